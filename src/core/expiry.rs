//! Expiry scheduler
//!
//! Periodic scan that moves live credentials past their deadline to
//! `expired` and feeds the reject set. Runs with an immediate first tick so a
//! restart catches up right away; one bad iteration never stops the next.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};

use crate::core::reject::DEFAULT_HORIZON_HOURS;
use crate::core::state::CoreState;
use crate::logger::log;

pub const SCAN_PERIOD: Duration = Duration::from_secs(30);

pub struct ExpiryScheduler {
    state: Arc<Mutex<CoreState>>,
    period: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ExpiryScheduler {
    pub fn new(state: Arc<Mutex<CoreState>>) -> Self {
        Self::with_period(state, SCAN_PERIOD)
    }

    pub fn with_period(state: Arc<Mutex<CoreState>>, period: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            state,
            period,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawn the scan loop. The first tick fires immediately.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let period = self.period;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut interval = interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let expired = scan_once(&state).await;
                        if expired > 0 {
                            log::info!(count = expired, "Expired credentials");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        log::debug!("Expiry scheduler shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Cancel the timer; the in-flight iteration finishes on its own.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// One scan iteration: expire everything past deadline, prune the reject set.
/// Returns how many credentials were expired.
pub async fn scan_once(state: &Mutex<CoreState>) -> usize {
    let now = Utc::now();
    let mut guard = state.lock().await;

    let due: Vec<i64> = guard
        .keys
        .all()
        .iter()
        .filter(|c| c.status.is_live() && c.expires_at <= now)
        .map(|c| c.id)
        .collect();

    let mut expired = 0;
    for id in due {
        match guard.expire_credential(id, now) {
            Ok(Some(_)) => expired += 1,
            Ok(None) => {}
            Err(e) => {
                // keep going, the next tick retries what this one missed
                log::warn!(id = id, error = %e, "Expiry transition failed");
            }
        }
    }

    let pruned = guard
        .reject
        .prune(ChronoDuration::hours(DEFAULT_HORIZON_HOURS), now);
    if pruned > 0 {
        log::debug!(count = pruned, "Reject set pruned");
    }

    expired
}
