//! Per-IP rate limiting
//!
//! Dual-window limiter for the validate endpoint: at most 20 requests per
//! minute and 100 per hour per client IP. Buckets are swept periodically so
//! the map stays bounded.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::logger::log;

const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const HOUR_WINDOW: Duration = Duration::from_secs(3600);
const MINUTE_LIMIT: usize = 20;
const HOUR_LIMIT: usize = 100;
pub const SWEEP_PERIOD: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct Bucket {
    /// Request instants within the last hour, oldest first.
    hits: VecDeque<Instant>,
}

impl Bucket {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) > HOUR_WINDOW {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn check_and_record(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.hits.len() >= HOUR_LIMIT {
            return false;
        }
        let in_minute = self
            .hits
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) <= MINUTE_WINDOW)
            .count();
        if in_minute >= MINUTE_LIMIT {
            return false;
        }
        self.hits.push_back(now);
        true
    }
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<IpAddr, Bucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request from `ip`. Returns false when either window is full;
    /// rejected requests do not consume quota.
    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        self.buckets.entry(ip).or_default().check_and_record(now)
    }

    /// Drop expired hits and empty buckets.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| {
            bucket.prune(now);
            !bucket.hits.is_empty()
        });
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Spawn the periodic sweeper. Returns the shutdown sender.
    pub fn start_sweeper(self: Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let limiter = self;

        tokio::spawn(async move {
            let mut interval = interval(SWEEP_PERIOD);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // skip the immediate tick, there is nothing to sweep yet
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        limiter.sweep();
                        log::debug!(buckets = limiter.bucket_count(), "Rate-limit buckets swept");
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        shutdown_tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn test_minute_window_limit() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..20 {
            assert!(limiter.allow_at(ip(1), now));
        }
        // the 21st within the same minute is refused
        assert!(!limiter.allow_at(ip(1), now));
    }

    #[test]
    fn test_minute_window_slides() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..20 {
            assert!(limiter.allow_at(ip(1), start));
        }
        assert!(!limiter.allow_at(ip(1), start));
        // a minute later the per-minute window has drained
        assert!(limiter.allow_at(ip(1), start + Duration::from_secs(61)));
    }

    #[test]
    fn test_hour_window_limit() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        // spread 100 hits so the minute window never trips
        for i in 0..100u64 {
            let t = start + Duration::from_secs(i * 30);
            assert!(limiter.allow_at(ip(1), t), "hit {} refused", i);
        }
        let after = start + Duration::from_secs(100 * 30);
        assert!(!limiter.allow_at(ip(1), after));
    }

    #[test]
    fn test_ips_are_independent() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..20 {
            assert!(limiter.allow_at(ip(1), now));
        }
        assert!(!limiter.allow_at(ip(1), now));
        assert!(limiter.allow_at(ip(2), now));
    }

    #[test]
    fn test_rejected_requests_do_not_consume_quota() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..20 {
            assert!(limiter.allow_at(ip(1), start));
        }
        for _ in 0..50 {
            assert!(!limiter.allow_at(ip(1), start));
        }
        // only the 20 allowed hits are on the books; after the minute window
        // passes the client is not hour-banned
        assert!(limiter.allow_at(ip(1), start + Duration::from_secs(61)));
    }

    #[test]
    fn test_sweep_drops_empty_buckets() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        limiter.allow_at(ip(1), now);
        assert_eq!(limiter.bucket_count(), 1);
        // nothing expired yet
        limiter.sweep();
        assert_eq!(limiter.bucket_count(), 1);
    }
}
