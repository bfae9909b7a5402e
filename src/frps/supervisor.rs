//! frps subprocess supervisor
//!
//! Owns the daemon lifecycle: provision the pinned binary, generate config,
//! spawn, watch, restart with exponential backoff on unexpected exits, and
//! tear down with SIGTERM then force-kill. Nobody else signals the child.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::frps::admin::FrpsAdminClient;
use crate::frps::{config_gen, provision};
use crate::logger::log;

const READINESS_ATTEMPTS: u32 = 30;
const READINESS_INTERVAL: Duration = Duration::from_secs(1);
const STOP_GRACE: Duration = Duration::from_secs(10);
const MAX_RESTART_DELAY: Duration = Duration::from_secs(30);
/// Subprocess log lines are dropped rather than ever stalling the pipe reader.
const LOG_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Error,
    Restarting,
    Stopping,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Error => "error",
            SupervisorState::Restarting => "restarting",
            SupervisorState::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub version: String,
    pub restart_count: u32,
}

#[derive(Debug)]
struct Inner {
    state: SupervisorState,
    pid: Option<u32>,
    started_at: Option<Instant>,
    restart_count: u32,
}

pub struct FrpsSupervisor {
    config: Config,
    bin_dir: PathBuf,
    config_path: PathBuf,
    admin: FrpsAdminClient,
    inner: Mutex<Inner>,
    run: Mutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>,
}

impl FrpsSupervisor {
    pub fn new(config: Config, bin_dir: PathBuf, config_path: PathBuf) -> Result<Self> {
        let admin = FrpsAdminClient::new(&config.frps)?;
        Ok(Self {
            config,
            bin_dir,
            config_path,
            admin,
            inner: Mutex::new(Inner {
                state: SupervisorState::Stopped,
                pid: None,
                started_at: None,
                restart_count: 0,
            }),
            run: Mutex::new(None),
        })
    }

    pub fn admin(&self) -> &FrpsAdminClient {
        &self.admin
    }

    pub async fn get_status(&self) -> SupervisorStatus {
        let inner = self.inner.lock().await;
        SupervisorStatus {
            state: inner.state,
            pid: inner.pid,
            uptime_secs: inner.started_at.map(|t| t.elapsed().as_secs()),
            version: self.config.frp_version.clone(),
            restart_count: inner.restart_count,
        }
    }

    /// Start the supervision loop. Fails fast if the first spawn cannot reach
    /// readiness; later crashes restart with backoff in the background.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Err(anyhow!("supervisor already running"));
        }

        let cancel = CancellationToken::new();
        let mut child = self.start_once().await?;

        let this = Arc::clone(&self);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            this.supervise(&mut child, loop_cancel).await;
        });

        *run = Some((cancel, handle));
        Ok(())
    }

    /// Intentional shutdown: cancel pending restarts, SIGTERM the child, wait
    /// up to the grace period, then force-kill.
    pub async fn stop(&self) {
        let Some((cancel, handle)) = self.run.lock().await.take() else {
            return;
        };
        {
            let mut inner = self.inner.lock().await;
            inner.state = SupervisorState::Stopping;
        }
        cancel.cancel();
        if tokio::time::timeout(STOP_GRACE + Duration::from_secs(2), handle)
            .await
            .is_err()
        {
            log::warn!("Supervisor loop did not stop in time");
        }
        let mut inner = self.inner.lock().await;
        inner.state = SupervisorState::Stopped;
        inner.pid = None;
        inner.started_at = None;
    }

    /// Provision + configure + spawn + wait for readiness.
    async fn start_once(&self) -> Result<Child> {
        {
            let mut inner = self.inner.lock().await;
            inner.state = SupervisorState::Starting;
        }

        let binary = provision::ensure_binary(&self.bin_dir, &self.config.frp_version)
            .await
            .context("provision frps binary")?;
        config_gen::write(&self.config, &self.config_path)
            .map_err(|e| anyhow!("generate frps config: {}", e))?;

        let mut child = Command::new(&binary)
            .arg("-c")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {}", binary.display()))?;

        if let Some(stdout) = child.stdout.take() {
            forward_pipe(stdout, "frps:stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_pipe(stderr, "frps:stderr");
        }

        let pid = child.id();
        log::subprocess("spawned", pid.map(|p| p.to_string()).as_deref());

        // Readiness: the admin endpoint answering means the daemon is up.
        let mut ready = false;
        for _ in 0..READINESS_ATTEMPTS {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(anyhow!("frps exited during startup: {}", status));
            }
            if self.admin.is_ready().await {
                ready = true;
                break;
            }
            tokio::time::sleep(READINESS_INTERVAL).await;
        }
        if !ready {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let mut inner = self.inner.lock().await;
            inner.state = SupervisorState::Error;
            return Err(anyhow!("frps admin endpoint never became ready"));
        }

        {
            let mut inner = self.inner.lock().await;
            inner.state = SupervisorState::Running;
            inner.pid = pid;
            inner.started_at = Some(Instant::now());
            inner.restart_count = 0;
        }
        log::subprocess("ready", None);
        Ok(child)
    }

    /// Watch the child; restart with backoff on unexpected exits until the
    /// cancellation token fires.
    async fn supervise(self: Arc<Self>, child: &mut Child, cancel: CancellationToken) {
        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|e| format!("wait failed: {}", e));
                    log::warn!(status = %status, "frps exited unexpectedly");

                    let k = {
                        let mut inner = self.inner.lock().await;
                        inner.state = SupervisorState::Restarting;
                        inner.pid = None;
                        inner.started_at = None;
                        let k = inner.restart_count;
                        inner.restart_count = inner.restart_count.saturating_add(1);
                        k
                    };
                    let delay = restart_delay(k);
                    log::subprocess("restart scheduled", Some(&format!("{}s", delay.as_secs())));

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return,
                    }

                    match self.start_once().await {
                        Ok(new_child) => *child = new_child,
                        Err(e) => {
                            log::error!(error = %e, "frps restart failed");
                            let mut inner = self.inner.lock().await;
                            inner.state = SupervisorState::Error;
                            // loop again: child.wait() on the dead handle
                            // returns immediately and re-enters backoff
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    self.terminate(child).await;
                    return;
                }
            }
        }
    }

    /// SIGTERM, grace period, then force-kill.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(_) => log::subprocess("stopped", None),
            Err(_) => {
                log::warn!("frps ignored SIGTERM, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

/// `min(1s * 2^k, 30s)`
fn restart_delay(k: u32) -> Duration {
    let secs = 1u64.checked_shl(k).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_RESTART_DELAY)
}

/// Forward a subprocess pipe to the logger, line by line, through a bounded
/// channel. A slow logger drops lines instead of backpressuring the pipe.
fn forward_pipe(stream: impl AsyncRead + Unpin + Send + 'static, source: &'static str) {
    let (tx, mut rx) = mpsc::channel::<String>(LOG_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.try_send(line).is_err() {
                // channel full, drop the line
            }
        }
    });

    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            log::info!(source = source, "{}", line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_delay_backoff() {
        assert_eq!(restart_delay(0), Duration::from_secs(1));
        assert_eq!(restart_delay(1), Duration::from_secs(2));
        assert_eq!(restart_delay(3), Duration::from_secs(8));
        assert_eq!(restart_delay(4), Duration::from_secs(16));
        assert_eq!(restart_delay(5), Duration::from_secs(30));
        assert_eq!(restart_delay(20), Duration::from_secs(30));
        assert_eq!(restart_delay(80), Duration::from_secs(30));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SupervisorState::Stopped.as_str(), "stopped");
        assert_eq!(SupervisorState::Running.as_str(), "running");
        assert_eq!(SupervisorState::Restarting.as_str(), "restarting");
    }

    #[tokio::test]
    async fn test_initial_status() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = FrpsSupervisor::new(
            Config::default(),
            dir.path().join("bin"),
            dir.path().join("frps.toml"),
        )
        .unwrap();

        let status = supervisor.get_status().await;
        assert_eq!(status.state, SupervisorState::Stopped);
        assert_eq!(status.pid, None);
        assert_eq!(status.restart_count, 0);
        assert_eq!(status.version, "0.67.0");
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = FrpsSupervisor::new(
            Config::default(),
            dir.path().join("bin"),
            dir.path().join("frps.toml"),
        )
        .unwrap();
        supervisor.stop().await;
        assert_eq!(supervisor.get_status().await.state, SupervisorState::Stopped);
    }
}
