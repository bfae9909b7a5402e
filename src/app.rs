//! Application root
//!
//! Wires every component together in dependency order, runs the HTTP
//! listener, and owns graceful shutdown. Handlers receive one explicit `App`
//! handle instead of reaching for globals.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bot::{BotDispatcher, BotNotifier, BotTransport};
use crate::config::{CliArgs, Config};
use crate::core::expiry::ExpiryScheduler;
use crate::core::reject::DEFAULT_HORIZON_HOURS;
use crate::core::state::{CoreState, Notifier};
use crate::frps::FrpsSupervisor;
use crate::http::{self, RateLimiter};
use crate::logger::log;
use crate::motd::MotdProbe;
use crate::store::ensure_data_dir;
use crate::update::UpdateService;

const SHUTDOWN_CEILING: Duration = Duration::from_secs(15);

/// Shared handle passed to every HTTP handler and bot command.
pub struct App {
    pub state: Arc<Mutex<CoreState>>,
    pub notifier: Arc<dyn Notifier>,
    pub motd: Arc<MotdProbe>,
    pub supervisor: Arc<FrpsSupervisor>,
    pub rate_limiter: Arc<RateLimiter>,
    pub updater: Arc<UpdateService>,
}

/// Run the server until a shutdown signal arrives.
pub async fn run(cli: CliArgs) -> Result<()> {
    // 1. config
    let config_path = cli.config_path();
    let config = Config::load(&config_path).context("load config")?;
    config.validate().context("validate config")?;

    // 2. stores
    let data_dir = cli.data_dir();
    ensure_data_dir(&data_dir).map_err(|e| anyhow::anyhow!("data dir: {}", e))?;
    let state = Arc::new(Mutex::new(
        CoreState::load(config.clone(), config_path, &data_dir)
            .map_err(|e| anyhow::anyhow!("load stores: {}", e))?,
    ));

    // components around the state
    let (transport, outbound_rx, event_tx, event_rx) = BotTransport::new(
        config.bot.ws_url.clone(),
        config.bot.token.clone(),
        config.bot.self_id.clone(),
        config.bot.broadcast_groups.clone(),
    );
    let notifier: Arc<dyn Notifier> = Arc::new(BotNotifier(Arc::clone(&transport)));
    let motd = Arc::new(MotdProbe::new(Arc::clone(&notifier)));
    let supervisor = Arc::new(
        FrpsSupervisor::new(
            config.clone(),
            cli.bin_dir(),
            data_dir.join("frps.toml"),
        )
        .context("supervisor setup")?,
    );
    let rate_limiter = Arc::new(RateLimiter::new());
    let updater = Arc::new(UpdateService::new(cli.root_dir.clone()));

    let app = Arc::new(App {
        state: Arc::clone(&state),
        notifier,
        motd: Arc::clone(&motd),
        supervisor: Arc::clone(&supervisor),
        rate_limiter: Arc::clone(&rate_limiter),
        updater,
    });

    // 3. HTTP listener up before the supervisor so the plugin endpoint is
    // reachable the moment frps starts
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    log::info!(addr = %addr, "HTTP listener bound");

    let http_shutdown = CancellationToken::new();
    let router = http::build_router(Arc::clone(&app));
    let server_cancel = http_shutdown.clone();
    let http_task = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
        .await;
        if let Err(e) = result {
            log::error!(error = %e, "HTTP server failed");
        }
    });

    // 4. supervisor: a failed start is non-fatal, the listener stays up so a
    // retried frps can still reach the plugin endpoint
    if let Err(e) = Arc::clone(&supervisor).start().await {
        log::error!(error = %e, "frps supervisor failed to start");
    }

    // 5. reject set rebuild
    {
        let now = Utc::now();
        let mut guard = state.lock().await;
        let snapshot: Vec<_> = guard.keys.all().to_vec();
        guard
            .reject
            .rebuild(&snapshot, ChronoDuration::hours(DEFAULT_HORIZON_HOURS), now);
        log::info!(entries = guard.reject.len(), "Reject set rebuilt");
    }

    // 6. expiry scheduler
    let expiry = ExpiryScheduler::new(Arc::clone(&state));
    let expiry_task = expiry.start();

    // rate-limit sweeper
    let sweeper_tx = Arc::clone(&rate_limiter).start_sweeper();

    // 7. bot transport + dispatcher
    let transport_task = Arc::clone(&transport).start(outbound_rx, event_tx);
    let dispatcher = BotDispatcher::new(Arc::clone(&app), Arc::clone(&transport));
    let dispatcher_task = dispatcher.start(event_rx);

    // 8. signal handlers
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    // 9. online broadcast + post-update marker
    {
        let transport = Arc::clone(&transport);
        let updater = Arc::clone(&app.updater);
        tokio::spawn(async move {
            transport
                .broadcast_group_message(
                    &format!("FireFrp v{} 已上线", env!("CARGO_PKG_VERSION")),
                    None,
                )
                .await;
            if let Some(version) = updater.take_update_marker() {
                transport
                    .broadcast_group_message(&format!("已成功更新到 v{}", version), None)
                    .await;
            }
        });
    }

    shutdown.cancelled().await;
    log::info!("Shutdown requested");

    let sequence = async {
        transport
            .broadcast_group_message("FireFrp 服务端即将下线", None)
            .await;
        transport.stop();
        let _ = transport_task.await;
        let _ = dispatcher_task.await;

        http_shutdown.cancel();
        let _ = http_task.await;

        let _ = sweeper_tx.send(true);
        expiry.stop();
        let _ = expiry_task.await;

        motd.cancel_all();
        supervisor.stop().await;
    };
    if tokio::time::timeout(SHUTDOWN_CEILING, sequence).await.is_err() {
        log::warn!("Graceful shutdown exceeded ceiling, forcing exit");
    }

    log::info!("Shutdown complete");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint =
                signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
            let mut sighup =
                signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

            tokio::select! {
                _ = sigint.recv() => log::info!("SIGINT received"),
                _ = sigterm.recv() => log::info!("SIGTERM received"),
                _ = sighup.recv() => log::info!("SIGHUP received"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received");
        }

        shutdown.cancel();
    });
}
