use firefrp_server::{app, config, logger, update};

use logger::log;

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let cli = config::CliArgs::parse_args();
    logger::init_logger(&cli.log_mode);

    if cli.update {
        std::process::exit(run_update(&cli).await);
    }

    log::info!(
        version = env!("CARGO_PKG_VERSION"),
        root = %cli.root_dir.display(),
        "Starting FireFrp server"
    );

    if let Err(e) = app::run(cli).await {
        log::error!(error = %e, "Fatal startup error");
        std::process::exit(1);
    }
}

/// `--update`: run the self-update flow and exit. 0 covers both "updated"
/// and "already newest"; 1 is a failed update.
async fn run_update(cli: &config::CliArgs) -> i32 {
    let config = match config::Config::load(&cli.config_path()) {
        Ok(config) => config,
        Err(e) => {
            log::error!(error = %e, "Cannot load config for update");
            return 1;
        }
    };

    let updater = update::UpdateService::new(cli.root_dir.clone());
    let progress = |line: &str| log::info!("{}", line);
    match updater
        .run(config.updates.channel, &config.updates.github_token, &progress)
        .await
    {
        Ok(_) => 0,
        Err(e) => {
            log::error!(error = %e, "Update failed");
            1
        }
    }
}
