//! syncgate server daemon

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use syncgate_server::cli::Cli;
use syncgate_server::config::{AppConfig, ConfigLoader};
use syncgate_server::http::{self, HttpSettings};
use syncgate_server::server::ConnectionServer;
use syncgate_server::shutdown::ShutdownCoordinator;
use syncgate_server::supervisor::{ShutdownOutcome, Signals, Supervisor};
use syncgate_server::upgrade::{UpgradeHandler, UpgradeSettings};
use syncgate_server::worker::DaemonLauncher;
use syncgate_utils::{Result, SyncgateError};

/// Config file (or defaults) with command line overrides applied
fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = ConfigLoader::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    ConfigLoader::validate(&config)?;
    Ok(config)
}

async fn run_daemon(config: AppConfig) -> Result<ShutdownOutcome> {
    let addr = config.server.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| SyncgateError::Bind { addr, source })?;
    let mut signals = Signals::install()?;

    let server = Arc::new(ConnectionServer::new(DaemonLauncher::from_config(
        &config.daemon,
    )));
    let handler = UpgradeHandler::new(
        Arc::clone(&server),
        UpgradeSettings::try_from(&config.upgrade)?,
    );

    let background = ShutdownCoordinator::new();
    if let Some(every) = config.server.status_interval() {
        server.report_status(every, &background);
    }

    let http_shutdown = CancellationToken::new();
    let settings = HttpSettings {
        read_timeout: config.server.read_timeout(),
    };
    let http = tokio::spawn(http::serve(
        listener,
        handler,
        settings,
        http_shutdown.clone(),
    ));

    info!(
        listen = %addr,
        method = %config.upgrade.method,
        daemon = %config.daemon.program.display(),
        "Listening for upgrade requests"
    );

    let name = signals.recv().await;
    info!(signal = name, "Shutdown requested");

    tokio::spawn(async move {
        loop {
            let name = signals.recv().await;
            warn!(signal = name, "Shutdown already in progress, ignoring signal");
        }
    });

    let supervisor = Supervisor::new(
        server,
        http_shutdown,
        background,
        config.server.shutdown_timeout(),
    );
    Ok(supervisor.shutdown(http).await)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    syncgate_utils::init_logging_with_config(cli.log_config())?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Syncgate");

    let result = match load_config(&cli) {
        Ok(config) => run_daemon(config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(ShutdownOutcome::Complete) => {
            info!("Shutdown complete, stopping process");
            Ok(())
        }
        Ok(outcome @ ShutdownOutcome::Forced) => {
            error!("Shutdown forced, stopping process");
            std::process::exit(outcome.exit_code());
        }
        Err(e) if e.is_config() => {
            error!(error = %e, "Invalid configuration");
            Err(e)
        }
        Err(e) => {
            error!(error = %e, "Server failed");
            Err(e)
        }
    }
}
