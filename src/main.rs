use std::process;
use std::sync::Arc;

use tracing::{error, info};

use waggle::config::Config;
use waggle::core::agent::Agent;
use waggle::logger::LoggerManager;
use waggle::print_error;

#[tokio::main]
async fn main() {
    let config = Config::new().unwrap_or_else(|err| {
        print_error!("{err}");
        process::exit(1);
    });

    let logger = LoggerManager::new(config.logger.clone(), config.debug).unwrap_or_else(|err| {
        print_error!("Failed to set up logging: {err}");
        process::exit(1);
    });
    if let Err(err) = logger.init() {
        print_error!("Failed to initialize logging: {err}");
        process::exit(1);
    }

    info!(
        pid = process::id(),
        version = env!("CARGO_PKG_VERSION"),
        "waggle host agent"
    );

    let agent = Arc::new(Agent::new(config));
    if let Err(err) = agent.start().await {
        error!(error = %err, "startup failed");
        process::exit(1);
    }

    shutdown_signal().await;
    agent.stop().await;
}

/// Completes on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            _ = term.recv() => info!("termination signal received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    }
}
