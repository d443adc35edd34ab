//! `rowq-worker`: one worker process of the fleet.
//!
//! Reads the three required environment variables, wires SIGINT/SIGTERM to
//! the shutdown token, and runs the main loop with a logging callback.
//! Exits 0 on graceful shutdown and non-zero on misconfiguration or a
//! permanent backend failure.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use rowq_runtime::shutdown::ShutdownState;
use rowq_runtime::{Config, Orchestrator};
use rowq_store::InMemorySheetStore;

fn main() -> ExitCode {
    fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    if !Path::new(&config.service_account_file).exists() {
        error!(
            path = %config.service_account_file,
            "service account file not found"
        );
        return ExitCode::from(2);
    }

    // The production backend is supplied by the embedding program through
    // the SheetStore seam; the bundled store keeps the workbook in-process.
    warn!("using the in-process sheet store; rows will not outlive this process");
    let store = Arc::new(InMemorySheetStore::new());

    let mut orchestrator = match Orchestrator::new(config.clone(), store) {
        Ok(orchestrator) => orchestrator,
        Err(error) => {
            error!(%error, "startup failed");
            return ExitCode::from(2);
        }
    };

    const GRACEFUL_WAIT: Duration = Duration::from_secs(60);

    let handler_token = orchestrator.shutdown_token();
    if let Err(error) = ctrlc::set_handler(move || match handler_token.signal() {
        ShutdownState::Terminated => {
            eprintln!("second signal, terminating immediately");
            std::process::exit(130);
        }
        _ => {
            eprintln!("shutdown requested, finishing current work");
            let watchdog = handler_token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(GRACEFUL_WAIT);
                if watchdog.state() != ShutdownState::Terminated {
                    eprintln!("graceful shutdown timed out");
                    std::process::exit(1);
                }
            });
        }
    }) {
        error!(%error, "failed to install signal handler");
        return ExitCode::from(2);
    }

    info!(worker = %config.worker_name, "worker starting");
    let outcome = orchestrator.run(|url| {
        info!(%url, "processing video");
        Ok(())
    });

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "worker stopped on fatal error");
            ExitCode::FAILURE
        }
    }
}
