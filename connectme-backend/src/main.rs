use connectme_backend::{GraphStore, StoreConfig};
use dotenv::dotenv;
use std::process::ExitCode;
use std::str::FromStr;
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
enum Command {
    Serve,
    Repair,
    Check,
    Stats,
}

const USAGE: &str = "usage: connectme-backend [serve|repair|check|stats]";

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    env_logger::init();

    let command = match std::env::args().nth(1) {
        None => Command::Serve,
        Some(arg) => match Command::from_str(&arg) {
            Ok(command) => command,
            Err(_) => {
                eprintln!("unknown command: {}\n{}", arg, USAGE);
                return ExitCode::from(2);
            }
        },
    };

    let config = StoreConfig::from_env();
    log::info!("ConnectMe store v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using data directory: {}", config.data_dir.display());

    let store = match GraphStore::open(config) {
        Ok(store) => store,
        Err(e) => {
            log::error!("Failed to open store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match command {
        Command::Serve => serve(&store).await,
        Command::Repair => {
            let report = store.run_repair();
            print_json(&report);
            store.shutdown()
        }
        Command::Check => {
            let report = store.check_consistency();
            print_json(&report);
            if !report.is_clean() {
                return ExitCode::FAILURE;
            }
            Ok(())
        }
        Command::Stats => {
            print_json(&store.stats());
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{} failed: {}", command.as_ref(), e);
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Failed to render output: {}", e),
    }
}

/// Keep the store open until Ctrl+C / SIGTERM, then flush everything
async fn serve(store: &GraphStore) -> connectme_backend::StoreResult<()> {
    let stats = store.stats();
    log::info!(
        "[STORE] Ready with {} persons and {} tags (version {})",
        stats.persons,
        stats.tags,
        stats.version.version
    );

    wait_for_shutdown_signal().await;
    log::info!("Received shutdown signal, flushing pending writes...");
    store.shutdown()?;
    log::info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            log::warn!("Could not listen for SIGTERM ({}), waiting for Ctrl+C only", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
