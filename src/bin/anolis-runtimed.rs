//! `anolis-runtimed` — the runtime binary.
//!
//! Reads a YAML config document (path given as the first CLI arg, default
//! `config.yaml`), builds the orchestrator, installs the SIGINT/SIGTERM
//! handler, and runs the main monitoring loop until shutdown (§4.10, §6.3).
//! Exit code 0 on clean shutdown, non-zero on init failure.

use std::path::PathBuf;

use anolis_runtime::config::Config;
use anolis_runtime::orchestrator::Orchestrator;
use anolis_runtime::shutdown;
use tracing_subscriber::EnvFilter;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));

    let config = match Config::load_from_path(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error loading '{}': {e}", config_path.display());
            std::process::exit(1);
        }
    };

    init_tracing(&config.log_level);

    let orchestrator = match Orchestrator::init(&config) {
        Ok(o) => o,
        Err(e) => {
            tracing::error!(error = %e, "orchestrator init failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = shutdown::install(orchestrator.shutdown_flag()) {
        tracing::error!(error = %e, "failed to install signal handlers");
        std::process::exit(1);
    }

    if let Err(e) = orchestrator.run() {
        tracing::error!(error = %e, "orchestrator run failed");
        std::process::exit(1);
    }

    tracing::info!("clean shutdown");
}
