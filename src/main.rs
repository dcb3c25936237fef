// =============================================================================
// Lattice Hedge Grid — Main Entry Point
// =============================================================================
//
// Multi-account hedged grid engine for Bybit USDT-linear perpetuals. Config
// is strict-validated JSON; API secrets come from the environment. Accounts
// carrying an emergency-stop flag refuse to start until the flag is removed.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod account;
mod bybit;
mod config;
mod ledger;
mod limit_tracker;
mod orchestrator;
mod persistence;
mod reconcile;
mod risk;
mod strategy;
mod stream;
mod types;
mod wallet;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::BotConfig;
use crate::orchestrator::Orchestrator;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Lattice Hedge Grid — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("LATTICE_CONFIG").unwrap_or_else(|_| "config.json".to_string());

    let config = match BotConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %config_path, error = %format!("{e:#}"), "configuration invalid");
            return 2;
        }
    };

    // ── 2. Register accounts ─────────────────────────────────────────────
    let mut orchestrator = Orchestrator::new(&config.data_dir);
    if let Err(e) = orchestrator.register_accounts(&config) {
        error!(error = %format!("{e:#}"), "account registration failed");
        return 3;
    }

    // ── 3. Start streams, restores, and timers ───────────────────────────
    if let Err(e) = orchestrator.start_all().await {
        error!(error = %format!("{e:#}"), "startup failed");
        return 4;
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 4. Supervision: exit when told to, or when every account died ────
    let mut check = tokio::time::interval(std::time::Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Shutdown signal received — stopping gracefully");
                orchestrator.shutdown();
                // Give event loops a moment to drain and release.
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                info!("Lattice Hedge Grid shut down complete.");
                return 0;
            }
            _ = check.tick() => {
                if !orchestrator.any_running() {
                    error!("every account has stopped (emergency flags on disk) — exiting");
                    return 1;
                }
            }
        }
    }
}
