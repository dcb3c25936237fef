// =============================================================================
// Orchestrator — account registry and stream fan-out wiring
// =============================================================================
//
// Owns the one StreamHub of the process and every account runtime. Accounts
// whose emergency-stop flag bars startup are skipped with a loud log; the
// process only refuses to start when *no* account could be registered.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::account::AccountRuntime;
use crate::config::BotConfig;
use crate::stream::StreamHub;

pub struct Orchestrator {
    hub: Arc<StreamHub>,
    data_dir: PathBuf,
    accounts: Vec<Arc<AccountRuntime>>,
}

impl Orchestrator {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            hub: Arc::new(StreamHub::new()),
            data_dir: data_dir.into(),
            accounts: Vec::new(),
        }
    }

    /// Build every account from config. An account barred by its
    /// emergency-stop flag is skipped, not fatal; a config/credential
    /// problem is fatal for the whole process.
    pub fn register_accounts(&mut self, config: &BotConfig) -> Result<()> {
        for account_cfg in &config.accounts {
            match AccountRuntime::build(account_cfg.clone(), &self.data_dir) {
                Ok(runtime) => self.accounts.push(Arc::new(runtime)),
                Err(e) => {
                    let msg = format!("{e:#}");
                    if msg.contains("emergency-stop flag") {
                        error!(
                            account = account_cfg.id,
                            error = %msg,
                            "account barred by emergency stop — skipping"
                        );
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        if self.accounts.is_empty() {
            anyhow::bail!("no account could be registered — nothing to run");
        }
        info!(accounts = self.accounts.len(), "accounts registered");
        Ok(())
    }

    /// Start every registered account: streams, restore, timers.
    pub async fn start_all(&self) -> Result<()> {
        for account in &self.accounts {
            account
                .clone()
                .start(&self.hub)
                .await
                .map_err(|e| e.context(format!("account {} failed to start", account.tag())))?;
        }
        Ok(())
    }

    /// True while at least one account loop is live.
    pub fn any_running(&self) -> bool {
        self.accounts.iter().any(|a| !a.is_stopped())
    }

    /// Graceful shutdown of every account.
    pub fn shutdown(&self) {
        warn!("shutting down all accounts");
        for account in &self.accounts {
            account.shutdown();
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("accounts", &self.accounts.len())
            .finish()
    }
}
