// =============================================================================
// Bot Configuration — multi-account, multi-symbol grid settings
// =============================================================================
//
// Loaded once at startup from a JSON file. Validation is strict: any field
// outside its allowed range aborts startup with a diagnostic naming the exact
// account/strategy/field, so a typo never reaches the exchange.
//
// API credentials are never stored in the file. Each account names the
// environment variables that hold its key and secret.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_category() -> String {
    "linear".to_string()
}

fn default_mm_rate_threshold() -> f64 {
    90.0
}

fn default_data_dir() -> String {
    "data".to_string()
}

// =============================================================================
// Per-symbol strategy settings
// =============================================================================

/// Grid parameters for one symbol under one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// e.g. "DOGEUSDT".
    pub symbol: String,

    /// Bybit product category. Only "linear" (USDT perpetuals) is supported.
    #[serde(default = "default_category")]
    pub category: String,

    /// Position leverage, 1..=200.
    pub leverage: u32,

    /// Margin committed to the level-0 entry of each side, in USD.
    pub initial_position_size_usd: f64,

    /// Distance between grid levels as a percentage of the average entry.
    pub grid_step_percent: f64,

    /// Martingale factor applied to each successive averaging entry's margin.
    /// Must be strictly greater than 1.0.
    pub averaging_multiplier: f64,

    /// Take-profit distance from the average entry, percent (before fees).
    pub take_profit_percent: f64,

    /// Hard cap on averaging entries per side.
    pub max_grid_levels_per_side: u32,
}

impl StrategyConfig {
    fn validate(&self, account_label: &str) -> Result<()> {
        let at = |field: &str| format!("{account_label}.strategies[{}].{field}", self.symbol);

        if self.symbol.trim().is_empty() {
            bail!("{}: symbol must not be empty", account_label);
        }
        if self.category != "linear" {
            bail!("{}: only \"linear\" is supported, got {:?}", at("category"), self.category);
        }
        if !(1..=200).contains(&self.leverage) {
            bail!("{}: leverage must be 1..=200, got {}", at("leverage"), self.leverage);
        }
        if !(0.1..=100_000.0).contains(&self.initial_position_size_usd) {
            bail!(
                "{}: initial_position_size_usd must be 0.1..=100000, got {}",
                at("initial_position_size_usd"),
                self.initial_position_size_usd
            );
        }
        if !(0.01..=100.0).contains(&self.grid_step_percent) {
            bail!(
                "{}: grid_step_percent must be 0.01..=100, got {}",
                at("grid_step_percent"),
                self.grid_step_percent
            );
        }
        if self.averaging_multiplier <= 1.0 || self.averaging_multiplier > 10.0 {
            bail!(
                "{}: averaging_multiplier must be in (1.0, 10.0], got {}",
                at("averaging_multiplier"),
                self.averaging_multiplier
            );
        }
        if !(0.01..=100.0).contains(&self.take_profit_percent) {
            bail!(
                "{}: take_profit_percent must be 0.01..=100, got {}",
                at("take_profit_percent"),
                self.take_profit_percent
            );
        }
        if !(1..=50).contains(&self.max_grid_levels_per_side) {
            bail!(
                "{}: max_grid_levels_per_side must be 1..=50, got {}",
                at("max_grid_levels_per_side"),
                self.max_grid_levels_per_side
            );
        }
        Ok(())
    }
}

// =============================================================================
// Risk settings
// =============================================================================

/// Account-level risk limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Account MM rate (percent) at which every position is force-closed
    /// and the account is emergency-stopped.
    #[serde(default = "default_mm_rate_threshold")]
    pub mm_rate_threshold: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            mm_rate_threshold: default_mm_rate_threshold(),
        }
    }
}

// =============================================================================
// Per-account settings
// =============================================================================

/// One exchange account with its credentials indirection and strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// 1..=999. Zero-padded to three digits in file names and log context.
    pub id: u16,

    /// Human-readable label used in logs.
    pub name: String,

    /// Name of the environment variable holding the API key.
    pub api_key_env: String,

    /// Name of the environment variable holding the API secret.
    pub api_secret_env: String,

    /// Route REST/WS traffic to Bybit's demo-trading environment.
    #[serde(default)]
    pub demo_trading: bool,

    /// Log every order instead of sending it. Streams still run live.
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub risk_management: RiskConfig,

    pub strategies: Vec<StrategyConfig>,
}

impl AccountConfig {
    /// Zero-padded three-digit account tag used in file names and logs.
    pub fn tag(&self) -> String {
        format!("{:03}", self.id)
    }

    fn validate(&self) -> Result<()> {
        let label = format!("accounts[{}]", self.id);

        if !(1..=999).contains(&self.id) {
            bail!("accounts: id must be 1..=999, got {}", self.id);
        }
        if self.name.trim().is_empty() {
            bail!("{label}.name: must not be empty");
        }
        if self.api_key_env.trim().is_empty() {
            bail!("{label}.api_key_env: must not be empty");
        }
        if self.api_secret_env.trim().is_empty() {
            bail!("{label}.api_secret_env: must not be empty");
        }
        if !(0.0..=100.0).contains(&self.risk_management.mm_rate_threshold) {
            bail!(
                "{label}.risk_management.mm_rate_threshold: must be 0..=100, got {}",
                self.risk_management.mm_rate_threshold
            );
        }
        if self.strategies.is_empty() {
            bail!("{label}.strategies: at least one strategy is required");
        }

        let mut seen = std::collections::HashSet::new();
        for strat in &self.strategies {
            if !seen.insert(strat.symbol.clone()) {
                bail!("{label}.strategies: duplicate symbol {:?}", strat.symbol);
            }
            strat.validate(&label)?;
        }
        Ok(())
    }

    /// Resolve API credentials from the process environment.
    pub fn credentials(&self) -> Result<(String, String)> {
        let key = std::env::var(&self.api_key_env).with_context(|| {
            format!(
                "account {}: environment variable {} (api_key_env) is not set",
                self.tag(),
                self.api_key_env
            )
        })?;
        let secret = std::env::var(&self.api_secret_env).with_context(|| {
            format!(
                "account {}: environment variable {} (api_secret_env) is not set",
                self.tag(),
                self.api_secret_env
            )
        })?;
        Ok((key, secret))
    }
}

// =============================================================================
// Top-level config
// =============================================================================

/// Top-level configuration: the account list plus engine-wide paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Directory for persisted state and emergency-stop flags.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    pub accounts: Vec<AccountConfig>,
}

impl BotConfig {
    /// Load and validate configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            accounts = config.accounts.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Validate every account and check for duplicate account ids.
    pub fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            bail!("accounts: at least one account is required");
        }
        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.id) {
                bail!("accounts: duplicate id {}", account.id);
            }
            account.validate()?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn strategy_json() -> serde_json::Value {
        serde_json::json!({
            "symbol": "DOGEUSDT",
            "leverage": 75,
            "initial_position_size_usd": 1.0,
            "grid_step_percent": 1.0,
            "averaging_multiplier": 2.0,
            "take_profit_percent": 1.0,
            "max_grid_levels_per_side": 10
        })
    }

    fn config_json() -> serde_json::Value {
        serde_json::json!({
            "accounts": [{
                "id": 1,
                "name": "main",
                "api_key_env": "BYBIT_KEY_001",
                "api_secret_env": "BYBIT_SECRET_001",
                "demo_trading": true,
                "strategies": [strategy_json()]
            }]
        })
    }

    fn parse(v: serde_json::Value) -> BotConfig {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn valid_config_passes() {
        let cfg = parse(config_json());
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.data_dir, "data");
        assert_eq!(cfg.accounts[0].tag(), "001");
        assert_eq!(cfg.accounts[0].strategies[0].category, "linear");
        assert!(!cfg.accounts[0].dry_run);
        assert!((cfg.accounts[0].risk_management.mm_rate_threshold - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn leverage_out_of_range_is_named() {
        let mut v = config_json();
        v["accounts"][0]["strategies"][0]["leverage"] = serde_json::json!(201);
        let err = parse(v).validate().unwrap_err().to_string();
        assert!(err.contains("leverage"), "diagnostic should name the field: {err}");
        assert!(err.contains("DOGEUSDT"), "diagnostic should name the strategy: {err}");
    }

    #[test]
    fn multiplier_of_exactly_one_is_rejected() {
        let mut v = config_json();
        v["accounts"][0]["strategies"][0]["averaging_multiplier"] = serde_json::json!(1.0);
        let err = parse(v).validate().unwrap_err().to_string();
        assert!(err.contains("averaging_multiplier"), "{err}");
    }

    #[test]
    fn duplicate_account_ids_rejected() {
        let mut v = config_json();
        let dup = v["accounts"][0].clone();
        v["accounts"].as_array_mut().unwrap().push(dup);
        let err = parse(v).validate().unwrap_err().to_string();
        assert!(err.contains("duplicate id"), "{err}");
    }

    #[test]
    fn duplicate_symbols_rejected() {
        let mut v = config_json();
        let dup = strategy_json();
        v["accounts"][0]["strategies"].as_array_mut().unwrap().push(dup);
        let err = parse(v).validate().unwrap_err().to_string();
        assert!(err.contains("duplicate symbol"), "{err}");
    }

    #[test]
    fn account_id_zero_rejected() {
        let mut v = config_json();
        v["accounts"][0]["id"] = serde_json::json!(0);
        let err = parse(v).validate().unwrap_err().to_string();
        assert!(err.contains("id must be 1..=999"), "{err}");
    }

    #[test]
    fn max_levels_out_of_range_rejected() {
        let mut v = config_json();
        v["accounts"][0]["strategies"][0]["max_grid_levels_per_side"] = serde_json::json!(51);
        let err = parse(v).validate().unwrap_err().to_string();
        assert!(err.contains("max_grid_levels_per_side"), "{err}");
    }

    #[test]
    fn credentials_resolve_from_env() {
        std::env::set_var("LATTICE_TEST_KEY", "k");
        std::env::set_var("LATTICE_TEST_SECRET", "s");
        let mut v = config_json();
        v["accounts"][0]["api_key_env"] = serde_json::json!("LATTICE_TEST_KEY");
        v["accounts"][0]["api_secret_env"] = serde_json::json!("LATTICE_TEST_SECRET");
        let cfg = parse(v);
        let (k, s) = cfg.accounts[0].credentials().unwrap();
        assert_eq!(k, "k");
        assert_eq!(s, "s");
    }

    #[test]
    fn missing_env_var_is_diagnosed() {
        let mut v = config_json();
        v["accounts"][0]["api_key_env"] = serde_json::json!("LATTICE_TEST_MISSING_VAR");
        let cfg = parse(v);
        let err = format!("{:#}", cfg.accounts[0].credentials().unwrap_err());
        assert!(err.contains("LATTICE_TEST_MISSING_VAR"), "{err}");
    }
}
