//! Service configuration.
//!
//! Loaded once at startup from a YAML file; a missing file means defaults.
//! Secrets and the listen address can be overridden from the environment:
//! - `OPENROUTER_API_KEY` - provider credential
//! - `SWITCHBOARD_LISTEN_ADDR` - bind address for the HTTP surface
//!
//! The tier catalog and agent roster live in their own files (reloadable
//! at runtime); this config only points at them.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::budget::{pricing, BudgetConfig, BudgetPeriod};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub tiers_path: PathBuf,
    pub agents_path: PathBuf,
    pub openrouter_api_key: Option<String>,
    pub budget: BudgetSettings,
    pub router: RouterSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            tiers_path: PathBuf::from("config/tiers.yaml"),
            agents_path: PathBuf::from("config/agents.yaml"),
            openrouter_api_key: None,
            budget: BudgetSettings::default(),
            router: RouterSettings::default(),
        }
    }
}

/// Which durable backend the ledger writes its audit trail to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetBackend {
    Sqlite,
    Csv,
    /// No durable trail; spend state dies with the process.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    /// Limit per period, in major currency units.
    pub limit: f64,
    pub currency: String,
    pub period: BudgetPeriod,
    pub warn_ratio: f64,
    pub backend: BudgetBackend,
    pub store_path: PathBuf,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            limit: 5.0,
            currency: "USD".to_string(),
            period: BudgetPeriod::Session,
            warn_ratio: 0.8,
            backend: BudgetBackend::Sqlite,
            store_path: PathBuf::from("data/ledger.db"),
        }
    }
}

impl BudgetSettings {
    pub fn to_budget_config(&self) -> BudgetConfig {
        BudgetConfig {
            limit_micros: pricing::to_micros(self.limit),
            period: self.period,
            warn_ratio: self.warn_ratio,
            currency: self.currency.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Hard cap on agent turns per conversation.
    pub max_turns: u32,
    /// Times the same directed edge may repeat within the window.
    pub max_repeats: u32,
    /// Sliding window (in hops) the repeat count lives in.
    pub repeat_window: usize,
    /// Cap on model attempts within one turn's cascade.
    pub max_attempts: u32,
    /// Deadline for a single model attempt, transport retries included.
    pub turn_timeout_secs: u64,
    /// Messages of history that go into an agent prompt.
    pub history_window: usize,
    /// Output-token expectation used for pre-call cost estimates.
    pub default_output_tokens: u64,
    /// Idle conversations are closed after this long without input.
    pub idle_ttl_secs: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_turns: 24,
            max_repeats: 3,
            repeat_window: 20,
            max_attempts: 4,
            turn_timeout_secs: 60,
            history_window: 10,
            default_output_tokens: 512,
            idle_ttl_secs: 900,
        }
    }
}

impl Config {
    /// Load configuration; a missing file yields defaults. Environment
    /// overrides apply after the file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            tracing::info!("Loaded config from {}", path.display());
            config
        } else {
            tracing::info!("No config file at {}, using defaults", path.display());
            Config::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            if !key.is_empty() {
                self.openrouter_api_key = Some(key);
            }
        }
        if let Ok(addr) = std::env::var("SWITCHBOARD_LISTEN_ADDR") {
            if !addr.is_empty() {
                self.listen_addr = addr;
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.budget.limit <= 0.0 {
            anyhow::bail!("budget.limit must be positive");
        }
        if !(0.0..=1.0).contains(&self.budget.warn_ratio) {
            anyhow::bail!("budget.warn_ratio must be within 0..=1");
        }
        if self.router.max_turns == 0 || self.router.max_attempts == 0 {
            anyhow::bail!("router.max_turns and router.max_attempts must be positive");
        }
        if self.router.turn_timeout_secs == 0 {
            anyhow::bail!("router.turn_timeout_secs must be positive");
        }
        Ok(())
    }
}
