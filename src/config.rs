// =============================================================================
// Engine Configuration — JSON-backed runtime settings
// =============================================================================
//
// All tunables live in one file (default `risk_config.json`). Every field has
// a serde default so a partial or older config file still loads; unknown
// fields are ignored. Saves are atomic (tmp file + rename) so a crash never
// leaves a truncated config behind.
// =============================================================================

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ledger::UnderwaterLimits;
use crate::retry::RetryPolicy;
use crate::sizer::SizerConfig;
use crate::types::Regime;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_bot_id() -> String {
    "risk-sentinel-1".to_string()
}

fn default_pairs() -> Vec<String> {
    vec!["BTCUSDT".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_starting_balance() -> f64 {
    1_000.0
}

fn default_scan_interval_secs() -> u64 {
    60
}

fn default_max_quote_age_secs() -> u64 {
    30
}

fn default_max_concurrent_closes() -> usize {
    4
}

fn default_taker_fee_rate() -> f64 {
    0.001
}

fn default_retry_max() -> u32 {
    2
}

fn default_retry_base_ms() -> u64 {
    250
}

fn default_retry_max_ms() -> u64 {
    2_000
}

fn default_loss_threshold_tight() -> f64 {
    -0.4
}

fn default_loss_threshold_std() -> f64 {
    -0.5
}

fn default_loss_threshold_wide() -> f64 {
    -0.7
}

fn default_dwell_short() -> u64 {
    600
}

fn default_dwell_std() -> u64 {
    900
}

fn default_dwell_long() -> u64 {
    1_200
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Per-regime underwater limits. Choppy markets get the tightest leash,
/// strong trends the longest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnderwaterTable {
    #[serde(default = "default_loss_threshold_tight")]
    pub choppy_loss_threshold_pct: f64,
    #[serde(default = "default_dwell_short")]
    pub choppy_min_dwell_secs: u64,

    #[serde(default = "default_loss_threshold_std")]
    pub weak_loss_threshold_pct: f64,
    #[serde(default = "default_dwell_std")]
    pub weak_min_dwell_secs: u64,

    #[serde(default = "default_loss_threshold_std")]
    pub moderate_loss_threshold_pct: f64,
    #[serde(default = "default_dwell_std")]
    pub moderate_min_dwell_secs: u64,

    #[serde(default = "default_loss_threshold_wide")]
    pub strong_loss_threshold_pct: f64,
    #[serde(default = "default_dwell_long")]
    pub strong_min_dwell_secs: u64,
}

impl Default for UnderwaterTable {
    fn default() -> Self {
        Self {
            choppy_loss_threshold_pct: default_loss_threshold_tight(),
            choppy_min_dwell_secs: default_dwell_short(),
            weak_loss_threshold_pct: default_loss_threshold_std(),
            weak_min_dwell_secs: default_dwell_std(),
            moderate_loss_threshold_pct: default_loss_threshold_std(),
            moderate_min_dwell_secs: default_dwell_std(),
            strong_loss_threshold_pct: default_loss_threshold_wide(),
            strong_min_dwell_secs: default_dwell_long(),
        }
    }
}

impl UnderwaterTable {
    /// Limits stamped onto a position at entry for its regime.
    pub fn limits_for(&self, regime: Regime) -> UnderwaterLimits {
        match regime {
            Regime::Choppy => UnderwaterLimits {
                loss_threshold_pct: self.choppy_loss_threshold_pct,
                min_dwell_secs: self.choppy_min_dwell_secs,
            },
            Regime::Weak => UnderwaterLimits {
                loss_threshold_pct: self.weak_loss_threshold_pct,
                min_dwell_secs: self.weak_min_dwell_secs,
            },
            Regime::Moderate => UnderwaterLimits {
                loss_threshold_pct: self.moderate_loss_threshold_pct,
                min_dwell_secs: self.moderate_min_dwell_secs,
            },
            Regime::Strong => UnderwaterLimits {
                loss_threshold_pct: self.strong_loss_threshold_pct,
                min_dwell_secs: self.strong_min_dwell_secs,
            },
        }
    }
}

/// Retry knobs for exit orders, in plain JSON-friendly units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_retry_max(),
            base_backoff_ms: default_retry_base_ms(),
            max_backoff_ms: default_retry_max_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: std::time::Duration::from_millis(self.base_backoff_ms),
            max_backoff: std::time::Duration::from_millis(self.max_backoff_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_bot_id")]
    pub bot_id: String,
    #[serde(default = "default_pairs")]
    pub pairs: Vec<String>,

    /// Demo mode trades against the local fill simulator instead of the
    /// signed REST gateway.
    #[serde(default = "default_true")]
    pub demo_mode: bool,
    #[serde(default = "default_starting_balance")]
    pub starting_balance: f64,

    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_max_quote_age_secs")]
    pub max_quote_age_secs: u64,
    #[serde(default = "default_max_concurrent_closes")]
    pub max_concurrent_closes: usize,

    /// Taker fee fallback when the exchange publishes nothing better.
    #[serde(default = "default_taker_fee_rate")]
    pub taker_fee_rate: f64,

    #[serde(default)]
    pub sizer: SizerConfig,
    #[serde(default)]
    pub underwater: UnderwaterTable,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bot_id: default_bot_id(),
            pairs: default_pairs(),
            demo_mode: true,
            starting_balance: default_starting_balance(),
            scan_interval_secs: default_scan_interval_secs(),
            max_quote_age_secs: default_max_quote_age_secs(),
            max_concurrent_closes: default_max_concurrent_closes(),
            taker_fee_rate: default_taker_fee_rate(),
            sizer: SizerConfig::default(),
            underwater: UnderwaterTable::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`, falling back to defaults (and writing them out) if
    /// the file does not exist yet.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            let cfg: Self = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))?;
            cfg.validate()?;
            info!(path = %path.display(), bot_id = %cfg.bot_id, "config loaded");
            Ok(cfg)
        } else {
            warn!(path = %path.display(), "config not found — writing defaults");
            let cfg = Self::default();
            cfg.save(path)?;
            Ok(cfg)
        }
    }

    /// Atomic save: write to a sibling tmp file, then rename over the target.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write config tmp {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to move config into place at {}", path.display()))?;
        info!(path = %path.display(), "config saved");
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.bot_id.is_empty(), "bot_id must not be empty");
        anyhow::ensure!(
            (0.0..1.0).contains(&self.taker_fee_rate),
            "taker_fee_rate must be in [0, 1)"
        );
        anyhow::ensure!(self.scan_interval_secs > 0, "scan_interval_secs must be > 0");
        anyhow::ensure!(
            self.max_concurrent_closes > 0,
            "max_concurrent_closes must be > 0"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
