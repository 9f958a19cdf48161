// =============================================================================
// Shared types used across the risk & exit governance engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Market-condition regime attached to a position at entry time and held
/// fixed for that position's lifetime. Supplied by an external classifier;
/// this engine treats it as an opaque label that parameterises the erosion
/// allowance and the underwater thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Choppy,
    Weak,
    Moderate,
    Strong,
}

impl Default for Regime {
    fn default() -> Self {
        Self::Choppy
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Choppy => write!(f, "choppy"),
            Self::Weak => write!(f, "weak"),
            Self::Moderate => write!(f, "moderate"),
            Self::Strong => write!(f, "strong"),
        }
    }
}

/// Why a position was (or should be) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Operator-initiated close.
    Manual,
    /// Upstream orchestrator decided to close (rotation, shutdown, etc).
    Orchestrator,
    /// Hard stop-loss level reached.
    StopLoss,
    /// Configured profit target reached.
    ProfitTarget,
    /// Breakeven lock: exiting to protect a position back at flat.
    BreakevenProtection,
    /// Peak-profit giveback exceeded the regime's erosion allowance.
    ErosionCapExceeded,
    /// Position never went green and sat below the loss threshold past the
    /// minimum dwell time.
    UnderwaterNeverProfited,
}

impl ExitReason {
    /// Profit-protection reasons are only valid when the recomputed net
    /// result at execution time is non-negative; the Guard rejects the close
    /// otherwise instead of realising a loss under a "protected" label.
    pub fn is_profit_protection(self) -> bool {
        matches!(
            self,
            Self::ProfitTarget | Self::BreakevenProtection | Self::ErosionCapExceeded
        )
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Orchestrator => write!(f, "orchestrator"),
            Self::StopLoss => write!(f, "stop_loss"),
            Self::ProfitTarget => write!(f, "profit_target"),
            Self::BreakevenProtection => write!(f, "breakeven_protection"),
            Self::ErosionCapExceeded => write!(f, "erosion_cap_exceeded"),
            Self::UnderwaterNeverProfited => write!(f, "underwater_never_profited"),
        }
    }
}

/// An exit request handed to the Guard.
///
/// `requested_price` of `None` means "exit at the best available quote";
/// the Guard still enforces the net-positive floor for IOC liquidity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitIntent {
    pub reason: ExitReason,
    #[serde(default)]
    pub requested_price: Option<f64>,
}

impl ExitIntent {
    pub fn new(reason: ExitReason) -> Self {
        Self {
            reason,
            requested_price: None,
        }
    }

    pub fn at_price(reason: ExitReason, price: f64) -> Self {
        Self {
            reason,
            requested_price: Some(price),
        }
    }
}

/// Health classification of an open position, as surfaced to dashboards
/// and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Erosion ratio below the warning threshold.
    Healthy,
    /// Erosion ratio at 80 %+ of the allowance.
    Warning,
    /// Erosion allowance exhausted (100 %+).
    Critical,
    /// Never profitable and currently below water.
    Underwater,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
            Self::Underwater => write!(f, "underwater"),
        }
    }
}
