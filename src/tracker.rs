// =============================================================================
// Peak/Erosion Tracker — per-position peak profit and giveback governance
// =============================================================================
//
// Tracks the highest profit-percent a position has ever reached and measures
// how much of that peak has been given back ("erosion") against a
// regime-dependent allowance. When the giveback exceeds the allowance the
// tracker emits a forced-exit recommendation with reason
// `erosion_cap_exceeded`.
//
// The recommendation is advisory: the Exit Execution Guard re-validates net
// profitability at execution time before acting on it.
//
// Invariants:
//   - The peak only ever rises, and only while the position is green.
//   - A position that has never been profitable (peak == 0) is excluded from
//     erosion logic entirely; the Underwater Policy governs it instead.
//   - Erosion-used is exactly 0 whenever current profit <= 0.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{ExitReason, HealthStatus, Regime};

/// Erosion ratio (percent of allowance consumed) at which the position is
/// reported as `warning`.
pub const EROSION_WARN_RATIO_PCT: f64 = 80.0;
/// Erosion ratio at which the position is reported as `critical`.
pub const EROSION_CRITICAL_RATIO_PCT: f64 = 100.0;

// ---------------------------------------------------------------------------
// Erosion cap source
// ---------------------------------------------------------------------------

/// Supplies the fraction of peak profit the system tolerates giving back
/// before forcing an exit, per `(regime, peak_pct)`.
///
/// The exact curve belongs to the external regime classifier; implementations
/// here only have to honour the consumer contract: stronger regimes tolerate
/// proportionally more giveback than choppy ones.
pub trait ErosionCapSource: Send + Sync {
    fn cap_fraction(&self, regime: Regime, peak_pct: f64) -> f64;
}

/// Default per-regime allowance table.
///
/// Large peaks (> 10 %) get an extra 0.10 of room before a forced
/// round-trip, capped at 0.75.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegimeCapTable;

impl ErosionCapSource for RegimeCapTable {
    fn cap_fraction(&self, regime: Regime, peak_pct: f64) -> f64 {
        let base: f64 = match regime {
            Regime::Choppy => 0.30,
            Regime::Weak => 0.40,
            Regime::Moderate => 0.50,
            Regime::Strong => 0.60,
        };
        if peak_pct > 10.0 {
            (base + 0.10).min(0.75)
        } else {
            base
        }
    }
}

/// Fixed allowance regardless of regime or peak. Used in tests and manual
/// overrides.
#[derive(Debug, Clone, Copy)]
pub struct FixedCap(pub f64);

impl ErosionCapSource for FixedCap {
    fn cap_fraction(&self, _regime: Regime, _peak_pct: f64) -> f64 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Assessment
// ---------------------------------------------------------------------------

/// Result of evaluating a position's erosion state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErosionAssessment {
    pub status: HealthStatus,
    pub peak_pct: f64,
    pub current_pct: f64,
    /// Fraction of peak given back, in [0, 1+]. Exactly 0 when the position
    /// is flat-or-red or has never been profitable.
    pub erosion_used_fraction: f64,
    pub erosion_cap_fraction: f64,
    /// `used / cap * 100`, clamped at 0 minimum. Dashboard/alerting metric.
    pub erosion_ratio_pct: f64,
    /// Advisory forced-exit recommendation, if any.
    pub recommendation: Option<ExitReason>,
}

/// Result of a peak update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakUpdate {
    pub peak_pct: f64,
    /// Whether the stored peak was raised by this update.
    pub raised: bool,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Stateless evaluator; per-position state lives in the ledger record.
pub struct ErosionTracker<C> {
    caps: C,
}

impl<C: ErosionCapSource> ErosionTracker<C> {
    pub fn new(caps: C) -> Self {
        Self { caps }
    }

    /// Update the stored peak from the latest profit-percent.
    ///
    /// The peak only moves while the position is green, and only upward.
    /// A stored peak observed below a positive current value is repaired in
    /// place — that is an idempotent correction, not an error.
    pub fn update_peak(&self, stored_peak: f64, current_pct: f64) -> PeakUpdate {
        if current_pct <= 0.0 {
            return PeakUpdate {
                peak_pct: stored_peak,
                raised: false,
            };
        }

        if current_pct > stored_peak {
            if stored_peak > 0.0 {
                // The stored value lagged a fresher read somewhere; heal it.
                warn!(
                    stored_peak,
                    current_pct, "stale peak below current profit — repairing"
                );
            }
            PeakUpdate {
                peak_pct: current_pct,
                raised: true,
            }
        } else {
            PeakUpdate {
                peak_pct: stored_peak,
                raised: false,
            }
        }
    }

    /// Assess erosion for a position with the given (already updated) peak.
    ///
    /// Positions with `peak_pct <= 0` are not governed here; they come back
    /// `underwater` (when red) or `healthy` (at flat) with zero erosion, and
    /// the Underwater Policy owns any exit decision.
    pub fn assess(&self, regime: Regime, peak_pct: f64, current_pct: f64) -> ErosionAssessment {
        if peak_pct <= 0.0 {
            let status = if current_pct < 0.0 {
                HealthStatus::Underwater
            } else {
                HealthStatus::Healthy
            };
            return ErosionAssessment {
                status,
                peak_pct,
                current_pct,
                erosion_used_fraction: 0.0,
                erosion_cap_fraction: self.caps.cap_fraction(regime, peak_pct),
                erosion_ratio_pct: 0.0,
                recommendation: None,
            };
        }

        let cap = self.caps.cap_fraction(regime, peak_pct);

        // Underwater exclusion: a red position never "erodes", whatever its
        // peak history says.
        let used = if current_pct <= 0.0 || current_pct >= peak_pct {
            0.0
        } else {
            (peak_pct - current_pct) / peak_pct
        };

        let ratio_pct = if cap > 0.0 {
            (used / cap * 100.0).max(0.0)
        } else {
            0.0
        };

        let recommendation = if used > cap {
            Some(ExitReason::ErosionCapExceeded)
        } else {
            None
        };

        let status = if ratio_pct >= EROSION_CRITICAL_RATIO_PCT {
            HealthStatus::Critical
        } else if ratio_pct >= EROSION_WARN_RATIO_PCT {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        debug!(
            regime = %regime,
            peak_pct,
            current_pct,
            used = format!("{:.4}", used),
            cap = format!("{:.4}", cap),
            ratio_pct = format!("{:.1}", ratio_pct),
            status = %status,
            "erosion assessed"
        );

        ErosionAssessment {
            status,
            peak_pct,
            current_pct,
            erosion_used_fraction: used,
            erosion_cap_fraction: cap,
            erosion_ratio_pct: ratio_pct,
            recommendation,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
