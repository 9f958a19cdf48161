// =============================================================================
// Underwater Policy — forced exits for positions that never went green
// =============================================================================
//
// Governs positions with no positive peak on record (`peak_pct <= 0`): if
// such a position sits below its loss threshold for at least the minimum
// dwell time, a forced exit is recommended with reason
// `underwater_never_profited`.
//
// The dwell requirement exists so a single noisy tick through the threshold
// does not trigger an exit; before it elapses the policy surfaces a pending
// warning instead.
//
// This policy and the Erosion Tracker are mutually exclusive per position:
// the sign of the recorded peak decides which one governs at any instant.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ledger::Position;
use crate::types::ExitReason;

/// Outcome of an underwater evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum UnderwaterVerdict {
    /// Position is not governed by this policy (it has a positive peak, or
    /// is not currently red).
    NotApplicable,
    /// Red, but still above the loss threshold. No action.
    Watch,
    /// Below the threshold but the dwell time has not elapsed yet; surfaced
    /// as a warning, never as an exit.
    Pending { remaining_secs: u64 },
    /// Threshold breached for at least the minimum dwell time.
    ForceExit { reason: ExitReason },
}

/// Evaluate the underwater policy for `position` at `now`.
///
/// Thresholds come from the per-position limits fixed at entry.
pub fn evaluate(position: &Position, now: DateTime<Utc>) -> UnderwaterVerdict {
    // Positions with a positive peak are the Erosion Tracker's business.
    if position.peak_profit_pct > 0.0 || position.current_profit_pct >= 0.0 {
        return UnderwaterVerdict::NotApplicable;
    }

    let limits = position.underwater;
    if position.current_profit_pct >= limits.loss_threshold_pct {
        return UnderwaterVerdict::Watch;
    }

    let age = position.age_secs(now);
    if age >= limits.min_dwell_secs {
        debug!(
            id = %position.id,
            current_pct = position.current_profit_pct,
            threshold_pct = limits.loss_threshold_pct,
            age_secs = age,
            dwell_secs = limits.min_dwell_secs,
            "underwater dwell elapsed — recommending forced exit"
        );
        UnderwaterVerdict::ForceExit {
            reason: ExitReason::UnderwaterNeverProfited,
        }
    } else {
        UnderwaterVerdict::Pending {
            remaining_secs: limits.min_dwell_secs - age,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
