// =============================================================================
// Trade Ledger — arena-style store for open positions and closed trades
// =============================================================================
//
// Positions are keyed by UUID and owned exclusively by the bot instance that
// opened them. The ledger is the single write path for position state:
//   - the Tracker mutates peak fields through `apply_profit_update`,
//   - the Guard closes positions through `close_if_open`.
//
// `close_if_open` is conditional (`status == Open AND bot_id matches`), so
// closing twice, or closing another bot's position, fails with NotFound
// instead of silently double-writing.
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{ExitReason, Regime};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Current status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Per-position underwater limits, fixed at entry from the regime config.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UnderwaterLimits {
    /// Loss threshold in percent (negative, e.g. -0.5).
    pub loss_threshold_pct: f64,
    /// Minimum time below the threshold before a forced exit is recommended.
    pub min_dwell_secs: u64,
}

/// A single open trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    /// Owning bot instance. Closes from any other bot are rejected.
    pub bot_id: String,
    pub pair: String,
    pub entry_price: f64,
    pub quantity: f64,
    /// Entry fee already paid, in quote currency.
    pub entry_fee: f64,
    pub entry_time: DateTime<Utc>,
    /// Market regime label at entry; fixed for the position's lifetime.
    pub regime: Regime,
    /// Risk committed at open (quote currency), used by the exposure guard.
    pub risk_usd: f64,
    /// Underwater policy limits fixed at entry.
    pub underwater: UnderwaterLimits,
    /// Latest derived net profit-percent.
    #[serde(default)]
    pub current_profit_pct: f64,
    /// Highest profit-percent ever observed while the position was green.
    /// Monotonically non-decreasing; 0 means "never profitable".
    #[serde(default)]
    pub peak_profit_pct: f64,
    #[serde(default)]
    pub peak_recorded_at: Option<DateTime<Utc>>,
    pub status: PositionStatus,
}

impl Position {
    /// Age of the position.
    pub fn age_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.entry_time).num_seconds().max(0) as u64
    }
}

/// Immutable snapshot created exactly once when a position closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position_id: Uuid,
    pub bot_id: String,
    pub pair: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub net_pnl: f64,
    pub net_pnl_pct: f64,
    /// Entry + exit fees, quote currency.
    pub total_fees: f64,
    pub exit_reason: ExitReason,
    /// Set when the exchange-side close could not be confirmed and the
    /// database close was finalised with the requested numbers.
    #[serde(default)]
    pub needs_reconciliation: bool,
    /// Archival-visibility flag; the only field mutable after creation.
    #[serde(default)]
    pub archived: bool,
}

/// Inputs for opening a new position.
#[derive(Debug, Clone)]
pub struct OpenSpec {
    pub bot_id: String,
    pub pair: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_fee: f64,
    pub regime: Regime,
    pub risk_usd: f64,
    pub underwater: UnderwaterLimits,
}

/// Final numbers the Guard hands over when closing.
#[derive(Debug, Clone)]
pub struct CloseFill {
    pub exit_price: f64,
    pub net_pnl: f64,
    pub net_pnl_pct: f64,
    pub total_fees: f64,
    pub exit_reason: ExitReason,
    pub needs_reconciliation: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// No open position with this id belongs to the requesting bot. Covers
    /// both "already closed" and "not yours".
    #[error("no open position {0} for this bot")]
    NotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Thread-safe store owning all open positions and closed trades.
pub struct TradeLedger {
    open: RwLock<HashMap<Uuid, Position>>,
    closed: RwLock<Vec<ClosedTrade>>,
}

impl TradeLedger {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Open a new position and return its record.
    pub fn open_position(&self, spec: OpenSpec) -> Position {
        let pos = Position {
            id: Uuid::new_v4(),
            bot_id: spec.bot_id,
            pair: spec.pair,
            entry_price: spec.entry_price,
            quantity: spec.quantity,
            entry_fee: spec.entry_fee,
            entry_time: Utc::now(),
            regime: spec.regime,
            risk_usd: spec.risk_usd,
            underwater: spec.underwater,
            current_profit_pct: 0.0,
            peak_profit_pct: 0.0,
            peak_recorded_at: None,
            status: PositionStatus::Open,
        };

        info!(
            id = %pos.id,
            pair = %pos.pair,
            entry_price = pos.entry_price,
            quantity = pos.quantity,
            entry_fee = pos.entry_fee,
            regime = %pos.regime,
            risk_usd = pos.risk_usd,
            "position opened"
        );

        self.open.write().insert(pos.id, pos.clone());
        pos
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get(&self, id: Uuid) -> Option<Position> {
        self.open.read().get(&id).cloned()
    }

    /// Snapshot of all open positions.
    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().values().cloned().collect()
    }

    /// Sum of risk committed across all open positions (exposure guard input).
    pub fn open_risk_total(&self) -> f64 {
        self.open.read().values().map(|p| p.risk_usd).sum()
    }

    /// The most recent `count` closed trades (newest first), excluding
    /// archived ones.
    pub fn closed_trades(&self, count: usize) -> Vec<ClosedTrade> {
        let closed = self.closed.read();
        closed
            .iter()
            .rev()
            .filter(|t| !t.archived)
            .take(count)
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Tracker mutations
    // -------------------------------------------------------------------------

    /// Apply a Tracker profit update: latest profit-percent plus the updated
    /// (monotone) peak. No-op if the position is gone.
    pub fn apply_profit_update(
        &self,
        id: Uuid,
        current_profit_pct: f64,
        peak_profit_pct: f64,
        peak_recorded_at: Option<DateTime<Utc>>,
    ) {
        let mut open = self.open.write();
        if let Some(pos) = open.get_mut(&id) {
            pos.current_profit_pct = current_profit_pct;
            if peak_profit_pct < pos.peak_profit_pct {
                // Peak never decreases; a lower incoming value means the
                // caller raced a fresher update. Keep the stored peak.
                warn!(
                    id = %id,
                    stored_peak = pos.peak_profit_pct,
                    incoming_peak = peak_profit_pct,
                    "ignoring peak regression in profit update"
                );
            } else {
                pos.peak_profit_pct = peak_profit_pct;
                if peak_recorded_at.is_some() {
                    pos.peak_recorded_at = peak_recorded_at;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Conditional close (Guard only)
    // -------------------------------------------------------------------------

    /// Close a position if it is still open and belongs to `bot_id`.
    ///
    /// Creates the immutable `ClosedTrade` snapshot exactly once and removes
    /// the position from the open arena in the same critical section, so a
    /// concurrent close of the same id observes NotFound.
    pub fn close_if_open(
        &self,
        id: Uuid,
        bot_id: &str,
        fill: CloseFill,
    ) -> Result<ClosedTrade, LedgerError> {
        let mut open = self.open.write();

        let owned = matches!(
            open.get(&id),
            Some(p) if p.status == PositionStatus::Open && p.bot_id == bot_id
        );
        if !owned {
            return Err(LedgerError::NotFound(id));
        }
        let pos = open.remove(&id).expect("checked above");
        drop(open);

        let trade = ClosedTrade {
            position_id: pos.id,
            bot_id: pos.bot_id,
            pair: pos.pair,
            entry_price: pos.entry_price,
            quantity: pos.quantity,
            exit_price: fill.exit_price,
            exit_time: Utc::now(),
            net_pnl: fill.net_pnl,
            net_pnl_pct: fill.net_pnl_pct,
            total_fees: fill.total_fees,
            exit_reason: fill.exit_reason,
            needs_reconciliation: fill.needs_reconciliation,
            archived: false,
        };

        info!(
            id = %trade.position_id,
            pair = %trade.pair,
            exit_price = trade.exit_price,
            net_pnl = trade.net_pnl,
            net_pnl_pct = trade.net_pnl_pct,
            total_fees = trade.total_fees,
            reason = %trade.exit_reason,
            needs_reconciliation = trade.needs_reconciliation,
            "position closed"
        );

        self.closed.write().push(trade.clone());
        Ok(trade)
    }

    /// Toggle the archival-visibility flag on a closed trade.
    pub fn set_archived(&self, position_id: Uuid, archived: bool) -> bool {
        let mut closed = self.closed.write();
        if let Some(trade) = closed.iter_mut().find(|t| t.position_id == position_id) {
            trade.archived = archived;
            true
        } else {
            false
        }
    }
}

impl Default for TradeLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TradeLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeLedger")
            .field("open_positions", &self.open.read().len())
            .field("closed_trades", &self.closed.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
