// =============================================================================
// Dynamic Position Sizer — capped, confidence-scaled fractional Kelly
// =============================================================================
//
// Computes how much capital to commit to a new position:
//
//   1. Kelly fraction from historical win/loss statistics
//      (conservative fixed default until enough closed trades exist).
//   2. Damping to a configurable fraction of full Kelly.
//   3. Absolute clamp of the risk fraction to [1 %, 10 %] of balance.
//   4. Confidence multiplier mapping the upstream 0-100 score linearly
//      onto [0.5x, 2.0x], followed by a re-clamp so the absolute bound
//      holds no matter what.
//   5. Exposure guard: total open risk plus the new risk must stay under
//      a separate, smaller portfolio cap.
//
// Balance and statistics live behind a single `parking_lot::RwLock`; every
// sizing call reads the latest committed balance, and out-of-band resyncs
// from the live exchange balance are applied through the same writer.
// =============================================================================

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Absolute lower bound on the per-trade risk fraction.
pub const MIN_RISK_FRACTION: f64 = 0.01;
/// Absolute upper bound on the per-trade risk fraction. Never bypassed.
pub const MAX_RISK_FRACTION: f64 = 0.10;

/// Confidence multiplier range endpoints.
const CONF_MULT_LO: f64 = 0.5;
const CONF_MULT_HI: f64 = 2.0;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunable sizing parameters, loaded from the runtime config.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SizerConfig {
    /// Fraction of full Kelly to actually use (variance damping).
    pub kelly_damping: f64,
    /// Fixed risk fraction used until `min_trade_history` trades exist.
    pub conservative_fraction: f64,
    /// Closed trades required before the Kelly estimate is trusted.
    pub min_trade_history: u32,
    /// Confidence anchor mapped to the 0.5x multiplier.
    pub min_confidence: f64,
    /// Confidence anchor mapped to the 2.0x multiplier.
    pub max_confidence: f64,
    /// Portfolio-wide cap: sum of open risk as a fraction of balance.
    pub max_concurrent_risk_fraction: f64,
    /// When true, the balance is resynced from the live exchange balance
    /// out of band instead of being tracked purely from closed trades.
    pub unlimited_capital: bool,
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self {
            kelly_damping: 0.25,
            conservative_fraction: 0.02,
            min_trade_history: 10,
            min_confidence: 50.0,
            max_confidence: 95.0,
            max_concurrent_risk_fraction: 0.05,
            unlimited_capital: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Public results
// ---------------------------------------------------------------------------

/// Sizing answer handed to order placement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PositionSize {
    /// Position size in quote currency.
    pub size_usd: f64,
    /// Position size in asset units at the given price.
    pub size_asset: f64,
    /// Capital at risk in quote currency.
    pub risk_usd: f64,
    /// Final risk fraction after damping, clamping, and confidence scaling.
    pub risk_fraction: f64,
}

/// Snapshot of the per-account running statistics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SizerSnapshot {
    pub balance: f64,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub avg_win_pct: f64,
    /// Average losing percent as a positive magnitude.
    pub avg_loss_pct: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingError {
    #[error("invalid sizing input: {0}")]
    Validation(String),
    #[error(
        "exposure cap exceeded: open risk {open_risk:.2} + new risk {new_risk:.2} \
         > {cap:.2} ({cap_fraction:.0}% of balance)"
    )]
    ExposureExceeded {
        open_risk: f64,
        new_risk: f64,
        cap: f64,
        cap_fraction: f64,
    },
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

struct Inner {
    balance: f64,
    total_trades: u32,
    winning_trades: u32,
    losing_trades: u32,
    avg_win_pct: f64,
    avg_loss_pct: f64,
}

// ---------------------------------------------------------------------------
// Sizer
// ---------------------------------------------------------------------------

/// Per-account position sizer. Created with an account and kept for its
/// lifetime; statistics are only reset by explicit operator action.
pub struct PositionSizer {
    config: SizerConfig,
    state: RwLock<Inner>,
}

impl PositionSizer {
    pub fn new(config: SizerConfig, starting_balance: f64) -> Self {
        info!(
            balance = starting_balance,
            kelly_damping = config.kelly_damping,
            conservative_fraction = config.conservative_fraction,
            max_concurrent_risk_fraction = config.max_concurrent_risk_fraction,
            unlimited_capital = config.unlimited_capital,
            "PositionSizer initialised"
        );
        Self {
            config,
            state: RwLock::new(Inner {
                balance: starting_balance,
                total_trades: 0,
                winning_trades: 0,
                losing_trades: 0,
                avg_win_pct: 0.0,
                avg_loss_pct: 0.0,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Sizing
    // -------------------------------------------------------------------------

    /// Size a new position.
    ///
    /// * `confidence`    — upstream signal confidence in [0, 100].
    /// * `price`         — current asset price (quote currency).
    /// * `stop_loss_pct` — stop distance in percent (2.0 == 2 %).
    /// * `open_risk`     — sum of risk already committed to open positions.
    pub fn size_position(
        &self,
        confidence: f64,
        price: f64,
        stop_loss_pct: f64,
        open_risk: f64,
    ) -> Result<PositionSize, SizingError> {
        if !confidence.is_finite() || !(0.0..=100.0).contains(&confidence) {
            return Err(SizingError::Validation(format!(
                "confidence {confidence} outside [0, 100]"
            )));
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(SizingError::Validation(format!("price {price} must be > 0")));
        }
        if !stop_loss_pct.is_finite() || stop_loss_pct <= 0.0 || stop_loss_pct > 100.0 {
            return Err(SizingError::Validation(format!(
                "stop_loss_pct {stop_loss_pct} outside (0, 100]"
            )));
        }

        let s = self.state.read();
        let balance = s.balance;
        if balance <= 0.0 {
            return Err(SizingError::Validation(format!(
                "balance {balance} must be > 0"
            )));
        }

        // 1-2. Kelly fraction damped to the configured fraction of full
        // Kelly, or the conservative default on sparse history.
        let (kelly, damped) = match self.kelly_fraction(&s) {
            Some(k) => (k, k * self.config.kelly_damping),
            None => (0.0, self.config.conservative_fraction),
        };
        drop(s);

        // 3. Absolute per-trade bound.
        let clamped = damped.clamp(MIN_RISK_FRACTION, MAX_RISK_FRACTION);

        // 4. Confidence scaling, re-clamped: the bound is unconditional.
        let conf_mult = remap(
            confidence,
            self.config.min_confidence,
            self.config.max_confidence,
            CONF_MULT_LO,
            CONF_MULT_HI,
        );
        let final_fraction = (clamped * conf_mult).clamp(MIN_RISK_FRACTION, MAX_RISK_FRACTION);

        // 5. Exposure guard against the portfolio cap.
        let risk_usd = balance * final_fraction;
        let cap = balance * self.config.max_concurrent_risk_fraction;
        if open_risk + risk_usd > cap {
            warn!(
                open_risk,
                new_risk = risk_usd,
                cap,
                "new position rejected by exposure guard"
            );
            return Err(SizingError::ExposureExceeded {
                open_risk,
                new_risk: risk_usd,
                cap,
                cap_fraction: self.config.max_concurrent_risk_fraction * 100.0,
            });
        }

        let size_usd = risk_usd / (stop_loss_pct / 100.0);
        let size_asset = size_usd / price;

        debug!(
            confidence,
            kelly = format!("{:.4}", kelly),
            damped = format!("{:.4}", damped),
            clamped = format!("{:.4}", clamped),
            conf_mult = format!("{:.2}", conf_mult),
            final_fraction = format!("{:.4}", final_fraction),
            risk_usd = format!("{:.2}", risk_usd),
            size_usd = format!("{:.2}", size_usd),
            "position sized"
        );

        Ok(PositionSize {
            size_usd,
            size_asset,
            risk_usd,
            risk_fraction: final_fraction,
        })
    }

    /// Kelly fraction from the running statistics:
    /// `(win_rate * avg_win - (1 - win_rate) * avg_loss) / avg_win`.
    ///
    /// Returns `None` below `min_trade_history` closed trades — the estimate
    /// from sparse data is unstable and the caller falls back to the fixed
    /// conservative default.
    fn kelly_fraction(&self, s: &Inner) -> Option<f64> {
        if s.total_trades < self.config.min_trade_history || s.avg_win_pct <= 0.0 {
            return None;
        }
        let win_rate = s.winning_trades as f64 / s.total_trades as f64;
        Some((win_rate * s.avg_win_pct - (1.0 - win_rate) * s.avg_loss_pct) / s.avg_win_pct)
    }

    // -------------------------------------------------------------------------
    // State updates
    // -------------------------------------------------------------------------

    /// Record a closed trade's result and update balance and statistics.
    pub fn record_trade_result(&self, net_pnl: f64, net_pnl_pct: f64) {
        let mut s = self.state.write();

        s.total_trades += 1;
        if net_pnl >= 0.0 {
            s.winning_trades += 1;
            let n = s.winning_trades as f64;
            s.avg_win_pct += (net_pnl_pct - s.avg_win_pct) / n;
        } else {
            s.losing_trades += 1;
            let n = s.losing_trades as f64;
            s.avg_loss_pct += (net_pnl_pct.abs() - s.avg_loss_pct) / n;
        }

        if !self.config.unlimited_capital {
            s.balance += net_pnl;
        }

        debug!(
            net_pnl,
            net_pnl_pct,
            balance = s.balance,
            total_trades = s.total_trades,
            win_rate = s.winning_trades as f64 / s.total_trades as f64,
            "trade result recorded"
        );
    }

    /// Accept an out-of-band balance update from the live exchange balance.
    /// Every sizing computation after this call sees the new value.
    pub fn resync_balance(&self, balance: f64) {
        if !balance.is_finite() || balance < 0.0 {
            warn!(balance, "ignoring invalid balance resync");
            return;
        }
        let mut s = self.state.write();
        let old = s.balance;
        s.balance = balance;
        debug!(old_balance = old, new_balance = balance, "balance resynced");
    }

    /// Operator-initiated full reset of the running statistics.
    pub fn reset(&self, starting_balance: f64) {
        let mut s = self.state.write();
        *s = Inner {
            balance: starting_balance,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            avg_win_pct: 0.0,
            avg_loss_pct: 0.0,
        };
        info!(balance = starting_balance, "sizer statistics reset (manual)");
    }

    /// Serialisable snapshot of the current statistics.
    pub fn snapshot(&self) -> SizerSnapshot {
        let s = self.state.read();
        SizerSnapshot {
            balance: s.balance,
            total_trades: s.total_trades,
            winning_trades: s.winning_trades,
            losing_trades: s.losing_trades,
            avg_win_pct: s.avg_win_pct,
            avg_loss_pct: s.avg_loss_pct,
            win_rate: if s.total_trades > 0 {
                s.winning_trades as f64 / s.total_trades as f64
            } else {
                0.0
            },
        }
    }
}

impl std::fmt::Debug for PositionSizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("PositionSizer")
            .field("balance", &s.balance)
            .field("total_trades", &s.total_trades)
            .field("config", &self.config)
            .finish()
    }
}

/// Linearly remap `value` from `[in_lo, in_hi]` to `[out_lo, out_hi]`,
/// clamped to the output range.
fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        (value - in_lo) / (in_hi - in_lo)
    };
    out_lo + t.clamp(0.0, 1.0) * (out_hi - out_lo)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn sizer(balance: f64) -> PositionSizer {
        PositionSizer::new(SizerConfig::default(), balance)
    }

    /// Feed `wins` winning and `losses` losing trades with the given percents.
    fn seed_history(s: &PositionSizer, wins: u32, win_pct: f64, losses: u32, loss_pct: f64) {
        for _ in 0..wins {
            s.record_trade_result(1.0, win_pct);
        }
        for _ in 0..losses {
            s.record_trade_result(-1.0, -loss_pct);
        }
    }

    #[test]
    fn conservative_default_before_history() {
        let s = sizer(10_000.0);
        let size = s.size_position(72.5, 100.0, 2.0, 0.0).unwrap();
        // 0.02 conservative fraction, confidence 72.5 == midpoint -> 1.25x.
        assert!((size.risk_fraction - 0.025).abs() < 1e-9);
        assert!((size.risk_usd - 250.0).abs() < 1e-6);
    }

    #[test]
    fn kelly_engages_after_ten_trades() {
        let s = PositionSizer::new(
            SizerConfig {
                unlimited_capital: true, // freeze balance for the assertion
                ..SizerConfig::default()
            },
            10_000.0,
        );
        // 60 % win rate, avg win 4 %, avg loss 2 %:
        // kelly = (0.6*4 - 0.4*2) / 4 = 0.4; damped 0.1; clamped 0.1.
        seed_history(&s, 6, 4.0, 4, 2.0);
        let size = s.size_position(50.0, 100.0, 2.0, 0.0).unwrap();
        // Confidence 50 -> 0.5x of 0.10 -> 0.05.
        assert!((size.risk_fraction - 0.05).abs() < 1e-9);
    }

    #[test]
    fn negative_edge_clamps_to_floor() {
        let s = sizer(10_000.0);
        // 30 % win rate with symmetric magnitudes: negative Kelly.
        seed_history(&s, 3, 2.0, 7, 2.0);
        let size = s.size_position(50.0, 100.0, 2.0, 0.0).unwrap();
        assert!((size.risk_fraction - MIN_RISK_FRACTION).abs() < 1e-12);
    }

    #[test]
    fn risk_fraction_bounded_under_random_inputs() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            // Exposure cap lifted so only the per-trade bound is exercised.
            let s = PositionSizer::new(
                SizerConfig {
                    max_concurrent_risk_fraction: 1.0,
                    ..SizerConfig::default()
                },
                rng.gen_range(100.0..1_000_000.0),
            );
            let trades = rng.gen_range(0..40);
            let win_probability = rng.gen_range(0.05..0.95);
            for _ in 0..trades {
                if rng.gen_bool(win_probability) {
                    s.record_trade_result(1.0, rng.gen_range(0.1..20.0));
                } else {
                    s.record_trade_result(-1.0, -rng.gen_range(0.1..20.0));
                }
            }
            let confidence = rng.gen_range(50.0..95.0);
            let size = s
                .size_position(confidence, rng.gen_range(0.01..100_000.0), 2.0, 0.0)
                .unwrap();
            assert!(
                (MIN_RISK_FRACTION..=MAX_RISK_FRACTION).contains(&size.risk_fraction),
                "fraction {} out of bounds at confidence {confidence}",
                size.risk_fraction
            );
        }
    }

    #[test]
    fn confidence_scales_linearly_between_anchors() {
        let s = sizer(10_000.0);
        let low = s.size_position(50.0, 100.0, 2.0, 0.0).unwrap();
        let high = s.size_position(95.0, 100.0, 2.0, 0.0).unwrap();
        // Conservative base 0.02: 0.5xvs 2.0x -> 0.01 vs 0.04.
        assert!((low.risk_fraction - 0.01).abs() < 1e-9);
        assert!((high.risk_fraction - 0.04).abs() < 1e-9);
        // Below the anchor the multiplier saturates.
        let floor = s.size_position(10.0, 100.0, 2.0, 0.0).unwrap();
        assert!((floor.risk_fraction - low.risk_fraction).abs() < 1e-12);
    }

    #[test]
    fn sizes_derive_from_stop_and_price() {
        let s = sizer(10_000.0);
        let size = s.size_position(72.5, 50.0, 2.0, 0.0).unwrap();
        // risk 250 at 2 % stop -> 12 500 notional -> 250 asset units at 50.
        assert!((size.size_usd - 12_500.0).abs() < 1e-6);
        assert!((size.size_asset - 250.0).abs() < 1e-6);
    }

    #[test]
    fn exposure_guard_rejects_over_cap() {
        let s = sizer(10_000.0);
        // Cap is 5 % of balance = 500. Open risk 400, new risk 250 -> reject.
        let err = s.size_position(72.5, 100.0, 2.0, 400.0).unwrap_err();
        assert!(matches!(err, SizingError::ExposureExceeded { .. }));
        // Under the cap it goes through.
        assert!(s.size_position(72.5, 100.0, 2.0, 200.0).is_ok());
    }

    #[test]
    fn resync_balance_used_immediately() {
        let s = sizer(10_000.0);
        s.resync_balance(20_000.0);
        let size = s.size_position(72.5, 100.0, 2.0, 0.0).unwrap();
        assert!((size.risk_usd - 500.0).abs() < 1e-6);
        // Invalid resyncs are ignored.
        s.resync_balance(f64::NAN);
        assert!((s.snapshot().balance - 20_000.0).abs() < 1e-9);
    }

    #[test]
    fn balance_tracks_closed_trades() {
        let s = sizer(1_000.0);
        s.record_trade_result(25.0, 2.5);
        s.record_trade_result(-10.0, -1.0);
        assert!((s.snapshot().balance - 1_015.0).abs() < 1e-9);
    }

    #[test]
    fn running_averages_are_means() {
        let s = sizer(1_000.0);
        s.record_trade_result(1.0, 2.0);
        s.record_trade_result(1.0, 4.0);
        s.record_trade_result(-1.0, -3.0);
        let snap = s.snapshot();
        assert!((snap.avg_win_pct - 3.0).abs() < 1e-9);
        assert!((snap.avg_loss_pct - 3.0).abs() < 1e-9);
        assert!((snap.win_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_invalid_inputs() {
        let s = sizer(1_000.0);
        assert!(s.size_position(101.0, 100.0, 2.0, 0.0).is_err());
        assert!(s.size_position(-1.0, 100.0, 2.0, 0.0).is_err());
        assert!(s.size_position(70.0, 0.0, 2.0, 0.0).is_err());
        assert!(s.size_position(70.0, 100.0, 0.0, 0.0).is_err());
        assert!(s.size_position(70.0, 100.0, 120.0, 0.0).is_err());
    }

    #[test]
    fn manual_reset_clears_statistics() {
        let s = sizer(1_000.0);
        seed_history(&s, 5, 2.0, 5, 2.0);
        s.reset(2_000.0);
        let snap = s.snapshot();
        assert_eq!(snap.total_trades, 0);
        assert!((snap.balance - 2_000.0).abs() < 1e-12);
    }
}
