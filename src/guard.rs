// =============================================================================
// Exit Execution Guard — the single gate every position close passes through
// =============================================================================
//
// The Guard serializes closes per position (advisory locks), validates the
// market data is fresh, enforces the breakeven floor on profit-protection
// exits, places the IOC order with bounded retries, and settles the ledger
// from the ACTUAL fill — never from the requested price.
//
// Outcomes are explicit:
//   - Closed    — ledger settled, sizer updated.
//   - Deferred  — nothing happened; safe to try again next scan.
//   - Rejected  — close refused (busy, gone, or would realise a loss on a
//                 profit-protection exit).
//
// If the exchange rejects the order outright (fatal error) the ledger close
// is finalised anyway at the submitted limit price and flagged
// `needs_reconciliation` so the books never hold a phantom open position.
// A spent retry budget on transient errors defers instead: the position
// stays open and the caller (or the next scan) tries again later.
//
// Every outcome is recorded into the shared audit rings with its reason.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::accounting;
use crate::engine_state::AuditSink;
use crate::exchange::{FeeSchedule, GatewayError, OrderGateway, OrderSide, TimeInForce};
use crate::feed::PriceFeed;
use crate::ledger::{CloseFill, ClosedTrade, Position, TradeLedger};
use crate::retry::{self, RetryError, RetryPolicy};
use crate::sizer::PositionSizer;
use crate::types::ExitIntent;

/// Net-percent tolerance in the race-abort check. A fill at the computed
/// breakeven floor recomputes to a sub-femto negative under f64 rounding
/// and must still count as breakeven.
const BREAKEVEN_EPSILON_PCT: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a close attempt was postponed. The position is untouched; a later
/// attempt with the same intent is safe.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeferReason {
    /// No quote available for the pair.
    NoQuote,
    /// The latest quote is older than the freshness window.
    StaleQuote { age_secs: i64, max_age_secs: u64 },
    /// The IOC order found no liquidity at or above the limit price.
    NoFill { limit_price: f64 },
    /// The retry budget was spent on transient exchange errors. Nothing was
    /// booked; the caller retries once the exchange recovers.
    RetriesExhausted { attempts: u32 },
}

/// Why a close attempt was refused outright.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// Another close of the same position is in flight.
    LockBusy,
    /// No open position with this id belongs to this bot.
    NotFound,
    /// Invalid inputs (bad fee schedule, corrupt position numbers).
    Validation { message: String },
    /// A profit-protection exit would have realised a net loss once the
    /// actual fill and fees were accounted. The position stays open.
    RaceAbort { net_pnl_pct: f64 },
}

/// Terminal result of one close attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CloseOutcome {
    Closed { trade: ClosedTrade },
    Deferred { reason: DeferReason },
    Rejected { reason: RejectReason },
}

// ---------------------------------------------------------------------------
// Advisory per-position locks
// ---------------------------------------------------------------------------

/// Registry of positions with a close currently in flight.
#[derive(Debug, Default)]
struct PositionLocks {
    held: Mutex<HashSet<Uuid>>,
}

impl PositionLocks {
    /// Try to take the lock for `id`. Returns None if already held.
    fn try_acquire(self: &Arc<Self>, id: Uuid) -> Option<LockToken> {
        if self.held.lock().insert(id) {
            Some(LockToken {
                locks: Arc::clone(self),
                id,
            })
        } else {
            None
        }
    }
}

/// Releases the advisory lock on drop, including on early returns.
struct LockToken {
    locks: Arc<PositionLocks>,
    id: Uuid,
}

impl Drop for LockToken {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

pub struct ExitGuard {
    bot_id: String,
    ledger: Arc<TradeLedger>,
    sizer: Arc<PositionSizer>,
    gateway: Arc<dyn OrderGateway>,
    feed: Arc<dyn PriceFeed>,
    fees: FeeSchedule,
    retry_policy: RetryPolicy,
    /// Quotes older than this are refused (seconds).
    max_quote_age_secs: u64,
    locks: Arc<PositionLocks>,
    audit: AuditSink,
}

impl ExitGuard {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot_id: String,
        ledger: Arc<TradeLedger>,
        sizer: Arc<PositionSizer>,
        gateway: Arc<dyn OrderGateway>,
        feed: Arc<dyn PriceFeed>,
        fees: FeeSchedule,
        retry_policy: RetryPolicy,
        max_quote_age_secs: u64,
        audit: AuditSink,
    ) -> Self {
        Self {
            bot_id,
            ledger,
            sizer,
            gateway,
            feed,
            fees,
            retry_policy,
            max_quote_age_secs,
            locks: Arc::new(PositionLocks::default()),
            audit,
        }
    }

    /// Record a rejection in the audit trail with its reason serialized
    /// verbatim, then hand it back.
    fn reject(&self, id: Uuid, reason: RejectReason) -> CloseOutcome {
        self.audit.event(Some(id), "close_rejected", serialize_reason(&reason));
        CloseOutcome::Rejected { reason }
    }

    fn defer(&self, id: Uuid, reason: DeferReason) -> CloseOutcome {
        self.audit.event(Some(id), "close_deferred", serialize_reason(&reason));
        CloseOutcome::Deferred { reason }
    }

    /// Minimum exit price at which the position breaks even after the entry
    /// fee and the taker fee on the exit notional.
    pub fn breakeven_floor(position: &Position, taker_rate: f64) -> f64 {
        let entry_cost = position.entry_price * position.quantity + position.entry_fee;
        entry_cost / (position.quantity * (1.0 - taker_rate))
    }

    /// Attempt to close `id` under `intent`. Never panics, never leaves the
    /// ledger half-written; exactly one `CloseOutcome` comes back.
    pub async fn close_position(&self, id: Uuid, intent: ExitIntent) -> CloseOutcome {
        let _token = match self.locks.try_acquire(id) {
            Some(t) => t,
            None => {
                warn!(id = %id, reason = %intent.reason, "close already in flight — rejecting");
                return self.reject(id, RejectReason::LockBusy);
            }
        };

        let pos = match self.ledger.get(id) {
            Some(p) => p,
            None => return self.reject(id, RejectReason::NotFound),
        };

        let taker_rate = self.fees.taker_rate(&pos.pair);
        if !(0.0..1.0).contains(&taker_rate) {
            return self.reject(
                id,
                RejectReason::Validation {
                    message: format!("taker fee rate {taker_rate} out of range"),
                },
            );
        }

        // Freshness gate: even an explicitly priced exit is refused when the
        // market view is stale, so forced exits never act on dead data.
        let now = Utc::now();
        let quote = match self.feed.quote(&pos.pair).await {
            Some(q) => q,
            None => {
                warn!(id = %id, pair = %pos.pair, "no quote for pair — deferring close");
                self.audit
                    .error("price_feed", format!("no quote for {}", pos.pair));
                return self.defer(id, DeferReason::NoQuote);
            }
        };
        if !quote.is_fresh(now, self.max_quote_age_secs) {
            let age = quote.age_secs(now);
            warn!(
                id = %id,
                pair = %pos.pair,
                age_secs = age,
                "quote too old — deferring close"
            );
            self.audit.error(
                "price_feed",
                format!("stale quote for {} ({age}s old)", pos.pair),
            );
            return self.defer(
                id,
                DeferReason::StaleQuote {
                    age_secs: age,
                    max_age_secs: self.max_quote_age_secs,
                },
            );
        }

        // Profit-protection exits are floored at breakeven; loss-taking exits
        // (stop loss, underwater, manual) sell at the requested/market price.
        let base_price = intent.requested_price.unwrap_or(quote.price);
        let limit_price = if intent.reason.is_profit_protection() {
            base_price.max(Self::breakeven_floor(&pos, taker_rate))
        } else {
            base_price
        };
        if !limit_price.is_finite() || limit_price <= 0.0 {
            return self.reject(
                id,
                RejectReason::Validation {
                    message: format!("computed limit price {limit_price} is invalid"),
                },
            );
        }

        info!(
            id = %id,
            pair = %pos.pair,
            reason = %intent.reason,
            limit_price,
            quote_price = quote.price,
            "submitting exit order"
        );

        let placed = retry::run(
            &self.retry_policy,
            "exit_order",
            |e: &GatewayError| e.is_retryable(),
            || {
                self.gateway.place_order(
                    &pos.pair,
                    OrderSide::Sell,
                    pos.quantity,
                    limit_price,
                    TimeInForce::Ioc,
                )
            },
        )
        .await;

        let fill = match placed {
            Ok(fill) => fill,
            Err(RetryError::Fatal(e)) => {
                // The exchange rejected the order outright. Finalise the
                // ledger close at the submitted limit with a projected fee
                // and flag it for manual reconciliation rather than leave a
                // phantom open position.
                error!(id = %id, error = %e, "fatal exchange error on close");
                self.audit
                    .error("exchange", format!("fatal error closing {id}: {e}"));
                let projected_fee = limit_price * pos.quantity * taker_rate;
                return self.settle(&pos, intent, limit_price, projected_fee, true);
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                // Transient outage outlasted the retry budget. Nothing was
                // confirmed on the exchange, so nothing is booked: the
                // position stays open and the next attempt starts fresh.
                error!(id = %id, attempts, error = %last, "close retries exhausted");
                self.audit.error(
                    "exchange",
                    format!("retries exhausted closing {id} after {attempts} attempts: {last}"),
                );
                return self.defer(id, DeferReason::RetriesExhausted { attempts });
            }
        };

        if !fill.is_filled() {
            info!(id = %id, limit_price, "IOC expired unfilled — deferring close");
            return self.defer(id, DeferReason::NoFill { limit_price });
        }

        self.settle(&pos, intent, fill.avg_price, fill.fee, false)
    }

    /// Recompute P&L from the actual (or projected) fill, enforce the
    /// race-abort rule, and write the ledger + sizer exactly once.
    fn settle(
        &self,
        pos: &Position,
        intent: ExitIntent,
        exit_price: f64,
        exit_fee: f64,
        needs_reconciliation: bool,
    ) -> CloseOutcome {
        let net = match accounting::net_pnl(
            pos.entry_price,
            exit_price,
            pos.quantity,
            pos.entry_fee,
            exit_fee,
        ) {
            Ok(n) => n,
            Err(e) => {
                return self.reject(
                    pos.id,
                    RejectReason::Validation {
                        message: e.to_string(),
                    },
                );
            }
        };
        let net_pct = match accounting::net_pnl_percent(net, pos.entry_price, pos.quantity) {
            Ok(p) => p,
            Err(e) => {
                return self.reject(
                    pos.id,
                    RejectReason::Validation {
                        message: e.to_string(),
                    },
                );
            }
        };

        // A "protect the profit" exit that would book a loss means the market
        // moved between decision and fill. Abort; the position stays open and
        // the next scan re-evaluates from fresh numbers. A fill exactly at
        // the breakeven floor is breakeven, not a loss, hence the epsilon.
        if intent.reason.is_profit_protection() && net_pct < -BREAKEVEN_EPSILON_PCT {
            warn!(
                id = %pos.id,
                reason = %intent.reason,
                exit_price,
                net_pnl = net,
                net_pnl_pct = net_pct,
                "profit-protection close would realise a loss — aborting"
            );
            return self.reject(pos.id, RejectReason::RaceAbort { net_pnl_pct: net_pct });
        }

        let fill = CloseFill {
            exit_price,
            net_pnl: net,
            net_pnl_pct: net_pct,
            total_fees: pos.entry_fee + exit_fee,
            exit_reason: intent.reason,
            needs_reconciliation,
        };

        match self.ledger.close_if_open(pos.id, &self.bot_id, fill) {
            Ok(trade) => {
                self.sizer.record_trade_result(trade.net_pnl, trade.net_pnl_pct);
                self.audit.event(
                    Some(pos.id),
                    "close",
                    format!(
                        "{} at {:.8} (net {:.4}, {:.4}%{})",
                        trade.exit_reason,
                        trade.exit_price,
                        trade.net_pnl,
                        trade.net_pnl_pct,
                        if trade.needs_reconciliation {
                            ", needs reconciliation"
                        } else {
                            ""
                        }
                    ),
                );
                CloseOutcome::Closed { trade }
            }
            Err(_) => self.reject(pos.id, RejectReason::NotFound),
        }
    }
}

/// JSON form of a defer/reject reason for the audit trail. Falls back to the
/// Debug rendering if serialization ever fails.
fn serialize_reason<R: Serialize + std::fmt::Debug>(reason: &R) -> String {
    serde_json::to_string(reason).unwrap_or_else(|_| format!("{reason:?}"))
}

impl std::fmt::Debug for ExitGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitGuard")
            .field("bot_id", &self.bot_id)
            .field("max_quote_age_secs", &self.max_quote_age_secs)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{GatewayError, OrderFill, OrderStatus, SimGateway};
    use crate::feed::CachedPriceFeed;
    use crate::ledger::{OpenSpec, UnderwaterLimits};
    use crate::sizer::SizerConfig;
    use crate::types::{ExitReason, Regime};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Fills every order at a fixed price regardless of the submitted limit.
    struct FixedFillGateway {
        fill_price: f64,
        taker_rate: f64,
    }

    #[async_trait]
    impl OrderGateway for FixedFillGateway {
        async fn place_order(
            &self,
            _pair: &str,
            _side: OrderSide,
            amount: f64,
            _price: f64,
            _tif: TimeInForce,
        ) -> Result<OrderFill, GatewayError> {
            Ok(OrderFill {
                filled: amount,
                avg_price: self.fill_price,
                fee: amount * self.fill_price * self.taker_rate,
                fee_asset: "USDT".to_string(),
                status: OrderStatus::Filled,
            })
        }

        async fn account_balance(&self, _asset: &str) -> Result<f64, GatewayError> {
            Ok(0.0)
        }
    }

    /// Always fails hard.
    struct BrokenGateway;

    #[async_trait]
    impl OrderGateway for BrokenGateway {
        async fn place_order(
            &self,
            _pair: &str,
            _side: OrderSide,
            _amount: f64,
            _price: f64,
            _tif: TimeInForce,
        ) -> Result<OrderFill, GatewayError> {
            Err(GatewayError::Fatal("account suspended".to_string()))
        }

        async fn account_balance(&self, _asset: &str) -> Result<f64, GatewayError> {
            Err(GatewayError::Fatal("account suspended".to_string()))
        }
    }

    /// Every call fails with a retryable error, as during an exchange outage.
    struct OutageGateway;

    #[async_trait]
    impl OrderGateway for OutageGateway {
        async fn place_order(
            &self,
            _pair: &str,
            _side: OrderSide,
            _amount: f64,
            _price: f64,
            _tif: TimeInForce,
        ) -> Result<OrderFill, GatewayError> {
            Err(GatewayError::Transient("503 service unavailable".to_string()))
        }

        async fn account_balance(&self, _asset: &str) -> Result<f64, GatewayError> {
            Err(GatewayError::Transient("503 service unavailable".to_string()))
        }
    }

    /// IOC never finds liquidity.
    struct NoLiquidityGateway;

    #[async_trait]
    impl OrderGateway for NoLiquidityGateway {
        async fn place_order(
            &self,
            _pair: &str,
            _side: OrderSide,
            _amount: f64,
            _price: f64,
            _tif: TimeInForce,
        ) -> Result<OrderFill, GatewayError> {
            Ok(OrderFill {
                filled: 0.0,
                avg_price: 0.0,
                fee: 0.0,
                fee_asset: String::new(),
                status: OrderStatus::Expired,
            })
        }

        async fn account_balance(&self, _asset: &str) -> Result<f64, GatewayError> {
            Ok(0.0)
        }
    }

    fn open_spec() -> OpenSpec {
        OpenSpec {
            bot_id: "bot-1".to_string(),
            pair: "BTCUSDT".to_string(),
            entry_price: 45_000.0,
            quantity: 0.01,
            entry_fee: 2.0,
            regime: Regime::Moderate,
            risk_usd: 10.0,
            underwater: UnderwaterLimits {
                loss_threshold_pct: -0.5,
                min_dwell_secs: 900,
            },
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    struct Rig {
        ledger: Arc<TradeLedger>,
        sizer: Arc<PositionSizer>,
        feed: Arc<CachedPriceFeed>,
        audit: AuditSink,
        guard: ExitGuard,
    }

    fn rig(gateway: Arc<dyn OrderGateway>) -> Rig {
        let ledger = Arc::new(TradeLedger::new());
        let sizer = Arc::new(PositionSizer::new(SizerConfig::default(), 1_000.0));
        let feed = Arc::new(CachedPriceFeed::new());
        let audit = AuditSink::new(32, 32);
        let guard = ExitGuard::new(
            "bot-1".to_string(),
            Arc::clone(&ledger),
            Arc::clone(&sizer),
            gateway,
            Arc::clone(&feed) as Arc<dyn PriceFeed>,
            FeeSchedule::flat(0.001),
            fast_retry(),
            30,
            audit.clone(),
        );
        Rig {
            ledger,
            sizer,
            feed,
            audit,
            guard,
        }
    }

    #[test]
    fn breakeven_floor_covers_both_fees() {
        let ledger = TradeLedger::new();
        let pos = ledger.open_position(open_spec());
        let floor = ExitGuard::breakeven_floor(&pos, 0.001);
        // Selling exactly at the floor nets zero after entry + exit fees.
        let exit_fee = floor * pos.quantity * 0.001;
        let net =
            accounting::net_pnl(pos.entry_price, floor, pos.quantity, pos.entry_fee, exit_fee)
                .unwrap();
        assert!(net.abs() < 1e-9);
        assert!(floor > pos.entry_price);
    }

    #[tokio::test]
    async fn successful_close_settles_ledger_and_sizer() {
        let r = rig(Arc::new(SimGateway::new(0.001, 10_000.0)));
        let pos = r.ledger.open_position(open_spec());
        r.feed.push_now("BTCUSDT", 46_000.0);

        let out = r
            .guard
            .close_position(pos.id, ExitIntent::new(ExitReason::ProfitTarget))
            .await;

        match out {
            CloseOutcome::Closed { trade } => {
                assert!(trade.net_pnl > 0.0);
                assert!(!trade.needs_reconciliation);
                assert_eq!(trade.exit_reason, ExitReason::ProfitTarget);
            }
            other => panic!("expected Closed, got {other:?}"),
        }
        assert!(r.ledger.get(pos.id).is_none());
        let snap = r.sizer.snapshot();
        assert_eq!(snap.total_trades, 1);
        assert_eq!(snap.winning_trades, 1);
        assert!(snap.balance > 1_000.0);
    }

    #[tokio::test]
    async fn race_abort_keeps_position_open() {
        // Profit-target close, but the market already slipped: the fill comes
        // back at 44,990 against a 45,000 entry.
        let r = rig(Arc::new(FixedFillGateway {
            fill_price: 44_990.0,
            taker_rate: 0.001,
        }));
        let pos = r.ledger.open_position(open_spec());
        r.feed.push_now("BTCUSDT", 44_990.0);

        let out = r
            .guard
            .close_position(pos.id, ExitIntent::new(ExitReason::ProfitTarget))
            .await;

        match out {
            CloseOutcome::Rejected {
                reason: RejectReason::RaceAbort { net_pnl_pct },
            } => assert!(net_pnl_pct < 0.0),
            other => panic!("expected RaceAbort, got {other:?}"),
        }
        // Untouched: still open, nothing journalled, sizer unchanged.
        assert!(r.ledger.get(pos.id).is_some());
        assert!(r.ledger.closed_trades(10).is_empty());
        assert_eq!(r.sizer.snapshot().total_trades, 0);
    }

    #[tokio::test]
    async fn loss_taking_exit_books_the_loss() {
        // Same slipped fill, but a stop loss is allowed to realise it.
        let r = rig(Arc::new(FixedFillGateway {
            fill_price: 44_990.0,
            taker_rate: 0.001,
        }));
        let pos = r.ledger.open_position(open_spec());
        r.feed.push_now("BTCUSDT", 44_990.0);

        let out = r
            .guard
            .close_position(pos.id, ExitIntent::new(ExitReason::StopLoss))
            .await;

        match out {
            CloseOutcome::Closed { trade } => assert!(trade.net_pnl < 0.0),
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_quote_defers() {
        let r = rig(Arc::new(SimGateway::new(0.001, 10_000.0)));
        let pos = r.ledger.open_position(open_spec());
        r.feed
            .push("BTCUSDT", 46_000.0, Utc::now() - chrono::Duration::seconds(120));

        let out = r
            .guard
            .close_position(pos.id, ExitIntent::new(ExitReason::Manual))
            .await;
        assert!(matches!(
            out,
            CloseOutcome::Deferred {
                reason: DeferReason::StaleQuote { .. }
            }
        ));
        assert!(r.ledger.get(pos.id).is_some());
    }

    #[tokio::test]
    async fn missing_quote_defers() {
        let r = rig(Arc::new(SimGateway::new(0.001, 10_000.0)));
        let pos = r.ledger.open_position(open_spec());

        let out = r
            .guard
            .close_position(pos.id, ExitIntent::new(ExitReason::Manual))
            .await;
        assert!(matches!(
            out,
            CloseOutcome::Deferred {
                reason: DeferReason::NoQuote
            }
        ));
    }

    #[tokio::test]
    async fn unfilled_ioc_defers() {
        let r = rig(Arc::new(NoLiquidityGateway));
        let pos = r.ledger.open_position(open_spec());
        r.feed.push_now("BTCUSDT", 46_000.0);

        let out = r
            .guard
            .close_position(pos.id, ExitIntent::new(ExitReason::ErosionCapExceeded))
            .await;
        assert!(matches!(
            out,
            CloseOutcome::Deferred {
                reason: DeferReason::NoFill { .. }
            }
        ));
        assert!(r.ledger.get(pos.id).is_some());
    }

    #[tokio::test]
    async fn fill_exactly_at_breakeven_floor_closes() {
        // The floor price itself recomputes to a tiny negative net under f64
        // rounding; that must count as breakeven, not a race abort.
        let ledger = TradeLedger::new();
        let floor = ExitGuard::breakeven_floor(&ledger.open_position(open_spec()), 0.001);

        let r = rig(Arc::new(FixedFillGateway {
            fill_price: floor,
            taker_rate: 0.001,
        }));
        let pos = r.ledger.open_position(open_spec());
        r.feed.push_now("BTCUSDT", floor);

        let out = r
            .guard
            .close_position(pos.id, ExitIntent::new(ExitReason::BreakevenProtection))
            .await;

        match out {
            CloseOutcome::Closed { trade } => assert!(trade.net_pnl.abs() < 1e-6),
            other => panic!("expected Closed at the floor, got {other:?}"),
        }
        assert!(r.ledger.get(pos.id).is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_defer_and_leave_position_open() {
        // An outage that outlasts the retry budget books nothing: no close,
        // no journal entry, no sizer update. Contrast with the fatal path.
        let r = rig(Arc::new(OutageGateway));
        let pos = r.ledger.open_position(open_spec());
        r.feed.push_now("BTCUSDT", 46_000.0);

        let out = r
            .guard
            .close_position(pos.id, ExitIntent::new(ExitReason::StopLoss))
            .await;

        match out {
            CloseOutcome::Deferred {
                reason: DeferReason::RetriesExhausted { attempts },
            } => assert_eq!(attempts, 3),
            other => panic!("expected deferral, got {other:?}"),
        }
        assert!(r.ledger.get(pos.id).is_some());
        assert!(r.ledger.closed_trades(10).is_empty());
        assert_eq!(r.sizer.snapshot().total_trades, 0);
    }

    #[tokio::test]
    async fn fatal_exchange_error_finalises_with_reconciliation_flag() {
        let r = rig(Arc::new(BrokenGateway));
        let pos = r.ledger.open_position(open_spec());
        r.feed.push_now("BTCUSDT", 46_000.0);

        let out = r
            .guard
            .close_position(pos.id, ExitIntent::new(ExitReason::StopLoss))
            .await;

        match out {
            CloseOutcome::Closed { trade } => {
                assert!(trade.needs_reconciliation);
            }
            other => panic!("expected finalised close, got {other:?}"),
        }
        assert!(r.ledger.get(pos.id).is_none());
    }

    #[tokio::test]
    async fn second_close_of_same_position_is_rejected() {
        let r = rig(Arc::new(SimGateway::new(0.001, 10_000.0)));
        let pos = r.ledger.open_position(open_spec());
        r.feed.push_now("BTCUSDT", 46_000.0);

        let first = r
            .guard
            .close_position(pos.id, ExitIntent::new(ExitReason::Manual))
            .await;
        assert!(matches!(first, CloseOutcome::Closed { .. }));

        let second = r
            .guard
            .close_position(pos.id, ExitIntent::new(ExitReason::Manual))
            .await;
        assert!(matches!(
            second,
            CloseOutcome::Rejected {
                reason: RejectReason::NotFound
            }
        ));
    }

    #[tokio::test]
    async fn in_flight_close_locks_out_rivals() {
        let r = rig(Arc::new(SimGateway::new(0.001, 10_000.0)));
        let pos = r.ledger.open_position(open_spec());

        let token = r.guard.locks.try_acquire(pos.id);
        assert!(token.is_some());

        let out = r
            .guard
            .close_position(pos.id, ExitIntent::new(ExitReason::Manual))
            .await;
        assert!(matches!(
            out,
            CloseOutcome::Rejected {
                reason: RejectReason::LockBusy
            }
        ));

        drop(token);
        assert!(r.guard.locks.try_acquire(pos.id).is_some());
    }

    #[tokio::test]
    async fn outcomes_are_recorded_with_their_reasons() {
        // A refused close must leave its serialized reason in the audit
        // trail, and a feed problem must land in the error ring.
        let r = rig(Arc::new(FixedFillGateway {
            fill_price: 44_990.0,
            taker_rate: 0.001,
        }));
        let pos = r.ledger.open_position(open_spec());
        r.feed.push_now("BTCUSDT", 44_990.0);

        let out = r
            .guard
            .close_position(pos.id, ExitIntent::new(ExitReason::ProfitTarget))
            .await;
        assert!(matches!(out, CloseOutcome::Rejected { .. }));

        let events = r.audit.events.recent(10);
        let rejection = events
            .iter()
            .find(|e| e.kind == "close_rejected")
            .expect("rejection not recorded");
        assert_eq!(rejection.position_id, Some(pos.id));
        assert!(rejection.detail.contains("race_abort"));
        assert!(rejection.detail.contains("net_pnl_pct"));

        // Stale feed on a second position lands in the error ring.
        let pos2 = r.ledger.open_position(open_spec());
        r.feed
            .push("BTCUSDT", 44_990.0, Utc::now() - chrono::Duration::seconds(120));
        let out = r
            .guard
            .close_position(pos2.id, ExitIntent::new(ExitReason::Manual))
            .await;
        assert!(matches!(out, CloseOutcome::Deferred { .. }));
        let errors = r.audit.errors.recent(10);
        assert!(errors
            .iter()
            .any(|e| e.context == "price_feed" && e.message.contains("stale quote")));
    }

    #[tokio::test]
    async fn explicit_price_is_floored_for_profit_protection() {
        // Requested price below breakeven; the sim fills at the limit we
        // submit, so a fill at/above the floor proves the raise happened.
        let r = rig(Arc::new(SimGateway::new(0.001, 10_000.0)));
        let pos = r.ledger.open_position(open_spec());
        r.feed.push_now("BTCUSDT", 45_100.0);

        let floor = ExitGuard::breakeven_floor(&r.ledger.get(pos.id).unwrap(), 0.001);
        let out = r
            .guard
            .close_position(
                pos.id,
                ExitIntent::at_price(ExitReason::BreakevenProtection, 44_000.0),
            )
            .await;

        match out {
            CloseOutcome::Closed { trade } => {
                assert!(trade.exit_price >= floor - 1e-9);
                assert!(trade.net_pnl >= -1e-9);
            }
            other => panic!("expected Closed at the floor, got {other:?}"),
        }
    }
}
