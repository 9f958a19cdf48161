// =============================================================================
// Position Scanner — periodic health sweep over every open position
// =============================================================================
//
// Each tick the scanner:
//   1. derives the fee-adjusted unrealised profit from the latest quote,
//   2. advances the peak through the Tracker and writes both back,
//   3. evaluates erosion and the underwater policy into one health report,
//   4. hands any forced-exit recommendation to the Guard.
//
// Positions with a missing or stale quote are skipped for that tick; the
// Guard enforces its own freshness gate anyway, so a skip here only delays
// the next evaluation by one interval. Closes run concurrently, capped by a
// semaphore so a burst of forced exits cannot flood the exchange.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accounting;
use crate::engine_state::AuditSink;
use crate::exchange::FeeSchedule;
use crate::feed::PriceFeed;
use crate::guard::{CloseOutcome, ExitGuard};
use crate::ledger::{Position, TradeLedger};
use crate::tracker::{ErosionAssessment, ErosionCapSource, ErosionTracker};
use crate::types::{ExitIntent, ExitReason, HealthStatus};
use crate::underwater::{self, UnderwaterVerdict};

// ---------------------------------------------------------------------------
// Health report
// ---------------------------------------------------------------------------

/// One position's combined health picture, as served over the API and used
/// to drive forced exits.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub position_id: Uuid,
    pub pair: String,
    pub status: HealthStatus,
    pub current_profit_pct: f64,
    pub peak_profit_pct: f64,
    pub age_secs: u64,
    pub erosion: ErosionAssessment,
    pub underwater: UnderwaterVerdict,
    /// Forced exit recommendation, if any. Underwater wins over erosion
    /// because it is the only rule with a time component already satisfied.
    pub recommendation: Option<ExitReason>,
}

/// Evaluate a position from its stored profit fields. Pure; no I/O.
pub fn evaluate_position<C: ErosionCapSource>(
    tracker: &ErosionTracker<C>,
    position: &Position,
    now: DateTime<Utc>,
) -> HealthReport {
    let erosion = tracker.assess(
        position.regime,
        position.peak_profit_pct,
        position.current_profit_pct,
    );
    let uw = underwater::evaluate(position, now);

    let status = match uw {
        UnderwaterVerdict::NotApplicable => erosion.status,
        _ => HealthStatus::Underwater,
    };
    let recommendation = match uw {
        UnderwaterVerdict::ForceExit { reason } => Some(reason),
        _ => erosion.recommendation,
    };

    HealthReport {
        position_id: position.id,
        pair: position.pair.clone(),
        status,
        current_profit_pct: position.current_profit_pct,
        peak_profit_pct: position.peak_profit_pct,
        age_secs: position.age_secs(now),
        erosion,
        underwater: uw,
        recommendation,
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct PositionScanner<C: ErosionCapSource> {
    ledger: Arc<TradeLedger>,
    feed: Arc<dyn PriceFeed>,
    tracker: Arc<ErosionTracker<C>>,
    guard: Arc<ExitGuard>,
    fees: FeeSchedule,
    max_quote_age_secs: u64,
    close_permits: Arc<Semaphore>,
    audit: AuditSink,
}

impl<C: ErosionCapSource + 'static> PositionScanner<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<TradeLedger>,
        feed: Arc<dyn PriceFeed>,
        tracker: Arc<ErosionTracker<C>>,
        guard: Arc<ExitGuard>,
        fees: FeeSchedule,
        max_quote_age_secs: u64,
        max_concurrent_closes: usize,
        audit: AuditSink,
    ) -> Self {
        Self {
            ledger,
            feed,
            tracker,
            guard,
            fees,
            max_quote_age_secs,
            close_permits: Arc::new(Semaphore::new(max_concurrent_closes)),
            audit,
        }
    }

    /// Run forever at `interval_secs`. Intended to be spawned as a task.
    pub async fn run(self: Arc<Self>, interval_secs: u64) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs, "position scanner started");
        loop {
            ticker.tick().await;
            self.scan_once().await;
        }
    }

    /// One full sweep. Returns the reports produced, newest state included.
    pub async fn scan_once(&self) -> Vec<HealthReport> {
        let now = Utc::now();
        let positions = self.ledger.open_positions();
        if positions.is_empty() {
            return Vec::new();
        }
        debug!(count = positions.len(), "scanning open positions");

        let mut reports = Vec::with_capacity(positions.len());
        for pos in positions {
            if let Some(report) = self.scan_position(&pos, now).await {
                reports.push(report);
            }
        }
        reports
    }

    async fn scan_position(&self, pos: &Position, now: DateTime<Utc>) -> Option<HealthReport> {
        let quote = match self.feed.quote(&pos.pair).await {
            Some(q) if q.is_fresh(now, self.max_quote_age_secs) => q,
            Some(q) => {
                debug!(
                    id = %pos.id,
                    pair = %pos.pair,
                    age_secs = q.age_secs(now),
                    "quote stale — skipping this tick"
                );
                return None;
            }
            None => {
                debug!(id = %pos.id, pair = %pos.pair, "no quote — skipping this tick");
                return None;
            }
        };

        let taker_rate = self.fees.taker_rate(&pos.pair);
        let current_pct = match accounting::unrealized_pnl_percent(
            pos.entry_price,
            quote.price,
            pos.quantity,
            pos.entry_fee,
            taker_rate,
        ) {
            Ok(pct) => pct,
            Err(e) => {
                warn!(id = %pos.id, error = %e, "cannot derive unrealised profit");
                return None;
            }
        };

        let peak = self.tracker.update_peak(pos.peak_profit_pct, current_pct);
        self.ledger.apply_profit_update(
            pos.id,
            current_pct,
            peak.peak_pct,
            peak.raised.then_some(now),
        );

        // Re-read so the report reflects exactly what was persisted.
        let updated = self.ledger.get(pos.id)?;
        let report = evaluate_position(self.tracker.as_ref(), &updated, now);

        if let Some(reason) = report.recommendation {
            info!(
                id = %updated.id,
                pair = %updated.pair,
                status = ?report.status,
                current_pct = report.current_profit_pct,
                peak_pct = report.peak_profit_pct,
                reason = %reason,
                "forced exit recommended"
            );
            self.audit.event(
                Some(updated.id),
                "forced_exit_recommended",
                format!(
                    "{reason} ({:?}: current {:.4}%, peak {:.4}%)",
                    report.status, report.current_profit_pct, report.peak_profit_pct
                ),
            );
            self.spawn_close(updated.id, reason);
        }

        Some(report)
    }

    /// Fire-and-forget close, bounded by the semaphore. The Guard's advisory
    /// lock makes a duplicate spawn for the same position harmless.
    fn spawn_close(&self, id: Uuid, reason: ExitReason) {
        let guard = Arc::clone(&self.guard);
        let permits = Arc::clone(&self.close_permits);
        tokio::spawn(async move {
            let _permit = match permits.acquire().await {
                Ok(p) => p,
                Err(_) => return, // semaphore closed on shutdown
            };
            match guard.close_position(id, ExitIntent::new(reason)).await {
                CloseOutcome::Closed { trade } => {
                    info!(
                        id = %id,
                        net_pnl = trade.net_pnl,
                        net_pnl_pct = trade.net_pnl_pct,
                        reason = %trade.exit_reason,
                        "forced exit executed"
                    );
                }
                CloseOutcome::Deferred { reason } => {
                    debug!(id = %id, reason = ?reason, "forced exit deferred");
                }
                CloseOutcome::Rejected { reason } => {
                    warn!(id = %id, reason = ?reason, "forced exit rejected");
                }
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
