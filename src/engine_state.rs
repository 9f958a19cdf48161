// =============================================================================
// Engine State — shared hub handed to the API layer and background tasks
// =============================================================================
//
// Everything long-lived hangs off one `EngineState` behind an Arc. The
// `AuditSink` carries the decision/error rings plus a version counter that
// bumps on every recorded entry, so pollers can cheaply detect "something
// changed" without diffing snapshots.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::feed::CachedPriceFeed;
use crate::guard::ExitGuard;
use crate::ledger::TradeLedger;
use crate::sizer::{PositionSizer, SizerSnapshot};
use crate::tracker::{ErosionTracker, RegimeCapTable};

// ---------------------------------------------------------------------------
// Bounded event rings
// ---------------------------------------------------------------------------

/// Fixed-capacity ring: oldest entries fall off the back.
#[derive(Debug)]
pub struct RingLog<T> {
    entries: RwLock<VecDeque<T>>,
    capacity: usize,
}

impl<T: Clone> RingLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, entry: T) {
        let mut entries = self.entries.write();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Most recent `count` entries, newest first.
    pub fn recent(&self, count: usize) -> Vec<T> {
        self.entries.read().iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// One audit-trail entry: a decision or action the engine took.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvent {
    pub timestamp: DateTime<Utc>,
    pub position_id: Option<Uuid>,
    pub kind: String,
    pub detail: String,
}

impl EngineEvent {
    pub fn now(position_id: Option<Uuid>, kind: &str, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            position_id,
            kind: kind.to_string(),
            detail: detail.into(),
        }
    }
}

/// One operational error surfaced to the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub context: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn now(context: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            context: context.to_string(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Audit sink
// ---------------------------------------------------------------------------

/// Shared write handle to the audit-trail and error rings. Cloned into the
/// Guard and the scanner so every decision and failure lands in the same
/// rings the API serves, with the version counter bumped per entry.
#[derive(Debug, Clone)]
pub struct AuditSink {
    pub events: Arc<RingLog<EngineEvent>>,
    pub errors: Arc<RingLog<ErrorRecord>>,
    version: Arc<AtomicU64>,
}

impl AuditSink {
    pub fn new(event_capacity: usize, error_capacity: usize) -> Self {
        Self {
            events: Arc::new(RingLog::new(event_capacity)),
            errors: Arc::new(RingLog::new(error_capacity)),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn event(&self, position_id: Option<Uuid>, kind: &str, detail: impl Into<String>) {
        self.events.push(EngineEvent::now(position_id, kind, detail));
        self.bump_version();
    }

    pub fn error(&self, context: &str, message: impl Into<String>) {
        self.errors.push(ErrorRecord::now(context, message));
        self.bump_version();
    }

    pub fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

impl Default for AuditSink {
    fn default() -> Self {
        Self::new(256, 128)
    }
}

// ---------------------------------------------------------------------------
// State hub
// ---------------------------------------------------------------------------

pub struct EngineState {
    pub config: RwLock<EngineConfig>,
    pub ledger: Arc<TradeLedger>,
    pub sizer: Arc<PositionSizer>,
    pub feed: Arc<CachedPriceFeed>,
    pub guard: Arc<ExitGuard>,
    pub tracker: Arc<ErosionTracker<RegimeCapTable>>,
    pub audit: AuditSink,
    pub started_at: DateTime<Utc>,
}

impl EngineState {
    pub fn new(
        config: EngineConfig,
        ledger: Arc<TradeLedger>,
        sizer: Arc<PositionSizer>,
        feed: Arc<CachedPriceFeed>,
        guard: Arc<ExitGuard>,
        tracker: Arc<ErosionTracker<RegimeCapTable>>,
        audit: AuditSink,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            ledger,
            sizer,
            feed,
            guard,
            tracker,
            audit,
            started_at: Utc::now(),
        }
    }

    pub fn version(&self) -> u64 {
        self.audit.version()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let config = self.config.read();
        EngineSnapshot {
            bot_id: config.bot_id.clone(),
            demo_mode: config.demo_mode,
            state_version: self.version(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            open_positions: self.ledger.open_positions().len(),
            open_risk_usd: self.ledger.open_risk_total(),
            sizer: self.sizer.snapshot(),
        }
    }
}

/// Engine-wide status served at `/api/v1/state`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub bot_id: String,
    pub demo_mode: bool,
    pub state_version: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub open_positions: usize,
    pub open_risk_usd: f64,
    pub sizer: SizerSnapshot,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_log_evicts_oldest() {
        let log: RingLog<u32> = RingLog::new(3);
        for i in 0..5 {
            log.push(i);
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.recent(10), vec![4, 3, 2]);
        assert_eq!(log.recent(1), vec![4]);
    }

    #[test]
    fn ring_log_tracks_emptiness() {
        let log: RingLog<u32> = RingLog::new(2);
        assert!(log.is_empty());
        log.push(1);
        assert!(!log.is_empty());
    }

    #[test]
    fn audit_sink_records_and_versions() {
        let sink = AuditSink::new(4, 4);
        assert_eq!(sink.version(), 0);

        sink.event(None, "close", "manual close accepted");
        sink.error("exchange", "connect timeout");

        assert_eq!(sink.version(), 2);
        assert_eq!(sink.events.len(), 1);
        assert_eq!(sink.events.recent(1)[0].kind, "close");
        assert_eq!(sink.errors.recent(1)[0].context, "exchange");
    }
}
