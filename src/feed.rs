// =============================================================================
// Price Feed — consumer contract over the external market-data layer
// =============================================================================
//
// The engine does not ingest market data itself; it consumes quotes through
// the `PriceFeed` trait and refuses to act on anything older than the
// configured staleness bound. `CachedPriceFeed` is the in-process adapter:
// whatever distribution layer the deployment uses pushes last quotes into it.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A price observation with its origin timestamp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl PriceQuote {
    /// Age of the quote relative to `now`.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }

    /// Whether the quote is fresh enough to act on.
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age_secs: u64) -> bool {
        let age = now - self.timestamp;
        age >= Duration::zero() && age.num_seconds() as u64 <= max_age_secs
    }
}

/// Read access to the live price feed.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Latest known quote for `pair`, if any.
    async fn quote(&self, pair: &str) -> Option<PriceQuote>;
}

/// In-process last-quote cache fed by the external distribution layer.
pub struct CachedPriceFeed {
    quotes: RwLock<HashMap<String, PriceQuote>>,
}

impl CachedPriceFeed {
    pub fn new() -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
        }
    }

    /// Record the latest quote for `pair`.
    pub fn push(&self, pair: &str, price: f64, timestamp: DateTime<Utc>) {
        debug!(pair, price, "quote updated");
        self.quotes
            .write()
            .insert(pair.to_string(), PriceQuote { price, timestamp });
    }

    /// Convenience for tests and simulators: push a quote stamped now.
    pub fn push_now(&self, pair: &str, price: f64) {
        self.push(pair, price, Utc::now());
    }
}

impl Default for CachedPriceFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceFeed for CachedPriceFeed {
    async fn quote(&self, pair: &str) -> Option<PriceQuote> {
        self.quotes.read().get(pair).copied()
    }
}

impl std::fmt::Debug for CachedPriceFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedPriceFeed")
            .field("pairs", &self.quotes.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_latest_quote() {
        let feed = CachedPriceFeed::new();
        assert!(feed.quote("BTCUSDT").await.is_none());

        feed.push_now("BTCUSDT", 45_000.0);
        feed.push_now("BTCUSDT", 45_100.0);
        let q = feed.quote("BTCUSDT").await.unwrap();
        assert!((q.price - 45_100.0).abs() < 1e-9);
    }

    #[test]
    fn freshness_bound() {
        let now = Utc::now();
        let fresh = PriceQuote {
            price: 100.0,
            timestamp: now - Duration::seconds(3),
        };
        assert!(fresh.is_fresh(now, 5));

        let stale = PriceQuote {
            price: 100.0,
            timestamp: now - Duration::seconds(11),
        };
        assert!(!stale.is_fresh(now, 5));
        assert_eq!(stale.age_secs(now), 11);

        // A quote from the future is not trusted either.
        let future = PriceQuote {
            price: 100.0,
            timestamp: now + Duration::seconds(30),
        };
        assert!(!future.is_fresh(now, 5));
    }
}
