//! Historical warmup with an incrementally patched on-disk cache

use crate::data::{Bar, BarCache, Timeframe};
use crate::error::EngineError;
use crate::feed::{HistoricalDataProvider, HistoryRequest};
use crate::strategy::{guarded, UnitRuntime};
use crate::Result;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Wall clock in epoch milliseconds
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// How a symbol's history was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupPath {
    /// Cache was fresh and used as-is
    Reused,
    /// Cache was extended with the missing buckets
    Patched { fetched: usize },
    /// Cache absent, unreadable or too old
    Full,
}

#[derive(Debug, Clone)]
pub struct SymbolWarmup {
    pub symbol: String,
    pub path: WarmupPath,
    /// Most recent `lookback` bars, ascending
    pub bars: Vec<Bar>,
}

/// Reconciles the bar cache with the history provider before a unit goes live
pub struct WarmupCacheManager {
    provider: Arc<dyn HistoricalDataProvider>,
    cache: BarCache,
    clock: Clock,
}

impl WarmupCacheManager {
    pub fn new(provider: Arc<dyn HistoricalDataProvider>, cache: BarCache) -> Self {
        Self {
            provider,
            cache,
            clock: Arc::new(|| Utc::now().timestamp_millis()),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn cache(&self) -> &BarCache {
        &self.cache
    }

    pub fn now_ms(&self) -> i64 {
        (self.clock)()
    }

    async fn fetch(&self, symbol: &str, timeframe: Timeframe, outputsize: usize) -> Result<Vec<Bar>> {
        let request = HistoryRequest {
            symbol: symbol.to_string(),
            interval: timeframe,
            outputsize,
        };
        let mut bars = self
            .provider
            .fetch_history(&request)
            .await
            .map_err(|e| EngineError::WarmupFailed {
                id: symbol.to_string(),
                reason: format!("history fetch failed: {e:#}"),
            })?;
        bars.sort_by_key(|b| b.time);
        bars.dedup_by_key(|b| b.time);
        Ok(bars)
    }

    async fn read_cache(&self, symbol: &str, timeframe: Timeframe) -> Option<Vec<Bar>> {
        match self.cache.load(symbol, timeframe).await {
            Ok(Some(bars)) if !bars.is_empty() => Some(bars),
            Ok(_) => None,
            Err(e) => {
                warn!(symbol, error = %e, "unusable bar cache, refetching");
                None
            }
        }
    }

    /// Obtain the latest `lookback` bars for one symbol and refresh its cache
    pub async fn load_symbol(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
    ) -> Result<SymbolWarmup> {
        let tf = timeframe.as_millis();
        let now = self.now_ms();

        let cached = match self.read_cache(symbol, timeframe).await {
            Some(cached) if cached.len() < lookback => {
                debug!(symbol, cached = cached.len(), lookback, "cache shorter than lookback");
                None
            }
            other => other,
        };
        // Never shrink the cache below what another unit already stored.
        let keep = lookback.max(cached.as_ref().map_or(0, Vec::len));

        let (path, mut bars) = match cached {
            Some(mut cached) => {
                let last = cached[cached.len() - 1].time;
                let age = now - last;
                if age < tf.saturating_mul(2) {
                    (WarmupPath::Reused, cached)
                } else if age <= (lookback as i64).saturating_mul(tf) {
                    let missing = ((age + tf - 1) / tf) as usize;
                    let fresh = self.fetch(symbol, timeframe, missing).await?;
                    let before = cached.len();
                    cached.extend(fresh.into_iter().filter(|b| b.time > last));
                    (
                        WarmupPath::Patched {
                            fetched: cached.len() - before,
                        },
                        cached,
                    )
                } else {
                    (WarmupPath::Full, self.fetch(symbol, timeframe, lookback).await?)
                }
            }
            None => (WarmupPath::Full, self.fetch(symbol, timeframe, lookback).await?),
        };

        if bars.len() > keep {
            bars.drain(..bars.len() - keep);
        }
        if !bars.is_empty() {
            if let Err(e) = self.cache.store(symbol, timeframe, &bars).await {
                warn!(symbol, error = %e, "failed to write bar cache");
            }
        }

        if bars.len() > lookback {
            bars.drain(..bars.len() - lookback);
        }
        debug!(symbol, ?path, bars = bars.len(), "warmup history resolved");

        Ok(SymbolWarmup {
            symbol: symbol.to_string(),
            path,
            bars,
        })
    }

    /// Load every symbol of the unit concurrently, then replay the history
    /// through it with signals suppressed. Any symbol without data fails the
    /// whole unit. Returns the number of bars replayed.
    pub async fn warm_up(&self, runtime: &mut UnitRuntime) -> Result<usize> {
        let id = runtime.id().to_string();
        let symbols = runtime.symbols().to_vec();
        let timeframe = runtime.timeframe();
        let lookback = runtime.lookback();

        let results = join_all(
            symbols
                .iter()
                .map(|symbol| self.load_symbol(symbol, timeframe, lookback)),
        )
        .await;

        let mut loaded = Vec::with_capacity(results.len());
        for (symbol, result) in symbols.iter().zip(results) {
            let warm = result.map_err(|e| EngineError::WarmupFailed {
                id: id.clone(),
                reason: format!("{symbol}: {e}"),
            })?;
            if warm.bars.is_empty() {
                return Err(EngineError::WarmupFailed {
                    id: id.clone(),
                    reason: format!("no history for {symbol}"),
                });
            }
            loaded.push(warm);
        }

        let mut replayed = 0;
        for warm in &loaded {
            replayed += guarded(|| runtime.prime(&warm.symbol, &warm.bars)).map_err(|e| {
                EngineError::WarmupFailed {
                    id: id.clone(),
                    reason: format!("{}: {e:#}", warm.symbol),
                }
            })?;
            if !runtime.is_warmed_up(&warm.symbol) {
                return Err(EngineError::WarmupFailed {
                    id: id.clone(),
                    reason: format!(
                        "{}: only {} of {lookback} bars available",
                        warm.symbol,
                        warm.bars.len()
                    ),
                });
            }
        }
        info!(strategy_id = %id, symbols = loaded.len(), bars = replayed, "warmup complete");
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    const TF: i64 = 60_000;

    /// Serves `available` consecutive bars ending at the last closed bucket
    struct FakeProvider {
        now: Arc<AtomicI64>,
        available: usize,
        requests: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl HistoricalDataProvider for FakeProvider {
        async fn fetch_history(&self, request: &HistoryRequest) -> anyhow::Result<Vec<Bar>> {
            self.requests.lock().unwrap().push(request.outputsize);
            let last_closed = (self.now.load(Ordering::SeqCst) / TF - 1) * TF;
            let count = request.outputsize.min(self.available) as i64;
            Ok((0..count)
                .rev()
                .map(|i| {
                    let time = last_closed - i * TF;
                    Bar::new(time, 1.0, 1.0, 1.0, (time / TF) as f64, 1.0)
                })
                .collect())
        }
    }

    fn setup(available: usize) -> (WarmupCacheManager, Arc<FakeProvider>, Arc<AtomicI64>) {
        let now = Arc::new(AtomicI64::new(1_000 * TF + 30_000));
        let provider = Arc::new(FakeProvider {
            now: now.clone(),
            available,
            requests: Mutex::new(Vec::new()),
        });
        let dir = std::env::temp_dir().join(format!("warmup-{}", uuid::Uuid::new_v4()));
        let clock = now.clone();
        let manager = WarmupCacheManager::new(provider.clone(), BarCache::new(dir))
            .with_clock(move || clock.load(Ordering::SeqCst));
        (manager, provider, now)
    }

    #[tokio::test]
    async fn full_fetch_then_reuse() {
        let (manager, provider, _) = setup(500);
        let tf = Timeframe::minutes(1);

        let first = manager.load_symbol("BTC/USDT", tf, 50).await.unwrap();
        assert_eq!(first.path, WarmupPath::Full);
        assert_eq!(first.bars.len(), 50);

        let second = manager.load_symbol("BTC/USDT", tf, 50).await.unwrap();
        assert_eq!(second.path, WarmupPath::Reused);
        assert_eq!(second.bars, first.bars);
        assert_eq!(*provider.requests.lock().unwrap(), vec![50]);
    }

    #[tokio::test]
    async fn patches_only_missing_buckets() {
        let (manager, provider, now) = setup(500);
        let tf = Timeframe::minutes(1);
        let first = manager.load_symbol("ETH", tf, 50).await.unwrap();
        let last = first.bars.last().unwrap().time;

        now.fetch_add(3 * TF, Ordering::SeqCst);
        let patched = manager.load_symbol("ETH", tf, 50).await.unwrap();

        assert_eq!(patched.path, WarmupPath::Patched { fetched: 3 });
        assert_eq!(patched.bars.len(), 50);
        assert_eq!(patched.bars.last().unwrap().time, last + 3 * TF);
        assert!(patched.bars.windows(2).all(|w| w[1].time - w[0].time == TF));
        // age is 4.5 buckets, so 5 are requested and only 3 are newer
        assert_eq!(*provider.requests.lock().unwrap(), vec![50, 5]);
    }

    #[tokio::test]
    async fn stale_cache_is_refetched() {
        let (manager, provider, now) = setup(500);
        let tf = Timeframe::minutes(1);
        manager.load_symbol("SOL", tf, 10).await.unwrap();

        now.fetch_add(20 * TF, Ordering::SeqCst);
        let refreshed = manager.load_symbol("SOL", tf, 10).await.unwrap();
        assert_eq!(refreshed.path, WarmupPath::Full);
        assert_eq!(*provider.requests.lock().unwrap(), vec![10, 10]);
    }

    #[tokio::test]
    async fn short_cache_is_not_reused_for_longer_lookback() {
        let (manager, provider, _) = setup(500);
        let tf = Timeframe::minutes(1);

        manager.load_symbol("BTC", tf, 10).await.unwrap();
        let long = manager.load_symbol("BTC", tf, 50).await.unwrap();
        assert_eq!(long.path, WarmupPath::Full);
        assert_eq!(long.bars.len(), 50);

        // The longer history stays cached for the shorter unit.
        let short = manager.load_symbol("BTC", tf, 10).await.unwrap();
        assert_eq!(short.path, WarmupPath::Reused);
        assert_eq!(short.bars.len(), 10);
        assert_eq!(short.bars.last(), long.bars.last());
        assert_eq!(*provider.requests.lock().unwrap(), vec![10, 50]);

        let again = manager.load_symbol("BTC", tf, 50).await.unwrap();
        assert_eq!(again.path, WarmupPath::Reused);
        assert_eq!(again.bars, long.bars);
    }

    #[tokio::test]
    async fn corrupt_cache_falls_back() {
        let (manager, _, _) = setup(500);
        let tf = Timeframe::minutes(1);
        let path = manager.cache().path("ADA", tf);
        tokio::fs::create_dir_all(manager.cache().dir()).await.unwrap();
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let loaded = manager.load_symbol("ADA", tf, 5).await.unwrap();
        assert_eq!(loaded.path, WarmupPath::Full);
        assert_eq!(loaded.bars.len(), 5);
    }

    #[tokio::test]
    async fn empty_history_fails_warmup() {
        use crate::strategy::{BarContext, Strategy, StrategySignal, StrategyUnit};

        struct Idle;
        impl Strategy for Idle {
            fn name(&self) -> &str {
                "IDLE"
            }
            fn on_bar(&mut self, _: &BarContext<'_>) -> anyhow::Result<Option<StrategySignal>> {
                Ok(None)
            }
        }

        let (manager, _, _) = setup(0);
        let unit = StrategyUnit::new("u1", vec!["X".into()], Timeframe::minutes(1), 5, Box::new(Idle));
        let mut runtime = UnitRuntime::new(unit, 100).unwrap();

        let err = manager.warm_up(&mut runtime).await.unwrap_err();
        assert!(matches!(err, EngineError::WarmupFailed { .. }));
        assert!(!runtime.is_warmed_up("X"));

        // Some history, but less than the lookback, is still a failure.
        let (manager, _, _) = setup(3);
        let unit = StrategyUnit::new("u2", vec!["X".into()], Timeframe::minutes(1), 5, Box::new(Idle));
        let mut runtime = UnitRuntime::new(unit, 100).unwrap();

        let err = manager.warm_up(&mut runtime).await.unwrap_err();
        assert!(matches!(err, EngineError::WarmupFailed { ref reason, .. } if reason.contains("3 of 5")));
        assert!(!runtime.is_warmed_up("X"));
    }
}
