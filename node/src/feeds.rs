//! File-backed market data for running the node without an exchange connection

use anyhow::{bail, Context};
use async_trait::async_trait;
use dispatch_core::data::{Bar, BarCache, Tick, Timeframe};
use dispatch_core::feed::{HistoricalDataProvider, HistoryRequest, MarketDataSource};
use futures::stream::{self, Iter};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::vec::IntoIter;
use tracing::{info, warn};

/// Serves bars from `<dir>/<symbol>_<timeframe>.json` (a JSON array of bars)
#[derive(Debug, Clone)]
pub struct JsonHistoryProvider {
    dir: PathBuf,
}

impl JsonHistoryProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.json",
            BarCache::sanitize_symbol(symbol),
            timeframe.label()
        ))
    }
}

#[async_trait]
impl HistoricalDataProvider for JsonHistoryProvider {
    async fn fetch_history(&self, request: &HistoryRequest) -> anyhow::Result<Vec<Bar>> {
        let path = self.path(&request.symbol, request.interval);
        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading history file {}", path.display()))?;
        let mut bars: Vec<Bar> = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing history file {}", path.display()))?;

        bars.sort_by_key(|b| b.time);
        let skip = bars.len().saturating_sub(request.outputsize);
        Ok(bars.split_off(skip))
    }
}

/// Replays recorded ticks from a JSON-lines file
#[derive(Debug)]
pub struct ReplaySource {
    path: PathBuf,
    symbols: Mutex<BTreeSet<String>>,
    connected: AtomicBool,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            symbols: Mutex::new(BTreeSet::new()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Recorded ticks for the currently subscribed symbols, in time order.
    /// Malformed lines are logged and skipped.
    pub async fn ticks(&self) -> anyhow::Result<Iter<IntoIter<Tick>>> {
        if !self.is_connected() {
            bail!("replay source is not connected");
        }
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading tick file {}", self.path.display()))?;
        let symbols = self
            .symbols
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut ticks = Vec::new();
        for (n, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Tick>(line) {
                Ok(tick) if symbols.contains(&tick.symbol) => ticks.push(tick),
                Ok(_) => {}
                Err(e) => warn!(line = n + 1, error = %e, "skipping malformed tick"),
            }
        }
        ticks.sort_by_key(|t| t.time);
        info!(ticks = ticks.len(), symbols = symbols.len(), "tick replay loaded");
        Ok(stream::iter(ticks))
    }
}

#[async_trait]
impl MarketDataSource for ReplaySource {
    async fn update_symbols(&self, symbols: &[String]) -> anyhow::Result<()> {
        *self.symbols.lock().unwrap_or_else(PoisonError::into_inner) =
            symbols.iter().cloned().collect();
        Ok(())
    }

    async fn connect(&self) -> anyhow::Result<()> {
        tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("tick file {} unavailable", self.path.display()))?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dispatch-node-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn history_returns_most_recent_bars() {
        let dir = temp_dir();
        let provider = JsonHistoryProvider::new(&dir);
        let tf = Timeframe::minutes(1);
        let bars: Vec<Bar> = (0..10).rev().map(|i| Bar::flat(i * 60_000, 1.0)).collect();
        std::fs::write(provider.path("BTC/USDT", tf), serde_json::to_vec(&bars).unwrap()).unwrap();

        let request = HistoryRequest {
            symbol: "BTC/USDT".into(),
            interval: tf,
            outputsize: 4,
        };
        let fetched = provider.fetch_history(&request).await.unwrap();
        let times: Vec<i64> = fetched.iter().map(|b| b.time).collect();
        assert_eq!(times, vec![360_000, 420_000, 480_000, 540_000]);
    }

    #[tokio::test]
    async fn missing_history_is_an_error() {
        let provider = JsonHistoryProvider::new(temp_dir());
        let request = HistoryRequest {
            symbol: "ETH".into(),
            interval: Timeframe::minutes(5),
            outputsize: 10,
        };
        assert!(provider.fetch_history(&request).await.is_err());
    }

    #[tokio::test]
    async fn replay_filters_to_subscribed_symbols() {
        let path = temp_dir().join("ticks.jsonl");
        let lines = [
            r#"{"symbol":"BTC","time":2000,"price":101.0,"volume":1.0}"#,
            r#"{"symbol":"ETH","time":1500,"price":10.0,"volume":1.0}"#,
            "not json",
            r#"{"symbol":"BTC","time":1000,"price":100.0,"volume":1.0}"#,
        ];
        std::fs::write(&path, lines.join("\n")).unwrap();

        let source = ReplaySource::new(&path);
        assert!(source.ticks().await.is_err());

        source.update_symbols(&["BTC".to_string()]).await.unwrap();
        source.connect().await.unwrap();
        let ticks: Vec<Tick> = source.ticks().await.unwrap().collect().await;
        let times: Vec<i64> = ticks.iter().map(|t| t.time).collect();
        assert_eq!(times, vec![1000, 2000]);
    }

    #[tokio::test]
    async fn connect_fails_without_file() {
        let source = ReplaySource::new(temp_dir().join("absent.jsonl"));
        assert!(source.connect().await.is_err());
        assert!(!source.is_connected());
    }
}
