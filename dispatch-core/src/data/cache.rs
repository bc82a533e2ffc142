//! On-disk bar cache used to shorten warmup

use crate::data::{Bar, Timeframe};
use crate::error::EngineError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bumped whenever the file layout changes; other versions are ignored
pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    symbol: String,
    timeframe: String,
    bars: Vec<Bar>,
}

/// JSON bar cache, one file per (symbol, timeframe)
#[derive(Debug, Clone)]
pub struct BarCache {
    dir: PathBuf,
}

impl BarCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File-system safe form of a symbol ("BTC/USDT" -> "BTC_USDT")
    pub fn sanitize_symbol(symbol: &str) -> String {
        symbol
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }

    /// Get cache path from symbol and timeframe
    pub fn path(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.json",
            Self::sanitize_symbol(symbol),
            timeframe.label()
        ))
    }

    /// `Ok(None)` when no file exists; an error when the file is unreadable,
    /// malformed, from another schema version, or written for another symbol
    /// that sanitizes to the same name.
    pub async fn load(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<Vec<Bar>>> {
        let path = self.path(symbol, timeframe);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file: CacheFile = serde_json::from_slice(&raw)?;
        if file.version != CACHE_SCHEMA_VERSION {
            return Err(EngineError::Cache(format!(
                "{} has schema version {}, expected {}",
                path.display(),
                file.version,
                CACHE_SCHEMA_VERSION
            )));
        }
        if file.symbol != symbol {
            return Err(EngineError::Cache(format!(
                "{} holds {}, not {symbol}",
                path.display(),
                file.symbol
            )));
        }
        debug!(path = %path.display(), bars = file.bars.len(), "loaded bar cache");
        Ok(Some(file.bars))
    }

    /// Replace the cached bars, writing through a temp file
    pub async fn store(&self, symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(symbol, timeframe);
        let file = CacheFile {
            version: CACHE_SCHEMA_VERSION,
            symbol: symbol.to_string(),
            timeframe: timeframe.label(),
            bars: bars.to_vec(),
        };
        let body = serde_json::to_vec(&file)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), bars = bars.len(), "stored bar cache");
        Ok(())
    }
}
