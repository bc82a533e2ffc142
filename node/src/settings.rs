//! Node-level settings: where strategies, history and ticks live

use anyhow::Context;
use dispatch_core::strategy::StrategyDefinition;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// JSON array of strategy definitions
    pub strategies_file: PathBuf,
    /// Directory of `<symbol>_<timeframe>.json` bar files
    pub history_dir: PathBuf,
    /// JSON-lines tick recording replayed in paper mode
    pub ticks_file: PathBuf,
    /// Where backtest outputs are written; logged only when unset
    pub report_dir: Option<PathBuf>,
}

impl NodeSettings {
    /// Read from the environment. Call after `.env` has been loaded.
    pub fn from_env() -> Self {
        let path = |key: &str, default: &str| {
            std::env::var(key)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(default))
        };
        Self {
            strategies_file: path("DISPATCH_STRATEGIES_FILE", "strategies.json"),
            history_dir: path("DISPATCH_HISTORY_DIR", "./history"),
            ticks_file: path("DISPATCH_TICKS_FILE", "./ticks.jsonl"),
            report_dir: std::env::var("DISPATCH_REPORT_DIR").ok().map(PathBuf::from),
        }
    }
}

pub fn load_definitions(path: &Path) -> anyhow::Result<Vec<StrategyDefinition>> {
    let raw = std::fs::read(path)
        .with_context(|| format!("reading strategies file {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("parsing strategies file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_definition_list() {
        let path = std::env::temp_dir().join(format!("strategies-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"[{"id":"a","strategy_type":"RSI","symbols":["BTC"],"timeframe":"5m","lookback":30}]"#,
        )
        .unwrap();

        let definitions = load_definitions(&path).unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].timeframe.as_millis(), 300_000);
        assert!(definitions[0].params.is_null());
    }
}
