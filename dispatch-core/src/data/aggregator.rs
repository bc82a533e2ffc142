//! Tick-to-bar synthesis with gap filling

use crate::data::bar::is_valid_observation;
use crate::data::{Bar, HistoryBuffer, Timeframe};
use std::collections::HashMap;

/// Per-symbol counters for observations that did not change bar state
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AggregationReport {
    /// Non-positive price, bad volume or negative time
    pub rejected_ticks: u64,
    /// Ticks or bars older than the current bucket
    pub late_ticks: u64,
    /// Flat bars inserted for buckets without activity
    pub synthetic_bars: u64,
}

#[derive(Debug, Clone)]
struct SymbolSeries {
    active: Option<Bar>,
    history: HistoryBuffer,
    report: AggregationReport,
}

impl SymbolSeries {
    fn new(capacity: usize) -> Self {
        Self {
            active: None,
            history: HistoryBuffer::new(capacity),
            report: AggregationReport::default(),
        }
    }

    /// Push one flat bar per bucket strictly between `prev` and `next`
    fn fill_gap(&mut self, tf_ms: i64, prev: i64, close: f64, next: i64) {
        let missing = (next - prev) / tf_ms - 1;
        if missing <= 0 {
            return;
        }
        self.report.synthetic_bars += missing as u64;

        // Only the newest `capacity` flat bars can survive in the buffer.
        let kept = missing.min(self.history.capacity() as i64);
        let mut time = next - kept * tf_ms;
        while time < next {
            self.history.push(Bar::flat(time, close));
            time += tf_ms;
        }
    }
}

/// Bar synthesis for every symbol a strategy unit subscribes to
#[derive(Debug, Clone)]
pub struct BarAggregator {
    timeframe: Timeframe,
    lookback: usize,
    capacity: usize,
    series: HashMap<String, SymbolSeries>,
}

impl BarAggregator {
    /// `lookback` is clamped to `capacity`
    pub fn new(timeframe: Timeframe, lookback: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            timeframe,
            lookback: lookback.clamp(1, capacity),
            capacity,
            series: HashMap::new(),
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn lookback(&self) -> usize {
        self.lookback
    }

    /// Feed one tick. Returns true when at least one bar was closed into history.
    /// The first tick for a symbol only opens a bar, unless it lands past a gap
    /// after warmup history.
    pub fn update_tick(&mut self, symbol: &str, time: i64, price: f64, volume: f64) -> bool {
        let tf_ms = self.timeframe.as_millis();
        let capacity = self.capacity;
        let series = self
            .series
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolSeries::new(capacity));

        if !is_valid_observation(time, price, volume) {
            series.report.rejected_ticks += 1;
            return false;
        }

        let bucket = self.timeframe.bucket_start(time);
        match series.active {
            Some(ref mut active) if active.time == bucket => {
                active.absorb(price, volume);
                false
            }
            Some(active) if bucket < active.time => {
                series.report.late_ticks += 1;
                false
            }
            Some(active) => {
                series.history.push(active);
                series.fill_gap(tf_ms, active.time, active.close, bucket);
                series.active = Some(Bar::opening(bucket, price, volume));
                true
            }
            None => {
                // Continue from warmup history so the live sequence stays gap-free.
                let mut closed = false;
                if let Some(last) = series.history.latest().copied() {
                    if bucket <= last.time {
                        series.report.late_ticks += 1;
                        return false;
                    }
                    let before = series.report.synthetic_bars;
                    series.fill_gap(tf_ms, last.time, last.close, bucket);
                    closed = series.report.synthetic_bars > before;
                }
                series.active = Some(Bar::opening(bucket, price, volume));
                closed
            }
        }
    }

    /// Push an already-closed bar, bypassing synthesis
    pub fn ingest_bar(&mut self, symbol: &str, bar: Bar) -> bool {
        let capacity = self.capacity;
        let series = self
            .series
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolSeries::new(capacity));

        if let Some(last) = series.history.latest() {
            if bar.time <= last.time {
                series.report.late_ticks += 1;
                return false;
            }
        }
        series.history.push(bar);
        true
    }

    pub fn is_warmed_up(&self, symbol: &str) -> bool {
        self.history_len(symbol) >= self.lookback
    }

    /// Retained closed bars, most recent last
    pub fn lookback_window(&self, symbol: &str) -> Vec<Bar> {
        self.series
            .get(symbol)
            .map(|s| s.history.last_n(self.capacity))
            .unwrap_or_default()
    }

    /// In-progress bar for the current bucket
    pub fn active_bar(&self, symbol: &str) -> Option<&Bar> {
        self.series.get(symbol).and_then(|s| s.active.as_ref())
    }

    pub fn history_len(&self, symbol: &str) -> usize {
        self.series.get(symbol).map_or(0, |s| s.history.len())
    }

    pub fn report(&self, symbol: &str) -> AggregationReport {
        self.series
            .get(symbol)
            .map(|s| s.report)
            .unwrap_or_default()
    }

    /// Forget all state for a symbol
    pub fn reset(&mut self, symbol: &str) {
        self.series.remove(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYM: &str = "BTC/USDT";

    fn aggregator() -> BarAggregator {
        BarAggregator::new(Timeframe::minutes(1), 3, 10)
    }

    #[test]
    fn ticks_within_bucket_build_ohlc() {
        let mut agg = aggregator();
        assert!(!agg.update_tick(SYM, 1_000, 10.0, 1.0));
        assert!(!agg.update_tick(SYM, 5_000, 13.0, 1.0));
        assert!(!agg.update_tick(SYM, 20_000, 8.0, 1.0));
        assert!(!agg.update_tick(SYM, 59_999, 11.0, 2.0));

        let active = agg.active_bar(SYM).copied().unwrap();
        assert_eq!(active.time, 0);
        assert_eq!(active.open, 10.0);
        assert_eq!(active.high, 13.0);
        assert_eq!(active.low, 8.0);
        assert_eq!(active.close, 11.0);
        assert_eq!(active.volume, 5.0);

        assert!(agg.update_tick(SYM, 60_000, 12.0, 1.0));
        let closed = agg.lookback_window(SYM);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0], active);
    }

    #[test]
    fn gap_of_n_buckets_produces_n_flat_bars() {
        let mut agg = aggregator();
        agg.update_tick(SYM, 0, 10.0, 1.0);
        agg.update_tick(SYM, 30_000, 10.5, 1.0);
        // Skip buckets 60s, 120s, 180s.
        assert!(agg.update_tick(SYM, 240_500, 12.0, 1.0));

        let window = agg.lookback_window(SYM);
        assert_eq!(window.len(), 4);
        let times: Vec<i64> = window.iter().map(|b| b.time).collect();
        assert_eq!(times, vec![0, 60_000, 120_000, 180_000]);
        for flat in &window[1..] {
            assert_eq!(flat.open, 10.5);
            assert_eq!(flat.high, 10.5);
            assert_eq!(flat.low, 10.5);
            assert_eq!(flat.close, 10.5);
            assert_eq!(flat.volume, 0.0);
        }
        assert_eq!(agg.report(SYM).synthetic_bars, 3);
        assert_eq!(agg.active_bar(SYM).map(|b| b.time), Some(240_000));
    }

    #[test]
    fn adjacent_bucket_adds_no_synthetic_bars() {
        let mut agg = aggregator();
        agg.update_tick(SYM, 0, 10.0, 1.0);
        agg.update_tick(SYM, 60_000, 11.0, 1.0);
        assert_eq!(agg.report(SYM).synthetic_bars, 0);
        assert_eq!(agg.history_len(SYM), 1);
    }

    #[test]
    fn invalid_ticks_leave_state_untouched() {
        let mut agg = aggregator();
        agg.update_tick(SYM, 0, 10.0, 1.0);
        assert!(!agg.update_tick(SYM, 70_000, 0.0, 1.0));
        assert!(!agg.update_tick(SYM, 70_000, -1.0, 1.0));
        assert!(!agg.update_tick(SYM, -70_000, 5.0, 1.0));

        assert_eq!(agg.history_len(SYM), 0);
        assert_eq!(agg.active_bar(SYM).map(|b| b.close), Some(10.0));
        assert_eq!(agg.report(SYM).rejected_ticks, 3);
    }

    #[test]
    fn late_ticks_are_ignored() {
        let mut agg = aggregator();
        agg.update_tick(SYM, 120_000, 10.0, 1.0);
        assert!(!agg.update_tick(SYM, 61_000, 99.0, 1.0));

        let active = agg.active_bar(SYM).copied().unwrap();
        assert_eq!(active.high, 10.0);
        assert_eq!(agg.report(SYM).late_ticks, 1);
    }

    #[test]
    fn warmed_up_tracks_lookback() {
        let mut agg = aggregator();
        assert!(!agg.is_warmed_up(SYM));
        for i in 0..3 {
            agg.ingest_bar(SYM, Bar::flat(i * 60_000, 1.0));
        }
        assert!(agg.is_warmed_up(SYM));
    }

    #[test]
    fn first_live_tick_continues_from_history() {
        let mut agg = aggregator();
        agg.ingest_bar(SYM, Bar::flat(0, 5.0));
        agg.ingest_bar(SYM, Bar::flat(60_000, 6.0));

        // Tick inside an already-closed bucket is late.
        assert!(!agg.update_tick(SYM, 90_000, 7.0, 1.0));

        // Two empty buckets between history and the first live bucket.
        assert!(agg.update_tick(SYM, 245_000, 7.0, 1.0));
        let times: Vec<i64> = agg.lookback_window(SYM).iter().map(|b| b.time).collect();
        assert_eq!(times, vec![0, 60_000, 120_000, 180_000]);
    }

    #[test]
    fn ingest_rejects_non_increasing_bars() {
        let mut agg = aggregator();
        assert!(agg.ingest_bar(SYM, Bar::flat(60_000, 1.0)));
        assert!(!agg.ingest_bar(SYM, Bar::flat(60_000, 2.0)));
        assert!(!agg.ingest_bar(SYM, Bar::flat(0, 2.0)));
        assert_eq!(agg.history_len(SYM), 1);
    }

    #[test]
    fn huge_gap_keeps_buffer_bounded() {
        let mut agg = aggregator();
        agg.update_tick(SYM, 0, 10.0, 1.0);
        agg.update_tick(SYM, 1_000 * 60_000, 11.0, 1.0);

        let window = agg.lookback_window(SYM);
        assert_eq!(window.len(), 10);
        assert_eq!(window.last().map(|b| b.time), Some(999 * 60_000));
        assert_eq!(agg.report(SYM).synthetic_bars, 999);
    }
}
