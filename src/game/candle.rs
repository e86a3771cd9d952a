//! Candle Aggregation
//!
//! Groups raw crash ticks into time-bucketed OHLC candles. Once too many
//! completed candles pile up they are merged pairwise and the bucket
//! duration doubles, so a long game still fits on one chart.
//!
//! Everything handed out of the aggregator is an owned copy. A completed
//! candle is a plain value; nothing a client receives can change after it
//! was sent.

use serde::{Serialize, Deserialize};

/// Default bucket width for the first candles of a game.
pub const DEFAULT_GROUP_DURATION_MS: i64 = 5_000;

/// Default completed-candle count that triggers a merge.
pub const DEFAULT_MERGE_THRESHOLD: usize = 30;

/// OHLC summary of a window of ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleGroup {
    /// First price in the window.
    pub open: f64,
    /// Last price in the window.
    pub close: f64,
    /// Highest price.
    pub max: f64,
    /// Lowest price.
    pub min: f64,
    /// Raw prices; only populated while the candle is in progress.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_list: Vec<f64>,
    /// Window start (unix ms).
    pub start_time: i64,
    /// Window width.
    pub duration_ms: i64,
    /// Frozen candles never change again.
    pub is_complete: bool,
}

impl CandleGroup {
    fn open_at(price: f64, now_ms: i64, duration_ms: i64) -> Self {
        Self {
            open: price,
            close: price,
            max: price,
            min: price,
            value_list: vec![price],
            start_time: now_ms,
            duration_ms,
            is_complete: false,
        }
    }

    fn push(&mut self, price: f64) {
        self.value_list.push(price);
        self.close = price;
        self.max = self.max.max(price);
        self.min = self.min.min(price);
    }

    /// Completed copy without raw values.
    fn frozen(&self) -> Self {
        Self {
            value_list: Vec::new(),
            is_complete: true,
            ..self.clone()
        }
    }

    /// Combine two adjacent candles into one twice as wide.
    pub fn merge(first: &CandleGroup, second: &CandleGroup) -> CandleGroup {
        CandleGroup {
            open: first.open,
            close: second.close,
            max: first.max.max(second.max),
            min: first.min.min(second.min),
            value_list: Vec::new(),
            start_time: first.start_time,
            duration_ms: first.duration_ms * 2,
            is_complete: true,
        }
    }

    /// `min <= open, close <= max`.
    pub fn is_consistent(&self) -> bool {
        self.min <= self.open
            && self.open <= self.max
            && self.min <= self.close
            && self.close <= self.max
    }
}

/// Merge candles pairwise; an odd trailing candle is carried over unchanged.
pub fn merge_groups(groups: &[CandleGroup]) -> Vec<CandleGroup> {
    let mut merged: Vec<CandleGroup> = groups
        .chunks_exact(2)
        .map(|pair| CandleGroup::merge(&pair[0], &pair[1]))
        .collect();
    if groups.len() % 2 == 1 {
        if let Some(last) = groups.last() {
            merged.push(last.clone());
        }
    }
    merged
}

/// Bucketing state of a game's candles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleGroupingState {
    /// Width of newly opened candles. Only ever doubles.
    pub group_duration_ms: i64,
    /// Start of the in-progress candle.
    pub group_start_time: i64,
    /// Number of merges so far.
    pub merge_count: u32,
}

/// Candles affected by one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickCandles {
    /// The in-progress candle after the tick.
    pub current: CandleGroup,
    /// A candle frozen by this tick, if its window elapsed. When the freeze
    /// triggers a merge this is the merged tail, so it always equals the last
    /// entry of [`CandleAggregator::completed`].
    pub completed: Option<CandleGroup>,
}

/// Tick-to-candle aggregator for one crash game.
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    completed: Vec<CandleGroup>,
    current: Option<CandleGroup>,
    state: CandleGroupingState,
    merge_threshold: usize,
}

impl Default for CandleAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_GROUP_DURATION_MS, DEFAULT_MERGE_THRESHOLD)
    }
}

impl CandleAggregator {
    /// Create an aggregator. Thresholds below 2 are raised to 2.
    pub fn new(group_duration_ms: i64, merge_threshold: usize) -> Self {
        Self {
            completed: Vec::new(),
            current: None,
            state: CandleGroupingState {
                group_duration_ms: group_duration_ms.max(1),
                group_start_time: 0,
                merge_count: 0,
            },
            merge_threshold: merge_threshold.max(2),
        }
    }

    /// Feed one price observed at `now_ms`.
    pub fn on_tick(&mut self, price: f64, now_ms: i64) -> TickCandles {
        let duration = self.state.group_duration_ms;

        let completed = match self.current.as_mut() {
            None => {
                self.current = Some(CandleGroup::open_at(price, now_ms, duration));
                self.state.group_start_time = now_ms;
                None
            }
            Some(current) if now_ms - self.state.group_start_time >= duration => {
                self.completed.push(current.frozen());
                if self.completed.len() >= self.merge_threshold {
                    self.merge();
                }
                let tail = self.completed.last().cloned();
                self.current = Some(CandleGroup::open_at(
                    price,
                    now_ms,
                    self.state.group_duration_ms,
                ));
                self.state.group_start_time = now_ms;
                tail
            }
            Some(current) => {
                current.push(price);
                None
            }
        };

        TickCandles {
            current: self.current.clone().unwrap_or_else(|| {
                CandleGroup::open_at(price, now_ms, self.state.group_duration_ms)
            }),
            completed,
        }
    }

    fn merge(&mut self) {
        self.completed = merge_groups(&self.completed);
        self.state.group_duration_ms *= 2;
        self.state.merge_count += 1;
    }

    /// Freeze the in-progress candle at game end.
    ///
    /// A rugged game closes its last candle at zero.
    pub fn finish(&mut self, rugged: bool) -> Option<CandleGroup> {
        let current = self.current.take()?;
        let mut frozen = current.frozen();
        if rugged {
            frozen.close = 0.0;
            frozen.min = 0.0;
        }
        self.completed.push(frozen.clone());
        Some(frozen)
    }

    /// Copy of the completed candles, oldest first.
    pub fn completed(&self) -> Vec<CandleGroup> {
        self.completed.clone()
    }

    /// Copy of the in-progress candle.
    pub fn current(&self) -> Option<CandleGroup> {
        self.current.clone()
    }

    /// Current bucketing state.
    pub fn state(&self) -> CandleGroupingState {
        self.state
    }

    /// Consume the aggregator, returning the completed candles.
    pub fn into_completed(self) -> Vec<CandleGroup> {
        self.completed
    }
}

// =============================================================================
// TESTS
// =============================================================================
