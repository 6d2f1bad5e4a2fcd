//! Hit-rate tracking.
//!
//! Lifetime counters plus four circular windows covering the last 100, 1k,
//! 10k, and 100k lookups. Each window cell is two bits: the high bit marks
//! a recorded observation, the low bit marks a hit, so cells the cache has
//! not reached yet read as "no data" instead of as misses. The four
//! buffers together stay under 28 KiB.

use std::sync::Mutex;

use serde::Serialize;

use crate::sync::mutex_lock;

const SOURCE: &str = "performance";
const WINDOW_SIZES: [usize; 4] = [100, 1_000, 10_000, 100_000];

// ============================================================================
// Windows
// ============================================================================

struct WindowBuffer {
    capacity: usize,
    cells: Vec<u8>,
}

impl WindowBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            cells: vec![0u8; capacity.div_ceil(4)],
        }
    }

    fn record(&mut self, call_index: u64, hit: bool) {
        let slot = (call_index % self.capacity as u64) as usize;
        let shift = (slot % 4) * 2;
        let mask = !(0b11u8 << shift);
        let observation = (if hit { 0b11u8 } else { 0b10u8 }) << shift;
        let cell = &mut self.cells[slot / 4];
        *cell = (*cell & mask) | observation;
    }

    fn hit_rate(&self) -> Option<f64> {
        let mut hits = 0u64;
        let mut observed = 0u64;
        for &cell in &self.cells {
            for shift in [0u8, 2, 4, 6] {
                match (cell >> shift) & 0b11 {
                    0b11 => {
                        hits += 1;
                        observed += 1;
                    }
                    0b10 => observed += 1,
                    _ => {}
                }
            }
        }
        (observed > 0).then(|| hits as f64 / observed as f64)
    }
}

// ============================================================================
// Tracker
// ============================================================================

struct TrackerState {
    call_count: u64,
    hit_count: u64,
    miss_count: u64,
    last_hit: Option<String>,
    last_miss: Option<String>,
    windows: [WindowBuffer; 4],
}

/// Sliding-window hit-rate tracker.
pub struct PerformanceTracker {
    state: Mutex<TrackerState>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                call_count: 0,
                hit_count: 0,
                miss_count: 0,
                last_hit: None,
                last_miss: None,
                windows: WINDOW_SIZES.map(WindowBuffer::new),
            }),
        }
    }

    pub fn hit(&self, key: &str) {
        self.record(key, true);
    }

    pub fn miss(&self, key: &str) {
        self.record(key, false);
    }

    fn record(&self, key: &str, hit: bool) {
        let mut state = mutex_lock(&self.state, SOURCE, "record");
        let call_index = state.call_count;
        state.call_count += 1;
        if hit {
            state.hit_count += 1;
            state.last_hit = Some(key.to_string());
        } else {
            state.miss_count += 1;
            state.last_miss = Some(key.to_string());
        }
        for window in &mut state.windows {
            window.record(call_index, hit);
        }
    }

    pub fn report(&self) -> PerformanceReport {
        let state = mutex_lock(&self.state, SOURCE, "report");
        let rates: Vec<Option<f64>> = state.windows.iter().map(WindowBuffer::hit_rate).collect();
        PerformanceReport {
            call_count: state.call_count,
            hit_count: state.hit_count,
            miss_count: state.miss_count,
            hit_rate: (state.call_count > 0)
                .then(|| state.hit_count as f64 / state.call_count as f64),
            hit_rate_last_100: rates[0],
            hit_rate_last_1000: rates[1],
            hit_rate_last_10000: rates[2],
            hit_rate_last_100000: rates[3],
            last_hit: state.last_hit.clone(),
            last_miss: state.last_miss.clone(),
        }
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time tracker snapshot. Window rates are `None` until the
/// window has seen at least one lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub call_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: Option<f64>,
    pub hit_rate_last_100: Option<f64>,
    pub hit_rate_last_1000: Option<f64>,
    pub hit_rate_last_10000: Option<f64>,
    pub hit_rate_last_100000: Option<f64>,
    pub last_hit: Option<String>,
    pub last_miss: Option<String>,
}

/// Tracker wiring with a disabled variant that keeps the call surface.
pub(crate) enum Tracker {
    Active(PerformanceTracker),
    Disabled,
}

impl Tracker {
    pub(crate) fn new(track_performance: bool) -> Self {
        if track_performance {
            Self::Active(PerformanceTracker::new())
        } else {
            Self::Disabled
        }
    }

    pub(crate) fn hit(&self, key: &str) {
        if let Self::Active(tracker) = self {
            tracker.hit(key);
        }
    }

    pub(crate) fn miss(&self, key: &str) {
        if let Self::Active(tracker) = self {
            tracker.miss(key);
        }
    }

    pub(crate) fn report(&self) -> Option<PerformanceReport> {
        match self {
            Self::Active(tracker) => Some(tracker.report()),
            Self::Disabled => None,
        }
    }
}
