//! Rolling performance profiler
//!
//! Keeps the most recent measurements of an operation (by default the
//! lifetime of a pooled connection checkout) and reports average latency
//! split by outcome.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of measurements kept per profiler
pub const PROFILER_WINDOW: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Sample {
    elapsed: Duration,
    success: bool,
}

/// Snapshot of a profiler's rolling window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub avg_success_ms: f64,
    pub avg_error_ms: f64,
    pub success_count: u32,
    pub error_count: u32,
}

impl PerformanceStats {
    /// Fraction of failed measurements in the window
    pub fn error_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            0.0
        } else {
            self.error_count as f64 / total as f64
        }
    }
}

/// Rolling window of operation latencies
#[derive(Debug)]
pub struct PerformanceProfiler {
    name: String,
    window: usize,
    samples: Mutex<VecDeque<Sample>>,
}

impl PerformanceProfiler {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_window(name, PROFILER_WINDOW)
    }

    pub fn with_window(name: impl Into<String>, window: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            window: window.max(1),
            samples: Mutex::new(VecDeque::with_capacity(window.max(1))),
        })
    }

    /// Start a measurement; finish it with `success()` or `error()`.
    pub fn start(self: &Arc<Self>) -> Measurement {
        Measurement {
            profiler: Arc::clone(self),
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn record(&self, elapsed: Duration, success: bool) {
        let outcome = if success { "success" } else { "error" };
        metrics::histogram!(
            "xyzfs_profiler_latency_seconds",
            "profiler" => self.name.clone(),
            "outcome" => outcome
        )
        .record(elapsed.as_secs_f64());

        let mut samples = self.samples.lock();
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(Sample { elapsed, success });
    }

    pub fn stats(&self) -> PerformanceStats {
        let samples = self.samples.lock();
        let mut stats = PerformanceStats::default();
        let (mut ok_total, mut err_total) = (0.0, 0.0);
        for sample in samples.iter() {
            let ms = sample.elapsed.as_secs_f64() * 1000.0;
            if sample.success {
                stats.success_count += 1;
                ok_total += ms;
            } else {
                stats.error_count += 1;
                err_total += ms;
            }
        }
        if stats.success_count > 0 {
            stats.avg_success_ms = ok_total / stats.success_count as f64;
        }
        if stats.error_count > 0 {
            stats.avg_error_ms = err_total / stats.error_count as f64;
        }
        stats
    }
}

/// An in-flight measurement
///
/// Dropping an unfinished measurement records nothing.
#[derive(Debug)]
pub struct Measurement {
    profiler: Arc<PerformanceProfiler>,
    started: Instant,
    finished: bool,
}

impl Measurement {
    pub fn success(mut self) {
        self.finish(true);
    }

    pub fn error(mut self) {
        self.finish(false);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn finish(&mut self, success: bool) {
        if !self.finished {
            self.finished = true;
            self.profiler.record(self.started.elapsed(), success);
        }
    }
}
