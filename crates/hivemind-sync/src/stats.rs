//! Per-task timing accumulation for finalization passes.
//!
//! Tasks report their elapsed wall-clock time under a name; at the end
//! of a pass the scheduler logs the aggregate and cross-checks it
//! against the real elapsed time (diagnostic only — with a worker
//! pool the sum of task times normally exceeds the wall time).

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

/// Accumulates named-task timings. Cheap to share; all methods take
/// `&self`.
#[derive(Debug, Default)]
pub struct StatsCollector {
    timings: Mutex<HashMap<String, Duration>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished task's elapsed time. Repeated reports under
    /// the same name accumulate.
    pub fn record(&self, name: &str, elapsed: Duration) {
        let mut timings = self.timings.lock();
        *timings.entry(name.to_string()).or_default() += elapsed;
    }

    /// Sum of all recorded task times.
    pub fn total(&self) -> Duration {
        self.timings.lock().values().sum()
    }

    /// Log every recorded task under the given heading, slowest
    /// first, and return the sum.
    pub fn log_current(&self, heading: &str) -> Duration {
        let timings = self.timings.lock();
        let mut entries: Vec<_> = timings.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1));
        for (name, elapsed) in &entries {
            tracing::info!("`{}` executed in {:.4}s", name, elapsed.as_secs_f64());
        }
        let total: Duration = timings.values().sum();
        tracing::info!("{}: {:.4}s", heading, total.as_secs_f64());
        total
    }

    /// Discard all recorded timings.
    pub fn clear(&self) {
        self.timings.lock().clear();
    }

    /// Number of distinct task names recorded.
    pub fn len(&self) -> usize {
        self.timings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.timings.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_total() {
        let stats = StatsCollector::new();
        stats.record("a", Duration::from_millis(100));
        stats.record("b", Duration::from_millis(50));
        assert_eq!(stats.len(), 2);
        assert_eq!(stats.total(), Duration::from_millis(150));
    }

    #[test]
    fn test_repeated_names_accumulate() {
        let stats = StatsCollector::new();
        stats.record("a", Duration::from_millis(10));
        stats.record("a", Duration::from_millis(20));
        assert_eq!(stats.len(), 1);
        assert_eq!(stats.total(), Duration::from_millis(30));
    }

    #[test]
    fn test_clear_resets() {
        let stats = StatsCollector::new();
        stats.record("a", Duration::from_millis(10));
        stats.clear();
        assert!(stats.is_empty());
        assert_eq!(stats.total(), Duration::ZERO);
    }
}
