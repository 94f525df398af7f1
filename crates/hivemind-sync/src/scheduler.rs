//! Phase-barrier task scheduling for post-sync maintenance.
//!
//! Finalization work is a list of named tasks grouped into phases.
//! Tasks in the same phase run concurrently on a worker pool bounded
//! by the usable connection count; phases execute strictly in order.
//! The phase barrier is how tasks that mutate the same table are kept
//! from ever overlapping — such tasks are simply placed in different
//! phases.
//!
//! A failing task is logged with its name and re-raised after the
//! rest of its phase has been observed; the caller treats that as
//! fatal for the current finalization pass. No work is ever left
//! unawaited.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::stats::StatsCollector;
use crate::{Error, Result};

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A named unit of post-sync work.
pub struct MaintenanceTask {
    name: String,
    fut: TaskFuture,
}

impl MaintenanceTask {
    pub fn new<F>(name: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self { name: name.into(), fut: Box::pin(fut) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Runs phases of maintenance tasks against a bounded worker pool.
pub struct TaskScheduler {
    workers: usize,
    stats: Arc<StatsCollector>,
}

impl TaskScheduler {
    /// `workers` is the maximum number of tasks in flight at once,
    /// normally the usable connection count — each task holds one
    /// pooled connection for its full duration.
    pub fn new(workers: usize, stats: Arc<StatsCollector>) -> Self {
        Self { workers: workers.max(1), stats }
    }

    /// Run every phase in order, with a barrier between phases.
    ///
    /// Returns the first task failure, after the failing task's phase
    /// has fully drained. Later phases are not started.
    pub async fn run_phases(&self, phases: Vec<Vec<MaintenanceTask>>) -> Result<()> {
        for (phase_num, phase) in phases.into_iter().enumerate() {
            self.run_phase(phase_num, phase).await?;
        }
        Ok(())
    }

    async fn run_phase(&self, phase_num: usize, tasks: Vec<MaintenanceTask>) -> Result<()> {
        let wall_start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut names: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut set: JoinSet<Result<Duration>> = JoinSet::new();

        for task in tasks {
            let semaphore = Arc::clone(&semaphore);
            let MaintenanceTask { name, fut } = task;
            let handle = set.spawn(async move {
                // the semaphore is never closed while the set is alive
                let _permit = semaphore.acquire_owned().await.map_err(|_| Error::State(
                    "scheduler semaphore closed".to_string(),
                ))?;
                let start = Instant::now();
                fut.await?;
                Ok(start.elapsed())
            });
            names.insert(handle.id(), name);
        }

        let mut first_failure: Option<Error> = None;
        let mut completed = 0usize;
        let mut tasks_elapsed = Duration::ZERO;

        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, Ok(elapsed))) => {
                    let name = names.remove(&id).unwrap_or_default();
                    self.stats.record(&name, elapsed);
                    tasks_elapsed += elapsed;
                    completed += 1;
                    counter!("finalize_tasks_total").increment(1);
                }
                Ok((id, Err(e))) => {
                    let name = names.remove(&id).unwrap_or_default();
                    tracing::error!("'{}' generated an exception: {}", name, e);
                    counter!("finalize_task_failures_total").increment(1);
                    if first_failure.is_none() {
                        first_failure = Some(Error::TaskFailed { name, source: Box::new(e) });
                    }
                }
                Err(join_err) => {
                    let name = names.remove(&join_err.id()).unwrap_or_default();
                    tracing::error!("'{}' did not complete: {}", name, join_err);
                    counter!("finalize_task_failures_total").increment(1);
                    if first_failure.is_none() {
                        first_failure =
                            Some(Error::TaskJoin { name, reason: join_err.to_string() });
                    }
                }
            }
        }

        if let Some(failure) = first_failure {
            return Err(failure);
        }

        let wall = wall_start.elapsed();
        tracing::info!("[INIT] {} tasks finished in phase {}", completed, phase_num);
        // diagnostic only: with a worker pool the task sum usually exceeds wall time
        tracing::info!(
            "Elapsed time: {:.4}s. Calculated elapsed time: {:.4}s. Difference: {:.4}s",
            wall.as_secs_f64(),
            tasks_elapsed.as_secs_f64(),
            wall.as_secs_f64() - tasks_elapsed.as_secs_f64()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn scheduler(workers: usize) -> TaskScheduler {
        TaskScheduler::new(workers, Arc::new(StatsCollector::new()))
    }

    #[tokio::test]
    async fn test_phases_run_in_strict_order() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let mut phase0 = Vec::new();
        for name in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            phase0.push(MaintenanceTask::new(name, async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                order.lock().push("phase0");
                Ok(())
            }));
        }
        let order1 = Arc::clone(&order);
        let phase1 = vec![MaintenanceTask::new("d", async move {
            order1.lock().push("phase1");
            Ok(())
        })];

        scheduler(4).run_phases(vec![phase0, phase1]).await.unwrap();

        let order = order.lock();
        assert_eq!(order.len(), 4);
        // the barrier guarantees every phase-0 task precedes phase 1
        assert_eq!(order[3], "phase1");
        assert!(order[..3].iter().all(|s| *s == "phase0"));
    }

    #[tokio::test]
    async fn test_failure_aborts_pass_after_phase_drains() {
        let siblings_ran = Arc::new(Mutex::new(0usize));
        let phase1_ran = Arc::new(Mutex::new(false));

        let mut phase0 = Vec::new();
        phase0.push(MaintenanceTask::new("broken", async {
            Err(Error::State("boom".to_string()))
        }));
        for name in ["s1", "s2"] {
            let siblings_ran = Arc::clone(&siblings_ran);
            phase0.push(MaintenanceTask::new(name, async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                *siblings_ran.lock() += 1;
                Ok(())
            }));
        }
        let phase1_flag = Arc::clone(&phase1_ran);
        let phase1 = vec![MaintenanceTask::new("later", async move {
            *phase1_flag.lock() = true;
            Ok(())
        })];

        let err = scheduler(4).run_phases(vec![phase0, phase1]).await.unwrap_err();
        assert!(matches!(err, Error::TaskFailed { ref name, .. } if name == "broken"));
        // siblings were drained before the failure propagated
        assert_eq!(*siblings_ran.lock(), 2);
        // the next phase never started
        assert!(!*phase1_ran.lock());
    }

    #[tokio::test]
    async fn test_worker_bound_limits_concurrency() {
        let in_flight = Arc::new(Mutex::new((0usize, 0usize))); // (current, max)

        let mut phase = Vec::new();
        for i in 0..8 {
            let in_flight = Arc::clone(&in_flight);
            phase.push(MaintenanceTask::new(format!("t{}", i), async move {
                {
                    let mut guard = in_flight.lock();
                    guard.0 += 1;
                    guard.1 = guard.1.max(guard.0);
                }
                tokio::time::sleep(Duration::from_millis(15)).await;
                in_flight.lock().0 -= 1;
                Ok(())
            }));
        }

        scheduler(2).run_phases(vec![phase]).await.unwrap();
        assert!(in_flight.lock().1 <= 2);
    }

    #[tokio::test]
    async fn test_timings_are_recorded_per_task() {
        let stats = Arc::new(StatsCollector::new());
        let scheduler = TaskScheduler::new(4, Arc::clone(&stats));
        let phase = vec![
            MaintenanceTask::new("x", async { Ok(()) }),
            MaintenanceTask::new("y", async { Ok(()) }),
        ];
        scheduler.run_phases(vec![phase]).await.unwrap();
        assert_eq!(stats.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_phase_list_is_a_noop() {
        scheduler(1).run_phases(Vec::new()).await.unwrap();
        scheduler(1).run_phases(vec![Vec::new()]).await.unwrap();
    }
}
