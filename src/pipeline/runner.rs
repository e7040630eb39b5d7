//! Stage runner: executes a stage's deficit against a worker.
//!
//! Each planned item gets exactly one worker call. A success is appended to
//! the stage ledger immediately, so an interrupted run keeps everything that
//! finished. Worker failures and timeouts are counted and logged; the item
//! simply stays in the deficit for the next run. A ledger error is fatal.

use std::time::{Duration, Instant};

use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

use super::planner::{shard_items, PlannedItem};
use super::progress::{ProgressMonitor, StageCounters, StageReport};
use crate::error::{PipelineError, WorkerError};
use crate::ledger::Ledger;
use crate::workers::Worker;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Runs planned items through a worker with bounded parallelism.
///
/// The plan is split into `concurrency` shards by upstream line index; each
/// shard is worked through sequentially, shards run side by side. Workers
/// share nothing but the ledger.
#[derive(Debug, Clone)]
pub struct StageRunner {
    concurrency: usize,
    item_timeout: Duration,
}

impl StageRunner {
    pub fn new(concurrency: usize, item_timeout: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            item_timeout,
        }
    }

    /// One item at a time.
    pub fn sequential(item_timeout: Duration) -> Self {
        Self::new(1, item_timeout)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn item_timeout(&self) -> Duration {
        self.item_timeout
    }

    /// Runs every planned item and reports what was appended.
    pub async fn run<I, O, W>(
        &self,
        stage: &str,
        items: Vec<PlannedItem<I>>,
        worker: &W,
        ledger: &Ledger<O>,
    ) -> Result<StageReport, PipelineError>
    where
        I: Send + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
        W: Worker<I, O> + ?Sized,
    {
        if items.is_empty() {
            return Ok(StageReport::skipped(stage));
        }

        let counters = StageCounters::new();
        counters.planned.store(items.len(), Ordering::Relaxed);
        info!(
            stage = stage,
            planned = items.len(),
            concurrency = self.concurrency,
            "Running stage items"
        );

        let shards = shard_items(items, self.concurrency);
        let monitor = ProgressMonitor::start(
            stage.to_string(),
            counters.clone(),
            PROGRESS_INTERVAL,
        );
        let shard_runs = shards.into_iter().map(|shard| {
            let counters = &counters;
            async move {
                for planned in shard {
                    self.run_one(stage, &planned.task_id, planned.item, worker, ledger, counters)
                        .await?;
                }
                Ok::<(), PipelineError>(())
            }
        });
        let result = try_join_all(shard_runs).await;
        monitor.stop().await;
        result?;

        let report = StageReport::from_counters(stage, &counters);
        info!(
            stage = stage,
            planned = report.planned,
            appended = report.appended,
            failed = report.failed,
            "Stage items finished"
        );
        Ok(report)
    }

    /// One worker call and, on success, one append.
    ///
    /// Returns whether a record was appended. Only ledger errors are returned
    /// as `Err`.
    pub async fn run_one<I, O, W>(
        &self,
        stage: &str,
        task_id: &str,
        item: I,
        worker: &W,
        ledger: &Ledger<O>,
        counters: &StageCounters,
    ) -> Result<bool, PipelineError>
    where
        I: Send + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
        W: Worker<I, O> + ?Sized,
    {
        let started = Instant::now();
        counters.in_flight.fetch_add(1, Ordering::Relaxed);
        let outcome = match tokio::time::timeout(self.item_timeout, worker.invoke(item)).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Timeout {
                seconds: self.item_timeout.as_secs(),
            }),
        };
        counters.in_flight.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Ok(record) => {
                let ledger = ledger.clone();
                tokio::task::spawn_blocking(move || ledger.append(&record)).await??;
                counters.appended.fetch_add(1, Ordering::Relaxed);
                info!(
                    stage = stage,
                    task_id = task_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Appended record"
                );
                Ok(true)
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    stage = stage,
                    task_id = task_id,
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Worker failed, item stays pending"
                );
                Ok(false)
            }
        }
    }
}
