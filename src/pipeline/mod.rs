//! Resumable, ledger-backed pipeline.
//!
//! # Stages
//!
//! 1. **Environment**: build the repository's container image once.
//! 2. **Synthesis**: ask an agent for candidate tasks until the target count
//!    is reached.
//! 3. **Validation**: ask an agent to validate each candidate and produce
//!    `src.diff` / `tests.diff`.
//! 4. **Check**: verify each validated task with the apply / fail / reverse
//!    protocol.
//!
//! Every stage plans from the JSONL ledgers on disk ([`planner`]), runs its
//! items through a [`StageRunner`], and appends one line per finished item.
//! A worker failure leaves the item pending for the next run.
//!
//! # Example
//!
//! ```rust,ignore
//! use bench_forge::pipeline::{PipelineConfig, StageContext, Workflow, WorkflowWorkers};
//!
//! let config = PipelineConfig::from_env()?.with_target_candidates(5);
//! let ctx = StageContext::from_snapshot(&snapshot, container, paths);
//! let workers = WorkflowWorkers::from_config(&config, &ctx)?;
//! let summary = Workflow::new(&config, ctx, matching_files, workers)?.run().await?;
//! println!("{} passed, {} failed", summary.passed, summary.failed);
//! ```

pub mod config;
pub mod planner;
pub mod progress;
pub mod runner;
pub mod stages;
pub mod workflow;

pub use config::{ConfigError, PipelineConfig};
pub use planner::{
    remaining_count, remaining_work, shard_items, PlannedItem, ResumeMode, WorkPlan,
};
pub use progress::{ProgressMonitor, ProgressSnapshot, StageCounters, StageReport};
pub use runner::StageRunner;
pub use stages::{
    CheckStage, EnvironmentStage, Stage, StageContext, SynthesisStage, ValidationStage, CHECK,
    ENVIRONMENT, SYNTHESIS, VALIDATION,
};
pub use workflow::{Workflow, WorkflowSummary, WorkflowWorkers};
