//! bench-forge: resumable synthesis of feature re-implementation benchmark
//! tasks.
//!
//! A repository goes through four stages (environment, synthesis,
//! validation, check), each recorded in an append-only JSONL ledger. The
//! ledgers are the only state: an interrupted run resumes from whatever they
//! hold, and finished ledgers can be validated and merged as datasets.

pub mod check;
pub mod cli;
pub mod container;
pub mod dataset;
pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod repo;
pub mod task;
pub mod workers;

pub use error::{DatasetError, LedgerError, PipelineError, WorkerError};
