//! Background maintenance.
//!
//! Writes submit a [`MaintenanceTask`] to the [`MaintenanceScheduler`], which
//! runs the [`Pipeline`] (score, summarize, persist, publish) on a bounded
//! worker pool. The [`Reconciler`] sweeps the whole store on a timer so the
//! cache and the vector index converge with the current weights.

pub mod pipeline;
pub mod reconcile;
pub mod scheduler;
pub mod summary;

pub use pipeline::{MaintenanceTask, Pipeline, Stage, StageOutcome, TaskId, TaskReport};
pub use reconcile::{ReconcileHandle, ReconcileReport, Reconciler};
pub use scheduler::{
    MaintenanceScheduler, SchedulerConfig, SchedulerStats, ShutdownReport, Submission, TaskFailure,
};
pub use summary::{ExtractiveSummarizer, Summarizer, Summary};
