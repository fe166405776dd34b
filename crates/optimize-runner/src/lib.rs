//! # optimize-runner
//!
//! Turns the Optimize activity feed into work.
//!
//! This crate provides:
//! - The trial-run loop driving one experiment until the server stops it
//! - Activity dispatch: scans update a scenario template, runs create and
//!   execute an experiment, and every handled item is acknowledged
//! - [`ActivityWorker`], which consumes a subscription channel and runs
//!   experiments alongside scans
//! - Trial evaluators and template generators

mod barrier;
mod dispatch;
mod evaluator;
mod template;
mod trial_loop;
mod worker;

pub use barrier::RunGroup;
pub use dispatch::{ActivityDispatcher, DispatchOutcome, Handled};
pub use evaluator::{CommandEvaluator, TrialEvaluator};
pub use template::{
    baseline_assignments, experiment_from_template, FileTemplateGenerator, TemplateGenerator,
};
pub use trial_loop::{run_experiment, TrialRunSummary, TrialStep, EVALUATION_FAILED};
pub use worker::{worker_query, ActivityWorker, WorkerReport};
