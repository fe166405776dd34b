//! Trial-run loop
//!
//! Drives one experiment: create the baseline trial, then keep asking the
//! server for the next trial, evaluate it and report the result until the
//! server says the experiment is stopped.

use crate::evaluator::TrialEvaluator;
use chrono::Utc;
use optimize_api::experiments::{
    Assignment, ExperimentApi, ExperimentItem, ExperimentName, TrialAssignments, TrialValues,
};
use optimize_core::{OptimizeError, Relation, Result};
use tracing::{debug, info, instrument, warn};

/// Failure reason reported when the evaluator could not measure a trial
pub const EVALUATION_FAILED: &str = "evaluation-failed";

/// Outcome of asking for the next trial
#[derive(Debug)]
pub enum TrialStep {
    /// A trial to evaluate
    Assigned(TrialAssignments),
    /// No more trials; the run is complete
    Stopped,
    Failed(OptimizeError),
}

impl From<Result<TrialAssignments>> for TrialStep {
    fn from(result: Result<TrialAssignments>) -> Self {
        match result {
            Ok(assignments) => TrialStep::Assigned(assignments),
            Err(e) if e.is_experiment_stopped() => TrialStep::Stopped,
            Err(e) => TrialStep::Failed(e),
        }
    }
}

/// What a completed run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrialRunSummary {
    pub experiment: ExperimentName,
    /// Trials reported after the baseline
    pub trials: usize,
    /// Reported trials that failed evaluation
    pub failed_trials: usize,
}

/// Run `experiment` until the server stops it
///
/// The baseline trial is created first; failing to create it fails the run.
/// Evaluation failures are reported as failed trials and the loop carries on.
/// Any error from the server other than the stop signal ends the run.
#[instrument(skip_all, fields(experiment = %experiment.name))]
pub async fn run_experiment<A, E>(
    api: &A,
    experiment: &ExperimentItem,
    baseline: Vec<Assignment>,
    evaluator: &E,
) -> Result<TrialRunSummary>
where
    A: ExperimentApi + ?Sized,
    E: TrialEvaluator + ?Sized,
{
    let trials_url = experiment.metadata.require_link(Relation::Trials)?;
    let next_trial_url = experiment.metadata.require_link(Relation::NextTrial)?;

    let mut summary = TrialRunSummary {
        experiment: experiment.name.clone(),
        ..Default::default()
    };

    let baseline = TrialAssignments::baseline(baseline);
    let created = api.create_trial(trials_url, &baseline).await?;
    debug!("Created baseline trial {:?}", created.location());

    loop {
        let assignments = match TrialStep::from(api.next_trial(next_trial_url).await) {
            TrialStep::Assigned(assignments) => assignments,
            TrialStep::Stopped => break,
            TrialStep::Failed(e) => return Err(e),
        };

        let location = assignments.metadata.require_location()?.to_string();
        let started = Utc::now();

        let values = match evaluator.evaluate(&assignments).await {
            Ok(values) => TrialValues::succeeded(values),
            Err(e) => {
                warn!("Trial {} failed evaluation: {}", location, e);
                summary.failed_trials += 1;
                TrialValues::failed(EVALUATION_FAILED, e.to_string())
            }
        };

        api.report_trial(&location, &values.with_times(started, Utc::now()))
            .await?;
        summary.trials += 1;
        debug!("Reported trial {}", location);
    }

    info!(
        "Experiment {} stopped after {} trials",
        summary.experiment, summary.trials
    );
    Ok(summary)
}
