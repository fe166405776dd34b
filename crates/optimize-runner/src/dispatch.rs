//! Activity dispatch and acknowledgement
//!
//! Each activity item refers to a scenario through its external URL. A scan
//! pushes a freshly generated template to the scenario; a run creates a new
//! experiment under the scenario and drives it with the trial-run loop.
//! Handled items are deleted from the feed whether or not handling worked,
//! so an item that always fails cannot come back forever. Items with tags
//! this worker does not know are left on the feed for someone else.

use crate::evaluator::TrialEvaluator;
use crate::template::{baseline_assignments, experiment_from_template, TemplateGenerator};
use crate::trial_loop::{run_experiment, TrialRunSummary};
use optimize_api::applications::{ActivityItem, ActivityTag, ApplicationApi, ApplicationItem, ScenarioItem};
use optimize_api::experiments::{new_experiment_name, ExperimentApi};
use optimize_core::{OptimizeError, Relation, Result};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What handling an item did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// The scenario template was updated
    Scanned,
    /// An experiment ran to completion
    Ran(TrialRunSummary),
    /// No handler for the item's tags; it was not acknowledged
    Skipped,
}

/// Result of dispatching one activity item
#[derive(Debug)]
pub struct DispatchOutcome {
    pub item_url: String,
    pub handled: Result<Handled>,
    /// `None` when acknowledgement was not attempted
    pub acknowledged: Option<Result<()>>,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.handled.is_ok() && !matches!(self.acknowledged, Some(Err(_)))
    }
}

/// Routes activity items to the scan and run handlers
pub struct ActivityDispatcher<P: ?Sized, X> {
    applications: Arc<P>,
    experiments: X,
    generator: Arc<dyn TemplateGenerator>,
    evaluator: Arc<dyn TrialEvaluator>,
}

impl<P: ?Sized, X: Clone> Clone for ActivityDispatcher<P, X> {
    fn clone(&self) -> Self {
        Self {
            applications: Arc::clone(&self.applications),
            experiments: self.experiments.clone(),
            generator: Arc::clone(&self.generator),
            evaluator: Arc::clone(&self.evaluator),
        }
    }
}

impl<P, X> ActivityDispatcher<P, X>
where
    P: ApplicationApi + ?Sized,
    X: ExperimentApi + Clone,
{
    pub fn new(
        applications: Arc<P>,
        experiments: X,
        generator: Arc<dyn TemplateGenerator>,
        evaluator: Arc<dyn TrialEvaluator>,
    ) -> Self {
        Self {
            applications,
            experiments,
            generator,
            evaluator,
        }
    }

    pub fn applications(&self) -> &Arc<P> {
        &self.applications
    }

    /// Handle one item, then acknowledge it
    #[instrument(skip_all, fields(item = %item.url))]
    pub async fn dispatch(&self, item: ActivityItem) -> DispatchOutcome {
        let handled = if item.has_tag(ActivityTag::Scan) {
            self.handle_scan(&item).await.map(|_| Handled::Scanned)
        } else if item.has_tag(ActivityTag::Run) {
            self.handle_run(&item).await.map(Handled::Ran)
        } else {
            warn!("No handler for activity tagged {:?}, leaving it", item.tags);
            return DispatchOutcome {
                item_url: item.url,
                handled: Ok(Handled::Skipped),
                acknowledged: None,
            };
        };

        match &handled {
            Ok(Handled::Ran(summary)) => info!(
                "Run of {} finished ({} trials)",
                item.external_url, summary.trials
            ),
            Ok(_) => info!("Scan of {} finished", item.external_url),
            Err(e) => error!("Failed to handle activity {}: {}", item.url, e),
        }

        let acknowledged = self.acknowledge(&item).await;
        if let Err(e) = &acknowledged {
            warn!("{}", e);
        }

        DispatchOutcome {
            item_url: item.url,
            handled,
            acknowledged: Some(acknowledged),
        }
    }

    /// Remove a handled item from the feed
    pub async fn acknowledge(&self, item: &ActivityItem) -> Result<()> {
        if item.url.is_empty() {
            return Err(OptimizeError::Acknowledgement {
                url: item.id.clone(),
                reason: "item has no URL".to_string(),
            });
        }
        self.applications
            .delete_activity(&item.url)
            .await
            .map_err(|e| OptimizeError::Acknowledgement {
                url: item.url.clone(),
                reason: e.to_string(),
            })
    }

    async fn scenario(&self, item: &ActivityItem) -> Result<(ScenarioItem, ApplicationItem)> {
        let scenario = self.applications.get_scenario(&item.external_url).await?;
        let application_url = scenario.metadata.require_link(Relation::Up)?;
        let application = self.applications.get_application(application_url).await?;
        Ok((scenario, application))
    }

    /// Push a newly generated template to the item's scenario
    pub async fn handle_scan(&self, item: &ActivityItem) -> Result<()> {
        let (scenario, application) = self.scenario(item).await?;
        let template_url = scenario.metadata.require_link(Relation::Template)?;

        let template = self.generator.generate(&application, &scenario).await?;
        debug!(
            "Updating template with {} parameters and {} metrics",
            template.parameters.len(),
            template.metrics.len()
        );
        self.applications
            .update_template(template_url, &template)
            .await
    }

    /// Create an experiment for the item's scenario and run it
    pub async fn handle_run(&self, item: &ActivityItem) -> Result<TrialRunSummary> {
        let (scenario, application) = self.scenario(item).await?;
        let template_url = scenario.metadata.require_link(Relation::Template)?;
        let experiments_url = scenario.metadata.require_link(Relation::Experiments)?;

        let template = self.applications.get_template(template_url).await?;
        let experiment = experiment_from_template(&template, &application, &scenario);

        let api = self.experiments.with_endpoint(experiments_url)?;
        let name = new_experiment_name();
        info!("Creating experiment {} at {}", name, api.endpoint());
        let created = api.create_experiment_by_name(&name, &experiment).await?;

        run_experiment(
            &api,
            &created,
            baseline_assignments(&template),
            self.evaluator.as_ref(),
        )
        .await
    }
}
