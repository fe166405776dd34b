//! Activity worker
//!
//! Consumes the subscription channel. Scans are handled in line; runs are
//! spawned so that scans (and other runs, up to the parallelism limit) keep
//! flowing while an experiment is in progress. When the channel closes the
//! worker waits for every spawned run before returning.

use crate::barrier::RunGroup;
use crate::dispatch::{ActivityDispatcher, DispatchOutcome, Handled};
use optimize_api::applications::{
    Activity, ActivityFeedQuery, ActivityItem, ActivityTag, ApplicationApi, Subscription,
};
use optimize_api::experiments::ExperimentApi;
use optimize_core::{OptimizeError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Items buffered between the subscription and the worker
const CHANNEL_CAPACITY: usize = 16;

/// Tally of everything a worker dispatched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub scans: usize,
    pub runs: usize,
    pub trials: usize,
    pub skipped: usize,
    pub failed: usize,
    pub unacknowledged: usize,
}

impl WorkerReport {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match &outcome.handled {
            Ok(Handled::Scanned) => self.scans += 1,
            Ok(Handled::Ran(summary)) => {
                self.runs += 1;
                self.trials += summary.trials;
            }
            Ok(Handled::Skipped) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
        if let Some(Err(_)) = &outcome.acknowledged {
            self.unacknowledged += 1;
        }
    }
}

/// Feeds activity items to an [`ActivityDispatcher`]
pub struct ActivityWorker<P: ?Sized, X> {
    dispatcher: ActivityDispatcher<P, X>,
    runs: RunGroup,
    max_parallel_runs: usize,
}

impl<P, X> ActivityWorker<P, X>
where
    P: ApplicationApi + ?Sized + 'static,
    X: ExperimentApi + Clone + 'static,
{
    pub fn new(dispatcher: ActivityDispatcher<P, X>) -> Self {
        Self {
            dispatcher,
            runs: RunGroup::new(),
            max_parallel_runs: 1,
        }
    }

    /// Allow up to `max` experiments to run at once (at least one)
    pub fn with_max_parallel_runs(mut self, max: usize) -> Self {
        self.max_parallel_runs = max.max(1);
        self
    }

    /// Runs requested through this worker that have not finished
    pub fn run_group(&self) -> &RunGroup {
        &self.runs
    }

    /// Ask the server for a template scan of `scenario_url`
    pub async fn request_scan(&self, feed_url: &str, scenario_url: &str) -> Result<()> {
        self.dispatcher
            .applications()
            .create_activity(feed_url, &Activity::scan(scenario_url))
            .await
    }

    /// Ask the server for a run of `scenario_url`
    ///
    /// The run is counted in [`run_group`](Self::run_group) before the
    /// request goes out, so a waiter cannot miss it.
    pub async fn request_run(&self, feed_url: &str, scenario_url: &str) -> Result<()> {
        self.runs.add(1);
        let requested = self
            .dispatcher
            .applications()
            .create_activity(feed_url, &Activity::run(scenario_url))
            .await;
        if requested.is_err() {
            self.runs.done();
        }
        requested
    }

    /// Dispatch items until the channel closes, then drain in-flight runs
    pub async fn run(&self, mut rx: mpsc::Receiver<ActivityItem>) -> WorkerReport {
        let permits = Arc::new(Semaphore::new(self.max_parallel_runs));
        let mut in_flight: JoinSet<DispatchOutcome> = JoinSet::new();
        let mut report = WorkerReport::default();

        while let Some(item) = rx.recv().await {
            debug!("Received activity {} tagged {:?}", item.url, item.tags);

            if !item.has_tag(ActivityTag::Run) || item.has_tag(ActivityTag::Scan) {
                report.record(&self.dispatcher.dispatch(item).await);
                continue;
            }

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let dispatcher = self.dispatcher.clone();
            let done = RunDone(self.runs.clone());
            in_flight.spawn(async move {
                let _done = done;
                let outcome = dispatch_run(dispatcher, item).await;
                drop(permit);
                outcome
            });
        }

        if !in_flight.is_empty() {
            info!("Waiting for {} experiment runs", in_flight.len());
        }
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    error!("Experiment run task failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Request a scan and a run of one scenario and process them
    ///
    /// Subscribes to the feed, posts both requests, waits for the run to
    /// finish (or for `cancel` to fire) and then cancels the subscription.
    pub async fn run_scenario(
        self: Arc<Self>,
        subscription: Subscription<P>,
        cancel: CancellationToken,
        scenario_url: &str,
    ) -> Result<WorkerReport> {
        let feed_url = subscription.feed_url().to_string();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let delivery = subscription.subscribe(tx);

        let consumer = tokio::spawn({
            let worker = Arc::clone(&self);
            async move { worker.run(rx).await }
        });

        let requested = async {
            self.request_scan(&feed_url, scenario_url).await?;
            self.request_run(&feed_url, scenario_url).await
        }
        .await;

        if requested.is_ok() {
            tokio::select! {
                _ = self.runs.wait() => {}
                _ = cancel.cancelled() => {
                    warn!("Cancelled with {} runs outstanding", self.runs.pending());
                }
            }
        }
        cancel.cancel();

        if let Err(e) = delivery.await {
            error!("Activity delivery task failed: {}", e);
        }
        let report = consumer.await.unwrap_or_else(|e| {
            error!("Activity worker task failed: {}", e);
            WorkerReport::default()
        });

        requested.map(|_| report)
    }
}

/// Marks a run finished when dropped, whether or not it completed normally
struct RunDone(RunGroup);

impl Drop for RunDone {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// Dispatch a run item on a task of its own
///
/// A panicking handler takes down only that task; the item is still
/// acknowledged and reported as failed.
async fn dispatch_run<P, X>(dispatcher: ActivityDispatcher<P, X>, item: ActivityItem) -> DispatchOutcome
where
    P: ApplicationApi + ?Sized + 'static,
    X: ExperimentApi + Clone + 'static,
{
    let handler = dispatcher.clone();
    let task_item = item.clone();
    let joined = tokio::spawn(async move { handler.dispatch(task_item).await }).await;

    match joined {
        Ok(outcome) => outcome,
        Err(join_error) => {
            error!("Run of {} did not complete: {}", item.external_url, join_error);
            let acknowledged = dispatcher.acknowledge(&item).await;
            if let Err(e) = &acknowledged {
                warn!("{}", e);
            }
            DispatchOutcome {
                item_url: item.url,
                handled: Err(OptimizeError::Other(format!("run task failed: {}", join_error))),
                acknowledged: Some(acknowledged),
            }
        }
    }
}

/// Query for the activity a worker handles
pub fn worker_query(batch_size: usize) -> ActivityFeedQuery {
    let mut query = ActivityFeedQuery::default();
    query.set_type([ActivityTag::Scan, ActivityTag::Run]);
    if batch_size > 0 {
        query.limit = Some(batch_size);
    }
    query
}
