//! End-to-end tests for the activity worker.
//!
//! The subscription, dispatcher and trial-run loop run together against the
//! in-memory server.

use optimize_api::applications::{
    ActivityTag, Subscription, Template, TemplateMetric, TemplateParameter,
};
use optimize_api::experiments::{Assignment, NumberOrString, TrialAssignments, Value};
use optimize_api::mock::MockOptimize;
use optimize_core::{ErrorType, Result};
use optimize_runner::{worker_query, ActivityDispatcher, ActivityWorker, TrialEvaluator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(20);

fn throughput(assignments: &TrialAssignments) -> Result<Vec<Value>> {
    let cpu = assignments
        .get("cpu")
        .and_then(NumberOrString::as_f64)
        .unwrap_or_default();
    Ok(vec![Value {
        metric_name: "throughput".to_string(),
        value: cpu * 2.0,
        error: None,
    }])
}

fn template() -> Template {
    Template {
        parameters: vec![TemplateParameter {
            name: "cpu".to_string(),
            kind: "int".to_string(),
            baseline: Some(NumberOrString::from(500)),
            bounds: None,
            values: Vec::new(),
        }],
        metrics: vec![TemplateMetric {
            name: "throughput".to_string(),
            minimize: false,
            optimize: None,
            bounds: None,
        }],
    }
}

fn worker(mock: &MockOptimize) -> ActivityWorker<MockOptimize, MockOptimize> {
    let evaluator: Arc<dyn TrialEvaluator> = Arc::new(throughput);
    ActivityWorker::new(ActivityDispatcher::new(
        Arc::new(mock.clone()),
        mock.clone(),
        Arc::new(template()),
        evaluator,
    ))
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn position(calls: &[String], op: &str) -> Vec<usize> {
    calls
        .iter()
        .enumerate()
        .filter(|(_, c)| c.starts_with(op))
        .map(|(i, _)| i)
        .collect()
}

#[tokio::test]
async fn test_run_activity_end_to_end() {
    let mock = MockOptimize::new();
    mock.add_application("a1");
    let scenario = mock.add_scenario("a1", "s1", template());
    mock.push_trial(TrialAssignments {
        assignments: vec![Assignment::new("cpu", 750)],
        ..Default::default()
    });
    let item_url = mock.push_activity(&[ActivityTag::Run], &scenario);

    let cancel = CancellationToken::new();
    let subscription =
        Subscription::subscribe_activity(Arc::new(mock.clone()), cancel.clone(), worker_query(0), POLL)
            .await
            .unwrap();
    let (tx, rx) = mpsc::channel(4);
    subscription.subscribe(tx);

    let worker = Arc::new(worker(&mock));
    let consumer = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(rx).await }
    });

    wait_for(|| !mock.deleted_activity().is_empty()).await;
    cancel.cancel();
    let report = timeout(Duration::from_secs(5), consumer)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.runs, 1);
    assert_eq!(report.trials, 1);
    assert_eq!(report.failed, 0);

    // Experiment created under A1/S1 with the scenario labels
    let experiments = mock.created_experiments();
    assert_eq!(experiments.len(), 1);
    assert_eq!(experiments[0].1.labels["application"], "a1");
    assert_eq!(experiments[0].1.labels["scenario"], "s1");

    // Baseline first, then exactly one reported trial
    let baseline = mock.created_trials();
    assert_eq!(baseline.len(), 1);
    assert_eq!(baseline[0].1.labels["baseline"], "true");
    assert_eq!(baseline[0].1.assignments, vec![Assignment::new("cpu", 500)]);

    let reported = mock.reported_trials();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].1.values[0].value, 1500.0);

    // Acknowledged exactly once, after the loop saw the stop signal
    assert_eq!(mock.deleted_activity(), vec![item_url]);
    let calls = mock.calls();
    let next_trials = position(&calls, "next_trial");
    let deletes = position(&calls, "delete_activity");
    assert_eq!(next_trials.len(), 2);
    assert_eq!(deletes.len(), 1);
    assert!(position(&calls, "create_trial")[0] < next_trials[0]);
    assert!(next_trials[1] < deletes[0]);
}

#[tokio::test]
async fn test_run_scenario_requests_scan_and_run() {
    let mock = MockOptimize::new();
    mock.add_application("a1");
    let scenario = mock.add_scenario("a1", "s1", Template::default());
    mock.push_trial(TrialAssignments {
        assignments: vec![Assignment::new("cpu", 600)],
        ..Default::default()
    });

    let cancel = CancellationToken::new();
    let subscription =
        Subscription::subscribe_activity(Arc::new(mock.clone()), cancel.clone(), worker_query(0), POLL)
            .await
            .unwrap();

    let worker = Arc::new(worker(&mock));
    let report = timeout(
        Duration::from_secs(10),
        worker.clone().run_scenario(subscription, cancel.clone(), &scenario),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(cancel.is_cancelled());
    assert_eq!(worker.run_group().pending(), 0);
    assert_eq!(report.scans, 1);
    assert_eq!(report.runs, 1);
    assert_eq!(report.trials, 1);

    // The scan replaced the empty template before the run read it
    assert_eq!(mock.updated_templates().len(), 1);
    assert_eq!(mock.created_experiments()[0].1.parameters.len(), 1);

    assert_eq!(mock.created_activity().len(), 2);
    assert_eq!(mock.deleted_activity().len(), 2);
    assert!(mock.pending_activity().is_empty());
}

#[tokio::test]
async fn test_failed_runs_do_not_stop_the_worker() {
    let mock = MockOptimize::new();
    mock.add_application("a1");
    let scenario = mock.add_scenario("a1", "s1", template());
    mock.push_activity(&[ActivityTag::Run], "/v2/applications/a1/scenarios/missing");
    mock.push_activity(&[ActivityTag::Scan], &scenario);

    let (tx, rx) = mpsc::channel(4);
    for item in mock.pending_activity() {
        tx.send(item).await.unwrap();
    }
    drop(tx);

    let report = worker(&mock).with_max_parallel_runs(2).run(rx).await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.scans, 1);
    assert_eq!(report.unacknowledged, 0);
    assert!(mock.pending_activity().is_empty());
}

#[tokio::test]
async fn test_run_scenario_returns_when_cancelled_before_run_arrives() {
    let mock = MockOptimize::new();
    mock.add_application("a1");
    let scenario = mock.add_scenario("a1", "s1", template());

    let cancel = CancellationToken::new();
    let subscription =
        Subscription::subscribe_activity(Arc::new(mock.clone()), cancel.clone(), worker_query(0), POLL)
            .await
            .unwrap();

    // The feed goes away, so the requested run is never delivered
    mock.fail_on("list_activity", ErrorType::Unauthorized);
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        }
    });

    let worker = Arc::new(worker(&mock));
    let report = timeout(
        Duration::from_secs(3),
        worker.clone().run_scenario(subscription, cancel.clone(), &scenario),
    )
    .await
    .expect("run_scenario did not return after cancellation")
    .unwrap();

    assert_eq!(report.runs, 0);
    assert_eq!(worker.run_group().pending(), 1);
    assert_eq!(mock.created_activity().len(), 2);
}

fn crash(_: &TrialAssignments) -> Result<Vec<Value>> {
    panic!("evaluator crashed")
}

#[tokio::test]
async fn test_panicking_run_is_acknowledged_and_released() {
    let mock = MockOptimize::new();
    mock.add_application("a1");
    let scenario = mock.add_scenario("a1", "s1", template());
    mock.push_trial(TrialAssignments {
        assignments: vec![Assignment::new("cpu", 750)],
        ..Default::default()
    });

    let cancel = CancellationToken::new();
    let subscription =
        Subscription::subscribe_activity(Arc::new(mock.clone()), cancel.clone(), worker_query(0), POLL)
            .await
            .unwrap();

    let evaluator: Arc<dyn TrialEvaluator> = Arc::new(crash);
    let worker = Arc::new(ActivityWorker::new(ActivityDispatcher::new(
        Arc::new(mock.clone()),
        mock.clone(),
        Arc::new(template()),
        evaluator,
    )));

    let report = timeout(
        Duration::from_secs(10),
        worker.clone().run_scenario(subscription, cancel.clone(), &scenario),
    )
    .await
    .expect("run_scenario hung after a panicking run")
    .unwrap();

    assert_eq!(worker.run_group().pending(), 0);
    assert_eq!(report.scans, 1);
    assert_eq!(report.runs, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(report.unacknowledged, 0);
    assert_eq!(mock.deleted_activity().len(), 2);
    assert!(mock.pending_activity().is_empty());
}
