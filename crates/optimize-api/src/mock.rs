//! In-memory Optimize server for tests
//!
//! [`MockOptimize`] implements both [`ApplicationApi`] and [`ExperimentApi`]
//! over shared state, hands out the same kind of hypermedia links the real
//! server does and records every mutating call so tests can assert on them.
//! Clones share state.

use crate::applications::{
    Activity, ActivityFeed, ActivityFeedQuery, ActivityItem, ActivityTag, Application,
    ApplicationApi, ApplicationItem, ApplicationList, ApplicationListQuery, ApplicationName,
    Scenario, ScenarioItem, ScenarioName, Template,
};
use crate::experiments::{
    Experiment, ExperimentApi, ExperimentItem, ExperimentLabels, ExperimentList,
    ExperimentListQuery, ExperimentName, TrialAssignments, TrialValues,
};
use async_trait::async_trait;
use optimize_core::{ApiError, ErrorType, Metadata, OptimizeError, Relation, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

const APPLICATIONS: &str = "/v2/applications/";
const EXPERIMENTS: &str = "/v1/experiments/";
const ACTIVITY: &str = "/v2/activity/";

/// Address the mock pretends to live at
pub const MOCK_ADDRESS: &str = "https://optimize.test";

#[derive(Debug, Default)]
struct MockState {
    applications: BTreeMap<String, Application>,
    scenarios: BTreeMap<String, (Scenario, String)>,
    templates: BTreeMap<String, Template>,
    experiments: Vec<(String, ExperimentItem)>,
    activity: Vec<ActivityItem>,
    activity_seq: usize,
    trial_seq: usize,
    page_size: Option<usize>,
    next_trials: VecDeque<std::result::Result<TrialAssignments, ApiError>>,
    failures: HashMap<String, ApiError>,
    calls: Vec<String>,
    created_experiments: Vec<(ExperimentName, Experiment)>,
    created_trials: Vec<(String, TrialAssignments)>,
    reported_trials: Vec<(String, TrialValues)>,
    updated_templates: Vec<(String, Template)>,
    created_activity: Vec<Activity>,
    deleted_activity: Vec<String>,
}

/// Shared in-memory server state plus the experiments endpoint in scope
#[derive(Debug, Clone)]
pub struct MockOptimize {
    state: Arc<Mutex<MockState>>,
    endpoint: String,
}

impl Default for MockOptimize {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOptimize {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            endpoint: EXPERIMENTS.to_string(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a call and fail it if a failure was injected for `op`
    fn call(&self, op: &str, target: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("{} {}", op, target));
        match state.failures.get(op) {
            Some(err) => Err(err.clone().into()),
            None => Ok(()),
        }
    }

    /// Make every subsequent `op` call (e.g. `"report_trial"`) fail
    pub fn fail_on(&self, op: &str, error_type: ErrorType) -> &Self {
        self.state()
            .failures
            .insert(op.to_string(), ApiError::new(error_type, "injected failure"));
        self
    }

    /// Limit list responses to `page_size` items per page
    pub fn set_page_size(&self, page_size: usize) -> &Self {
        self.state().page_size = Some(page_size);
        self
    }

    /// Add an application, returning its URL
    pub fn add_application(&self, name: &str) -> String {
        let url = format!("{}{}", APPLICATIONS, name);
        let application = Application {
            name: ApplicationName::from(name),
            display_name: name.to_string(),
            ..Default::default()
        };
        self.state().applications.insert(url.clone(), application);
        url
    }

    /// Set a label on an existing application
    pub fn label_application(&self, name: &str, key: &str, value: &str) -> &Self {
        let url = format!("{}{}", APPLICATIONS, name);
        if let Some(application) = self.state().applications.get_mut(&url) {
            application.labels.insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Add a scenario (and its template) to an application, returning its URL
    pub fn add_scenario(&self, application: &str, name: &str, template: Template) -> String {
        let app_url = format!("{}{}", APPLICATIONS, application);
        let url = format!("{}/scenarios/{}", app_url, name);
        let scenario = Scenario {
            name: ScenarioName::from(name),
            display_name: name.to_string(),
            ..Default::default()
        };

        let mut state = self.state();
        state.scenarios.insert(url.clone(), (scenario, app_url));
        state.templates.insert(format!("{}/template", url), template);
        url
    }

    /// Add an experiment under the default endpoint, returning its URL
    pub fn add_experiment(&self, name: &str, experiment: Experiment) -> String {
        let url = format!("{}{}", EXPERIMENTS, name);
        let item = experiment_item(&url, ExperimentName::from(name), experiment);
        self.state().experiments.push((url.clone(), item));
        url
    }

    /// Put an item on the activity feed, returning its URL
    pub fn push_activity(&self, tags: &[ActivityTag], external_url: &str) -> String {
        let mut state = self.state();
        state.activity_seq += 1;
        let id = state.activity_seq.to_string();
        let url = format!("{}{}", ACTIVITY, id);
        state.activity.push(ActivityItem {
            id: id.clone(),
            url: url.clone(),
            external_url: external_url.to_string(),
            title: format!("Activity {}", id),
            tags: tags.iter().map(|t| t.as_str().to_string()).collect(),
            date_published: None,
        });
        url
    }

    /// Queue the assignments returned by the next `next_trial` call
    ///
    /// Once the queue is empty, `next_trial` reports the experiment stopped.
    pub fn push_trial(&self, assignments: TrialAssignments) -> &Self {
        self.state().next_trials.push_back(Ok(assignments));
        self
    }

    /// Queue an error for the next `next_trial` call
    pub fn push_trial_error(&self, error_type: ErrorType) -> &Self {
        self.state()
            .next_trials
            .push_back(Err(ApiError::new(error_type, "scripted")));
        self
    }

    pub fn feed_url(&self) -> &'static str {
        ACTIVITY
    }

    /// Every call made so far, as `"<operation> <target>"`
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn created_experiments(&self) -> Vec<(ExperimentName, Experiment)> {
        self.state().created_experiments.clone()
    }

    pub fn created_trials(&self) -> Vec<(String, TrialAssignments)> {
        self.state().created_trials.clone()
    }

    pub fn reported_trials(&self) -> Vec<(String, TrialValues)> {
        self.state().reported_trials.clone()
    }

    pub fn updated_templates(&self) -> Vec<(String, Template)> {
        self.state().updated_templates.clone()
    }

    pub fn created_activity(&self) -> Vec<Activity> {
        self.state().created_activity.clone()
    }

    pub fn deleted_activity(&self) -> Vec<String> {
        self.state().deleted_activity.clone()
    }

    /// Items still waiting on the feed
    pub fn pending_activity(&self) -> Vec<ActivityItem> {
        self.state().activity.clone()
    }
}

/// Reduce an absolute URL on the mock address to its path
fn path(url: &str) -> &str {
    url.strip_prefix(MOCK_ADDRESS).unwrap_or(url)
}

fn not_found(error_type: ErrorType, url: &str) -> OptimizeError {
    ApiError::new(error_type, format!("{} not found", url)).into()
}

/// Offset encoded in a continuation link
fn offset(continuation: Option<&String>) -> usize {
    continuation
        .and_then(|c| c.split("offset=").nth(1))
        .and_then(|o| o.split('&').next())
        .and_then(|o| o.parse().ok())
        .unwrap_or(0)
}

/// Slice out one page, returning the `next` link if more remain
fn page<T: Clone>(
    all: &[T],
    base: &str,
    offset: usize,
    limit: Option<usize>,
) -> (Vec<T>, Option<String>) {
    let start = offset.min(all.len());
    let end = match limit {
        Some(limit) if limit > 0 => (start + limit).min(all.len()),
        _ => all.len(),
    };
    let next = (end < all.len()).then(|| format!("{}?offset={}", base, end));
    (all[start..end].to_vec(), next)
}

fn experiment_item(url: &str, name: ExperimentName, experiment: Experiment) -> ExperimentItem {
    let metadata = Metadata::new()
        .with_location(url)
        .with_link(Relation::SelfLink, url)
        .with_link(Relation::Labels, format!("{}/labels", url))
        .with_link(Relation::Trials, format!("{}/trials/", url))
        .with_link(Relation::NextTrial, format!("{}/trials/next", url));
    ExperimentItem {
        name,
        experiment,
        metadata,
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|requirement| match requirement.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
            None => labels.contains_key(requirement),
        })
}

#[async_trait]
impl ApplicationApi for MockOptimize {
    async fn check_endpoint(&self) -> Result<Metadata> {
        self.call("check_endpoint", APPLICATIONS)?;
        Ok(Metadata::new()
            .with_link(Relation::SelfLink, APPLICATIONS)
            .with_link(Relation::Alternate, ACTIVITY))
    }

    async fn list_applications(&self, query: &ApplicationListQuery) -> Result<ApplicationList> {
        self.call("list_applications", APPLICATIONS)?;
        let state = self.state();

        let all: Vec<ApplicationItem> = state
            .applications
            .iter()
            .filter(|(_, application)| {
                query
                    .label_selector
                    .as_deref()
                    .map_or(true, |s| matches_selector(&application.labels, s))
            })
            .map(|(url, application)| ApplicationItem {
                application: application.clone(),
                metadata: Metadata::new()
                    .with_link(Relation::SelfLink, url)
                    .with_link(Relation::Scenarios, format!("{}/scenarios/", url)),
            })
            .collect();
        let limit = query.limit.or(state.page_size);
        let (items, next) = page(&all, APPLICATIONS, offset(query.continuation.as_ref()), limit);

        let mut metadata = Metadata::new();
        if let Some(next) = next {
            metadata = metadata.with_link(Relation::Next, next);
        }
        Ok(ApplicationList {
            items,
            total_count: all.len(),
            metadata,
        })
    }

    async fn get_application(&self, url: &str) -> Result<ApplicationItem> {
        self.call("get_application", url)?;
        let url = path(url);
        let state = self.state();
        let application = state
            .applications
            .get(url)
            .cloned()
            .ok_or_else(|| not_found(ErrorType::ApplicationNotFound, url))?;
        Ok(ApplicationItem {
            application,
            metadata: Metadata::new()
                .with_link(Relation::SelfLink, url)
                .with_link(Relation::Scenarios, format!("{}/scenarios/", url)),
        })
    }

    async fn get_application_by_name(&self, name: &ApplicationName) -> Result<ApplicationItem> {
        self.get_application(&format!("{}{}", APPLICATIONS, name))
            .await
    }

    async fn create_application(&self, application: &Application) -> Result<Metadata> {
        let name = if application.name.is_empty() {
            application.display_name.to_lowercase().replace(' ', "-")
        } else {
            application.name.to_string()
        };
        self.upsert_application_by_name(&ApplicationName::from(name), application)
            .await
    }

    async fn upsert_application_by_name(
        &self,
        name: &ApplicationName,
        application: &Application,
    ) -> Result<Metadata> {
        let url = format!("{}{}", APPLICATIONS, name);
        self.call("upsert_application", &url)?;

        let mut application = application.clone();
        application.name = name.clone();
        let title = application.display_name.clone();
        self.state().applications.insert(url.clone(), application);

        Ok(Metadata::new()
            .with_location(url.as_str())
            .with_title(title)
            .with_link(Relation::Scenarios, format!("{}/scenarios/", url)))
    }

    async fn delete_application(&self, url: &str) -> Result<()> {
        self.call("delete_application", url)?;
        let url = path(url);
        self.state()
            .applications
            .remove(url)
            .map(|_| ())
            .ok_or_else(|| not_found(ErrorType::ApplicationNotFound, url))
    }

    async fn get_scenario(&self, url: &str) -> Result<ScenarioItem> {
        self.call("get_scenario", url)?;
        let url = path(url);
        let state = self.state();
        let (scenario, app_url) = state
            .scenarios
            .get(url)
            .cloned()
            .ok_or_else(|| not_found(ErrorType::ScenarioNotFound, url))?;
        Ok(ScenarioItem {
            scenario,
            metadata: Metadata::new()
                .with_link(Relation::SelfLink, url)
                .with_link(Relation::Up, app_url)
                .with_link(Relation::Template, format!("{}/template", url))
                .with_link(Relation::Experiments, format!("{}/experiments/", url)),
        })
    }

    async fn create_scenario(&self, url: &str, scenario: &Scenario) -> Result<Metadata> {
        self.call("create_scenario", url)?;
        let scenarios = path(url).trim_end_matches('/');
        let app_url = scenarios
            .strip_suffix("/scenarios")
            .ok_or_else(|| not_found(ErrorType::ApplicationNotFound, scenarios))?
            .to_string();
        if !self.state().applications.contains_key(&app_url) {
            return Err(not_found(ErrorType::ApplicationNotFound, &app_url));
        }

        let name = scenario.name.to_string();
        let location = format!("{}/{}", scenarios, name);
        let mut state = self.state();
        state
            .scenarios
            .insert(location.clone(), (scenario.clone(), app_url.clone()));
        state
            .templates
            .insert(format!("{}/template", location), Template::default());

        Ok(Metadata::new()
            .with_location(location.as_str())
            .with_title(scenario.display_name.as_str())
            .with_link(Relation::Up, app_url)
            .with_link(Relation::Template, format!("{}/template", location)))
    }

    async fn delete_scenario(&self, url: &str) -> Result<()> {
        self.call("delete_scenario", url)?;
        let url = path(url);
        self.state()
            .scenarios
            .remove(url)
            .map(|_| ())
            .ok_or_else(|| not_found(ErrorType::ScenarioNotFound, url))
    }

    async fn get_template(&self, url: &str) -> Result<Template> {
        self.call("get_template", url)?;
        let url = path(url);
        self.state()
            .templates
            .get(url)
            .cloned()
            .ok_or_else(|| not_found(ErrorType::ScenarioNotFound, url))
    }

    async fn update_template(&self, url: &str, template: &Template) -> Result<()> {
        self.call("update_template", url)?;
        let url = path(url).to_string();
        let mut state = self.state();
        state.templates.insert(url.clone(), template.clone());
        state.updated_templates.push((url, template.clone()));
        Ok(())
    }

    async fn list_activity(&self, url: &str, query: &ActivityFeedQuery) -> Result<ActivityFeed> {
        self.call("list_activity", url)?;
        let state = self.state();

        let all: Vec<ActivityItem> = state
            .activity
            .iter()
            .filter(|item| query.matches(item))
            .cloned()
            .collect();
        let limit = query.limit.or(state.page_size);
        let (items, next_url) = page(&all, ACTIVITY, offset(query.continuation.as_ref()), limit);

        Ok(ActivityFeed {
            title: "Activity".to_string(),
            items,
            next_url,
        })
    }

    async fn create_activity(&self, url: &str, activity: &Activity) -> Result<()> {
        self.call("create_activity", url)?;
        self.state().created_activity.push(activity.clone());

        if let Some(scan) = &activity.scan {
            self.push_activity(&[ActivityTag::Scan], &scan.scenario);
        }
        if let Some(run) = &activity.run {
            self.push_activity(&[ActivityTag::Run], &run.scenario);
        }
        Ok(())
    }

    async fn delete_activity(&self, url: &str) -> Result<()> {
        self.call("delete_activity", url)?;
        let url = path(url);
        let mut state = self.state();
        let before = state.activity.len();
        state.activity.retain(|item| item.url != url);
        if state.activity.len() == before {
            return Err(not_found(
                ErrorType::Unexpected("activity-not-found".to_string()),
                url,
            ));
        }
        state.deleted_activity.push(url.to_string());
        Ok(())
    }
}

#[async_trait]
impl ExperimentApi for MockOptimize {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn with_endpoint(&self, endpoint: &str) -> Result<Self> {
        let mut endpoint = path(endpoint).to_string();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        Ok(Self {
            state: Arc::clone(&self.state),
            endpoint,
        })
    }

    async fn list_experiments(&self, query: &ExperimentListQuery) -> Result<ExperimentList> {
        self.call("list_experiments", &self.endpoint)?;
        let state = self.state();

        let all: Vec<ExperimentItem> = state
            .experiments
            .iter()
            .filter(|(url, _)| url.starts_with(&self.endpoint))
            .filter(|(_, item)| {
                query
                    .label_selector
                    .as_deref()
                    .map_or(true, |s| matches_selector(&item.experiment.labels, s))
            })
            .map(|(_, item)| item.clone())
            .collect();
        let limit = query.limit.or(state.page_size);
        let (items, next) = page(&all, &self.endpoint, offset(query.continuation.as_ref()), limit);

        let mut metadata = Metadata::new();
        if let Some(next) = next {
            metadata = metadata.with_link(Relation::Next, next);
        }
        Ok(ExperimentList {
            items,
            total_count: all.len(),
            metadata,
        })
    }

    async fn get_experiment(&self, url: &str) -> Result<ExperimentItem> {
        self.call("get_experiment", url)?;
        let url = path(url);
        self.state()
            .experiments
            .iter()
            .find(|(u, _)| u == url)
            .map(|(_, item)| item.clone())
            .ok_or_else(|| not_found(ErrorType::ExperimentNotFound, url))
    }

    async fn get_experiment_by_name(&self, name: &ExperimentName) -> Result<ExperimentItem> {
        self.get_experiment(&format!("{}{}", self.endpoint, name))
            .await
    }

    async fn create_experiment_by_name(
        &self,
        name: &ExperimentName,
        experiment: &Experiment,
    ) -> Result<ExperimentItem> {
        if name.is_empty() || name.as_str().contains('/') {
            return Err(ApiError::new(ErrorType::ExperimentNameInvalid, name.to_string()).into());
        }
        let url = format!("{}{}", self.endpoint, name);
        self.call("create_experiment", &url)?;

        let item = experiment_item(&url, name.clone(), experiment.clone());
        let mut state = self.state();
        state.experiments.retain(|(u, _)| *u != url);
        state.experiments.push((url, item.clone()));
        state
            .created_experiments
            .push((name.clone(), experiment.clone()));
        Ok(item)
    }

    async fn delete_experiment(&self, url: &str) -> Result<()> {
        self.call("delete_experiment", url)?;
        let url = path(url);
        let mut state = self.state();
        let before = state.experiments.len();
        state.experiments.retain(|(u, _)| u != url);
        if state.experiments.len() == before {
            return Err(not_found(ErrorType::ExperimentNotFound, url));
        }
        Ok(())
    }

    async fn label_experiment(&self, url: &str, labels: &ExperimentLabels) -> Result<()> {
        self.call("label_experiment", url)?;
        let experiment_url = path(url).trim_end_matches("/labels");
        let mut state = self.state();
        let (_, item) = state
            .experiments
            .iter_mut()
            .find(|(u, _)| u == experiment_url)
            .ok_or_else(|| not_found(ErrorType::ExperimentNotFound, experiment_url))?;
        for (key, value) in &labels.labels {
            if value.is_empty() {
                item.experiment.labels.remove(key);
            } else {
                item.experiment.labels.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn create_trial(&self, url: &str, assignments: &TrialAssignments) -> Result<Metadata> {
        self.call("create_trial", url)?;
        let url = path(url).to_string();
        let mut state = self.state();
        state.trial_seq += 1;
        let location = format!("{}/{}", url.trim_end_matches('/'), state.trial_seq);
        state.created_trials.push((url, assignments.clone()));
        Ok(Metadata::new().with_location(location))
    }

    async fn next_trial(&self, url: &str) -> Result<TrialAssignments> {
        self.call("next_trial", url)?;
        let url = path(url);
        let mut state = self.state();
        match state.next_trials.pop_front() {
            Some(Ok(mut assignments)) => {
                state.trial_seq += 1;
                let trials = url.trim_end_matches("/next");
                assignments.metadata =
                    Metadata::new().with_location(format!("{}/{}", trials, state.trial_seq));
                Ok(assignments)
            }
            Some(Err(err)) => Err(err.into()),
            None => Err(ApiError::new(ErrorType::ExperimentStopped, "no more trials").into()),
        }
    }

    async fn report_trial(&self, url: &str, values: &TrialValues) -> Result<()> {
        self.call("report_trial", url)?;
        self.state()
            .reported_trials
            .push((path(url).to_string(), values.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scenario_links_lead_back_to_application() {
        let mock = MockOptimize::new();
        let app_url = mock.add_application("shop");
        let scn_url = mock.add_scenario("shop", "black-friday", Template::default());

        let scenario = mock.get_scenario(&scn_url).await.unwrap();
        assert_eq!(scenario.link(Relation::Up), Some(app_url.as_str()));

        let app = mock
            .get_application(scenario.link(Relation::Up).unwrap())
            .await
            .unwrap();
        assert_eq!(app.application.name.as_str(), "shop");

        let template_url = scenario.link(Relation::Template).unwrap();
        assert!(mock.get_template(template_url).await.is_ok());
    }

    #[tokio::test]
    async fn test_absolute_urls_are_accepted() {
        let mock = MockOptimize::new();
        mock.add_application("shop");
        let url = format!("{}{}shop", MOCK_ADDRESS, APPLICATIONS);
        assert!(mock.get_application(&url).await.is_ok());
    }

    #[tokio::test]
    async fn test_next_trial_stops_when_script_is_exhausted() {
        let mock = MockOptimize::new();
        mock.push_trial(TrialAssignments::default());

        let ta = mock.next_trial("/v1/experiments/e/trials/next").await.unwrap();
        assert_eq!(ta.location(), Some("/v1/experiments/e/trials/1"));

        let err = mock
            .next_trial("/v1/experiments/e/trials/next")
            .await
            .unwrap_err();
        assert!(err.is_experiment_stopped());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let mock = MockOptimize::new();
        mock.fail_on("report_trial", ErrorType::TrialAlreadyReported);
        let err = mock
            .report_trial("/v1/experiments/e/trials/1", &TrialValues::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), Some(&ErrorType::TrialAlreadyReported));
        assert!(mock.reported_trials().is_empty());
    }

    #[test]
    fn test_paging() {
        let all = vec![1, 2, 3, 4, 5];
        let (items, next) = page(&all, "/x/", 0, Some(2));
        assert_eq!(items, vec![1, 2]);
        assert_eq!(next.as_deref(), Some("/x/?offset=2"));

        let (items, next) = page(&all, "/x/", offset(next.as_ref()), Some(2));
        assert_eq!(items, vec![3, 4]);

        let (items, next) = page(&all, "/x/", 4, Some(2));
        assert_eq!(items, vec![5]);
        assert_eq!(next, None);
    }

    #[test]
    fn test_selector() {
        let mut labels = BTreeMap::new();
        labels.insert("application".to_string(), "shop".to_string());
        labels.insert("scenario".to_string(), "s1".to_string());
        assert!(matches_selector(&labels, "application=shop"));
        assert!(matches_selector(&labels, "application=shop,scenario=s1"));
        assert!(!matches_selector(&labels, "application=other"));
        assert!(matches_selector(&labels, "scenario"));
        assert!(matches_selector(&labels, ""));
    }
}
