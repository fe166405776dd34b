//! Experiments API

use super::{
    ExperimentItem, ExperimentLabels, ExperimentList, ExperimentListQuery, ExperimentName,
    TrialAssignments, TrialValues,
};
use crate::client::{retry_delay, ApiClient};
use async_trait::async_trait;
use optimize_core::{ErrorType, Metadata, OptimizeError, Result};
use reqwest::{Method, StatusCode, Url};
use std::time::Duration;
use tracing::{debug, instrument};

const EXPERIMENTS_ENDPOINT: &str = "/v1/experiments/";
const DEFAULT_TRIAL_WAIT: Duration = Duration::from_secs(5);

/// Operations on experiments and their trials
///
/// Every operation except the by-name ones takes a URL discovered from a
/// previously fetched resource.
#[async_trait]
pub trait ExperimentApi: Send + Sync {
    /// Collection endpoint this API is scoped to
    fn endpoint(&self) -> &str;

    /// Scope a copy of this API to another collection endpoint, e.g. a
    /// scenario's `experiments` link
    fn with_endpoint(&self, endpoint: &str) -> Result<Self>
    where
        Self: Sized;

    async fn list_experiments(&self, query: &ExperimentListQuery) -> Result<ExperimentList>;

    async fn get_experiment(&self, url: &str) -> Result<ExperimentItem>;

    async fn get_experiment_by_name(&self, name: &ExperimentName) -> Result<ExperimentItem>;

    /// Create (or replace) the experiment stored under `name`
    async fn create_experiment_by_name(
        &self,
        name: &ExperimentName,
        experiment: &super::Experiment,
    ) -> Result<ExperimentItem>;

    async fn delete_experiment(&self, url: &str) -> Result<()>;

    async fn label_experiment(&self, url: &str, labels: &ExperimentLabels) -> Result<()>;

    /// Create a trial with explicit assignments (e.g. the baseline)
    async fn create_trial(&self, url: &str, assignments: &TrialAssignments) -> Result<Metadata>;

    /// Ask the server for the next trial to evaluate
    ///
    /// Fails with an `experiment-stopped` error once no more trials will be
    /// produced.
    async fn next_trial(&self, url: &str) -> Result<TrialAssignments>;

    /// Report the outcome of a trial at its location
    async fn report_trial(&self, url: &str, values: &TrialValues) -> Result<()>;
}

/// HTTP implementation of [`ExperimentApi`]
#[derive(Debug, Clone)]
pub struct HttpExperimentApi {
    client: ApiClient,
    endpoint: Url,
}

impl HttpExperimentApi {
    /// Create an API bound to the default `/v1/experiments/` endpoint
    pub fn new(client: ApiClient) -> Result<Self> {
        let endpoint = client.resolve(EXPERIMENTS_ENDPOINT)?;
        Ok(Self { client, endpoint })
    }

    fn named_url(&self, name: &ExperimentName) -> Result<Url> {
        if name.is_empty() || name.as_str().contains('/') {
            return Err(
                crate::applications::invalid_name(ErrorType::ExperimentNameInvalid, name.as_str()),
            );
        }
        self.endpoint
            .join(name.as_str())
            .map_err(|e| OptimizeError::Other(format!("invalid experiment name {}: {}", name, e)))
    }

    fn list_url(&self, query: &ExperimentListQuery) -> Result<Url> {
        if let Some(next) = &query.continuation {
            return self.client.resolve(next);
        }

        let mut url = self.endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
            if let Some(selector) = &query.label_selector {
                pairs.append_pair("selector", selector);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }
}

#[async_trait]
impl ExperimentApi for HttpExperimentApi {
    fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    fn with_endpoint(&self, endpoint: &str) -> Result<Self> {
        let mut endpoint = self.client.resolve(endpoint)?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        Ok(Self {
            client: self.client.clone(),
            endpoint,
        })
    }

    async fn list_experiments(&self, query: &ExperimentListQuery) -> Result<ExperimentList> {
        let url = self.list_url(query)?;
        let (mut list, metadata): (ExperimentList, _) = self
            .client
            .get(url.as_str(), ErrorType::ExperimentNotFound)
            .await?;
        list.metadata = metadata;
        Ok(list)
    }

    async fn get_experiment(&self, url: &str) -> Result<ExperimentItem> {
        let (mut item, metadata): (ExperimentItem, _) =
            self.client.get(url, ErrorType::ExperimentNotFound).await?;
        if item.metadata.is_empty() {
            item.metadata = metadata;
        }
        Ok(item)
    }

    async fn get_experiment_by_name(&self, name: &ExperimentName) -> Result<ExperimentItem> {
        let url = self.named_url(name)?;
        let mut item = self.get_experiment(url.as_str()).await?;
        if item.name.is_empty() {
            item.name = name.clone();
        }
        Ok(item)
    }

    #[instrument(skip(self, experiment))]
    async fn create_experiment_by_name(
        &self,
        name: &ExperimentName,
        experiment: &super::Experiment,
    ) -> Result<ExperimentItem> {
        let url = self.named_url(name)?;
        let response = self
            .client
            .put(url.as_str(), experiment, ErrorType::ExperimentNotFound)
            .await?;

        let mut item: ExperimentItem = if response.body.trim().is_empty() {
            ExperimentItem {
                experiment: experiment.clone(),
                ..ExperimentItem::default()
            }
        } else {
            response.json()?
        };
        if item.name.is_empty() {
            item.name = name.clone();
        }
        if item.metadata.is_empty() {
            item.metadata = response.metadata;
        }
        Ok(item)
    }

    async fn delete_experiment(&self, url: &str) -> Result<()> {
        self.client.delete(url, ErrorType::ExperimentNotFound).await
    }

    async fn label_experiment(&self, url: &str, labels: &ExperimentLabels) -> Result<()> {
        self.client
            .post(url, labels, ErrorType::ExperimentNotFound)
            .await?;
        Ok(())
    }

    async fn create_trial(&self, url: &str, assignments: &TrialAssignments) -> Result<Metadata> {
        let response = self
            .client
            .post(url, assignments, ErrorType::ExperimentNotFound)
            .await?;
        Ok(response.metadata)
    }

    #[instrument(skip(self))]
    async fn next_trial(&self, url: &str) -> Result<TrialAssignments> {
        let url = self.client.resolve(url)?;

        // Waiting for a trial to become available is part of the transport;
        // the server decides when (and whether) the wait ends.
        loop {
            let response = self.client.send(Method::GET, url.clone(), None).await?;

            match response.status {
                StatusCode::OK => {
                    let mut assignments: TrialAssignments = response.json()?;
                    assignments.metadata = response.metadata;
                    return Ok(assignments);
                }
                StatusCode::GONE => {
                    let mut err = response.api_error(ErrorType::ExperimentNotFound);
                    if matches!(err.error_type, ErrorType::Unexpected(_)) {
                        err.error_type = ErrorType::ExperimentStopped;
                    }
                    return Err(err.into());
                }
                _ => {
                    let err = response.api_error(ErrorType::ExperimentNotFound);
                    if err.error_type != ErrorType::TrialUnavailable {
                        return Err(err.into());
                    }
                    let wait = retry_delay(err.retry_after, DEFAULT_TRIAL_WAIT);
                    debug!("Trial unavailable, waiting {:?}", wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    async fn report_trial(&self, url: &str, values: &TrialValues) -> Result<()> {
        self.client.post(url, values, ErrorType::TrialNotFound).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> HttpExperimentApi {
        HttpExperimentApi::new(ApiClient::new("https://api.example.com/", None).unwrap()).unwrap()
    }

    #[test]
    fn test_default_endpoint() {
        assert_eq!(api().endpoint(), "https://api.example.com/v1/experiments/");
    }

    #[test]
    fn test_scoped_endpoint_gets_trailing_slash() {
        let scoped = api()
            .with_endpoint("/v2/applications/a/scenarios/s/experiments")
            .unwrap();
        assert_eq!(
            scoped.endpoint(),
            "https://api.example.com/v2/applications/a/scenarios/s/experiments/"
        );
        let url = scoped.named_url(&ExperimentName::from("01ABC")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v2/applications/a/scenarios/s/experiments/01ABC"
        );
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(api().named_url(&ExperimentName::from("")).is_err());
        let err = api().named_url(&ExperimentName::from("a/b")).unwrap_err();
        assert_eq!(err.error_type(), Some(&ErrorType::ExperimentNameInvalid));
    }

    #[test]
    fn test_list_url() {
        let api = api();
        let mut q = ExperimentListQuery {
            limit: Some(10),
            ..Default::default()
        };
        q.set_label_selector("application=a");
        assert_eq!(
            api.list_url(&q).unwrap().as_str(),
            "https://api.example.com/v1/experiments/?limit=10&selector=application%3Da"
        );

        assert_eq!(
            api.list_url(&ExperimentListQuery::default()).unwrap().as_str(),
            "https://api.example.com/v1/experiments/"
        );

        q.continuation = Some("/v1/experiments/?offset=10".to_string());
        assert_eq!(
            api.list_url(&q).unwrap().as_str(),
            "https://api.example.com/v1/experiments/?offset=10"
        );
    }
}
