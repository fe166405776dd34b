//! Applications API

use super::{
    invalid_name, Activity, ActivityFeed, ActivityFeedQuery, Application, ApplicationItem,
    ApplicationList, ApplicationListQuery, ApplicationName, Scenario, ScenarioItem, Template,
};
use crate::client::ApiClient;
use async_trait::async_trait;
use optimize_core::{ErrorType, Metadata, Relation, Result};
use reqwest::Url;
use tracing::{debug, instrument};

const APPLICATIONS_ENDPOINT: &str = "/v2/applications/";

/// Operations on applications, their scenarios and the activity feed
#[async_trait]
pub trait ApplicationApi: Send + Sync {
    /// Probe the applications collection; the returned links describe
    /// where related endpoints (e.g. the activity feed) live
    async fn check_endpoint(&self) -> Result<Metadata>;

    async fn list_applications(&self, query: &ApplicationListQuery) -> Result<ApplicationList>;

    async fn get_application(&self, url: &str) -> Result<ApplicationItem>;

    async fn get_application_by_name(&self, name: &ApplicationName) -> Result<ApplicationItem>;

    async fn create_application(&self, application: &Application) -> Result<Metadata>;

    async fn upsert_application_by_name(
        &self,
        name: &ApplicationName,
        application: &Application,
    ) -> Result<Metadata>;

    async fn delete_application(&self, url: &str) -> Result<()>;

    async fn get_scenario(&self, url: &str) -> Result<ScenarioItem>;

    async fn create_scenario(&self, url: &str, scenario: &Scenario) -> Result<Metadata>;

    async fn delete_scenario(&self, url: &str) -> Result<()>;

    async fn get_template(&self, url: &str) -> Result<Template>;

    async fn update_template(&self, url: &str, template: &Template) -> Result<()>;

    /// Fetch one page of the activity feed at `url`
    async fn list_activity(&self, url: &str, query: &ActivityFeedQuery) -> Result<ActivityFeed>;

    /// Request a scan or run through the activity feed at `url`
    async fn create_activity(&self, url: &str, activity: &Activity) -> Result<()>;

    /// Acknowledge an activity item so it is not delivered again
    async fn delete_activity(&self, url: &str) -> Result<()>;
}

/// HTTP implementation of [`ApplicationApi`]
#[derive(Debug, Clone)]
pub struct HttpApplicationApi {
    client: ApiClient,
    endpoint: Url,
}

impl HttpApplicationApi {
    pub fn new(client: ApiClient) -> Result<Self> {
        let endpoint = client.resolve(APPLICATIONS_ENDPOINT)?;
        Ok(Self { client, endpoint })
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    fn named_url(&self, name: &ApplicationName) -> Result<Url> {
        if name.is_empty() || name.as_str().contains('/') {
            return Err(invalid_name(
                ErrorType::Unexpected("application-name-invalid".to_string()),
                name.as_str(),
            ));
        }
        self.client.resolve(&format!("{}{}", self.endpoint.path(), name))
    }

    fn list_url(&self, query: &ApplicationListQuery) -> Result<Url> {
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

    fn feed_url(&self, url: &str, query: &ActivityFeedQuery) -> Result<Url> {
        if let Some(next) = &query.continuation {
            return self.client.resolve(next);
        }

        let mut url = self.client.resolve(url)?;
        {
            let mut pairs = url.query_pairs_mut();
            if !query.tags.is_empty() {
                let tags: Vec<&str> = query.tags.iter().map(|t| t.as_str()).collect();
                pairs.append_pair("type", &tags.join(","));
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }
}

#[async_trait]
impl ApplicationApi for HttpApplicationApi {
    #[instrument(skip(self))]
    async fn check_endpoint(&self) -> Result<Metadata> {
        self.client
            .head(self.endpoint.as_str(), ErrorType::ApplicationNotFound)
            .await
    }

    async fn list_applications(&self, query: &ApplicationListQuery) -> Result<ApplicationList> {
        let url = self.list_url(query)?;
        let (mut list, metadata): (ApplicationList, _) = self
            .client
            .get(url.as_str(), ErrorType::ApplicationNotFound)
            .await?;
        list.metadata = metadata;
        Ok(list)
    }

    async fn get_application(&self, url: &str) -> Result<ApplicationItem> {
        let (mut item, metadata): (ApplicationItem, _) =
            self.client.get(url, ErrorType::ApplicationNotFound).await?;
        if item.metadata.is_empty() {
            item.metadata = metadata;
        }
        Ok(item)
    }

    async fn get_application_by_name(&self, name: &ApplicationName) -> Result<ApplicationItem> {
        let url = self.named_url(name)?;
        let mut item = self.get_application(url.as_str()).await?;
        if item.application.name.is_empty() {
            item.application.name = name.clone();
        }
        Ok(item)
    }

    #[instrument(skip(self, application))]
    async fn create_application(&self, application: &Application) -> Result<Metadata> {
        let response = self
            .client
            .post(self.endpoint.as_str(), application, ErrorType::ApplicationNotFound)
            .await?;
        Ok(response.metadata)
    }

    #[instrument(skip(self, application))]
    async fn upsert_application_by_name(
        &self,
        name: &ApplicationName,
        application: &Application,
    ) -> Result<Metadata> {
        let url = self.named_url(name)?;
        let response = self
            .client
            .put(url.as_str(), application, ErrorType::ApplicationNotFound)
            .await?;
        Ok(response.metadata)
    }

    async fn delete_application(&self, url: &str) -> Result<()> {
        self.client.delete(url, ErrorType::ApplicationNotFound).await
    }

    async fn get_scenario(&self, url: &str) -> Result<ScenarioItem> {
        let (mut item, metadata): (ScenarioItem, _) =
            self.client.get(url, ErrorType::ScenarioNotFound).await?;
        if item.metadata.is_empty() {
            item.metadata = metadata;
        }
        Ok(item)
    }

    async fn create_scenario(&self, url: &str, scenario: &Scenario) -> Result<Metadata> {
        let response = self
            .client
            .post(url, scenario, ErrorType::ApplicationNotFound)
            .await?;
        Ok(response.metadata)
    }

    async fn delete_scenario(&self, url: &str) -> Result<()> {
        self.client.delete(url, ErrorType::ScenarioNotFound).await
    }

    async fn get_template(&self, url: &str) -> Result<Template> {
        let (template, _) = self.client.get(url, ErrorType::ScenarioNotFound).await?;
        Ok(template)
    }

    #[instrument(skip(self, template))]
    async fn update_template(&self, url: &str, template: &Template) -> Result<()> {
        self.client
            .put(url, template, ErrorType::ScenarioNotFound)
            .await?;
        Ok(())
    }

    async fn list_activity(&self, url: &str, query: &ActivityFeedQuery) -> Result<ActivityFeed> {
        let url = self.feed_url(url, query)?;
        debug!("Fetching activity from {}", url);
        let (mut feed, metadata): (ActivityFeed, _) = self
            .client
            .get(url.as_str(), ErrorType::Unexpected("activity-feed-not-found".to_string()))
            .await?;
        if feed.next_url.is_none() {
            feed.next_url = metadata.link(Relation::Next).map(str::to_string);
        }
        Ok(feed)
    }

    async fn create_activity(&self, url: &str, activity: &Activity) -> Result<()> {
        self.client
            .post(url, activity, ErrorType::ScenarioNotFound)
            .await?;
        Ok(())
    }

    async fn delete_activity(&self, url: &str) -> Result<()> {
        self.client
            .delete(url, ErrorType::Unexpected("activity-not-found".to_string()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applications::ActivityTag;

    fn api() -> HttpApplicationApi {
        HttpApplicationApi::new(ApiClient::new("https://api.example.com/", None).unwrap()).unwrap()
    }

    #[test]
    fn test_named_url() {
        let url = api().named_url(&ApplicationName::from("shop")).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v2/applications/shop");
        assert!(api().named_url(&ApplicationName::from("a/b")).is_err());
    }

    #[test]
    fn test_list_url() {
        let api = api();
        assert_eq!(
            api.list_url(&ApplicationListQuery::default()).unwrap().as_str(),
            "https://api.example.com/v2/applications/"
        );
        let mut q = ApplicationListQuery {
            limit: Some(5),
            ..Default::default()
        };
        assert_eq!(
            api.list_url(&q).unwrap().as_str(),
            "https://api.example.com/v2/applications/?limit=5"
        );

        q.set_label_selector("team=checkout");
        assert_eq!(
            api.list_url(&q).unwrap().as_str(),
            "https://api.example.com/v2/applications/?limit=5&selector=team%3Dcheckout"
        );

        q.set_label_selector("");
        assert_eq!(q.label_selector, None);
    }

    #[test]
    fn test_feed_url_carries_tags() {
        let mut q = ActivityFeedQuery::default();
        q.set_type([ActivityTag::Scan, ActivityTag::Run]);
        let url = api().feed_url("/v2/activity/", &q).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v2/activity/?type=scan%2Crun"
        );

        let url = api()
            .feed_url("/v2/activity/", &ActivityFeedQuery::default())
            .unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v2/activity/");
    }
}
