//! Applications, scenarios, templates and the activity feed

mod activity;
mod api;
mod lister;

pub use activity::{
    Activity, ActivityFeed, ActivityFeedQuery, ActivityItem, ActivityTag, RunActivity,
    ScanActivity, Subscription, DEFAULT_POLL_INTERVAL,
};
pub use api::{ApplicationApi, HttpApplicationApi};
pub use lister::ApplicationLister;

use crate::experiments::{Bounds, NumberOrString};
use optimize_core::{ApiError, ErrorType, Metadata, OptimizeError, Relation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

resource_name! {
    /// Name of an application, also used as its path segment
    ApplicationName
}

resource_name! {
    /// Name of a scenario within an application
    ScenarioName
}

pub(crate) fn invalid_name(error_type: ErrorType, name: &str) -> OptimizeError {
    ApiError::new(error_type, format!("invalid name {:?}", name)).into()
}

/// Kubernetes selection of the resources that make up an application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesResource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(rename = "namespaceSelector", default, skip_serializing_if = "String::is_empty")]
    pub namespace_selector: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selector: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub kubernetes: KubernetesResource,
}

/// An application definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Application {
    #[serde(default, skip_serializing_if = "ApplicationName::is_empty")]
    pub name: ApplicationName,
    #[serde(rename = "title", default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
}

/// An application as returned by the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationItem {
    #[serde(flatten)]
    pub application: Application,
    #[serde(rename = "_metadata", default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl ApplicationItem {
    pub fn link(&self, relation: Relation) -> Option<&str> {
        self.metadata.link(relation)
    }
}

/// One page of applications
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationList {
    #[serde(default)]
    pub items: Vec<ApplicationItem>,
    #[serde(rename = "totalCount", default)]
    pub total_count: usize,
    #[serde(skip)]
    pub metadata: Metadata,
}

/// Query for listing applications
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationListQuery {
    /// Page size, `None` for the server default
    pub limit: Option<usize>,
    /// Label selector, e.g. `team=checkout`
    pub label_selector: Option<String>,
    /// Continuation link from a previous page
    pub continuation: Option<String>,
}

impl ApplicationListQuery {
    pub fn set_label_selector(&mut self, selector: impl Into<String>) {
        let selector = selector.into();
        self.label_selector = (!selector.is_empty()).then_some(selector);
    }
}

/// A way of exercising an application
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default, skip_serializing_if = "ScenarioName::is_empty")]
    pub name: ScenarioName,
    #[serde(rename = "title", default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configuration: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objective: Vec<serde_json::Value>,
}

/// A scenario as returned by the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioItem {
    #[serde(flatten)]
    pub scenario: Scenario,
    #[serde(rename = "_metadata", default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl ScenarioItem {
    pub fn link(&self, relation: Relation) -> Option<&str> {
        self.metadata.link(relation)
    }
}

/// A parameter discovered by scanning the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateParameter {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<NumberOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// A metric the scenario can measure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMetric {
    pub name: String,
    #[serde(default)]
    pub minimize: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimize: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
}

/// The experiment template of a scenario
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
    #[serde(default)]
    pub metrics: Vec<TemplateMetric>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_item_wire_format() {
        let item: ApplicationItem = serde_json::from_str(
            r#"{"name": "shop", "title": "Shop", "resources": [{"kubernetes": {"namespace": "default"}}],
                "_metadata": {"Link": ["</v2/applications/shop>; rel=self"]}}"#,
        )
        .unwrap();

        assert_eq!(item.application.name.as_str(), "shop");
        assert_eq!(item.application.display_name, "Shop");
        assert_eq!(item.application.resources[0].kubernetes.namespace, "default");
        assert_eq!(item.link(Relation::SelfLink), Some("/v2/applications/shop"));
    }

    #[test]
    fn test_empty_fields_are_omitted() {
        let app = Application {
            display_name: "Shop".to_string(),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&app).unwrap(),
            r#"{"title":"Shop"}"#
        );
    }

    #[test]
    fn test_template_wire_format() {
        let template: Template = serde_json::from_str(
            r#"{"parameters": [{"name": "cpu", "type": "int", "baseline": 500, "bounds": {"min": 100, "max": 2000}},
                               {"name": "gc", "type": "categorical", "baseline": "G1", "values": ["G1", "ZGC"]}],
                "metrics": [{"name": "p95", "minimize": true}]}"#,
        )
        .unwrap();

        assert_eq!(template.parameters.len(), 2);
        assert_eq!(
            template.parameters[0].baseline.as_ref().and_then(NumberOrString::as_f64),
            Some(500.0)
        );
        assert_eq!(template.parameters[1].values, vec!["G1", "ZGC"]);
        assert!(template.metrics[0].minimize);
    }
}
