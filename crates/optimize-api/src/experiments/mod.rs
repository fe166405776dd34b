//! Experiments and trials

mod api;
mod lister;
mod names;

pub use api::{ExperimentApi, HttpExperimentApi};
pub use lister::ExperimentLister;
pub use names::new_experiment_name;

use chrono::{DateTime, Utc};
use optimize_core::{Metadata, Relation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

resource_name! {
    /// Name of an experiment, also used as its path segment
    ExperimentName
}

/// Label marking the caller-supplied reference trial
pub const BASELINE_LABEL: &str = "baseline";

/// A parameter value, either numeric or categorical
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(serde_json::Number),
    String(String),
}

impl NumberOrString {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NumberOrString::Number(n) => n.as_f64(),
            NumberOrString::String(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for NumberOrString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumberOrString::Number(n) => write!(f, "{}", n),
            NumberOrString::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for NumberOrString {
    fn from(value: i64) -> Self {
        NumberOrString::Number(value.into())
    }
}

impl From<&str> for NumberOrString {
    fn from(value: &str) -> Self {
        NumberOrString::String(value.to_string())
    }
}

/// Numeric range of a parameter or metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: serde_json::Number,
    pub max: serde_json::Number,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParameterType {
    #[serde(rename = "int")]
    #[default]
    Integer,
    #[serde(rename = "double")]
    Double,
    #[serde(rename = "categorical")]
    Categorical,
}

/// A tunable parameter of an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// A measured outcome of an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub minimize: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimize: Option<bool>,
}

/// Server-side optimizer setting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Optimization {
    pub name: String,
    pub value: String,
}

/// Experiment definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    #[serde(rename = "displayName", default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optimization: Vec<Optimization>,
}

/// An experiment as returned by the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentItem {
    #[serde(default, skip_serializing_if = "ExperimentName::is_empty")]
    pub name: ExperimentName,
    #[serde(flatten)]
    pub experiment: Experiment,
    #[serde(rename = "_metadata", default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl ExperimentItem {
    pub fn link(&self, relation: Relation) -> Option<&str> {
        self.metadata.link(relation)
    }
}

/// One page of experiments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentList {
    #[serde(default)]
    pub items: Vec<ExperimentItem>,
    #[serde(rename = "totalCount", default)]
    pub total_count: usize,
    #[serde(skip)]
    pub metadata: Metadata,
}

/// Query for listing experiments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExperimentListQuery {
    /// Page size, `None` for the server default
    pub limit: Option<usize>,
    /// Label selector, e.g. `application=my-app`
    pub label_selector: Option<String>,
    /// Continuation link from a previous page
    pub continuation: Option<String>,
}

impl ExperimentListQuery {
    pub fn set_label_selector(&mut self, selector: impl Into<String>) {
        let selector = selector.into();
        self.label_selector = (!selector.is_empty()).then_some(selector);
    }
}

/// Label changes; an empty value removes the label
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentLabels {
    pub labels: BTreeMap<String, String>,
}

/// A single parameter assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(rename = "parameterName")]
    pub parameter_name: String,
    pub value: NumberOrString,
}

impl Assignment {
    pub fn new(parameter_name: impl Into<String>, value: impl Into<NumberOrString>) -> Self {
        Self {
            parameter_name: parameter_name.into(),
            value: value.into(),
        }
    }
}

/// Parameter values for one trial
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialAssignments {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    #[serde(skip)]
    pub metadata: Metadata,
}

impl TrialAssignments {
    /// Assignments for the reference trial, labelled `baseline=true`
    pub fn baseline(assignments: Vec<Assignment>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(BASELINE_LABEL.to_string(), "true".to_string());
        Self {
            labels,
            assignments,
            metadata: Metadata::new(),
        }
    }

    /// Where the result of this trial is reported
    pub fn location(&self) -> Option<&str> {
        self.metadata.location()
    }

    /// Look up the value assigned to a parameter
    pub fn get(&self, parameter_name: &str) -> Option<&NumberOrString> {
        self.assignments
            .iter()
            .find(|a| a.parameter_name == parameter_name)
            .map(|a| &a.value)
    }
}

/// A single observed metric value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    #[serde(rename = "metricName")]
    pub metric_name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<f64>,
}

/// Reported outcome of a trial
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialValues {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    #[serde(rename = "failureReason", default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(rename = "failureMessage", default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(rename = "completionTime", default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl TrialValues {
    /// Values for a trial that produced measurements
    pub fn succeeded(values: Vec<Value>) -> Self {
        Self {
            values,
            ..Self::default()
        }
    }

    /// Values for a trial that could not be measured
    pub fn failed(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            failed: true,
            failure_reason: Some(reason.into()),
            failure_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Record when the trial ran
    pub fn with_times(mut self, start: DateTime<Utc>, completion: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.completion_time = Some(completion);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trial_assignments_wire_format() {
        let ta: TrialAssignments = serde_json::from_str(
            r#"{"labels": {"baseline": "true"}, "assignments": [
                {"parameterName": "cpu", "value": 500},
                {"parameterName": "gc", "value": "G1"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(ta.get("cpu").and_then(NumberOrString::as_f64), Some(500.0));
        assert_eq!(ta.get("gc"), Some(&NumberOrString::from("G1")));
        assert_eq!(ta.get("memory"), None);
        assert_eq!(ta.labels.get(BASELINE_LABEL).map(String::as_str), Some("true"));
    }

    #[test]
    fn test_baseline_label() {
        let ta = TrialAssignments::baseline(vec![Assignment::new("cpu", 250)]);
        let json = serde_json::to_value(&ta).unwrap();
        assert_eq!(json["labels"]["baseline"], "true");
        assert_eq!(json["assignments"][0]["parameterName"], "cpu");
        assert_eq!(json["assignments"][0]["value"], 250);
    }

    #[test]
    fn test_failed_trial_values() {
        let values = TrialValues::failed("evaluation-failed", "exit status 1");
        let json = serde_json::to_value(&values).unwrap();
        assert_eq!(json["failed"], true);
        assert_eq!(json["failureReason"], "evaluation-failed");
        assert!(json.get("values").is_none());

        let values = TrialValues::succeeded(vec![Value {
            metric_name: "latency".to_string(),
            value: 12.5,
            error: None,
        }]);
        let json = serde_json::to_value(&values).unwrap();
        assert!(json.get("failed").is_none());
        assert_eq!(json["values"][0]["metricName"], "latency");
    }

    #[test]
    fn test_experiment_item_metadata() {
        let item: ExperimentItem = serde_json::from_str(
            r#"{"name": "01H", "displayName": "Demo", "labels": {"application": "a"},
                "parameters": [{"name": "cpu", "type": "int", "bounds": {"min": 100, "max": 4000}}],
                "metrics": [{"name": "cost", "minimize": true}],
                "_metadata": {"Link": ["</v1/experiments/01H/trials/>; rel=\"https://stormforge.io/rel/trials\""]}}"#,
        )
        .unwrap();

        assert_eq!(item.name.as_str(), "01H");
        assert_eq!(item.experiment.display_name, "Demo");
        assert_eq!(item.experiment.parameters[0].kind, ParameterType::Integer);
        assert_eq!(item.link(Relation::Trials), Some("/v1/experiments/01H/trials/"));
        assert_eq!(item.link(Relation::NextTrial), None);
    }

    #[test]
    fn test_label_selector() {
        let mut q = ExperimentListQuery::default();
        q.set_label_selector("");
        assert_eq!(q.label_selector, None);
        q.set_label_selector("scenario=s1");
        assert_eq!(q.label_selector.as_deref(), Some("scenario=s1"));
    }
}
