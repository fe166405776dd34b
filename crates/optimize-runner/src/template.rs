//! Scenario templates and the experiments built from them

use async_trait::async_trait;
use optimize_api::applications::{ApplicationItem, ScenarioItem, Template, TemplateParameter};
use optimize_api::experiments::{Assignment, Experiment, Metric, Parameter, ParameterType};
use optimize_core::{OptimizeError, Result};
use std::path::PathBuf;
use tracing::debug;

/// Label carrying the application an experiment belongs to
pub const APPLICATION_LABEL: &str = "application";
/// Label carrying the scenario an experiment belongs to
pub const SCENARIO_LABEL: &str = "scenario";

/// Produces the template pushed to a scenario when a scan is requested
#[async_trait]
pub trait TemplateGenerator: Send + Sync {
    async fn generate(
        &self,
        application: &ApplicationItem,
        scenario: &ScenarioItem,
    ) -> Result<Template>;
}

/// A fixed template
#[async_trait]
impl TemplateGenerator for Template {
    async fn generate(&self, _: &ApplicationItem, _: &ScenarioItem) -> Result<Template> {
        Ok(self.clone())
    }
}

/// Reads the template from a JSON file on every scan
#[derive(Debug, Clone)]
pub struct FileTemplateGenerator {
    path: PathBuf,
}

impl FileTemplateGenerator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TemplateGenerator for FileTemplateGenerator {
    async fn generate(
        &self,
        application: &ApplicationItem,
        scenario: &ScenarioItem,
    ) -> Result<Template> {
        debug!(
            "Generating template for {}/{} from {:?}",
            application.application.name, scenario.scenario.name, self.path
        );
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            OptimizeError::Config(format!("Failed to read template {:?}: {}", self.path, e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn parameter_type(parameter: &TemplateParameter) -> ParameterType {
    match parameter.kind.as_str() {
        "int" | "integer" => ParameterType::Integer,
        "double" | "float" => ParameterType::Double,
        "categorical" => ParameterType::Categorical,
        _ if !parameter.values.is_empty() => ParameterType::Categorical,
        _ => ParameterType::Integer,
    }
}

/// Build the experiment definition for a run of `scenario`
pub fn experiment_from_template(
    template: &Template,
    application: &ApplicationItem,
    scenario: &ScenarioItem,
) -> Experiment {
    let application_name = application.application.name.to_string();
    let scenario_name = scenario.scenario.name.to_string();

    let mut experiment = Experiment {
        display_name: if scenario.scenario.display_name.is_empty() {
            scenario_name.clone()
        } else {
            scenario.scenario.display_name.clone()
        },
        ..Default::default()
    };
    experiment
        .labels
        .insert(APPLICATION_LABEL.to_string(), application_name);
    experiment
        .labels
        .insert(SCENARIO_LABEL.to_string(), scenario_name);

    experiment.parameters = template
        .parameters
        .iter()
        .map(|p| Parameter {
            name: p.name.clone(),
            kind: parameter_type(p),
            bounds: p.bounds.clone(),
            values: p.values.clone(),
        })
        .collect();

    experiment.metrics = template
        .metrics
        .iter()
        .map(|m| Metric {
            name: m.name.clone(),
            minimize: m.minimize,
            optimize: m.optimize,
        })
        .collect();

    experiment
}

/// Baseline assignments taken from the template; parameters without a
/// baseline value are left out
pub fn baseline_assignments(template: &Template) -> Vec<Assignment> {
    template
        .parameters
        .iter()
        .filter_map(|p| {
            p.baseline
                .as_ref()
                .map(|value| Assignment::new(p.name.clone(), value.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use optimize_api::applications::{Application, Scenario, TemplateMetric};
    use optimize_api::experiments::{Bounds, NumberOrString};

    fn template() -> Template {
        Template {
            parameters: vec![
                TemplateParameter {
                    name: "cpu".to_string(),
                    kind: "int".to_string(),
                    baseline: Some(NumberOrString::from(500)),
                    bounds: Some(Bounds {
                        min: 100.into(),
                        max: 2000.into(),
                    }),
                    values: Vec::new(),
                },
                TemplateParameter {
                    name: "gc".to_string(),
                    kind: String::new(),
                    baseline: None,
                    bounds: None,
                    values: vec!["G1".to_string(), "ZGC".to_string()],
                },
            ],
            metrics: vec![TemplateMetric {
                name: "p95".to_string(),
                minimize: true,
                optimize: None,
                bounds: None,
            }],
        }
    }

    fn items() -> (ApplicationItem, ScenarioItem) {
        let application = ApplicationItem {
            application: Application {
                name: "shop".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let scenario = ScenarioItem {
            scenario: Scenario {
                name: "black-friday".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        (application, scenario)
    }

    #[test]
    fn test_experiment_from_template() {
        let (application, scenario) = items();
        let experiment = experiment_from_template(&template(), &application, &scenario);

        assert_eq!(experiment.display_name, "black-friday");
        assert_eq!(experiment.labels[APPLICATION_LABEL], "shop");
        assert_eq!(experiment.labels[SCENARIO_LABEL], "black-friday");
        assert_eq!(experiment.parameters[0].kind, ParameterType::Integer);
        assert!(experiment.parameters[0].bounds.is_some());
        assert_eq!(experiment.parameters[1].kind, ParameterType::Categorical);
        assert!(experiment.metrics[0].minimize);
    }

    #[test]
    fn test_baseline_skips_parameters_without_value() {
        let baseline = baseline_assignments(&template());
        assert_eq!(baseline, vec![Assignment::new("cpu", 500)]);
    }

    #[tokio::test]
    async fn test_file_template_generator() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.json");
        std::fs::write(&path, serde_json::to_string(&template()).unwrap()).unwrap();

        let (application, scenario) = items();
        let generated = FileTemplateGenerator::new(&path)
            .generate(&application, &scenario)
            .await
            .unwrap();
        assert_eq!(generated, template());

        let missing = FileTemplateGenerator::new(dir.path().join("missing.json"))
            .generate(&application, &scenario)
            .await;
        assert!(missing.is_err());
    }
}
