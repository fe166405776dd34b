//! Trial evaluation

use async_trait::async_trait;
use optimize_api::experiments::{TrialAssignments, Value};
use optimize_core::{OptimizeError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Measures the metrics of one trial
#[async_trait]
pub trait TrialEvaluator: Send + Sync {
    async fn evaluate(&self, assignments: &TrialAssignments) -> Result<Vec<Value>>;
}

#[async_trait]
impl<F> TrialEvaluator for F
where
    F: Fn(&TrialAssignments) -> Result<Vec<Value>> + Send + Sync,
{
    async fn evaluate(&self, assignments: &TrialAssignments) -> Result<Vec<Value>> {
        self(assignments)
    }
}

/// Evaluates trials by running an external program
///
/// The trial assignments are written to the program's stdin as JSON and a
/// JSON object of metric values (`{"latency": 12.5}`) is read back from its
/// stdout. A non-zero exit status fails the evaluation.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandEvaluator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    /// Split a whitespace separated command line into program and arguments
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| OptimizeError::Config("empty evaluation command".to_string()))?;
        Ok(Self::new(program, words.collect()))
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl TrialEvaluator for CommandEvaluator {
    #[instrument(skip(self, assignments), fields(program = %self.program))]
    async fn evaluate(&self, assignments: &TrialAssignments) -> Result<Vec<Value>> {
        let input = serde_json::to_vec(assignments)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            OptimizeError::Evaluation(format!("Failed to run {}: {}", self.program, e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&input).await {
                Ok(()) => {}
                // The program may not care about its input
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("{} closed stdin early", self.program);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OptimizeError::Evaluation(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!("Evaluation output: {}", stdout.trim());
        let metrics: BTreeMap<String, f64> = serde_json::from_str(stdout.trim()).map_err(|e| {
            OptimizeError::Evaluation(format!("invalid metrics from {}: {}", self.program, e))
        })?;

        Ok(metrics
            .into_iter()
            .map(|(metric_name, value)| Value {
                metric_name,
                value,
                error: None,
            })
            .collect())
    }
}
