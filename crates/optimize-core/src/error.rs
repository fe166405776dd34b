//! Unified error types for Optimize

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Typed error categories reported by the Optimize API
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// The experiment will not produce any more trials
    ExperimentStopped,
    ExperimentNotFound,
    ExperimentNameInvalid,
    ApplicationNotFound,
    ScenarioNotFound,
    TrialNotFound,
    /// No trial is ready yet, try again after the advertised delay
    TrialUnavailable,
    TrialAlreadyReported,
    Unauthorized,
    /// Anything the client does not recognize
    Unexpected(String),
}

impl ErrorType {
    /// Get the wire name of this error type
    pub fn as_str(&self) -> &str {
        match self {
            ErrorType::ExperimentStopped => "experiment-stopped",
            ErrorType::ExperimentNotFound => "experiment-not-found",
            ErrorType::ExperimentNameInvalid => "experiment-name-invalid",
            ErrorType::ApplicationNotFound => "application-not-found",
            ErrorType::ScenarioNotFound => "scenario-not-found",
            ErrorType::TrialNotFound => "trial-not-found",
            ErrorType::TrialUnavailable => "trial-unavailable",
            ErrorType::TrialAlreadyReported => "trial-already-reported",
            ErrorType::Unauthorized => "unauthorized",
            ErrorType::Unexpected(other) => other,
        }
    }

    /// Check if this type describes a missing resource
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ErrorType::ExperimentNotFound
                | ErrorType::ApplicationNotFound
                | ErrorType::ScenarioNotFound
                | ErrorType::TrialNotFound
        )
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ErrorType {
    fn from(s: &str) -> Self {
        match s {
            "experiment-stopped" => ErrorType::ExperimentStopped,
            "experiment-not-found" => ErrorType::ExperimentNotFound,
            "experiment-name-invalid" => ErrorType::ExperimentNameInvalid,
            "application-not-found" => ErrorType::ApplicationNotFound,
            "scenario-not-found" => ErrorType::ScenarioNotFound,
            "trial-not-found" => ErrorType::TrialNotFound,
            "trial-unavailable" => ErrorType::TrialUnavailable,
            "trial-already-reported" => ErrorType::TrialAlreadyReported,
            "unauthorized" => ErrorType::Unauthorized,
            other => ErrorType::Unexpected(other.to_string()),
        }
    }
}

impl Serialize for ErrorType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(ErrorType::from(value.as_str()))
    }
}

/// An error returned by the Optimize API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub error_type: ErrorType,
    pub message: String,
    /// Delay requested by the server before the call is retried
    pub retry_after: Option<Duration>,
    /// Location associated with the failure, if any
    pub location: Option<String>,
}

impl ApiError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            retry_after: None,
            location: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.error_type)
        } else {
            write!(f, "{}: {}", self.error_type, self.message)
        }
    }
}

impl std::error::Error for ApiError {}

/// Unified error type for all Optimize operations
#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("malformed response, {0}")]
    MalformedResponse(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("failed to acknowledge activity {url}: {reason}")]
    Acknowledgement { url: String, reason: String },

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl OptimizeError {
    /// Error for a required link relation that is absent from a response
    pub fn missing_link(relation: impl fmt::Display) -> Self {
        OptimizeError::MalformedResponse(format!("missing {} link", relation))
    }

    /// Get the API error type, if this is an API error
    pub fn error_type(&self) -> Option<&ErrorType> {
        match self {
            OptimizeError::Api(err) => Some(&err.error_type),
            _ => None,
        }
    }

    /// Check if this error reports a missing resource
    pub fn is_not_found(&self) -> bool {
        self.error_type().is_some_and(ErrorType::is_not_found)
    }

    /// Check if this error is the "no more trials" signal
    pub fn is_experiment_stopped(&self) -> bool {
        matches!(self.error_type(), Some(ErrorType::ExperimentStopped))
    }
}

/// Result type alias using OptimizeError
pub type Result<T> = std::result::Result<T, OptimizeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_wire_names() {
        for name in [
            "experiment-stopped",
            "experiment-not-found",
            "application-not-found",
            "trial-unavailable",
        ] {
            assert_eq!(ErrorType::from(name).as_str(), name);
        }
        assert_eq!(
            ErrorType::from("quota-exceeded"),
            ErrorType::Unexpected("quota-exceeded".to_string())
        );
    }

    #[test]
    fn test_experiment_stopped_is_typed() {
        let stopped: OptimizeError = ApiError::new(ErrorType::ExperimentStopped, "").into();
        assert!(stopped.is_experiment_stopped());
        assert!(!stopped.is_not_found());

        // The message alone never makes an error a stop signal
        let lookalike = OptimizeError::Transport("experiment-stopped".to_string());
        assert!(!lookalike.is_experiment_stopped());
    }

    #[test]
    fn test_not_found_detection() {
        let err: OptimizeError = ApiError::new(ErrorType::ApplicationNotFound, "nope").into();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "API error: application-not-found: nope");

        let err = OptimizeError::missing_link("self");
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "malformed response, missing self link");
    }

    #[test]
    fn test_error_type_serde() {
        let json = serde_json::to_string(&ErrorType::TrialUnavailable).unwrap();
        assert_eq!(json, "\"trial-unavailable\"");
        let parsed: ErrorType = serde_json::from_str("\"experiment-stopped\"").unwrap();
        assert_eq!(parsed, ErrorType::ExperimentStopped);
    }
}
