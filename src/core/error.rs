use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TauError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("{message}")]
    ConfigurationError { message: String, hints: Vec<String> },
    #[error("{message}")]
    TrialError { message: String, hints: Vec<String> },
    #[error("A record in table '{entity}' with '{attribute}' = {value} already exists")]
    RecordConflict {
        entity: String,
        attribute: String,
        value: String,
    },
    #[error("Invalid record data: {0}")]
    ModelError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    IncompatibleRecordError(String),
    #[error("{0}")]
    ImmutableRecordError(String),
    #[error("{0}")]
    ProjectSelectionError(String),
    #[error("{0}")]
    ExperimentSelectionError(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl TauError {
    pub fn configuration<S: Into<String>>(message: S, hints: &[&str]) -> Self {
        TauError::ConfigurationError {
            message: message.into(),
            hints: hints.iter().map(|h| h.to_string()).collect(),
        }
    }

    pub fn trial<S: Into<String>>(message: S, hints: &[&str]) -> Self {
        TauError::TrialError {
            message: message.into(),
            hints: hints.iter().map(|h| h.to_string()).collect(),
        }
    }

    /// Remediation hints shown below the message.
    pub fn hints(&self) -> &[String] {
        match self {
            TauError::ConfigurationError { hints, .. } | TauError::TrialError { hints, .. } => hints,
            _ => &[],
        }
    }

    /// User-correctable errors, as opposed to selection problems or defects.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TauError::ConfigurationError { .. } | TauError::TrialError { .. } | TauError::ModelError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_carries_hints() {
        let err = TauError::configuration("Cannot write to 'x'", &["Check that you have `write` access."]);
        assert_eq!(err.to_string(), "Cannot write to 'x'");
        assert_eq!(err.hints(), ["Check that you have `write` access.".to_string()]);
        assert!(err.is_configuration());
    }

    #[test]
    fn selection_errors_are_not_configuration_errors() {
        let err = TauError::ProjectSelectionError("No project selected".into());
        assert!(!err.is_configuration());
        assert!(err.hints().is_empty());
    }
}
