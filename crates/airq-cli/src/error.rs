use thiserror::Error;

use crate::model::ValidationError;
use crate::providers::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    User,
    Runtime,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::User,
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Runtime,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: "request cancelled".to_string(),
        }
    }

    pub fn runtime_with_trace(message: impl Into<String>, trace: &[String]) -> Self {
        let message = message.into();
        if trace.is_empty() {
            return Self::runtime(message);
        }
        Self::runtime(format!("{message} ({})", trace.join("; ")))
    }

    pub fn exit_code(&self) -> i32 {
        match self.kind {
            ErrorKind::User => 2,
            ErrorKind::Runtime => 1,
            ErrorKind::Cancelled => 130,
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(error: ValidationError) -> Self {
        Self::user(error.to_string())
    }
}

impl From<FetchError> for AppError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Cancelled => Self::cancelled(),
            FetchError::Invalid(error) => error.into(),
            FetchError::Upstream { source, trace } => {
                Self::runtime_with_trace(source.to_string(), &trace)
            }
        }
    }
}

/// Failure of a whole fetch. Per-source failures are absorbed by the fallback
/// chain and only surface here when a fetch cannot continue.
#[derive(Debug, Error, PartialEq)]
pub enum FetchError {
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("primary source failed: {source}")]
    Upstream {
        source: ProviderError,
        trace: Vec<String>,
    },
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_mapping_user_runtime_and_cancelled_are_stable() {
        assert_eq!(AppError::user("x").exit_code(), 2);
        assert_eq!(AppError::runtime("x").exit_code(), 1);
        assert_eq!(AppError::cancelled().exit_code(), 130);
    }

    #[test]
    fn runtime_with_trace_appends_source_reasons() {
        let error = AppError::runtime_with_trace(
            "all sources failed",
            &["openaq: timeout".to_string(), "nasa_tempo: 503".to_string()],
        );
        assert_eq!(error.kind, ErrorKind::Runtime);
        assert_eq!(
            error.message,
            "all sources failed (openaq: timeout; nasa_tempo: 503)"
        );
        assert_eq!(AppError::runtime_with_trace("x", &[]).message, "x");
    }

    #[test]
    fn fetch_error_maps_to_app_error_kinds() {
        assert_eq!(
            AppError::from(FetchError::Cancelled).kind,
            ErrorKind::Cancelled
        );
        assert_eq!(
            AppError::from(FetchError::Invalid(ValidationError::EmptyPlace)).kind,
            ErrorKind::User
        );

        let upstream = AppError::from(FetchError::Upstream {
            source: ProviderError::Transport("openaq: connection reset".to_string()),
            trace: vec!["openaq: transport error: connection reset".to_string()],
        });
        assert_eq!(upstream.kind, ErrorKind::Runtime);
        assert!(upstream.message.contains("connection reset"));
    }
}
