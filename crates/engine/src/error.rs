use loanrec_core::{ApplicationId, CoreError};
use loanrec_storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("application not found: {0}")]
    ApplicationNotFound(ApplicationId),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Failure categories reported to callers of the record engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    InvalidTransition,
    ValidationError,
    StoreUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::PermissionDenied => "permission-denied",
            Self::InvalidTransition => "invalid-transition",
            Self::ValidationError => "validation-error",
            Self::StoreUnavailable => "store-unavailable",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ApplicationNotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Config(_) => ErrorKind::ValidationError,
            Self::Core(e) => core_kind(e),
            Self::Storage(e) => match e {
                StorageError::NotFound(_) => ErrorKind::NotFound,
                StorageError::PermissionDenied(_) => ErrorKind::PermissionDenied,
                StorageError::Core(e) => core_kind(e),
                StorageError::Sqlite(_)
                | StorageError::Serialization(_)
                | StorageError::Unavailable(_) => ErrorKind::StoreUnavailable,
            },
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        self.kind() == ErrorKind::PermissionDenied
    }
}

fn core_kind(e: &CoreError) -> ErrorKind {
    if e.is_invalid_transition() {
        ErrorKind::InvalidTransition
    } else {
        ErrorKind::ValidationError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_failures_map_to_kinds() {
        let cases = [
            (StorageError::NotFound("x".into()), ErrorKind::NotFound),
            (StorageError::PermissionDenied("ro".into()), ErrorKind::PermissionDenied),
            (StorageError::Unavailable("busy".into()), ErrorKind::StoreUnavailable),
        ];
        for (err, kind) in cases {
            assert_eq!(EngineError::from(err).kind(), kind);
        }
    }

    #[test]
    fn core_failures_split_transition_from_validation() {
        let transition = CoreError::InvalidTransition {
            from: "draft".into(),
            action: "assign".into(),
        };
        assert_eq!(EngineError::from(transition).kind(), ErrorKind::InvalidTransition);
        assert_eq!(
            EngineError::from(CoreError::UnknownProgram("Jumbo".into())).kind(),
            ErrorKind::ValidationError
        );
    }

    #[test]
    fn kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ErrorKind::StoreUnavailable).unwrap();
        assert_eq!(json, "\"store-unavailable\"");
    }
}
