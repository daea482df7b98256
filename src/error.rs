//! Error taxonomy for the indexing and retrieval pipeline.
//!
//! Every failure that crosses a pipeline boundary is an [`IndexError`].
//! Failed responses carry an [`ErrorInfo`] payload built from the error,
//! the pipeline stage, and the lapse time recorded up to the failure point.

use serde::Serialize;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("file read failed: {0}")]
    FileReadError(String),

    #[error("embedding failed: {0}")]
    EmbeddingError(String),

    #[error("store write failed: {0}")]
    StoreWriteError(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("query must not be empty")]
    EmptyQuery,

    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl IndexError {
    /// Stable taxonomy name, used as `error_info.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            IndexError::MalformedMetadata(_) => "MalformedMetadata",
            IndexError::FileReadError(_) => "FileReadError",
            IndexError::EmbeddingError(_) => "EmbeddingError",
            IndexError::StoreWriteError(_) => "StoreWriteError",
            IndexError::StoreUnavailable(_) => "StoreUnavailable",
            IndexError::NotFound { .. } => "NotFound",
            IndexError::EmptyQuery => "EmptyQuery",
            IndexError::Cancelled(_) => "Cancelled",
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        IndexError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Build the structured payload attached to failed responses.
    pub fn info(&self, stage: &str, lapse_ms: f64) -> ErrorInfo {
        ErrorInfo {
            stage: stage.to_string(),
            kind: self.kind().to_string(),
            message: self.to_string(),
            lapse_ms,
        }
    }
}

impl From<sqlx::Error> for IndexError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => IndexError::StoreUnavailable(e.to_string()),
            other => IndexError::StoreWriteError(other.to_string()),
        }
    }
}

/// Structured diagnosis payload (`file_error_info` in responses).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorInfo {
    pub stage: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub lapse_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_taxonomy() {
        assert_eq!(IndexError::EmptyQuery.kind(), "EmptyQuery");
        assert_eq!(
            IndexError::not_found("chunk", "abc").kind(),
            "NotFound"
        );
        assert_eq!(
            IndexError::MalformedMetadata("x".into()).kind(),
            "MalformedMetadata"
        );
    }

    #[test]
    fn info_carries_stage_and_lapse() {
        let info = IndexError::StoreWriteError("duplicate".into()).info("doc-indexing", 12.5);
        assert_eq!(info.stage, "doc-indexing");
        assert_eq!(info.kind, "StoreWriteError");
        assert!(info.message.contains("duplicate"));
        assert_eq!(info.lapse_ms, 12.5);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], "StoreWriteError");
    }

    #[test]
    fn pool_timeout_maps_to_unavailable() {
        let err: IndexError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, IndexError::StoreUnavailable(_)));
        let err: IndexError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, IndexError::StoreWriteError(_)));
    }
}
