// ⚠️ Error kinds
// Only CorruptRegistry is fatal; the rest are counted and the run continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Raw record has neither a usable name nor a coordinate pair
    #[error("malformed record from {source_tag}: {reason}")]
    MalformedSource { source_tag: String, reason: String },

    /// Cluster members carry contradictory high-confidence identity signals
    #[error("ambiguous merge for {park_id}: {reason}")]
    AmbiguousMerge { park_id: String, reason: String },

    /// External collaborator failed; the record stays unenriched
    #[error("{step} unavailable: {reason}")]
    EnrichmentUnavailable { step: String, reason: String },

    /// Lower-precedence write against a field set by a higher-precedence source
    #[error("regression rejected on {park_id}.{field}: {attempted} < {current}")]
    RegressionRejected {
        park_id: String,
        field: String,
        attempted: String,
        current: String,
    },

    /// Persisted registry cannot be trusted; halt instead of overwriting it
    #[error("corrupt registry at row {row}: {reason}")]
    CorruptRegistry { row: usize, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl RegistryError {
    pub fn unavailable(step: &str, reason: impl Into<String>) -> Self {
        RegistryError::EnrichmentUnavailable {
            step: step.to_string(),
            reason: reason.into(),
        }
    }

    pub fn corrupt(row: usize, reason: impl Into<String>) -> Self {
        RegistryError::CorruptRegistry {
            row,
            reason: reason.into(),
        }
    }

    /// Errors that must stop the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RegistryError::CorruptRegistry { .. }
                | RegistryError::Io(_)
                | RegistryError::Csv(_)
                | RegistryError::Sqlite(_)
        )
    }

    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::EnrichmentUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_storage_errors_are_fatal() {
        assert!(RegistryError::corrupt(3, "missing provenance").is_fatal());
        assert!(!RegistryError::unavailable("parcel_area", "timeout").is_fatal());
        assert!(!RegistryError::MalformedSource {
            source_tag: "map_feature".into(),
            reason: "no name".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_unavailable_is_transient() {
        assert!(RegistryError::unavailable("address", "HTTP 429").is_transient());
        assert!(!RegistryError::corrupt(0, "bad header").is_transient());
    }
}
