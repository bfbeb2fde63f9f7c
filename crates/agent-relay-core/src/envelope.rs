//! Compare-and-swap outcomes and the wire envelope built from them.

use serde::{Deserialize, Serialize};

use crate::traits::StoreError;

/// Result of a versioned write that reached the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome<T> {
    /// The write was applied; `version` is the new version.
    Applied { version: i64, value: T },
    /// The expected version was stale; carries the current stored state.
    Mismatch { version: i64, value: T },
}

impl<T> CasOutcome<T> {
    /// Version carried by either outcome.
    #[must_use]
    pub const fn version(&self) -> i64 {
        match self {
            Self::Applied { version, .. } | Self::Mismatch { version, .. } => *version,
        }
    }

    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Envelope returned to protocol and HTTP collaborators for every versioned
/// mutation: `{result: "success" | "version-mismatch" | "error", version?, value?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum UpdateEnvelope<T> {
    Success { version: i64, value: T },
    VersionMismatch { version: i64, value: T },
    Error,
}

impl<T> UpdateEnvelope<T> {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl<T> From<CasOutcome<T>> for UpdateEnvelope<T> {
    fn from(outcome: CasOutcome<T>) -> Self {
        match outcome {
            CasOutcome::Applied { version, value } => Self::Success { version, value },
            CasOutcome::Mismatch { version, value } => Self::VersionMismatch { version, value },
        }
    }
}

impl<T> From<Result<CasOutcome<T>, StoreError>> for UpdateEnvelope<T> {
    fn from(result: Result<CasOutcome<T>, StoreError>) -> Self {
        match result {
            Ok(outcome) => outcome.into(),
            Err(e) => {
                tracing::warn!(error = %e, "versioned update failed");
                Self::Error
            }
        }
    }
}
