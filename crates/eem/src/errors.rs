//! 💀 Errors: the taxonomy of things going sideways.
//!
//! Three layers, three enums:
//! - [`ClusterError`]: Elasticsearch said no (or said nothing at all).
//! - [`StoreError`]: the definition store said no.
//! - [`EntityManagerError`]: what callers of the entity client actually match on.
//!
//! "Resource absent" is NOT in here. A 404 on a lookup is a perfectly normal
//! answer meaning `installed: false`, and the backends turn it into `None`
//! before it ever gets the chance to become an error. 🦆

use thiserror::Error;

/// 📡 Failures talking to the cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// 🔒 The cluster understood us perfectly and refused anyway.
    #[error("security_exception during {operation}: {reason}")]
    Security { operation: String, reason: String },
    #[error("elasticsearch answered {status} to {operation}: {body}")]
    Response {
        operation: String,
        status: u16,
        body: String,
    },
    #[error("could not reach elasticsearch during {operation}")]
    Transport {
        operation: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response shape from {operation}: {detail}")]
    Decode { operation: String, detail: String },
}

impl ClusterError {
    pub fn is_security(&self) -> bool {
        matches!(self, ClusterError::Security { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::Response { status: 404, .. })
    }

    /// 🔍 Classifies a non-2xx response body the way the ES client libraries do:
    /// by peeking at `error.type`.
    pub(crate) fn from_response(operation: impl Into<String>, status: u16, body: String) -> Self {
        let operation = operation.into();
        let parsed = serde_json::from_str::<serde_json::Value>(&body).ok();
        let error_type = parsed
            .as_ref()
            .and_then(|value| value.pointer("/error/type"))
            .and_then(serde_json::Value::as_str);
        if error_type == Some("security_exception") {
            let reason = parsed
                .as_ref()
                .and_then(|value| value.pointer("/error/reason"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or("permission denied")
                .to_string();
            return ClusterError::Security { operation, reason };
        }
        ClusterError::Response {
            operation,
            status,
            body,
        }
    }
}

/// 🗄️ Failures of the definition store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity definition [{0}] already exists")]
    AlreadyExists(String),
    #[error("entity definition [{0}] does not exist")]
    NotFound(String),
    /// 🏁 Somebody else wrote first. Re-read and try again, or give up gracefully.
    #[error("entity definition [{id}] was modified concurrently (expected {expected}, found {actual})")]
    VersionConflict {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("definition store backend failed")]
    Cluster(#[from] ClusterError),
    #[error("stored entity definition could not be decoded: {0}")]
    Decode(String),
}

/// 🎯 What the entity client hands back to its callers.
#[derive(Debug, Error)]
pub enum EntityManagerError {
    #[error("Unable to find entity definition with [{0}]")]
    NotFound(String),
    #[error("Entity definition with [{0}] already exists")]
    IdConflict(String),
    #[error("Entity definition [{0}] has changes in progress")]
    UpdateConflict(String),
    #[error("Security exception while managing entity definition [{definition_id}]: {reason}")]
    SecurityException {
        definition_id: String,
        reason: String,
    },
    #[error("Invalid entity definition: {0}")]
    InvalidDefinition(String),
    #[error("Cannot install entity definition [{definition_id}]")]
    Install {
        definition_id: String,
        #[source]
        source: ClusterError,
    },
    /// 🚦 Some transforms moved, some did not. `failed` lists the stragglers.
    #[error("Transforms of entity definition [{definition_id}] did not all {action}: {failed:?}")]
    TransformControl {
        definition_id: String,
        action: &'static str,
        failed: Vec<String>,
    },
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Store(StoreError),
}

impl EntityManagerError {
    /// 🏷️ Attaches the definition id to a cluster failure, lifting security errors
    /// into their own variant so callers can answer 403 instead of 500.
    pub(crate) fn install(definition_id: &str, source: ClusterError) -> Self {
        match source {
            ClusterError::Security { reason, .. } => EntityManagerError::SecurityException {
                definition_id: definition_id.to_string(),
                reason,
            },
            source => EntityManagerError::Install {
                definition_id: definition_id.to_string(),
                source,
            },
        }
    }
}

impl From<StoreError> for EntityManagerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => EntityManagerError::NotFound(id),
            StoreError::AlreadyExists(id) => EntityManagerError::IdConflict(id),
            StoreError::VersionConflict { id, .. } => EntityManagerError::UpdateConflict(id),
            other => EntityManagerError::Store(other),
        }
    }
}

pub type Result<T, E = EntityManagerError> = std::result::Result<T, E>;
