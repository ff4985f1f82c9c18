use shipflow_core::{Classify, ErrorKind};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid deploy configuration: {0}")]
    InvalidConfig(String),

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} was modified concurrently")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("application {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error(
        "deployment {namespace}/{name} not ready after {timeout:?} ({ready}/{desired} replicas ready)"
    )]
    NotReady {
        namespace: String,
        name: String,
        ready: i32,
        desired: i32,
        timeout: Duration,
    },

    #[error("failed to delete {failed:?} (deleted: {deleted:?})")]
    PartialDelete {
        deleted: Vec<String>,
        failed: Vec<String>,
    },

    #[error("failed to delete {0:?}")]
    DeleteFailed(Vec<String>),

    #[error("cluster API error: {0}")]
    Cluster(#[from] kube::Error),

    #[error("cluster is not available: {0}")]
    Unavailable(String),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("failed to render manifests: {0}")]
    Render(#[from] serde_yaml::Error),

    #[error("deployment cancelled")]
    Cancelled,
}

impl Classify for DeployError {
    fn kind(&self) -> ErrorKind {
        match self {
            DeployError::InvalidConfig(_) | DeployError::Manifest(_) => ErrorKind::Validation,
            DeployError::Render(_) => ErrorKind::Io,
            DeployError::AlreadyExists { .. }
            | DeployError::Conflict { .. }
            | DeployError::DeleteFailed(_)
            | DeployError::Cluster(_)
            | DeployError::Unavailable(_) => ErrorKind::Cluster,
            DeployError::NotFound { .. } => ErrorKind::NotFound,
            DeployError::NotReady { .. } => ErrorKind::Timeout,
            DeployError::PartialDelete { .. } => ErrorKind::PartialFailure,
            DeployError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;
