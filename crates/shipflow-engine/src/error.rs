use shipflow_build::BuildError;
use shipflow_core::{Classify, ErrorKind, Failure};
use shipflow_deploy::DeployError;
use shipflow_git::GitError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("missing required parameter: {0}")]
    MissingParam(String),

    #[error("invalid parameter '{name}': {message}")]
    InvalidParam { name: String, message: String },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("pipeline already exists: {0}")]
    PipelineExists(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("no suitable workflow found for prompt (best score: {best_score})")]
    NoMatch { best_score: i32 },

    #[error("cluster features are not available: {0}")]
    ClusterUnavailable(String),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("{0}")]
    Failed(Failure),
}

impl EngineError {
    pub fn invalid(name: &str, message: impl Into<String>) -> Self {
        EngineError::InvalidParam {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

impl Classify for EngineError {
    fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MissingParam(_)
            | EngineError::InvalidParam { .. }
            | EngineError::PipelineExists(_)
            | EngineError::InvalidPipeline(_)
            | EngineError::InvalidWorkflow(_) => ErrorKind::Validation,
            EngineError::UnknownTool(_)
            | EngineError::PipelineNotFound(_)
            | EngineError::WorkflowNotFound(_)
            | EngineError::NoMatch { .. } => ErrorKind::NotFound,
            EngineError::ClusterUnavailable(_) => ErrorKind::Cluster,
            EngineError::Git(e) => e.kind(),
            EngineError::Build(e) => e.kind(),
            EngineError::Deploy(e) => e.kind(),
            EngineError::Failed(f) => f.kind,
        }
    }

    fn to_failure(&self) -> Failure {
        match self {
            EngineError::Failed(f) => f.clone(),
            other => Failure::new(other.kind(), other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
