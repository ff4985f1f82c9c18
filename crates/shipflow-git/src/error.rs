use shipflow_core::{Classify, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to clone {url}: {message}")]
    Clone { url: String, message: String },

    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("authentication failed for {url}: {message}")]
    Auth { url: String, message: String },

    #[error("branch '{branch}' not found in {url}")]
    BranchNotFound { url: String, branch: String },

    #[error("repository is already watched: {url} ({branch})")]
    AlreadyWatched { url: String, branch: String },

    #[error("repository is not watched: {url} ({branch})")]
    NotWatched { url: String, branch: String },

    #[error("invalid repository: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for GitError {
    fn kind(&self) -> ErrorKind {
        match self {
            GitError::Clone { .. } => ErrorKind::Clone,
            GitError::Fetch { .. } | GitError::BranchNotFound { .. } => ErrorKind::Fetch,
            GitError::Auth { .. } => ErrorKind::Auth,
            GitError::AlreadyWatched { .. } | GitError::Invalid(_) => ErrorKind::Validation,
            GitError::NotWatched { .. } => ErrorKind::NotFound,
            GitError::Io(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, GitError>;
