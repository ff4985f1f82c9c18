use shipflow_core::{Classify, ErrorKind};
use shipflow_git::GitError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Dockerfile not found: {0}")]
    DockerfileNotFound(PathBuf),

    #[error("Build context directory not found: {0}")]
    ContextNotFound(PathBuf),

    #[error("Docker connection error: {0}")]
    DockerConnection(#[from] bollard::errors::Error),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid tag: {tag}")]
    InvalidTag { tag: String },

    #[error("Source preparation failed: {0}")]
    Source(#[from] GitError),

    #[error("Failed to download {url}: {message}")]
    Download { url: String, message: String },

    #[error("Authentication failed for {registry}: {message}")]
    AuthFailed { registry: String, message: String },

    #[error("registry configuration not found: {0}")]
    RegistryNotFound(String),

    #[error("Push failed: {message}")]
    PushFailed { message: String },

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Build job {job} did not finish within {timeout:?}")]
    JobTimeout { job: String, timeout: Duration },

    #[error("Cluster API error: {0}")]
    Cluster(#[from] kube::Error),

    #[error("Cluster build is not available: {0}")]
    ClusterUnavailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::DockerfileNotFound(path) => format!(
                "Dockerfileが見つかりません: {}\n\
                 \n\
                 dockerfile パラメータでソースルートからの相対パスを指定してください。",
                path.display()
            ),
            BuildError::AuthFailed { registry, .. } => format!(
                "{} への認証に失敗しました。\n\
                 \n\
                 registry_add でユーザー名とパスワードを登録してください。",
                registry
            ),
            BuildError::DockerConnection(_) => {
                "Docker デーモンに接続できません。Docker が起動しているか確認してください。"
                    .to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl Classify for BuildError {
    fn kind(&self) -> ErrorKind {
        match self {
            BuildError::DockerfileNotFound(_)
            | BuildError::ContextNotFound(_)
            | BuildError::InvalidConfig(_)
            | BuildError::InvalidTag { .. } => ErrorKind::Validation,
            BuildError::DockerConnection(_) | BuildError::PushFailed { .. } => ErrorKind::Engine,
            BuildError::BuildFailed(_) => ErrorKind::Build,
            BuildError::Source(e) => e.kind(),
            BuildError::Download { .. } => ErrorKind::Fetch,
            BuildError::AuthFailed { .. } => ErrorKind::Auth,
            BuildError::RegistryNotFound(_) | BuildError::ImageNotFound(_) => ErrorKind::NotFound,
            BuildError::JobTimeout { .. } => ErrorKind::Timeout,
            BuildError::Cluster(_) | BuildError::ClusterUnavailable(_) => ErrorKind::Cluster,
            BuildError::Cancelled => ErrorKind::Cancelled,
            BuildError::Io(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
