//! ビルドソースの準備
//!
//! git / url ソースは一時ディレクトリに展開する。一時ディレクトリは
//! `PreparedSource` の破棄時（成功・失敗・パニックのいずれでも）に削除される。

use crate::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use shipflow_git::{Credentials, GitRef, GitTransport};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// 一時ディレクトリのプレフィックス
pub const SCRATCH_PREFIX: &str = "shipflow-build-";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[default]
    Local,
    Git,
    Url,
}

impl std::str::FromStr for SourceType {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "path" => Ok(SourceType::Local),
            "git" => Ok(SourceType::Git),
            "url" | "archive" => Ok(SourceType::Url),
            other => Err(BuildError::InvalidConfig(format!(
                "unknown source type '{}' (expected local, git or url)",
                other
            ))),
        }
    }
}

/// 準備済みのソースディレクトリ
#[derive(Debug)]
pub struct PreparedSource {
    root: PathBuf,
    scratch: Option<TempDir>,
}

impl PreparedSource {
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// 一時ディレクトリのパス（ローカルソースでは `None`）
    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(|d| d.path())
    }
}

pub struct SourceFetcher {
    git: Arc<dyn GitTransport>,
    http: reqwest::Client,
}

impl SourceFetcher {
    pub fn new(git: Arc<dyn GitTransport>) -> Self {
        Self {
            git,
            http: reqwest::Client::new(),
        }
    }

    /// アーカイブ取得に使う HTTP クライアントを差し替える
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub async fn prepare(
        &self,
        source_type: SourceType,
        source: &str,
        git_ref: Option<&GitRef>,
        credentials: Option<&Credentials>,
    ) -> Result<PreparedSource> {
        if source.trim().is_empty() {
            return Err(BuildError::InvalidConfig("source is required".to_string()));
        }

        match source_type {
            SourceType::Local => {
                let root = PathBuf::from(source);
                if !root.is_dir() {
                    return Err(BuildError::ContextNotFound(root));
                }
                Ok(PreparedSource {
                    root,
                    scratch: None,
                })
            }
            SourceType::Git => {
                let scratch = scratch_dir()?;
                let root = scratch.path().join("src");
                self.git
                    .clone_repo(source, git_ref, credentials, &root)
                    .await?;
                Ok(PreparedSource {
                    root,
                    scratch: Some(scratch),
                })
            }
            SourceType::Url => {
                let scratch = scratch_dir()?;
                let bytes = self.download(source).await?;
                let dest = scratch.path().join("src");
                let root = tokio::task::spawn_blocking(move || unpack_archive(&bytes, &dest))
                    .await
                    .map_err(|e| BuildError::Io(std::io::Error::other(e.to_string())))??;
                Ok(PreparedSource {
                    root,
                    scratch: Some(scratch),
                })
            }
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        tracing::info!("Downloading build source from {}", url);
        let download_error = |e: reqwest::Error| BuildError::Download {
            url: url.to_string(),
            message: e.to_string(),
        };
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(download_error)?;
        let bytes = response.bytes().await.map_err(download_error)?;
        Ok(bytes.to_vec())
    }
}

fn scratch_dir() -> Result<TempDir> {
    Ok(tempfile::Builder::new().prefix(SCRATCH_PREFIX).tempdir()?)
}

/// tar / tar.gz アーカイブを展開し、ソースのルートを返す
///
/// トップレベルがディレクトリ 1 つだけの場合はその中をルートとする。
pub fn unpack_archive(bytes: &[u8], dest: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dest)?;
    let reader: Box<dyn Read + '_> = if bytes.starts_with(&[0x1f, 0x8b]) {
        Box::new(flate2::read::GzDecoder::new(bytes))
    } else {
        Box::new(bytes)
    };
    tar::Archive::new(reader)
        .unpack(dest)
        .map_err(|e| BuildError::InvalidConfig(format!("source archive is not a tar file: {}", e)))?;

    let entries = std::fs::read_dir(dest)?.collect::<std::io::Result<Vec<_>>>()?;
    if let [single] = entries.as_slice()
        && single.file_type()?.is_dir()
    {
        return Ok(single.path());
    }
    Ok(dest.to_path_buf())
}
