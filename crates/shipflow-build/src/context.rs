use crate::error::{BuildError, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::path::Path;
use tar::Builder;

/// コンテキスト外の Dockerfile を格納する名前
pub const EMBEDDED_DOCKERFILE: &str = "Dockerfile.shipflow";

/// アーカイブ化したビルドコンテキスト
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub archive: Vec<u8>,
    /// アーカイブ内の Dockerfile パス
    pub dockerfile: String,
}

pub struct ContextBuilder;

impl ContextBuilder {
    /// ビルドコンテキストを tar.gz アーカイブとして作成
    ///
    /// `.git` ディレクトリは含めない。Dockerfile がコンテキスト外にある場合は
    /// `Dockerfile.shipflow` として追加する。
    pub fn create_context(context_path: &Path, dockerfile_path: &Path) -> Result<BuildContext> {
        if !context_path.is_dir() {
            return Err(BuildError::ContextNotFound(context_path.to_path_buf()));
        }
        if !dockerfile_path.is_file() {
            return Err(BuildError::DockerfileNotFound(dockerfile_path.to_path_buf()));
        }
        tracing::debug!("Creating build context from: {}", context_path.display());

        let dockerfile = match dockerfile_path.strip_prefix(context_path) {
            Ok(relative) => relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => EMBEDDED_DOCKERFILE.to_string(),
        };

        let mut archive = Vec::new();
        {
            let encoder = GzEncoder::new(&mut archive, Compression::default());
            let mut tar = Builder::new(encoder);
            tar.follow_symlinks(false);

            append_tree(&mut tar, context_path, Path::new(""))?;

            if dockerfile == EMBEDDED_DOCKERFILE {
                let content = std::fs::read(dockerfile_path)?;
                let mut header = tar::Header::new_gnu();
                header.set_path(EMBEDDED_DOCKERFILE).map_err(|e| {
                    BuildError::InvalidConfig(format!("Failed to set Dockerfile path: {}", e))
                })?;
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                tar.append(&header, &content[..])?;
            }

            tar.into_inner()?.finish()?;
        }

        tracing::debug!("Build context created: {} bytes", archive.len());
        Self::check_context_size(archive.len());

        Ok(BuildContext {
            archive,
            dockerfile,
        })
    }

    fn check_context_size(size: usize) {
        const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024;

        if size > MAX_CONTEXT_SIZE {
            tracing::warn!(
                "Build context is large ({}MB); consider a .dockerignore",
                size / 1024 / 1024
            );
        }
    }
}

fn append_tree<W: std::io::Write>(tar: &mut Builder<W>, root: &Path, relative: &Path) -> Result<()> {
    let mut entries = std::fs::read_dir(root.join(relative))?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let path = entry.path();
        let rel = relative.join(&name);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            tar.append_dir(&rel, &path)?;
            append_tree(tar, root, &rel)?;
        } else {
            tar.append_path_with_name(&path, &rel)?;
        }
    }
    Ok(())
}
