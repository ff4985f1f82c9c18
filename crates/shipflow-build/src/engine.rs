//! コンテナエンジンの抽象と Docker 実装

use crate::error::{BuildError, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use futures_util::stream::StreamExt;
use serde::Serialize;
use shipflow_core::split_image_tag;
use std::collections::HashMap;

/// エンジンへのビルド要求
#[derive(Debug, Clone, Default)]
pub struct EngineBuildRequest {
    /// gzip 圧縮された tar 形式のビルドコンテキスト
    pub context: Vec<u8>,
    /// コンテキスト内の Dockerfile パス
    pub dockerfile: String,
    pub tag: String,
    pub build_args: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub platform: Option<String>,
    pub no_cache: bool,
    pub pull: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageSummary {
    pub id: String,
    pub references: Vec<String>,
    pub digests: Vec<String>,
    pub size: i64,
    pub created: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageDetails {
    pub id: String,
    pub references: Vec<String>,
    pub digests: Vec<String>,
    pub size: Option<i64>,
    pub created: Option<String>,
    pub architecture: Option<String>,
    pub os: Option<String>,
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// イメージをビルドし、イメージ ID を返す
    ///
    /// 出力は失敗時も `logs` に残る。
    async fn build(&self, request: EngineBuildRequest, logs: &mut Vec<String>)
    -> Result<Option<String>>;

    async fn tag(&self, source: &str, target: &str) -> Result<()>;

    /// プッシュし、取得できればダイジェストを返す
    async fn push(&self, reference: &str, credentials: Option<DockerCredentials>)
    -> Result<Option<String>>;

    /// 存在しない場合は `None`
    async fn inspect(&self, reference: &str) -> Result<Option<ImageDetails>>;

    async fn list(&self) -> Result<Vec<ImageSummary>>;

    async fn remove(&self, reference: &str, force: bool) -> Result<()>;
}

/// Docker Engine API によるエンジン
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// ローカルの Docker デーモンに接続
    pub fn connect() -> Result<Self> {
        Ok(Self::new(Docker::connect_with_local_defaults()?))
    }

    /// ビルド出力の処理
    fn handle_build_output(
        output: bollard::models::BuildInfo,
        logs: &mut Vec<String>,
        image_id: &mut Option<String>,
    ) -> Result<()> {
        if let Some(stream) = output.stream {
            let line = stream.trim_end();
            if !line.is_empty() {
                tracing::debug!("{}", line);
                logs.push(line.to_string());
            }
        }

        if let Some(error) = output.error {
            logs.push(error.clone());
            return Err(BuildError::BuildFailed(error));
        }

        if let Some(error_detail) = output.error_detail {
            let error_msg = error_detail
                .message
                .unwrap_or_else(|| "Unknown build error".to_string());
            logs.push(error_msg.clone());
            return Err(BuildError::BuildFailed(error_msg));
        }

        if let Some(status) = output.status {
            logs.push(status);
        }

        if let Some(id) = output.aux.and_then(|aux| aux.id) {
            *image_id = Some(id);
        }

        Ok(())
    }
}

fn not_found(reference: &str, error: bollard::errors::Error) -> BuildError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => BuildError::ImageNotFound(reference.to_string()),
        e => BuildError::DockerConnection(e),
    }
}

/// プッシュのステータス行からダイジェストを取り出す
///
/// 例: `latest: digest: sha256:abcd... size: 1234`
pub(crate) fn parse_digest(status: &str) -> Option<String> {
    let rest = &status[status.find("digest: ")? + "digest: ".len()..];
    let digest = rest.split_whitespace().next()?;
    digest.starts_with("sha256:").then(|| digest.to_string())
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build(
        &self,
        request: EngineBuildRequest,
        logs: &mut Vec<String>,
    ) -> Result<Option<String>> {
        tracing::info!("Building image: {}", request.tag);

        let build_args: HashMap<&str, &str> = request
            .build_args
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let labels: HashMap<&str, &str> = request
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        #[allow(deprecated)]
        let options = bollard::image::BuildImageOptions {
            dockerfile: request.dockerfile.as_str(),
            t: request.tag.as_str(),
            buildargs: build_args,
            labels,
            platform: request.platform.as_deref().unwrap_or(""),
            nocache: request.no_cache,
            pull: request.pull,
            rm: true,
            forcerm: true,
            ..Default::default()
        };
        tracing::debug!("Build options: {:?}", options);

        use bytes::Bytes;
        use http_body_util::{Either, Full};
        let body = Full::new(Bytes::from(request.context));
        let mut stream = self
            .docker
            .build_image(options, None, Some(Either::Left(body)));

        let mut image_id = None;
        while let Some(msg) = stream.next().await {
            let output = msg.map_err(|e| {
                logs.push(e.to_string());
                BuildError::DockerConnection(e)
            })?;
            Self::handle_build_output(output, logs, &mut image_id)?;
        }

        tracing::info!("Successfully built: {}", request.tag);
        Ok(image_id)
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let (repo, tag) = split_image_tag(target);

        #[allow(deprecated)]
        let options = bollard::image::TagImageOptions {
            repo: repo.as_str(),
            tag: tag.as_str(),
        };
        self.docker
            .tag_image(source, Some(options))
            .await
            .map_err(|e| not_found(source, e))
    }

    async fn push(
        &self,
        reference: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<Option<String>> {
        let (image, tag) = split_image_tag(reference);

        #[allow(deprecated)]
        let options = bollard::image::PushImageOptions::<String> { tag };

        #[allow(deprecated)]
        let mut stream = self.docker.push_image(&image, Some(options), credentials);

        let mut digest = None;
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| BuildError::PushFailed {
                message: e.to_string(),
            })?;
            if let Some(err) = info.error {
                return Err(if err.contains("unauthorized") || err.contains("denied") {
                    BuildError::AuthFailed {
                        registry: shipflow_core::extract_registry(reference),
                        message: err,
                    }
                } else {
                    BuildError::PushFailed { message: err }
                });
            }
            if let Some(found) = info.status.as_deref().and_then(parse_digest) {
                digest = Some(found);
            }
        }

        tracing::info!("Pushed {}", reference);
        Ok(digest)
    }

    async fn inspect(&self, reference: &str) -> Result<Option<ImageDetails>> {
        match self.docker.inspect_image(reference).await {
            Ok(image) => Ok(Some(ImageDetails {
                id: image.id.unwrap_or_default(),
                references: image.repo_tags.unwrap_or_default(),
                digests: image.repo_digests.unwrap_or_default(),
                size: image.size,
                created: image.created.map(|c| c.to_string()),
                architecture: image.architecture,
                os: image.os,
                labels: image.config.and_then(|c| c.labels).unwrap_or_default(),
            })),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(BuildError::DockerConnection(e)),
        }
    }

    async fn list(&self) -> Result<Vec<ImageSummary>> {
        let images = self
            .docker
            .list_images(None::<bollard::query_parameters::ListImagesOptions>)
            .await?;
        Ok(images
            .into_iter()
            .map(|image| ImageSummary {
                id: image.id,
                references: image.repo_tags,
                digests: image.repo_digests,
                size: image.size,
                created: image.created,
            })
            .collect())
    }

    async fn remove(&self, reference: &str, force: bool) -> Result<()> {
        let options = bollard::query_parameters::RemoveImageOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_image(reference, Some(options), None)
            .await
            .map_err(|e| not_found(reference, e))?;
        tracing::info!("Removed image {}", reference);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_digest() {
        assert_eq!(
            parse_digest("latest: digest: sha256:abc123 size: 1570"),
            Some("sha256:abc123".to_string())
        );
        assert_eq!(parse_digest("Pushed"), None);
        assert_eq!(parse_digest("digest: md5:xyz"), None);
    }

    #[test]
    fn test_handle_build_output_collects_logs_and_id() {
        let mut logs = Vec::new();
        let mut image_id = None;
        let output = bollard::models::BuildInfo {
            stream: Some("Step 1/2 : FROM alpine\n".to_string()),
            aux: Some(bollard::models::ImageId {
                id: Some("sha256:feed".to_string()),
            }),
            ..Default::default()
        };
        DockerEngine::handle_build_output(output, &mut logs, &mut image_id).unwrap();
        assert_eq!(logs, vec!["Step 1/2 : FROM alpine"]);
        assert_eq!(image_id.as_deref(), Some("sha256:feed"));
    }

    #[test]
    fn test_handle_build_output_error_is_logged() {
        let mut logs = Vec::new();
        let mut image_id = None;
        let output = bollard::models::BuildInfo {
            error: Some("The command '/bin/sh -c false' returned a non-zero code: 1".to_string()),
            ..Default::default()
        };
        let err = DockerEngine::handle_build_output(output, &mut logs, &mut image_id).unwrap_err();
        assert!(matches!(err, BuildError::BuildFailed(_)));
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    #[ignore] // Docker接続が必要なため、通常のテストではスキップ
    async fn test_build_and_inspect_simple_image() {
        use crate::context::ContextBuilder;

        let engine = DockerEngine::connect().unwrap();
        let temp_dir = tempfile::tempdir().unwrap();
        let dockerfile = temp_dir.path().join("Dockerfile");
        std::fs::write(&dockerfile, "FROM alpine:latest\nCMD echo 'test'").unwrap();
        let context = ContextBuilder::create_context(temp_dir.path(), &dockerfile).unwrap();

        let mut logs = Vec::new();
        engine
            .build(
                EngineBuildRequest {
                    context: context.archive,
                    dockerfile: context.dockerfile,
                    tag: "shipflow-test:latest".to_string(),
                    ..Default::default()
                },
                &mut logs,
            )
            .await
            .unwrap();
        assert!(!logs.is_empty());
        assert!(engine.inspect("shipflow-test:latest").await.unwrap().is_some());

        engine.remove("shipflow-test:latest", true).await.ok();
    }
}
