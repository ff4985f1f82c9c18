//! イメージプッシュ処理
//!
//! メインのタグを先にプッシュし、追加タグは 1 つずつ独立してプッシュする。
//! 追加タグの失敗は記録して続行し、全体の失敗にはしない。

use crate::auth::DockerConfigAuth;
use crate::engine::ContainerEngine;
use crate::error::{BuildError, Result};
use crate::registry::{RegistryProfile, RegistryStore};
use bollard::auth::DockerCredentials;
use serde::Serialize;
use shipflow_core::{
    Classify, Failure, extract_registry, image_reference, millis, qualify_image, split_image_tag,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct PushConfig {
    /// ローカルのイメージ参照
    pub source_image: String,
    /// プッシュ先のイメージ名（省略時はソースと同じ）
    pub target_image: Option<String>,
    pub target_tag: Option<String>,
    pub additional_tags: Vec<String>,
    /// 名前付きレジストリプロファイル
    pub registry: Option<String>,
    /// 明示的な認証情報（名前付きプロファイルより優先）
    pub credentials: Option<RegistryProfile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushResult {
    pub pushed_references: Vec<String>,
    pub digest: Option<String>,
    pub failed_tags: Vec<String>,
    pub duration: Duration,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<Failure>,
}

impl PushResult {
    fn failed(error: Failure, started: Instant) -> Self {
        let duration = started.elapsed();
        Self {
            pushed_references: Vec::new(),
            digest: None,
            failed_tags: Vec::new(),
            duration,
            duration_ms: millis(duration),
            success: false,
            error: Some(error),
        }
    }
}

pub struct RegistryPusher {
    engine: Arc<dyn ContainerEngine>,
    store: Arc<RegistryStore>,
    docker_auth: DockerConfigAuth,
}

impl RegistryPusher {
    pub fn new(engine: Arc<dyn ContainerEngine>, store: Arc<RegistryStore>) -> Self {
        Self {
            engine,
            store,
            docker_auth: DockerConfigAuth::new(),
        }
    }

    pub fn with_docker_auth(mut self, docker_auth: DockerConfigAuth) -> Self {
        self.docker_auth = docker_auth;
        self
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    /// イメージをレジストリにプッシュ
    pub async fn push(&self, config: &PushConfig, cancel: &CancellationToken) -> PushResult {
        let started = Instant::now();

        let (repository, profile, credentials) = match self.resolve(config).await {
            Ok(resolved) => resolved,
            Err(e) => return PushResult::failed(e.to_failure(), started),
        };

        let tag = config
            .target_tag
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| config.target_image.as_deref().and_then(explicit_tag))
            .unwrap_or_else(|| split_image_tag(&config.source_image).1);
        if let Err(e) = validate_tag(&tag) {
            return PushResult::failed(e.to_failure(), started);
        }
        let primary = image_reference(&repository, &tag);

        if let Some(profile) = &profile {
            tracing::info!("Pushing {} to registry {}", primary, profile.name);
        } else {
            tracing::info!("Pushing {}", primary);
        }

        let digest = match self
            .push_one(&config.source_image, &primary, credentials.clone(), cancel)
            .await
        {
            Ok(digest) => digest,
            Err(e) => return PushResult::failed(e.to_failure(), started),
        };

        let mut pushed = vec![primary];
        let mut failed_tags = Vec::new();
        for extra in &config.additional_tags {
            if *extra == tag {
                continue;
            }
            if cancel.is_cancelled() {
                failed_tags.push(extra.clone());
                continue;
            }
            let reference = image_reference(&repository, extra);
            let outcome = match validate_tag(extra) {
                Ok(()) => {
                    self.push_one(&config.source_image, &reference, credentials.clone(), cancel)
                        .await
                }
                Err(e) => Err(e),
            };
            match outcome {
                Ok(_) => pushed.push(reference),
                Err(e) => {
                    tracing::warn!("Failed to push additional tag {}: {}", reference, e);
                    failed_tags.push(extra.clone());
                }
            }
        }

        let error = (!failed_tags.is_empty()).then(|| {
            Failure::partial(format!(
                "{} of {} additional tag(s) failed: {}",
                failed_tags.len(),
                config.additional_tags.len(),
                failed_tags.join(", ")
            ))
        });

        let duration = started.elapsed();
        PushResult {
            pushed_references: pushed,
            digest,
            failed_tags,
            duration,
            duration_ms: millis(duration),
            success: true,
            error,
        }
    }

    /// プッシュ先のリポジトリ名と認証情報を決定
    async fn resolve(
        &self,
        config: &PushConfig,
    ) -> Result<(String, Option<RegistryProfile>, Option<DockerCredentials>)> {
        if config.source_image.trim().is_empty() {
            return Err(BuildError::InvalidConfig("source image is required".to_string()));
        }

        let profile = match (&config.credentials, &config.registry) {
            (Some(inline), _) => Some(inline.clone()),
            (None, Some(name)) if !name.is_empty() => Some(
                self.store
                    .get(name)
                    .ok_or_else(|| BuildError::RegistryNotFound(name.clone()))?,
            ),
            _ => None,
        };

        let target = config
            .target_image
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(&config.source_image);
        let (mut repository, _) = split_image_tag(target);

        let credentials = match &profile {
            Some(profile) => {
                profile.validate_access()?;
                repository = qualify_image(&repository, &profile.host());
                Some(profile.credentials())
            }
            None => {
                self.docker_auth
                    .credentials_for(&extract_registry(&repository))
                    .await?
            }
        };

        Ok((repository, profile, credentials))
    }

    async fn push_one(
        &self,
        source: &str,
        reference: &str,
        credentials: Option<DockerCredentials>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        if source != reference {
            self.engine.tag(source, reference).await?;
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(BuildError::Cancelled),
            result = self.engine.push(reference, credentials) => result,
        }
    }
}

/// 参照に明示されたタグ
fn explicit_tag(image: &str) -> Option<String> {
    let (repository, tag) = split_image_tag(image);
    (repository.len() < image.len()).then_some(tag)
}

/// タグのバリデーション
///
/// - 128 文字以下
/// - 英数字、ピリオド、ハイフン、アンダースコアのみ
/// - 先頭はピリオドまたはハイフンではない
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(BuildError::InvalidTag {
            tag: "(empty)".to_string(),
        });
    }

    if tag.len() > 128 {
        return Err(BuildError::InvalidTag {
            tag: format!("tag too long ({} characters, max 128)", tag.len()),
        });
    }

    if tag.starts_with('.') || tag.starts_with('-') {
        return Err(BuildError::InvalidTag {
            tag: tag.to_string(),
        });
    }

    if let Some(c) = tag
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '-' | '_'))
    {
        return Err(BuildError::InvalidTag {
            tag: format!("invalid character '{}' in {}", c, tag),
        });
    }

    Ok(())
}
