//! クラスタ内ビルドジョブ
//!
//! kaniko executor を特権ジョブとして投入し、完了は別途ポーリングで確認する。

use crate::error::{BuildError, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, KeyToPath, PodSpec, PodTemplateSpec, SecretVolumeSource,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use serde::{Deserialize, Serialize};
use shipflow_core::MANAGED_BY_LABEL;
use shipflow_git::GitRef;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobRef {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// ジョブの現在の状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Active,
    Succeeded,
    Failed(String),
}

/// 待機の結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
}

#[async_trait]
pub trait JobClient: Send + Sync {
    async fn submit(&self, job: Job) -> Result<JobRef>;
    async fn state(&self, job: &JobRef) -> Result<JobState>;
}

/// kaniko ジョブの入力
#[derive(Debug, Clone)]
pub struct KanikoJob<'a> {
    pub namespace: &'a str,
    pub executor_image: &'a str,
    pub git_url: &'a str,
    pub git_ref: Option<&'a GitRef>,
    pub dockerfile: &'a str,
    pub context_subpath: Option<&'a str>,
    pub destinations: &'a [String],
    pub build_args: &'a BTreeMap<String, String>,
    pub platform: Option<&'a str>,
    pub no_cache: bool,
    /// `.dockerconfigjson` を持つ Secret 名
    pub registry_secret: Option<&'a str>,
    pub managed_by: &'a str,
}

/// kaniko のビルドジョブを組み立てる
pub fn kaniko_job(spec: &KanikoJob<'_>) -> Job {
    let base = spec
        .destinations
        .first()
        .map(|d| shipflow_core::split_image_tag(d).0)
        .unwrap_or_default();
    let short = base.rsplit('/').next().unwrap_or("image");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let name = format!("{}-build-{}", dns_label(short, 40), &suffix[..8]);

    let context = {
        let repo = spec
            .git_url
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        match spec.git_ref {
            Some(GitRef::Branch(branch)) => format!("git://{}#refs/heads/{}", repo, branch),
            Some(GitRef::Commit(commit)) => format!("git://{}#{}", repo, commit),
            None => format!("git://{}", repo),
        }
    };

    let mut args = vec![
        format!("--context={}", context),
        format!("--dockerfile={}", spec.dockerfile),
        "--snapshot-mode=redo".to_string(),
    ];
    if let Some(sub) = spec.context_subpath.filter(|s| !s.is_empty() && *s != ".") {
        args.push(format!("--context-sub-path={}", sub));
    }
    args.extend(spec.destinations.iter().map(|d| format!("--destination={}", d)));
    args.extend(
        spec.build_args
            .iter()
            .map(|(k, v)| format!("--build-arg={}={}", k, v)),
    );
    if let Some(platform) = spec.platform {
        args.push(format!("--custom-platform={}", platform));
    }
    if !spec.no_cache {
        args.push("--cache=true".to_string());
    }

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), spec.managed_by.to_string());
    labels.insert("shipflow.dev/build".to_string(), name.clone());

    let (volumes, mounts) = match spec.registry_secret {
        Some(secret) => (
            Some(vec![Volume {
                name: "docker-config".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.to_string()),
                    items: Some(vec![KeyToPath {
                        key: ".dockerconfigjson".to_string(),
                        path: "config.json".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            Some(vec![VolumeMount {
                name: "docker-config".to_string(),
                mount_path: "/kaniko/.docker".to_string(),
                ..Default::default()
            }]),
        ),
        None => (None, None),
    };

    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(spec.namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(3600),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "kaniko".to_string(),
                        image: Some(spec.executor_image.to_string()),
                        args: Some(args),
                        env: Some(vec![EnvVar {
                            name: "DOCKER_CONFIG".to_string(),
                            value: Some("/kaniko/.docker".to_string()),
                            ..Default::default()
                        }]),
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            ..Default::default()
                        }),
                        volume_mounts: mounts,
                        ..Default::default()
                    }],
                    volumes,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// DNS-1123 ラベルとして使える形に整える
fn dns_label(value: &str, max: usize) -> String {
    let mut label: String = value
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    label.truncate(max);
    let label = label.trim_matches('-').to_string();
    if label.is_empty() {
        "image".to_string()
    } else {
        label
    }
}

/// 終了状態になるまでポーリングする
///
/// タイムアウトは `JobOutcome::TimedOut`、キャンセルは `BuildError::Cancelled`。
pub async fn wait_for_completion(
    client: &dyn JobClient,
    job: &JobRef,
    timeout: Duration,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<JobOutcome> {
    let deadline = Instant::now() + timeout;
    loop {
        match client.state(job).await? {
            JobState::Succeeded => {
                tracing::info!("Build job {} completed", job);
                return Ok(JobOutcome::Succeeded);
            }
            JobState::Failed(reason) => {
                tracing::warn!("Build job {} failed: {}", job, reason);
                return Ok(JobOutcome::Failed(reason));
            }
            JobState::Active => {}
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!("Build job {} did not finish within {:?}", job, timeout);
            return Ok(JobOutcome::TimedOut);
        }
        let wait = poll.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// Kubernetes Job API によるクライアント
#[derive(Clone)]
pub struct KubeJobClient {
    client: kube::Client,
}

impl KubeJobClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobClient for KubeJobClient {
    async fn submit(&self, job: Job) -> Result<JobRef> {
        let namespace = job
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| BuildError::InvalidConfig("job namespace is required".to_string()))?;
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        let created = api.create(&PostParams::default(), &job).await?;
        let name = created
            .metadata
            .name
            .ok_or_else(|| BuildError::ClusterUnavailable("created job has no name".to_string()))?;
        tracing::info!("Submitted build job {}/{}", namespace, name);
        Ok(JobRef { namespace, name })
    }

    async fn state(&self, job: &JobRef) -> Result<JobState> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), &job.namespace);
        let current = api.get(&job.name).await?;
        Ok(classify_job(&current))
    }
}

/// Job のステータスを状態に分類
pub fn classify_job(job: &Job) -> JobState {
    let Some(status) = job.status.as_ref() else {
        return JobState::Active;
    };

    for condition in status.conditions.iter().flatten() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return JobState::Succeeded,
            "Failed" => {
                return JobState::Failed(
                    condition
                        .message
                        .clone()
                        .or_else(|| condition.reason.clone())
                        .unwrap_or_else(|| "job failed".to_string()),
                );
            }
            _ => {}
        }
    }

    if status.succeeded.unwrap_or(0) > 0 {
        JobState::Succeeded
    } else if status.failed.unwrap_or(0) > 0 {
        JobState::Failed("pod failed".to_string())
    } else {
        JobState::Active
    }
}
