use crate::cluster::{ClusterClient, Exposure};
use crate::error::{DeployError, Result};
use crate::manifest::{AppManifest, EXPOSURE_ANNOTATION, RenderedManifests, exposure_name};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use serde::{Deserialize, Serialize};
use shipflow_config::{DeploySettings, ExposureKind, ResourceQuantity};
use shipflow_core::{
    Classify, Failure, MANAGED_BY_LABEL, image_reference, millis, split_image_tag,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// リソース要求（省略時は設定の既定値）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub requests: Option<ResourceQuantity>,
    pub limits: Option<ResourceQuantity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub name: String,
    pub namespace: Option<String>,
    pub image: String,
    /// 指定時はイメージ参照のタグより優先
    pub tag: Option<String>,
    pub replicas: Option<i32>,
    pub port: Option<i32>,
    pub service_type: Option<String>,
    pub resources: ResourceSpec,
    pub expose_externally: bool,
    pub exposure_domain: Option<String>,
    pub exposure_kind: Option<ExposureKind>,
    pub env_vars: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub health_path: Option<String>,
}

impl DeployConfig {
    pub fn new(name: &str, namespace: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            image: image.to_string(),
            ..Default::default()
        }
    }

    /// クラスタに触れずに適用予定のマニフェストを生成する
    pub fn render(&self, settings: &DeploySettings) -> Result<RenderedManifests> {
        self.resolve(settings)?.render()
    }

    /// 既定値を適用してマニフェストの入力にする
    pub fn resolve(&self, settings: &DeploySettings) -> Result<AppManifest> {
        validate_name(&self.name)?;
        let image = self.image.trim();
        if image.is_empty() {
            return Err(DeployError::InvalidConfig("image is required".to_string()));
        }

        let (repository, image_tag) = split_image_tag(image);
        let version = self
            .tag
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or(image_tag);

        let replicas = self.replicas.unwrap_or(settings.replicas);
        if replicas < 0 {
            return Err(DeployError::InvalidConfig(format!(
                "replicas must not be negative: {}",
                replicas
            )));
        }
        let port = self.port.unwrap_or(settings.port);
        if !(1..=65535).contains(&port) {
            return Err(DeployError::InvalidConfig(format!("invalid port: {}", port)));
        }

        let namespace = self
            .namespace
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(settings.namespace.as_str())
            .to_string();
        validate_name(&namespace)?;

        let mut env = BTreeMap::from([("PORT".to_string(), port.to_string())]);
        env.extend(self.env_vars.clone());

        let mut labels =
            BTreeMap::from([(MANAGED_BY_LABEL.to_string(), settings.managed_by.clone())]);
        labels.extend(self.labels.clone());

        Ok(AppManifest {
            name: self.name.clone(),
            namespace,
            image: image_reference(&repository, &version),
            version,
            replicas,
            port,
            service_type: self
                .service_type
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| settings.service_type.clone()),
            requests: self
                .resources
                .requests
                .clone()
                .unwrap_or_else(|| settings.requests.clone()),
            limits: self
                .resources
                .limits
                .clone()
                .unwrap_or_else(|| settings.limits.clone()),
            env,
            labels,
            annotations: self.annotations.clone(),
            health_path: self.health_path.clone().filter(|p| !p.is_empty()),
            exposure: self
                .expose_externally
                .then(|| self.exposure_kind.unwrap_or(settings.exposure)),
            exposure_domain: self.exposure_domain.clone(),
        })
    }
}

/// DNS-1123 ラベルの検証
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(DeployError::InvalidConfig(format!(
            "'{}' is not a valid resource name (lowercase letters, digits and '-')",
            name
        )))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployResult {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub ready_replicas: i32,
    pub total_replicas: i32,
    pub service_name: Option<String>,
    pub external_url: Option<String>,
    pub duration: Duration,
    pub duration_ms: u64,
    pub logs: Vec<String>,
    pub success: bool,
    pub error: Option<Failure>,
}

/// 管理下のアプリケーション
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppInfo {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub status: String,
    pub service_name: Option<String>,
    pub port: Option<i32>,
    pub external_url: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// 削除結果（存在しなかったリソースも削除済みとして扱う）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub absent: Vec<String>,
}

pub struct Deployer {
    cluster: Arc<dyn ClusterClient>,
    settings: DeploySettings,
    readiness_timeout: Duration,
    readiness_poll: Duration,
}

impl Deployer {
    pub fn new(cluster: Arc<dyn ClusterClient>, settings: DeploySettings) -> Self {
        Self {
            readiness_timeout: settings.readiness_timeout(),
            readiness_poll: settings.readiness_poll(),
            cluster,
            settings,
        }
    }

    /// 準備完了待ちのタイムアウトとポーリング間隔を変更
    pub fn with_readiness(mut self, timeout: Duration, poll: Duration) -> Self {
        self.readiness_timeout = timeout;
        self.readiness_poll = poll;
        self
    }

    pub fn settings(&self) -> &DeploySettings {
        &self.settings
    }

    pub fn render(&self, config: &DeployConfig) -> Result<RenderedManifests> {
        config.render(&self.settings)
    }

    /// アプリケーションをデプロイし、準備完了まで待つ
    ///
    /// タイムアウトしても適用済みのリソースは残す。
    pub async fn deploy(&self, config: &DeployConfig, cancel: &CancellationToken) -> DeployResult {
        let started = Instant::now();
        let mut logs = Vec::new();

        let manifest = match config.resolve(&self.settings) {
            Ok(manifest) => manifest,
            Err(e) => {
                let duration = started.elapsed();
                return DeployResult {
                    name: config.name.clone(),
                    namespace: config.namespace.clone().unwrap_or_default(),
                    image: config.image.clone(),
                    ready_replicas: 0,
                    total_replicas: config.replicas.unwrap_or(self.settings.replicas),
                    service_name: None,
                    external_url: None,
                    duration,
                    duration_ms: millis(duration),
                    logs,
                    success: false,
                    error: Some(e.to_failure()),
                };
            }
        };

        let mut result = DeployResult {
            name: manifest.name.clone(),
            namespace: manifest.namespace.clone(),
            image: manifest.image.clone(),
            ready_replicas: 0,
            total_replicas: manifest.replicas,
            service_name: None,
            external_url: None,
            duration: Duration::ZERO,
            duration_ms: 0,
            logs: Vec::new(),
            success: false,
            error: None,
        };

        match self.apply(&manifest, &mut result, &mut logs, cancel).await {
            Ok(()) => result.success = true,
            Err(e) => {
                tracing::warn!(
                    "Deployment of {}/{} failed: {}",
                    manifest.namespace,
                    manifest.name,
                    e
                );
                logs.push(format!("Error: {}", e));
                result.error = Some(e.to_failure());
            }
        }
        result.logs = logs;
        result.duration = started.elapsed();
        result.duration_ms = millis(result.duration);
        result
    }

    async fn apply(
        &self,
        manifest: &AppManifest,
        result: &mut DeployResult,
        logs: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ns = &manifest.namespace;
        let name = &manifest.name;

        check_cancelled(cancel)?;
        if self.cluster.ensure_namespace(ns).await? {
            logs.push(format!("Created namespace {}", ns));
        }

        check_cancelled(cancel)?;
        let created = self.apply_deployment(manifest).await?;
        logs.push(format!(
            "Deployment {}/{} {} ({} replicas, image {})",
            ns,
            name,
            if created { "created" } else { "updated" },
            manifest.replicas,
            manifest.image
        ));

        check_cancelled(cancel)?;
        let created = self.apply_service(manifest).await?;
        logs.push(format!(
            "Service {}/{} {}",
            ns,
            name,
            if created { "created" } else { "updated" }
        ));
        result.service_name = Some(name.clone());

        if let Some(desired) = manifest.exposure() {
            check_cancelled(cancel)?;
            let kind = exposure_name(desired.kind());
            match self.apply_exposure(ns, desired).await {
                Ok(exposure) => {
                    result.external_url = exposure.url();
                    match &result.external_url {
                        Some(url) => logs.push(format!("Exposed {} via {} at {}", name, kind, url)),
                        None => logs.push(format!("Exposed {} via {}", name, kind)),
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to expose {}/{} via {}: {}", ns, name, kind, e);
                    logs.push(format!("Warning: failed to create {} exposure: {}", kind, e));
                }
            }
        }

        result.ready_replicas = self.wait_ready(manifest, cancel).await?;
        logs.push(format!(
            "Deployment ready ({}/{})",
            result.ready_replicas, manifest.replicas
        ));
        Ok(())
    }

    /// 作成した場合は `true`
    async fn apply_deployment(&self, manifest: &AppManifest) -> Result<bool> {
        let ns = &manifest.namespace;
        let desired = manifest.deployment();
        if let Some(existing) = self.cluster.get_deployment(ns, &manifest.name).await? {
            self.replace_deployment(ns, desired, &existing).await?;
            return Ok(false);
        }
        match self.cluster.create_deployment(ns, &desired).await {
            Ok(_) => Ok(true),
            Err(DeployError::AlreadyExists { .. }) => {
                tracing::debug!("Deployment {}/{} appeared concurrently", ns, manifest.name);
                let existing = self.existing_deployment(ns, &manifest.name).await?;
                self.replace_deployment(ns, desired, &existing).await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn existing_deployment(&self, ns: &str, name: &str) -> Result<Deployment> {
        self.cluster
            .get_deployment(ns, name)
            .await?
            .ok_or_else(|| DeployError::NotFound {
                namespace: ns.to_string(),
                name: name.to_string(),
            })
    }

    async fn replace_deployment(
        &self,
        ns: &str,
        mut desired: Deployment,
        existing: &Deployment,
    ) -> Result<Deployment> {
        desired.metadata.resource_version = existing.metadata.resource_version.clone();
        self.cluster.replace_deployment(ns, &desired).await
    }

    async fn apply_service(&self, manifest: &AppManifest) -> Result<bool> {
        let ns = &manifest.namespace;
        let desired = manifest.service();
        if let Some(existing) = self.cluster.get_service(ns, &manifest.name).await? {
            self.replace_service(ns, desired, &existing).await?;
            return Ok(false);
        }
        match self.cluster.create_service(ns, &desired).await {
            Ok(_) => Ok(true),
            Err(DeployError::AlreadyExists { .. }) => {
                let existing = self
                    .cluster
                    .get_service(ns, &manifest.name)
                    .await?
                    .ok_or_else(|| DeployError::NotFound {
                        namespace: ns.to_string(),
                        name: manifest.name.clone(),
                    })?;
                self.replace_service(ns, desired, &existing).await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// サーバーが割り当てたアドレスとノードポートを引き継いで置き換える
    async fn replace_service(
        &self,
        ns: &str,
        mut desired: Service,
        existing: &Service,
    ) -> Result<Service> {
        desired.metadata.resource_version = existing.metadata.resource_version.clone();
        if let (Some(spec), Some(current)) = (desired.spec.as_mut(), existing.spec.as_ref()) {
            spec.cluster_ip = current.cluster_ip.clone();
            spec.cluster_ips = current.cluster_ips.clone();
            if let (Some(ports), Some(current_ports)) = (spec.ports.as_mut(), current.ports.as_ref())
            {
                for port in ports.iter_mut() {
                    port.node_port = current_ports
                        .iter()
                        .find(|p| p.name == port.name)
                        .and_then(|p| p.node_port);
                }
            }
        }
        self.cluster.replace_service(ns, &desired).await
    }

    async fn apply_exposure(&self, ns: &str, mut desired: Exposure) -> Result<Exposure> {
        let kind = desired.kind();
        let name = desired.name().to_string();
        let existing = match self.cluster.get_exposure(ns, kind, &name).await? {
            Some(existing) => Some(existing),
            None => match self.cluster.create_exposure(ns, &desired).await {
                Ok(created) => return Ok(created),
                Err(DeployError::AlreadyExists { .. }) => {
                    self.cluster.get_exposure(ns, kind, &name).await?
                }
                Err(e) => return Err(e),
            },
        };
        let existing = existing.ok_or_else(|| DeployError::NotFound {
            namespace: ns.to_string(),
            name: name.clone(),
        })?;

        desired.metadata_mut().resource_version = existing.metadata().resource_version.clone();
        // ホスト未指定の Route はクラスタが割り当てたホストを引き継ぐ
        if let (Exposure::Route(route), Exposure::Route(current)) = (&mut desired, &existing)
            && route.data["spec"]["host"].is_null()
            && let Some(host) = current.data["spec"]["host"].as_str()
        {
            route.data["spec"]["host"] = serde_json::json!(host);
        }
        self.cluster.replace_exposure(ns, &desired).await
    }

    async fn wait_ready(&self, manifest: &AppManifest, cancel: &CancellationToken) -> Result<i32> {
        let deadline = tokio::time::Instant::now() + self.readiness_timeout;
        let desired = manifest.replicas;
        loop {
            let current = self
                .existing_deployment(&manifest.namespace, &manifest.name)
                .await?;
            let ready = ready_replicas(&current);
            let status = current.status.as_ref();
            let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
            let observed = status.and_then(|s| s.observed_generation).unwrap_or(0);
            let generation = current.metadata.generation.unwrap_or(0);

            if ready == desired && updated == desired && observed >= generation {
                tracing::info!(
                    "Deployment {}/{} is ready ({}/{})",
                    manifest.namespace,
                    manifest.name,
                    ready,
                    desired
                );
                return Ok(ready);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(DeployError::NotReady {
                    namespace: manifest.namespace.clone(),
                    name: manifest.name.clone(),
                    ready,
                    desired,
                    timeout: self.readiness_timeout,
                });
            }
            tracing::debug!(
                "Waiting for {}/{} ({}/{} ready)",
                manifest.namespace,
                manifest.name,
                ready,
                desired
            );
            let wait = self.readiness_poll.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(DeployError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Deployment・Service・公開リソースを個別に削除する
    ///
    /// 一部だけ失敗した場合は `DeployError::PartialDelete`。
    pub async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<DeleteReport> {
        validate_name(name)?;
        let ns = namespace
            .filter(|n| !n.is_empty())
            .unwrap_or(self.settings.namespace.as_str());

        let mut report = DeleteReport::default();
        let mut failed = Vec::new();
        for resource in ["deployment", "service", "route", "ingress"] {
            check_cancelled(cancel)?;
            let outcome = match resource {
                "deployment" => self.cluster.delete_deployment(ns, name).await,
                "service" => self.cluster.delete_service(ns, name).await,
                "route" => {
                    self.cluster
                        .delete_exposure(ns, ExposureKind::Route, name)
                        .await
                }
                _ => {
                    self.cluster
                        .delete_exposure(ns, ExposureKind::Ingress, name)
                        .await
                }
            };
            match outcome {
                Ok(true) => {
                    tracing::info!("Deleted {} {}/{}", resource, ns, name);
                    report.deleted.push(resource.to_string());
                }
                Ok(false) => report.absent.push(resource.to_string()),
                Err(e) => {
                    tracing::warn!("Failed to delete {} {}/{}: {}", resource, ns, name, e);
                    failed.push(format!("{}: {}", resource, e));
                }
            }
        }

        if failed.is_empty() {
            Ok(report)
        } else if report.deleted.is_empty() && report.absent.is_empty() {
            Err(DeployError::DeleteFailed(failed))
        } else {
            Err(DeployError::PartialDelete {
                deleted: report.deleted,
                failed,
            })
        }
    }

    /// 管理ラベルを持つアプリケーションの一覧
    ///
    /// Service や公開リソースの取得に失敗した項目は省略する。
    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<AppInfo>> {
        let ns = namespace
            .filter(|n| !n.is_empty())
            .unwrap_or(self.settings.namespace.as_str());
        let selector = format!("{}={}", MANAGED_BY_LABEL, self.settings.managed_by);
        let deployments = self.cluster.list_deployments(ns, &selector).await?;

        let mut apps = Vec::with_capacity(deployments.len());
        for deployment in deployments {
            let Some(name) = deployment.metadata.name.clone() else {
                continue;
            };
            let mut info = app_info(ns, &name, &deployment);

            match self.cluster.get_service(ns, &name).await {
                Ok(Some(service)) => {
                    info.service_name = service.metadata.name.clone();
                    info.port = service
                        .spec
                        .and_then(|s| s.ports)
                        .and_then(|p| p.first().map(|p| p.port));
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("Service lookup for {}/{} failed: {}", ns, name, e),
            }

            let exposure = deployment
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(EXPOSURE_ANNOTATION))
                .and_then(|k| k.parse::<ExposureKind>().ok());
            if let Some(kind) = exposure {
                match self.cluster.get_exposure(ns, kind, &name).await {
                    Ok(found) => info.external_url = found.and_then(|e| e.url()),
                    Err(e) => {
                        tracing::debug!("Exposure lookup for {}/{} failed: {}", ns, name, e)
                    }
                }
            }
            apps.push(info);
        }
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(apps)
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(DeployError::Cancelled)
    } else {
        Ok(())
    }
}

fn ready_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

fn app_info(namespace: &str, name: &str, deployment: &Deployment) -> AppInfo {
    let replicas = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(0);
    let ready = ready_replicas(deployment);
    let image = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.image.clone())
        .unwrap_or_default();
    let status = if replicas == 0 {
        "stopped"
    } else if ready >= replicas {
        "ready"
    } else {
        "progressing"
    };

    AppInfo {
        name: name.to_string(),
        namespace: namespace.to_string(),
        image,
        replicas,
        ready_replicas: ready,
        status: status.to_string(),
        service_name: None,
        port: None,
        external_url: None,
        labels: deployment.metadata.labels.clone().unwrap_or_default(),
        created_at: deployment.metadata.creation_timestamp.as_ref().map(|t| t.0),
    }
}
