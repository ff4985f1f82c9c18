//! アプリケーションのデプロイと管理のツール

use super::{ParamSpec, ParamType, ToolHandler, ToolOutput, ToolSpec};
use crate::error::{EngineError, Result};
use crate::params::Params;
use async_trait::async_trait;
use serde_json::json;
use shipflow_config::{DeploySettings, ExposureKind, ResourceQuantity};
use shipflow_core::split_image_tag;
use shipflow_deploy::{DeployConfig, Deployer, ResourceSpec};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct AppTools {
    deployer: Option<Arc<Deployer>>,
    settings: DeploySettings,
    cancel: CancellationToken,
}

impl AppTools {
    /// `deployer` が無い場合、`app_manifests` 以外はクラスタ未接続エラーを返す
    pub fn new(
        deployer: Option<Arc<Deployer>>,
        settings: DeploySettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            deployer,
            settings,
            cancel,
        }
    }

    fn deployer(&self) -> Result<&Deployer> {
        self.deployer.as_deref().ok_or_else(|| {
            EngineError::ClusterUnavailable("no cluster connection configured".to_string())
        })
    }
}

/// イメージ参照の最後のパス要素をアプリ名にする
pub(crate) fn app_name_from_image(image: &str) -> String {
    let (repository, _) = split_image_tag(image);
    repository
        .rsplit('/')
        .next()
        .unwrap_or(&repository)
        .to_ascii_lowercase()
        .replace(['_', '.'], "-")
}

fn resources(params: &Params, defaults: &DeploySettings) -> ResourceSpec {
    let quantity = |cpu: &str, memory: &str, fallback: &ResourceQuantity| {
        match (params.str(cpu), params.str(memory)) {
            (None, None) => None,
            (cpu, memory) => Some(ResourceQuantity {
                cpu: cpu.unwrap_or_else(|| fallback.cpu.clone()),
                memory: memory.unwrap_or_else(|| fallback.memory.clone()),
            }),
        }
    };
    ResourceSpec {
        requests: quantity("cpu_request", "memory_request", &defaults.requests),
        limits: quantity("cpu_limit", "memory_limit", &defaults.limits),
    }
}

fn deploy_config(params: &Params, settings: &DeploySettings) -> Result<DeployConfig> {
    let image = params
        .str("image")
        .or_else(|| params.str("image_name"))
        .ok_or_else(|| EngineError::MissingParam("image".to_string()))?;
    let name = params
        .str("name")
        .or_else(|| params.str("app_name"))
        .unwrap_or_else(|| app_name_from_image(&image));

    let exposure_kind = params
        .str("exposure_kind")
        .map(|kind| {
            kind.parse::<ExposureKind>()
                .map_err(|e| EngineError::invalid("exposure_kind", e))
        })
        .transpose()?;

    Ok(DeployConfig {
        name,
        namespace: params.str("namespace"),
        image,
        tag: params.str("tag"),
        replicas: params.i32("replicas")?,
        port: params.i32("port")?,
        service_type: params.str("service_type"),
        resources: resources(params, settings),
        expose_externally: params.flag("expose")?,
        exposure_domain: params.str("domain"),
        exposure_kind,
        env_vars: params.map("env_vars")?,
        labels: params.map("labels")?,
        annotations: params.map("annotations")?,
        health_path: params.str("health_path"),
    })
}

fn deploy_params() -> Vec<ParamSpec> {
    use ParamSpec as P;
    use ParamType as T;
    vec![
        P::optional("image", T::String, "Container image (or image_name)"),
        P::optional("name", T::String, "Application name (default: derived from image)"),
        P::optional("namespace", T::String, "Target namespace"),
        P::optional("tag", T::String, "Image tag overriding the one in image"),
        P::optional("replicas", T::Integer, "Desired replicas"),
        P::optional("port", T::Integer, "Container port"),
        P::optional("service_type", T::String, "Service type (default: ClusterIP)"),
        P::optional("cpu_request", T::String, "CPU request, e.g. 100m"),
        P::optional("memory_request", T::String, "Memory request, e.g. 256Mi"),
        P::optional("cpu_limit", T::String, "CPU limit"),
        P::optional("memory_limit", T::String, "Memory limit"),
        P::optional("expose", T::Boolean, "Create an external Route or Ingress"),
        P::optional("domain", T::String, "Domain for the external host"),
        P::optional("exposure_kind", T::String, "route or ingress"),
        P::optional("env_vars", T::Map, "Environment variables"),
        P::optional("labels", T::Map, "Additional labels"),
        P::optional("annotations", T::Map, "Additional annotations"),
        P::optional("health_path", T::String, "HTTP path for readiness and liveness probes"),
    ]
}

#[async_trait]
impl ToolHandler for AppTools {
    fn specs(&self) -> Vec<ToolSpec> {
        use ParamSpec as P;
        use ParamType as T;
        vec![
            ToolSpec::new(
                "app_deploy",
                "Deploy or update an application (Deployment, Service and optional Route/Ingress)",
                deploy_params(),
            ),
            ToolSpec::new(
                "app_manifests",
                "Render the Deployment, Service and optional Route/Ingress as YAML without applying them",
                deploy_params(),
            ),
            ToolSpec::new(
                "app_list",
                "List applications managed by shipflow",
                vec![P::optional("namespace", T::String, "Namespace (default: configured namespace)")],
            ),
            ToolSpec::new(
                "app_delete",
                "Delete an application's Deployment, Service and exposure",
                vec![
                    P::required("name", T::String, "Application name"),
                    P::optional("namespace", T::String, "Namespace (default: configured namespace)"),
                ],
            ),
        ]
    }

    async fn call(&self, tool: &str, params: &Params) -> Result<ToolOutput> {
        if tool == "app_manifests" {
            let config = deploy_config(params, &self.settings)?;
            let rendered = config.render(&self.settings)?;
            return Ok(ToolOutput::ok(rendered));
        }

        let deployer = self.deployer()?;
        match tool {
            "app_deploy" => {
                let config = deploy_config(params, &self.settings)?;
                let result = deployer.deploy(&config, &self.cancel).await;
                let (success, error) = (result.success, result.error.clone());
                Ok(ToolOutput::outcome(result, success, error))
            }
            "app_list" => {
                let namespace = params.str("namespace");
                let apps = deployer.list(namespace.as_deref()).await?;
                Ok(ToolOutput::ok(json!({ "count": apps.len(), "applications": apps })))
            }
            "app_delete" => {
                let name = params.required_str("name")?;
                let namespace = params.str("namespace");
                let report = deployer
                    .delete(namespace.as_deref(), &name, &self.cancel)
                    .await?;
                Ok(ToolOutput::ok(report))
            }
            other => Err(EngineError::UnknownTool(other.to_string())),
        }
    }
}
