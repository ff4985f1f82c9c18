//! レジストリ認証プロファイルとプッシュのツール

use super::{ParamSpec, ParamType, ToolHandler, ToolOutput, ToolSpec};
use crate::error::{EngineError, Result};
use crate::params::Params;
use async_trait::async_trait;
use serde_json::json;
use shipflow_build::{PushConfig, RegistryProfile, RegistryPusher, RegistryStore};
use shipflow_core::{extract_registry, has_registry_host, qualify_image};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct RegistryTools {
    pusher: Arc<RegistryPusher>,
    cancel: CancellationToken,
}

impl RegistryTools {
    pub fn new(pusher: Arc<RegistryPusher>, cancel: CancellationToken) -> Self {
        Self { pusher, cancel }
    }

    fn store(&self) -> &RegistryStore {
        self.pusher.store()
    }

    async fn push(&self, params: &Params) -> Result<ToolOutput> {
        let source_image = params
            .str("source_image")
            .or_else(|| params.str("image"))
            .or_else(|| params.str("image_name"))
            .ok_or_else(|| EngineError::MissingParam("source_image".to_string()))?;

        let mut config = push_config(
            self.store(),
            &source_image,
            params.str("target_image"),
            params.str("registry").as_deref(),
        );
        config.target_tag = params.str("target_tag");
        config.additional_tags = params.list("additional_tags");
        config.additional_tags.extend(params.list("tags"));

        let username = params.str("username");
        let password = params.str("password");
        if username.is_some() || password.is_some() {
            let target = config.target_image.as_deref().unwrap_or(&source_image);
            let url = params
                .str("registry_url")
                .unwrap_or_else(|| extract_registry(target));
            config.credentials = Some(RegistryProfile::new(
                "inline",
                &url,
                username.as_deref().unwrap_or(""),
                password.as_deref().unwrap_or(""),
            ));
        }

        let result = self.pusher.push(&config, &self.cancel).await;
        let (success, error) = (result.success, result.error.clone());
        Ok(ToolOutput::outcome(result, success, error))
    }
}

/// ホスト名らしい文字列か（名前付きプロファイルと区別する）
fn looks_like_host(value: &str) -> bool {
    value.contains('.') || value.contains(':') || value == "localhost"
}

/// プッシュ先を決定する
///
/// `registry` が登録済みプロファイル名ならそれを使い、ホスト名ならプッシュ先の
/// イメージ名をそのホストで修飾する。それ以外は名前として渡し、未登録エラーにする。
pub(crate) fn push_config(
    store: &RegistryStore,
    source_image: &str,
    target_image: Option<String>,
    registry: Option<&str>,
) -> PushConfig {
    let mut config = PushConfig {
        source_image: source_image.to_string(),
        target_image,
        ..Default::default()
    };

    let Some(registry) = registry.map(str::trim).filter(|r| !r.is_empty()) else {
        return config;
    };
    if store.get(registry).is_none() && looks_like_host(registry) {
        let target = config
            .target_image
            .take()
            .unwrap_or_else(|| source_image.to_string());
        config.target_image = Some(if has_registry_host(&target) {
            target
        } else {
            qualify_image(&target, registry)
        });
        return config;
    }
    config.registry = Some(registry.to_string());
    config
}

#[async_trait]
impl ToolHandler for RegistryTools {
    fn specs(&self) -> Vec<ToolSpec> {
        use ParamSpec as P;
        use ParamType as T;
        vec![
            ToolSpec::new(
                "registry_add",
                "Register named registry credentials (kept in memory only)",
                vec![
                    P::required("name", T::String, "Profile name"),
                    P::required("url", T::String, "Registry host, e.g. quay.io"),
                    P::optional("username", T::String, "Registry username"),
                    P::optional("password", T::String, "Registry password or token"),
                    P::optional("email", T::String, "Account email"),
                    P::optional("insecure", T::Boolean, "Allow plain HTTP"),
                ],
            ),
            ToolSpec::new(
                "registry_remove",
                "Remove named registry credentials",
                vec![P::required("name", T::String, "Profile name")],
            ),
            ToolSpec::new(
                "registry_list",
                "List registry profiles with passwords redacted",
                vec![],
            ),
            ToolSpec::new(
                "image_push",
                "Push a local image to a container registry",
                vec![
                    P::optional("source_image", T::String, "Local image reference (or image / image_name)"),
                    P::optional("target_image", T::String, "Target image name (default: source image)"),
                    P::optional("target_tag", T::String, "Primary tag (default: source tag)"),
                    P::optional("additional_tags", T::List, "Extra tags pushed independently"),
                    P::optional("registry", T::String, "Registry profile name or registry host"),
                    P::optional("username", T::String, "Inline registry username"),
                    P::optional("password", T::String, "Inline registry password"),
                    P::optional("registry_url", T::String, "Registry host for inline credentials"),
                ],
            ),
        ]
    }

    async fn call(&self, tool: &str, params: &Params) -> Result<ToolOutput> {
        match tool {
            "registry_add" => {
                let mut profile = RegistryProfile::new(
                    &params.required_str("name")?,
                    &params.required_str("url")?,
                    params.str("username").as_deref().unwrap_or(""),
                    params.str("password").as_deref().unwrap_or(""),
                );
                profile.email = params.str("email");
                profile.insecure = params.flag("insecure")?;
                self.store().add(profile.clone())?;
                Ok(ToolOutput::ok(profile.redacted()))
            }
            "registry_remove" => {
                let name = params.required_str("name")?;
                let removed = self.store().remove(&name);
                Ok(ToolOutput::ok(json!({ "name": name, "removed": removed })))
            }
            "registry_list" => {
                let registries = self.store().list();
                Ok(ToolOutput::ok(json!({
                    "count": registries.len(),
                    "registries": registries,
                })))
            }
            "image_push" => self.push(params).await,
            other => Err(EngineError::UnknownTool(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolRegistry;
    use shipflow_build::DockerConfigAuth;
    use shipflow_build::testing::FakeEngine;
    use shipflow_core::ErrorKind;

    struct Setup {
        engine: Arc<FakeEngine>,
        registry: ToolRegistry,
        _docker_config: tempfile::TempDir,
    }

    fn setup() -> Setup {
        let engine = Arc::new(FakeEngine::new());
        let docker_config = tempfile::tempdir().unwrap();
        let pusher = RegistryPusher::new(engine.clone(), Arc::new(RegistryStore::new()))
            .with_docker_auth(DockerConfigAuth::with_config_path(
                docker_config.path().join("config.json"),
            ));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(RegistryTools::new(
            Arc::new(pusher),
            CancellationToken::new(),
        )));
        Setup {
            engine,
            registry,
            _docker_config: docker_config,
        }
    }

    fn params(pairs: &[&str]) -> Params {
        Params::from_pairs(pairs).unwrap()
    }

    #[tokio::test]
    async fn test_registry_profiles_are_redacted() {
        let setup = setup();
        let add = params(&["name=quay", "url=quay.io", "username=bot", "password=secret"]);
        let output = setup.registry.call("registry_add", &add).await;
        assert!(output.success, "{:?}", output.error);
        assert_eq!(output.data["password"], "***");

        let output = setup.registry.call("registry_list", &Params::new()).await;
        assert_eq!(output.data["count"], 1);
        assert_eq!(output.data["registries"][0]["password"], "***");

        let output = setup.registry.call("registry_remove", &params(&["name=quay"])).await;
        assert_eq!(output.data["removed"], true);
    }

    #[tokio::test]
    async fn test_push_with_named_profile() {
        let setup = setup();
        setup.engine.add_image("widget:abc123");
        setup.engine.require_auth("bot", "secret");
        setup
            .registry
            .call(
                "registry_add",
                &params(&["name=quay", "url=quay.io", "username=bot", "password=secret"]),
            )
            .await;

        let push = params(&[
            "source_image=widget:abc123",
            "target_image=acme/widget",
            "registry=quay",
            "additional_tags=latest",
        ]);
        let output = setup.registry.call("image_push", &push).await;
        assert!(output.success, "{:?}", output.error);
        assert_eq!(
            output.data["pushed_references"],
            json!(["quay.io/acme/widget:abc123", "quay.io/acme/widget:latest"])
        );
        assert!(output.data["duration_ms"].is_u64());
    }

    #[tokio::test]
    async fn test_push_to_registry_host_with_inline_credentials() {
        let setup = setup();
        setup.engine.add_image("widget:v1");
        setup.engine.require_auth("bot", "secret");

        let push = params(&[
            "source_image=widget:v1",
            "registry=registry.example.com",
            "username=bot",
            "password=secret",
        ]);
        let output = setup.registry.call("image_push", &push).await;
        assert!(output.success, "{:?}", output.error);
        assert_eq!(
            output.data["pushed_references"][0],
            "registry.example.com/widget:v1"
        );
    }

    #[tokio::test]
    async fn test_push_errors() {
        let setup = setup();
        setup.engine.add_image("widget:v1");

        let output = setup
            .registry
            .call("image_push", &params(&["source_image=widget:v1", "registry=missing"]))
            .await;
        assert_eq!(output.error.unwrap().kind, ErrorKind::NotFound);

        let output = setup
            .registry
            .call(
                "image_push",
                &params(&["source_image=widget:v1", "registry=quay.io", "username=bot"]),
            )
            .await;
        assert!(!output.success);
        assert_eq!(output.error.unwrap().kind, ErrorKind::Auth);

        let output = setup.registry.call("image_push", &Params::new()).await;
        assert_eq!(output.error.unwrap().kind, ErrorKind::Validation);
    }

    #[test]
    fn test_push_config_resolution() {
        let store = RegistryStore::new();
        store
            .add(RegistryProfile::new("internal", "registry.internal:5000", "u", "p"))
            .unwrap();

        let config = push_config(&store, "widget:v1", None, Some("internal"));
        assert_eq!(config.registry.as_deref(), Some("internal"));
        assert!(config.target_image.is_none());

        let config = push_config(&store, "widget:v1", None, Some("quay.io"));
        assert!(config.registry.is_none());
        assert_eq!(config.target_image.as_deref(), Some("quay.io/widget:v1"));

        let config = push_config(&store, "widget:v1", Some("ghcr.io/acme/widget".into()), Some("quay.io"));
        assert_eq!(config.target_image.as_deref(), Some("ghcr.io/acme/widget"));
    }
}
