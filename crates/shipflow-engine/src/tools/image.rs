//! イメージのビルドと管理のツール

use super::{ParamSpec, ParamType, ToolHandler, ToolOutput, ToolSpec};
use crate::error::{EngineError, Result};
use crate::params::Params;
use crate::tools::git::credentials_from;
use async_trait::async_trait;
use serde_json::json;
use shipflow_build::{BuildConfig, ImageBuilder, JobOutcome, JobRef, SourceType};
use shipflow_core::{ErrorKind, Failure};
use shipflow_git::GitRef;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct ImageTools {
    builder: Arc<ImageBuilder>,
    cancel: CancellationToken,
}

impl ImageTools {
    pub fn new(builder: Arc<ImageBuilder>, cancel: CancellationToken) -> Self {
        Self { builder, cancel }
    }

    async fn build(&self, params: &Params) -> Result<ToolOutput> {
        let config = build_config(params)?;
        let result = self.builder.build(&config, &self.cancel).await;
        let (success, error) = (result.success, result.error.clone());
        Ok(ToolOutput::outcome(result, success, error))
    }

    async fn wait(&self, params: &Params) -> Result<ToolOutput> {
        let job = params.required_str("job")?;
        let job = match job.split_once('/') {
            Some((namespace, name)) => JobRef {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            None => JobRef {
                namespace: params.str("namespace").ok_or_else(|| {
                    EngineError::invalid("job", "expected <namespace>/<name> or a namespace parameter")
                })?,
                name: job,
            },
        };
        let timeout = params.u64("timeout_secs")?.map(Duration::from_secs);

        let outcome = self
            .builder
            .wait_for_completion(&job, timeout, &self.cancel)
            .await?;
        let error = match &outcome {
            JobOutcome::Succeeded => None,
            JobOutcome::Failed(message) => Some(Failure::new(
                ErrorKind::Build,
                format!("build job {} failed: {}", job, message),
            )),
            JobOutcome::TimedOut => Some(Failure::new(
                ErrorKind::Timeout,
                format!("build job {} did not finish in time", job),
            )),
        };
        Ok(ToolOutput::outcome(
            json!({ "job": job, "outcome": outcome }),
            error.is_none(),
            error,
        ))
    }
}

/// ソース文字列から種類を推測する
pub(crate) fn infer_source_type(source: &str) -> SourceType {
    let source = source.trim();
    if source.starts_with("git@") || source.ends_with(".git") {
        SourceType::Git
    } else if source.starts_with("http://") || source.starts_with("https://") {
        let lower = source.to_ascii_lowercase();
        if lower.ends_with(".tar") || lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            SourceType::Url
        } else {
            SourceType::Git
        }
    } else {
        SourceType::Local
    }
}

fn build_config(params: &Params) -> Result<BuildConfig> {
    let source = params.required_str("source")?;
    let image_name = params.required_str("image_name")?;
    let source_type = match params.str("source_type") {
        Some(kind) => kind.parse()?,
        None => infer_source_type(&source),
    };

    let mut config = BuildConfig::new(source_type, &source, &image_name);
    config.git_ref = match (params.str("git_commit"), params.str("git_branch")) {
        (Some(commit), _) => Some(GitRef::Commit(commit)),
        (None, Some(branch)) => Some(GitRef::Branch(branch)),
        (None, None) => None,
    };
    config.credentials = credentials_from(params, "git_");
    if let Some(dockerfile) = params.str("dockerfile") {
        config.dockerfile = dockerfile;
    }
    if let Some(context) = params.str("build_context") {
        config.build_context = context;
    }
    config.tags = params.list("tags");
    config.build_args = params.map("build_args")?;
    config.labels = params.map("labels")?;
    config.platform = params.str("platform");
    config.no_cache = params.flag("no_cache")?;
    config.pull = params.flag("pull")?;
    if let Some(strategy) = params.str("strategy") {
        config.strategy = strategy.parse()?;
    }
    config.namespace = params.str("namespace");
    config.registry_secret = params.str("registry_secret");
    Ok(config)
}

/// `image` または `image_name`
fn image_param(params: &Params) -> Result<String> {
    params
        .str("image")
        .or_else(|| params.str("image_name"))
        .ok_or_else(|| EngineError::MissingParam("image".to_string()))
}

#[async_trait]
impl ToolHandler for ImageTools {
    fn specs(&self) -> Vec<ToolSpec> {
        use ParamSpec as P;
        use ParamType as T;
        vec![
            ToolSpec::new(
                "image_build",
                "Build a container image from a local path, git repository or archive URL",
                vec![
                    P::required("source", T::String, "Local path, git URL or archive URL"),
                    P::required("image_name", T::String, "Image name, optionally with a tag"),
                    P::optional("source_type", T::String, "local, git or url (inferred when omitted)"),
                    P::optional("tags", T::List, "Additional tags"),
                    P::optional("dockerfile", T::String, "Dockerfile path (default: Dockerfile)"),
                    P::optional("build_context", T::String, "Build context directory within the source"),
                    P::optional("build_args", T::Map, "Build arguments"),
                    P::optional("labels", T::Map, "Image labels"),
                    P::optional("platform", T::String, "Target platform, e.g. linux/amd64"),
                    P::optional("no_cache", T::Boolean, "Disable the build cache"),
                    P::optional("pull", T::Boolean, "Always pull base images"),
                    P::optional("strategy", T::String, "local (default) or cluster"),
                    P::optional("namespace", T::String, "Namespace for cluster builds"),
                    P::optional("registry_secret", T::String, "Push secret for cluster builds"),
                    P::optional("git_branch", T::String, "Branch to check out"),
                    P::optional("git_commit", T::String, "Commit to check out"),
                    P::optional("git_username", T::String, "Git HTTPS username"),
                    P::optional("git_password", T::String, "Git HTTPS password or token"),
                ],
            ),
            ToolSpec::new(
                "image_wait",
                "Wait for a cluster build job to finish",
                vec![
                    P::required("job", T::String, "Job reference as <namespace>/<name>"),
                    P::optional("namespace", T::String, "Namespace when job is a bare name"),
                    P::optional("timeout_secs", T::Integer, "Maximum wait in seconds"),
                ],
            ),
            ToolSpec::new(
                "image_list",
                "List local container images",
                vec![P::optional("filter", T::String, "Only images whose reference contains this text")],
            ),
            ToolSpec::new(
                "image_inspect",
                "Show details of a local container image",
                vec![
                    P::optional("image", T::String, "Image reference"),
                    P::optional("image_name", T::String, "Alias of image"),
                ],
            ),
            ToolSpec::new(
                "image_remove",
                "Remove a local container image",
                vec![
                    P::required("image", T::String, "Image reference"),
                    P::optional("force", T::Boolean, "Remove even if in use"),
                ],
            ),
        ]
    }

    async fn call(&self, tool: &str, params: &Params) -> Result<ToolOutput> {
        match tool {
            "image_build" => self.build(params).await,
            "image_wait" => self.wait(params).await,
            "image_list" => {
                let filter = params.str("filter");
                let images: Vec<_> = self
                    .builder
                    .list_images()
                    .await?
                    .into_iter()
                    .filter(|image| match &filter {
                        Some(f) => image.references.iter().any(|r| r.contains(f.as_str())),
                        None => true,
                    })
                    .collect();
                Ok(ToolOutput::ok(json!({ "count": images.len(), "images": images })))
            }
            "image_inspect" => {
                let image = image_param(params)?;
                Ok(ToolOutput::ok(self.builder.inspect_image(&image).await?))
            }
            "image_remove" => {
                let image = params.required_str("image")?;
                self.builder
                    .remove_image(&image, params.flag("force")?)
                    .await?;
                Ok(ToolOutput::ok(json!({ "image": image, "removed": true })))
            }
            other => Err(EngineError::UnknownTool(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolRegistry;
    use shipflow_build::testing::{FakeEngine, FakeJobClient};
    use shipflow_build::{JobState, SourceFetcher};
    use shipflow_config::BuildSettings;
    use shipflow_git::testing::FakeGit;

    struct Setup {
        engine: Arc<FakeEngine>,
        jobs: Arc<FakeJobClient>,
        registry: ToolRegistry,
    }

    fn setup() -> Setup {
        let engine = Arc::new(FakeEngine::new());
        let jobs = Arc::new(FakeJobClient::new());
        let settings = BuildSettings {
            job_poll_secs: 1,
            ..Default::default()
        };
        let builder = ImageBuilder::new(
            engine.clone(),
            SourceFetcher::new(Arc::new(FakeGit::new())),
            settings,
        )
        .with_job_client(jobs.clone());
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ImageTools::new(
            Arc::new(builder),
            CancellationToken::new(),
        )));
        Setup {
            engine,
            jobs,
            registry,
        }
    }

    #[test]
    fn test_infer_source_type() {
        assert_eq!(infer_source_type("https://github.com/acme/widget.git"), SourceType::Git);
        assert_eq!(infer_source_type("git@github.com:acme/widget.git"), SourceType::Git);
        assert_eq!(infer_source_type("https://example.com/src.tar.gz"), SourceType::Url);
        assert_eq!(infer_source_type("./app"), SourceType::Local);
    }

    #[test]
    fn test_build_config_from_params() {
        let params = Params::from_pairs([
            "source=https://github.com/acme/widget.git",
            "image_name=quay.io/acme/widget",
            "tags=v1,latest",
            "build_args=VERSION=1",
            "git_commit=abc123",
            "no_cache=true",
            "strategy=kaniko",
        ])
        .unwrap();
        let config = build_config(&params).unwrap();
        assert_eq!(config.source_type, SourceType::Git);
        assert_eq!(config.tags, vec!["v1", "latest"]);
        assert_eq!(config.git_ref, Some(GitRef::Commit("abc123".to_string())));
        assert_eq!(config.build_args.get("VERSION").map(String::as_str), Some("1"));
        assert!(config.no_cache);
        assert_eq!(config.strategy, shipflow_build::BuildStrategy::Cluster);

        let bad = Params::from_pairs(["source=.", "image_name=x", "source_type=svn"]).unwrap();
        assert!(build_config(&bad).is_err());
    }

    #[tokio::test]
    async fn test_build_local_source() {
        let setup = setup();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();

        let mut params = Params::new();
        params.insert("source", dir.path().to_string_lossy().to_string());
        params.insert("image_name", "widget:dev");
        let output = setup.registry.call("image_build", &params).await;
        assert!(output.success, "{:?}", output.error);
        assert_eq!(output.data["full_image_name"], "widget:dev");
        assert!(output.data["duration_ms"].is_u64());
        assert!(setup.engine.has_image("widget:dev"));
    }

    #[tokio::test]
    async fn test_build_failure_keeps_logs() {
        let setup = setup();
        setup.engine.fail_build("RUN make: exit code 2");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();

        let mut params = Params::new();
        params.insert("source", dir.path().to_string_lossy().to_string());
        params.insert("image_name", "widget:dev");
        let output = setup.registry.call("image_build", &params).await;
        assert!(!output.success);
        assert_eq!(output.error.unwrap().kind, ErrorKind::Build);
        assert!(!output.data["logs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_job() {
        let setup = setup();
        setup
            .jobs
            .set_states("build-widget", vec![JobState::Active, JobState::Succeeded]);
        let params = Params::from_pairs(["job=builds/build-widget", "timeout_secs=10"]).unwrap();
        let output = setup.registry.call("image_wait", &params).await;
        assert!(output.success, "{:?}", output.error);
        assert_eq!(output.data["outcome"]["status"], "succeeded");

        setup
            .jobs
            .set_states("broken", vec![JobState::Failed("BackoffLimitExceeded".to_string())]);
        let params = Params::from_pairs(["job=broken", "namespace=builds"]).unwrap();
        let output = setup.registry.call("image_wait", &params).await;
        assert!(!output.success);
        assert_eq!(output.error.unwrap().kind, ErrorKind::Build);

        let params = Params::from_pairs(["job=orphan"]).unwrap();
        let output = setup.registry.call("image_wait", &params).await;
        assert_eq!(output.error.unwrap().kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_list_inspect_remove() {
        let setup = setup();
        setup.engine.add_image("quay.io/acme/widget:v1");
        setup.engine.add_image("redis:7");

        let params = Params::from_pairs(["filter=widget"]).unwrap();
        let output = setup.registry.call("image_list", &params).await;
        assert_eq!(output.data["count"], 1);

        let params = Params::from_pairs(["image_name=quay.io/acme/widget:v1"]).unwrap();
        let output = setup.registry.call("image_inspect", &params).await;
        assert!(output.success, "{:?}", output.error);

        let output = setup.registry.call("image_inspect", &Params::new()).await;
        assert_eq!(output.error.unwrap().kind, ErrorKind::Validation);

        let params = Params::from_pairs(["image=redis:7"]).unwrap();
        assert!(setup.registry.call("image_remove", &params).await.success);
        assert!(!setup.engine.has_image("redis:7"));

        let output = setup.registry.call("image_inspect", &params).await;
        assert_eq!(output.error.unwrap().kind, ErrorKind::NotFound);
    }
}
