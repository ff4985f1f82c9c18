use crate::context::ContextBuilder;
use crate::engine::{ContainerEngine, EngineBuildRequest, ImageDetails, ImageSummary};
use crate::error::{BuildError, Result};
use crate::job::{self, JobClient, JobOutcome, JobRef, KanikoJob};
use crate::pusher::validate_tag;
use crate::source::{SourceFetcher, SourceType};
use serde::{Deserialize, Serialize};
use shipflow_config::BuildSettings;
use shipflow_core::{Classify, Failure, image_reference, millis, split_image_tag};
use shipflow_git::{Credentials, GitRef};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStrategy {
    /// ローカルのコンテナエンジンでビルド
    #[default]
    Local,
    /// クラスタ内の kaniko ジョブでビルド
    Cluster,
}

impl std::str::FromStr for BuildStrategy {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "docker" => Ok(BuildStrategy::Local),
            "cluster" | "kaniko" | "openshift" => Ok(BuildStrategy::Cluster),
            other => Err(BuildError::InvalidConfig(format!(
                "unknown build strategy '{}' (expected local or cluster)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    pub source_type: SourceType,
    pub source: String,
    pub git_ref: Option<GitRef>,
    pub credentials: Option<Credentials>,
    /// ソースルートからの Dockerfile パス
    pub dockerfile: String,
    /// ソースルートからのコンテキストディレクトリ
    pub build_context: String,
    pub image_name: String,
    pub tags: Vec<String>,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub platform: Option<String>,
    pub no_cache: bool,
    pub pull: bool,
    pub strategy: BuildStrategy,
    /// クラスタビルドのジョブ namespace（省略時は設定値）
    pub namespace: Option<String>,
    /// クラスタビルドでプッシュに使う `.dockerconfigjson` Secret
    pub registry_secret: Option<String>,
}

impl BuildConfig {
    pub fn new(source_type: SourceType, source: &str, image_name: &str) -> Self {
        Self {
            source_type,
            source: source.to_string(),
            image_name: image_name.to_string(),
            ..Default::default()
        }
    }

    fn dockerfile(&self) -> &str {
        match self.dockerfile.trim() {
            "" => "Dockerfile",
            d => d,
        }
    }

    /// 付与するイメージ参照（先頭がメイン）
    pub fn references(&self) -> Result<Vec<String>> {
        if self.image_name.trim().is_empty() {
            return Err(BuildError::InvalidConfig("image name is required".to_string()));
        }
        let (repository, tag) = split_image_tag(self.image_name.trim());
        let has_explicit_tag = repository.len() < self.image_name.trim().len();

        let extra: Vec<String> = self
            .tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        let mut tags = Vec::new();
        if has_explicit_tag || extra.is_empty() {
            tags.push(tag);
        }
        tags.extend(extra);

        let mut references = Vec::new();
        for tag in tags {
            validate_tag(&tag)?;
            let reference = image_reference(&repository, &tag);
            if !references.contains(&reference) {
                references.push(reference);
            }
        }
        Ok(references)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub full_image_name: String,
    pub references: Vec<String>,
    pub image_id: Option<String>,
    pub strategy: BuildStrategy,
    /// クラスタビルドで投入したジョブ
    pub job: Option<JobRef>,
    pub duration: Duration,
    pub duration_ms: u64,
    pub logs: Vec<String>,
    pub success: bool,
    pub error: Option<Failure>,
}

struct Built {
    references: Vec<String>,
    image_id: Option<String>,
    job: Option<JobRef>,
}

pub struct ImageBuilder {
    engine: Arc<dyn ContainerEngine>,
    fetcher: SourceFetcher,
    jobs: Option<Arc<dyn JobClient>>,
    settings: BuildSettings,
    managed_by: String,
}

impl ImageBuilder {
    pub fn new(engine: Arc<dyn ContainerEngine>, fetcher: SourceFetcher, settings: BuildSettings) -> Self {
        Self {
            engine,
            fetcher,
            jobs: None,
            settings,
            managed_by: "shipflow".to_string(),
        }
    }

    /// クラスタビルド用のジョブクライアントを設定
    pub fn with_job_client(mut self, jobs: Arc<dyn JobClient>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_managed_by(mut self, managed_by: impl Into<String>) -> Self {
        self.managed_by = managed_by.into();
        self
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// イメージをビルド
    ///
    /// 失敗しても `BuildResult` を返し、取得できたログは保持する。
    pub async fn build(&self, config: &BuildConfig, cancel: &CancellationToken) -> BuildResult {
        let started = Instant::now();
        let mut logs = Vec::new();

        let outcome = match config.strategy {
            BuildStrategy::Local => self.build_local(config, &mut logs, cancel).await,
            BuildStrategy::Cluster => self.submit_cluster(config, &mut logs).await,
        };

        let duration = started.elapsed();
        match outcome {
            Ok(built) => BuildResult {
                full_image_name: built.references.first().cloned().unwrap_or_default(),
                references: built.references,
                image_id: built.image_id,
                strategy: config.strategy,
                job: built.job,
                duration,
                duration_ms: millis(duration),
                logs,
                success: true,
                error: None,
            },
            Err(e) => {
                tracing::warn!("Build of {} failed: {}", config.image_name, e);
                BuildResult {
                    full_image_name: config.references().ok().and_then(|r| r.into_iter().next()).unwrap_or_default(),
                    references: Vec::new(),
                    image_id: None,
                    strategy: config.strategy,
                    job: None,
                    duration,
                    duration_ms: millis(duration),
                    logs,
                    success: false,
                    error: Some(e.to_failure()),
                }
            }
        }
    }

    async fn build_local(
        &self,
        config: &BuildConfig,
        logs: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Built> {
        let references = config.references()?;
        let Some(primary) = references.first().cloned() else {
            return Err(BuildError::InvalidConfig("no image reference to build".to_string()));
        };

        // 一時ディレクトリは source の破棄時に削除される
        let source = self
            .fetcher
            .prepare(
                config.source_type,
                &config.source,
                config.git_ref.as_ref(),
                config.credentials.as_ref(),
            )
            .await?;

        let context_dir = resolve_within(source.path(), &config.build_context);
        let dockerfile = resolve_within(source.path(), config.dockerfile());
        if !context_dir.is_dir() {
            return Err(BuildError::ContextNotFound(context_dir));
        }
        if !dockerfile.is_file() {
            return Err(BuildError::DockerfileNotFound(dockerfile));
        }

        let context = tokio::task::spawn_blocking(move || {
            ContextBuilder::create_context(&context_dir, &dockerfile)
        })
        .await
        .map_err(|e| BuildError::Io(std::io::Error::other(e.to_string())))??;

        let mut labels: std::collections::HashMap<String, String> =
            config.labels.clone().into_iter().collect();
        labels
            .entry(shipflow_core::MANAGED_BY_LABEL.to_string())
            .or_insert_with(|| self.managed_by.clone());

        let request = EngineBuildRequest {
            context: context.archive,
            dockerfile: context.dockerfile,
            tag: primary.clone(),
            build_args: config.build_args.clone().into_iter().collect(),
            labels,
            platform: config.platform.clone().filter(|p| !p.is_empty()),
            no_cache: config.no_cache,
            pull: config.pull,
        };
        logs.push(format!(
            "Building {} from {} source at {}",
            primary,
            source_label(config.source_type),
            source.path().display()
        ));

        let image_id = tokio::select! {
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
            result = self.engine.build(request, logs) => result?,
        };

        for extra in references.iter().skip(1) {
            self.engine.tag(&primary, extra).await?;
            logs.push(format!("Tagged {}", extra));
        }

        Ok(Built {
            references,
            image_id,
            job: None,
        })
    }

    async fn submit_cluster(&self, config: &BuildConfig, logs: &mut Vec<String>) -> Result<Built> {
        let jobs = self.jobs.as_ref().ok_or_else(|| {
            BuildError::ClusterUnavailable("no cluster connection configured".to_string())
        })?;
        if config.source_type != SourceType::Git {
            return Err(BuildError::InvalidConfig(
                "cluster builds require a git source".to_string(),
            ));
        }
        let references = config.references()?;
        let namespace = config
            .namespace
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.settings.namespace.clone());

        let manifest = job::kaniko_job(&KanikoJob {
            namespace: &namespace,
            executor_image: &self.settings.kaniko_image,
            git_url: &config.source,
            git_ref: config.git_ref.as_ref(),
            dockerfile: config.dockerfile(),
            context_subpath: Some(config.build_context.as_str()),
            destinations: &references,
            build_args: &config.build_args,
            platform: config.platform.as_deref(),
            no_cache: config.no_cache,
            registry_secret: config.registry_secret.as_deref(),
            managed_by: &self.managed_by,
        });

        let job_ref = jobs.submit(manifest).await?;
        logs.push(format!("Submitted build job {}", job_ref));

        Ok(Built {
            references,
            image_id: None,
            job: Some(job_ref),
        })
    }

    /// クラスタビルドの完了を待つ
    pub async fn wait_for_completion(
        &self,
        job: &JobRef,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        let jobs = self.jobs.as_ref().ok_or_else(|| {
            BuildError::ClusterUnavailable("no cluster connection configured".to_string())
        })?;
        job::wait_for_completion(
            jobs.as_ref(),
            job,
            timeout.unwrap_or_else(|| self.settings.job_timeout()),
            self.settings.job_poll(),
            cancel,
        )
        .await
    }

    pub async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        self.engine.list().await
    }

    pub async fn inspect_image(&self, reference: &str) -> Result<ImageDetails> {
        self.engine
            .inspect(reference)
            .await?
            .ok_or_else(|| BuildError::ImageNotFound(reference.to_string()))
    }

    pub async fn remove_image(&self, reference: &str, force: bool) -> Result<()> {
        self.engine.remove(reference, force).await
    }
}

fn source_label(source_type: SourceType) -> &'static str {
    match source_type {
        SourceType::Local => "local",
        SourceType::Git => "git",
        SourceType::Url => "url",
    }
}

/// ソースルートからの相対パスを解決（絶対パスはそのまま）
fn resolve_within(root: &Path, relative: &str) -> PathBuf {
    let relative = relative.trim();
    if relative.is_empty() || relative == "." {
        return root.to_path_buf();
    }
    let path = Path::new(relative);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::testing::{FakeEngine, FakeJobClient};
    use shipflow_core::ErrorKind;
    use shipflow_git::testing::FakeGit;
    use std::fs;

    fn builder(engine: &Arc<FakeEngine>, git: &Arc<FakeGit>) -> ImageBuilder {
        ImageBuilder::new(
            engine.clone(),
            SourceFetcher::new(git.clone()),
            BuildSettings::default(),
        )
    }

    fn local_project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM alpine\nCOPY . /app").unwrap();
        fs::write(dir.path().join("app.py"), "print('hi')").unwrap();
        dir
    }

    #[test]
    fn test_references() {
        let mut config = BuildConfig::new(SourceType::Local, ".", "quay.io/acme/widget");
        assert_eq!(config.references().unwrap(), vec!["quay.io/acme/widget:latest"]);

        config.tags = vec!["v1".to_string(), "latest".to_string()];
        assert_eq!(
            config.references().unwrap(),
            vec!["quay.io/acme/widget:v1", "quay.io/acme/widget:latest"]
        );

        config.image_name = "quay.io/acme/widget:abc12345".to_string();
        assert_eq!(
            config.references().unwrap(),
            vec![
                "quay.io/acme/widget:abc12345",
                "quay.io/acme/widget:v1",
                "quay.io/acme/widget:latest"
            ]
        );

        config.image_name = String::new();
        assert!(config.references().is_err());
    }

    #[test]
    fn test_references_ignore_blank_tags() {
        let mut config = BuildConfig::new(SourceType::Local, ".", "widget");
        config.tags = vec![String::new(), "  ".to_string()];
        assert_eq!(config.references().unwrap(), vec!["widget:latest"]);

        config.tags.push("v2".to_string());
        assert_eq!(config.references().unwrap(), vec!["widget:v2"]);
    }

    #[tokio::test]
    async fn test_build_with_blank_tags_uses_default_tag() {
        let engine = Arc::new(FakeEngine::new());
        let git = Arc::new(FakeGit::new());
        let project = local_project();

        let mut config = BuildConfig::new(
            SourceType::Local,
            &project.path().to_string_lossy(),
            "widget",
        );
        config.tags = vec![String::new()];
        let result = builder(&engine, &git).build(&config, &CancellationToken::new()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.full_image_name, "widget:latest");
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("docker".parse::<BuildStrategy>().unwrap(), BuildStrategy::Local);
        assert_eq!("openshift".parse::<BuildStrategy>().unwrap(), BuildStrategy::Cluster);
        assert!("podman-remote".parse::<BuildStrategy>().is_err());
    }

    #[tokio::test]
    async fn test_local_build_tags_all_references() {
        let engine = Arc::new(FakeEngine::new());
        let git = Arc::new(FakeGit::new());
        let project = local_project();

        let mut config = BuildConfig::new(
            SourceType::Local,
            &project.path().to_string_lossy(),
            "widget",
        );
        config.tags = vec!["abc12345".to_string(), "latest".to_string()];
        config.build_args.insert("VERSION".to_string(), "1".to_string());
        config.no_cache = true;

        let result = builder(&engine, &git).build(&config, &CancellationToken::new()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.full_image_name, "widget:abc12345");
        assert!(engine.has_image("widget:abc12345"));
        assert!(engine.has_image("widget:latest"));
        assert!(!result.logs.is_empty());

        let request = engine.last_build().unwrap();
        assert_eq!(request.dockerfile, "Dockerfile");
        assert_eq!(request.build_args.get("VERSION").map(String::as_str), Some("1"));
        assert!(request.no_cache);
        assert_eq!(
            request.labels.get(shipflow_core::MANAGED_BY_LABEL).map(String::as_str),
            Some("shipflow")
        );
        // ローカルソースは削除しない
        assert!(project.path().join("app.py").exists());
    }

    #[tokio::test]
    async fn test_failed_build_keeps_logs() {
        let engine = Arc::new(FakeEngine::new());
        engine.fail_build("RUN make returned a non-zero code: 2");
        let git = Arc::new(FakeGit::new());
        let project = local_project();

        let config = BuildConfig::new(
            SourceType::Local,
            &project.path().to_string_lossy(),
            "widget:dev",
        );
        let result = builder(&engine, &git).build(&config, &CancellationToken::new()).await;

        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Build);
        assert!(result.logs.iter().any(|l| l.contains("non-zero code")));
    }

    #[tokio::test]
    async fn test_missing_dockerfile_is_validation_error() {
        let engine = Arc::new(FakeEngine::new());
        let git = Arc::new(FakeGit::new());
        let project = tempfile::tempdir().unwrap();

        let config = BuildConfig::new(
            SourceType::Local,
            &project.path().to_string_lossy(),
            "widget",
        );
        let result = builder(&engine, &git).build(&config, &CancellationToken::new()).await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_git_build_removes_scratch_dir_on_success_and_failure() {
        let engine = Arc::new(FakeEngine::new());
        let git = Arc::new(FakeGit::new());
        git.add_file("Dockerfile", "FROM alpine");
        let builder = builder(&engine, &git);

        let mut config = BuildConfig::new(
            SourceType::Git,
            "https://github.com/acme/widget.git",
            "quay.io/acme/widget:abc12345",
        );
        config.git_ref = Some(GitRef::Commit("abc12345ffff".to_string()));

        let result = builder.build(&config, &CancellationToken::new()).await;
        assert!(result.success, "{:?}", result.error);
        let scratch = git.clones()[0].2.clone();
        assert!(!scratch.exists());
        assert!(
            scratch
                .parent()
                .unwrap()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(crate::source::SCRATCH_PREFIX)
        );

        engine.fail_build("boom");
        let result = builder.build(&config, &CancellationToken::new()).await;
        assert!(!result.success);
        let scratch = git.clones()[1].2.clone();
        assert!(!scratch.parent().unwrap().exists());
    }

    /// ビルドログに記録されたソースディレクトリ
    fn source_dir(logs: &[String]) -> std::path::PathBuf {
        let line = logs
            .iter()
            .find(|l| l.starts_with("Building "))
            .expect("build log names the source");
        let (_, path) = line.rsplit_once(" at ").expect("source path in log");
        std::path::PathBuf::from(path)
    }

    #[tokio::test]
    async fn test_url_build_removes_scratch_dir_on_success_and_failure() {
        let archive = crate::testing::tar_gz(&[
            ("widget-main/Dockerfile", "FROM alpine"),
            ("widget-main/app.py", "print('hi')"),
        ]);
        let url = crate::testing::serve_archive(archive).await;

        let engine = Arc::new(FakeEngine::new());
        let git = Arc::new(FakeGit::new());
        let fetcher = SourceFetcher::new(git.clone())
            .with_http_client(reqwest::Client::builder().no_proxy().build().unwrap());
        let builder = ImageBuilder::new(engine.clone(), fetcher, BuildSettings::default());
        let config = BuildConfig::new(SourceType::Url, &url, "widget:v1");

        let result = builder.build(&config, &CancellationToken::new()).await;
        assert!(result.success, "{:?}", result.error);
        let source = source_dir(&result.logs);
        assert!(source.ends_with("widget-main"));
        assert!(!source.exists());
        let scratch = source.parent().unwrap().parent().unwrap();
        assert!(
            scratch
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(crate::source::SCRATCH_PREFIX)
        );
        assert!(!scratch.exists());

        engine.fail_build("boom");
        let result = builder.build(&config, &CancellationToken::new()).await;
        assert!(!result.success);
        let source = source_dir(&result.logs);
        assert!(!source.parent().unwrap().parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_git_clone_failure() {
        let engine = Arc::new(FakeEngine::new());
        let git = Arc::new(FakeGit::new());
        git.fail_clone(true);

        let config = BuildConfig::new(
            SourceType::Git,
            "https://github.com/acme/widget.git",
            "widget",
        );
        let result = builder(&engine, &git).build(&config, &CancellationToken::new()).await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::Clone);
    }

    #[tokio::test]
    async fn test_cancelled_build() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_build_delay(Duration::from_secs(30));
        let git = Arc::new(FakeGit::new());
        let project = local_project();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let config = BuildConfig::new(
            SourceType::Local,
            &project.path().to_string_lossy(),
            "widget",
        );
        let result = builder(&engine, &git).build(&config, &cancel).await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_cluster_build_submits_job() {
        let engine = Arc::new(FakeEngine::new());
        let git = Arc::new(FakeGit::new());
        let jobs = Arc::new(FakeJobClient::new());
        let builder = builder(&engine, &git).with_job_client(jobs.clone());

        let mut config = BuildConfig::new(
            SourceType::Git,
            "https://github.com/acme/widget.git",
            "quay.io/acme/widget:abc12345",
        );
        config.strategy = BuildStrategy::Cluster;

        let result = builder.build(&config, &CancellationToken::new()).await;
        assert!(result.success, "{:?}", result.error);
        let job = result.job.unwrap();
        assert_eq!(job.namespace, "shipflow-builds");
        assert_eq!(jobs.submitted().len(), 1);
        // ローカルではビルドしない
        assert!(engine.last_build().is_none());

        jobs.set_states(&job.name, vec![JobState::Succeeded]);
        let outcome = builder
            .wait_for_completion(&job, Some(Duration::from_secs(1)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_cluster_build_requires_git_source() {
        let engine = Arc::new(FakeEngine::new());
        let git = Arc::new(FakeGit::new());
        let builder = builder(&engine, &git).with_job_client(Arc::new(FakeJobClient::new()));

        let mut config = BuildConfig::new(SourceType::Local, "/tmp", "widget");
        config.strategy = BuildStrategy::Cluster;
        let result = builder.build(&config, &CancellationToken::new()).await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::Validation);
    }
}
