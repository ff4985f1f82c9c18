//! パイプライン管理
//!
//! リポジトリとビルド・プッシュ・デプロイ設定を結び付け、コミット検知または
//! 手動トリガーで `pending → building → pushing → deploying → success` の順に実行する。
//! 失敗したステージで停止し、その時点の状態を記録する。
//! 同じパイプラインの実行はパイプラインごとのロックで直列化される。

use crate::error::{EngineError, Result};
use crate::tools::registry::push_config;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipflow_build::{BuildConfig, ImageBuilder, RegistryPusher, SourceType};
use shipflow_core::{ErrorKind, Failure, image_reference, short_hash, split_image_tag};
use shipflow_deploy::{DeployConfig, Deployer};
use shipflow_git::{CommitEvent, CommitListener, Credentials, GitRef, RepoWatcher};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// モデル
// ============================================================================

/// 実行状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Building,
    BuildFailed,
    Pushing,
    PushFailed,
    Deploying,
    DeployFailed,
    Success,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Building => "building",
            Status::BuildFailed => "build_failed",
            Status::Pushing => "pushing",
            Status::PushFailed => "push_failed",
            Status::Deploying => "deploying",
            Status::DeployFailed => "deploy_failed",
            Status::Success => "success",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::BuildFailed
                | Status::PushFailed
                | Status::DeployFailed
                | Status::Success
                | Status::Failed
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 実行のきっかけ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Commit,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub status: Status,
    pub at: DateTime<Utc>,
}

/// 1 回の実行記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    /// コミットハッシュ、または手動実行の識別子
    pub commit: String,
    pub tag: String,
    pub trigger: Trigger,
    pub status: Status,
    pub transitions: Vec<Transition>,
    pub image: Option<String>,
    pub external_url: Option<String>,
    pub error: Option<Failure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    fn new(id: String, commit: &str, trigger: Trigger) -> Self {
        let tag = match trigger {
            Trigger::Commit => short_hash(commit),
            Trigger::Manual => commit.to_string(),
        };
        let now = Utc::now();
        Self {
            id,
            commit: commit.to_string(),
            tag,
            trigger,
            status: Status::Pending,
            transitions: vec![Transition {
                status: Status::Pending,
                at: now,
            }],
            image: None,
            external_url: None,
            error: None,
            started_at: now,
            finished_at: None,
        }
    }

    fn transition(&mut self, status: Status) {
        self.status = status;
        self.transitions.push(Transition {
            status,
            at: Utc::now(),
        });
        if status.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    fn fail(&mut self, status: Status, error: Failure) {
        self.error = Some(error);
        self.transition(status);
    }

    /// 状態遷移の列
    pub fn statuses(&self) -> Vec<Status> {
        self.transitions.iter().map(|t| t.status).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Pipeline {
    pub name: String,
    pub git_url: String,
    pub git_branch: String,
    /// タグなしのイメージ名（タグが付いていても実行時のタグで置き換える）
    pub image_name: String,
    /// レジストリプロファイル名またはレジストリホスト
    pub registry: Option<String>,
    pub deploy_namespace: String,
    pub dockerfile: String,
    pub build_args: BTreeMap<String, String>,
    pub env_vars: BTreeMap<String, String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub last_status: Option<Status>,
    pub last_run: Option<PipelineRun>,
    #[serde(skip)]
    pub credentials: Option<Credentials>,
    /// このパイプラインの作成時に監視を追加したか
    #[serde(skip)]
    owns_watch: bool,
}

impl Pipeline {
    pub fn new(name: &str, git_url: &str, image_name: &str, deploy_namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            git_url: git_url.to_string(),
            git_branch: "main".to_string(),
            image_name: image_name.to_string(),
            registry: None,
            deploy_namespace: deploy_namespace.to_string(),
            dockerfile: "Dockerfile".to_string(),
            build_args: BTreeMap::new(),
            env_vars: BTreeMap::new(),
            active: true,
            created_at: Utc::now(),
            last_execution_time: None,
            last_status: None,
            last_run: None,
            credentials: None,
            owns_watch: false,
        }
    }

    fn watches(&self, url: &str, branch: &str) -> bool {
        self.git_url == url && self.git_branch == branch
    }

    fn validate(&mut self) -> Result<()> {
        self.name = self.name.trim().to_string();
        self.git_url = self.git_url.trim().to_string();
        self.image_name = self.image_name.trim().to_string();
        self.deploy_namespace = self.deploy_namespace.trim().to_string();
        self.git_branch = match self.git_branch.trim() {
            "" => "main".to_string(),
            branch => branch.to_string(),
        };
        if self.dockerfile.trim().is_empty() {
            self.dockerfile = "Dockerfile".to_string();
        }

        if !is_dns_label(&self.name) {
            return Err(EngineError::InvalidPipeline(format!(
                "'{}' is not a valid pipeline name (lowercase letters, digits and '-')",
                self.name
            )));
        }
        if self.git_url.is_empty() {
            return Err(EngineError::InvalidPipeline("git_url is required".to_string()));
        }
        if self.image_name.is_empty() {
            return Err(EngineError::InvalidPipeline("image_name is required".to_string()));
        }
        if !is_dns_label(&self.deploy_namespace) {
            return Err(EngineError::InvalidPipeline(format!(
                "'{}' is not a valid deploy namespace",
                self.deploy_namespace
            )));
        }
        Ok(())
    }
}

fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

// ============================================================================
// 実行ハンドル
// ============================================================================

/// 起動した実行の完了を待つためのハンドル
pub struct RunHandle {
    pipeline: String,
    run_id: String,
    handle: JoinHandle<PipelineRun>,
}

impl RunHandle {
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn wait(self) -> PipelineRun {
        match self.handle.await {
            Ok(run) => run,
            Err(e) => {
                let mut run = PipelineRun::new(self.run_id, "", Trigger::Manual);
                run.fail(
                    Status::Failed,
                    Failure::new(ErrorKind::Engine, format!("pipeline task aborted: {}", e)),
                );
                run
            }
        }
    }
}

/// 独立したタスクで実行し、パニックを `Failure` に変換する
pub(crate) async fn isolate<F>(future: F) -> std::result::Result<PipelineRun, Failure>
where
    F: Future<Output = PipelineRun> + Send + 'static,
{
    match tokio::spawn(future).await {
        Ok(run) => Ok(run),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Failure::new(
                ErrorKind::Engine,
                format!("pipeline execution panicked: {}", message),
            ))
        }
        Err(e) => Err(Failure::new(
            ErrorKind::Cancelled,
            format!("pipeline execution cancelled: {}", e),
        )),
    }
}

// ============================================================================
// マネージャー
// ============================================================================

struct Inner {
    watcher: Arc<RepoWatcher>,
    builder: Arc<ImageBuilder>,
    pusher: Arc<RegistryPusher>,
    deployer: Option<Arc<Deployer>>,
    pipelines: Mutex<BTreeMap<String, Pipeline>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct PipelineManager {
    inner: Arc<Inner>,
}

impl PipelineManager {
    /// マネージャーを作成し、ウォッチャーのコミット通知を購読する
    pub async fn new(
        watcher: Arc<RepoWatcher>,
        builder: Arc<ImageBuilder>,
        pusher: Arc<RegistryPusher>,
        deployer: Option<Arc<Deployer>>,
        cancel: CancellationToken,
    ) -> Self {
        let manager = Self {
            inner: Arc::new(Inner {
                watcher,
                builder,
                pusher,
                deployer,
                pipelines: Mutex::new(BTreeMap::new()),
                locks: Mutex::new(HashMap::new()),
                cancel,
            }),
        };
        manager
            .inner
            .watcher
            .subscribe(Arc::new(manager.clone()))
            .await;
        manager
    }

    fn pipelines(&self) -> MutexGuard<'_, BTreeMap<String, Pipeline>> {
        self.inner.pipelines()
    }

    /// パイプラインを作成し、必要ならリポジトリを監視対象に追加する
    pub async fn create(&self, mut pipeline: Pipeline) -> Result<Pipeline> {
        pipeline.validate()?;
        if self.pipelines().contains_key(&pipeline.name) {
            return Err(EngineError::PipelineExists(pipeline.name));
        }

        let watcher = &self.inner.watcher;
        if !watcher
            .is_watched(&pipeline.git_url, &pipeline.git_branch)
            .await
        {
            watcher
                .add(
                    &pipeline.git_url,
                    &pipeline.git_branch,
                    pipeline.credentials.clone(),
                )
                .await?;
            pipeline.owns_watch = true;
        }

        let inserted = {
            let mut pipelines = self.pipelines();
            if pipelines.contains_key(&pipeline.name) {
                false
            } else {
                pipeline.created_at = Utc::now();
                pipelines.insert(pipeline.name.clone(), pipeline.clone());
                true
            }
        };
        if !inserted {
            if pipeline.owns_watch {
                watcher.remove(&pipeline.git_url, &pipeline.git_branch).await;
            }
            return Err(EngineError::PipelineExists(pipeline.name));
        }

        tracing::info!(
            "Created pipeline {} for {} ({})",
            pipeline.name,
            pipeline.git_url,
            pipeline.git_branch
        );
        Ok(pipeline)
    }

    pub fn list(&self) -> Vec<Pipeline> {
        self.pipelines().values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Pipeline> {
        self.pipelines().get(name).cloned()
    }

    /// パイプラインを削除する
    ///
    /// 作成時に追加した監視は、同じリポジトリを使う他のパイプラインが無ければ解除する。
    pub async fn delete(&self, name: &str) -> Result<Pipeline> {
        let (removed, unwatch) = {
            let mut pipelines = self.pipelines();
            let removed = pipelines
                .remove(name)
                .ok_or_else(|| EngineError::PipelineNotFound(name.to_string()))?;
            let heir = pipelines
                .values_mut()
                .find(|p| p.watches(&removed.git_url, &removed.git_branch));
            let unwatch = match heir {
                Some(heir) => {
                    heir.owns_watch |= removed.owns_watch;
                    false
                }
                None => removed.owns_watch,
            };
            (removed, unwatch)
        };

        if unwatch {
            self.inner
                .watcher
                .remove(&removed.git_url, &removed.git_branch)
                .await;
        }
        {
            // 実行中・待機中の実行が残っていればロックを引き継ぐ
            let mut locks = self.inner.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.get(name).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(name);
            }
        }
        tracing::info!("Deleted pipeline {}", name);
        Ok(removed)
    }

    pub fn set_active(&self, name: &str, active: bool) -> Result<Pipeline> {
        let mut pipelines = self.pipelines();
        let pipeline = pipelines
            .get_mut(name)
            .ok_or_else(|| EngineError::PipelineNotFound(name.to_string()))?;
        pipeline.active = active;
        Ok(pipeline.clone())
    }

    /// 手動で実行する（識別子は `manual-<unix 秒>`）
    pub fn trigger(&self, name: &str) -> Result<RunHandle> {
        let pipeline = self
            .get(name)
            .ok_or_else(|| EngineError::PipelineNotFound(name.to_string()))?;
        let sentinel = format!("manual-{}", Utc::now().timestamp());
        tracing::info!("Manually triggered pipeline {} ({})", name, sentinel);
        Ok(self.spawn_run(pipeline, sentinel, Trigger::Manual))
    }

    /// 実行を独立したタスクとして起動する
    pub fn spawn_run(&self, pipeline: Pipeline, commit: String, trigger: Trigger) -> RunHandle {
        let inner = self.inner.clone();
        let name = pipeline.name.clone();
        let run_id = uuid::Uuid::new_v4().to_string();
        let lock = inner.lock_for(&name);

        let task_name = name.clone();
        let task_id = run_id.clone();
        let handle = tokio::spawn(async move {
            let _guard = lock.lock().await;
            // 待機中に変更された設定を反映する（削除後に作り直されたものは別物）
            let created_at = pipeline.created_at;
            let pipeline = inner
                .snapshot(&task_name)
                .filter(|current| current.created_at == created_at)
                .unwrap_or(pipeline);

            let outcome = isolate(inner.clone().execute(
                pipeline,
                task_id.clone(),
                commit.clone(),
                trigger,
            ))
            .await;
            match outcome {
                Ok(run) => run,
                Err(failure) => {
                    tracing::error!("Pipeline {}: {}", task_name, failure.message);
                    let mut run = inner
                        .current_run(&task_name, created_at, &task_id)
                        .unwrap_or_else(|| PipelineRun::new(task_id.clone(), &commit, trigger));
                    run.fail(Status::Failed, failure);
                    inner.record(&task_name, created_at, &run);
                    run
                }
            }
        });

        RunHandle {
            pipeline: name,
            run_id,
            handle,
        }
    }
}

#[async_trait]
impl CommitListener for PipelineManager {
    async fn on_commit(&self, event: &CommitEvent) -> anyhow::Result<()> {
        let matching: Vec<Pipeline> = self
            .pipelines()
            .values()
            .filter(|p| p.active && p.watches(&event.repo_url, &event.branch))
            .cloned()
            .collect();
        for pipeline in matching {
            tracing::info!(
                "Commit {} triggers pipeline {}",
                short_hash(&event.commit_hash),
                pipeline.name
            );
            // 完了は待たない
            let _ = self.spawn_run(pipeline, event.commit_hash.clone(), Trigger::Commit);
        }
        Ok(())
    }
}

impl Inner {
    fn pipelines(&self) -> MutexGuard<'_, BTreeMap<String, Pipeline>> {
        self.pipelines.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn snapshot(&self, name: &str) -> Option<Pipeline> {
        self.pipelines().get(name).cloned()
    }

    fn current_run(
        &self,
        name: &str,
        created_at: DateTime<Utc>,
        run_id: &str,
    ) -> Option<PipelineRun> {
        self.pipelines()
            .get(name)
            .filter(|p| p.created_at == created_at)
            .and_then(|p| p.last_run.clone())
            .filter(|run| run.id == run_id)
    }

    /// 実行状態をパイプラインに記録
    ///
    /// 削除済み、または同名で作り直されたパイプラインには記録しない。
    fn record(&self, name: &str, created_at: DateTime<Utc>, run: &PipelineRun) {
        tracing::info!("Pipeline {} [{}]: {}", name, run.tag, run.status);
        if let Some(pipeline) = self
            .pipelines()
            .get_mut(name)
            .filter(|p| p.created_at == created_at)
        {
            pipeline.last_status = Some(run.status);
            pipeline.last_execution_time = Some(Utc::now());
            pipeline.last_run = Some(run.clone());
        }
    }

    async fn execute(
        self: Arc<Self>,
        pipeline: Pipeline,
        run_id: String,
        commit: String,
        trigger: Trigger,
    ) -> PipelineRun {
        let mut run = PipelineRun::new(run_id, &commit, trigger);
        let name = pipeline.name.as_str();
        let created_at = pipeline.created_at;
        self.record(name, created_at, &run);

        // ビルド
        run.transition(Status::Building);
        self.record(name, created_at, &run);
        let (repository, _) = split_image_tag(&pipeline.image_name);
        let mut build = BuildConfig::new(
            SourceType::Git,
            &pipeline.git_url,
            &image_reference(&repository, &run.tag),
        );
        build.git_ref = Some(match trigger {
            Trigger::Commit => GitRef::Commit(commit.clone()),
            Trigger::Manual => GitRef::Branch(pipeline.git_branch.clone()),
        });
        build.credentials = pipeline.credentials.clone();
        build.dockerfile = pipeline.dockerfile.clone();
        build.build_args = pipeline.build_args.clone();
        build
            .labels
            .insert("shipflow.dev/pipeline".to_string(), pipeline.name.clone());

        let built = self.builder.build(&build, &self.cancel).await;
        if !built.success {
            let error = built
                .error
                .unwrap_or_else(|| Failure::new(ErrorKind::Build, "build failed"));
            run.fail(Status::BuildFailed, error);
            self.record(name, created_at, &run);
            return run;
        }

        // プッシュ
        run.transition(Status::Pushing);
        self.record(name, created_at, &run);
        let mut push = push_config(
            self.pusher.store(),
            &built.full_image_name,
            Some(repository.clone()),
            pipeline.registry.as_deref(),
        );
        push.target_tag = Some(run.tag.clone());
        push.additional_tags = vec!["latest".to_string()];

        let pushed = self.pusher.push(&push, &self.cancel).await;
        let image = match pushed.pushed_references.first() {
            Some(image) if pushed.success => image.clone(),
            _ => {
                let error = pushed
                    .error
                    .unwrap_or_else(|| Failure::new(ErrorKind::Engine, "push failed"));
                run.fail(Status::PushFailed, error);
                self.record(name, created_at, &run);
                return run;
            }
        };
        run.image = Some(image.clone());

        // デプロイ
        run.transition(Status::Deploying);
        self.record(name, created_at, &run);
        let Some(deployer) = self.deployer.as_ref() else {
            run.fail(
                Status::DeployFailed,
                Failure::new(ErrorKind::Cluster, "cluster features are not available"),
            );
            self.record(name, created_at, &run);
            return run;
        };
        let mut deploy = DeployConfig::new(&pipeline.name, &pipeline.deploy_namespace, &image);
        deploy.env_vars = pipeline.env_vars.clone();

        let deployed = deployer.deploy(&deploy, &self.cancel).await;
        if !deployed.success {
            let error = deployed
                .error
                .unwrap_or_else(|| Failure::new(ErrorKind::Cluster, "deploy failed"));
            run.fail(Status::DeployFailed, error);
            self.record(name, created_at, &run);
            return run;
        }
        run.external_url = deployed.external_url;
        run.transition(Status::Success);
        self.record(name, created_at, &run);
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipflow_build::testing::FakeEngine;
    use shipflow_build::{DockerConfigAuth, RegistryProfile, RegistryStore, SourceFetcher};
    use shipflow_config::{BuildSettings, DeploySettings};
    use shipflow_deploy::testing::MemoryCluster;
    use shipflow_git::testing::FakeGit;
    use std::time::Duration;

    const URL: &str = "https://git.example.com/acme/widget.git";
    const FIRST: &str = "aaaaaaaa11111111";
    const SECOND: &str = "bbbbbbbb22222222";

    struct Harness {
        git: Arc<FakeGit>,
        engine: Arc<FakeEngine>,
        cluster: Arc<MemoryCluster>,
        store: Arc<RegistryStore>,
        watcher: Arc<RepoWatcher>,
        manager: PipelineManager,
        _docker_config: tempfile::TempDir,
    }

    async fn harness_with_cluster(with_cluster: bool) -> Harness {
        let git = Arc::new(FakeGit::new());
        git.set_head(URL, "main", FIRST);
        git.add_file("Dockerfile", "FROM alpine\n");

        let engine = Arc::new(FakeEngine::new());
        let builder = ImageBuilder::new(
            engine.clone(),
            SourceFetcher::new(git.clone()),
            BuildSettings::default(),
        );
        let docker_config = tempfile::tempdir().unwrap();
        let store = Arc::new(RegistryStore::new());
        let pusher = RegistryPusher::new(engine.clone(), store.clone()).with_docker_auth(
            DockerConfigAuth::with_config_path(docker_config.path().join("config.json")),
        );
        let cluster = Arc::new(MemoryCluster::new());
        let deployer = with_cluster.then(|| {
            Arc::new(
                Deployer::new(cluster.clone(), DeploySettings::default())
                    .with_readiness(Duration::from_millis(200), Duration::from_millis(5)),
            )
        });
        let watcher = Arc::new(RepoWatcher::new(git.clone()));
        let manager = PipelineManager::new(
            watcher.clone(),
            Arc::new(builder),
            Arc::new(pusher),
            deployer,
            CancellationToken::new(),
        )
        .await;

        Harness {
            git,
            engine,
            cluster,
            store,
            watcher,
            manager,
            _docker_config: docker_config,
        }
    }

    async fn harness() -> Harness {
        harness_with_cluster(true).await
    }

    fn widget() -> Pipeline {
        Pipeline::new("widget", URL, "quay.io/acme/widget", "demo")
    }

    async fn wait_for_status(manager: &PipelineManager, name: &str) -> PipelineRun {
        for _ in 0..200 {
            if let Some(run) = manager.get(name).and_then(|p| p.last_run)
                && run.status.is_terminal()
            {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pipeline {} did not finish", name);
    }

    #[tokio::test]
    async fn test_successful_run_transitions() {
        let h = harness().await;
        h.manager.create(widget()).await.unwrap();

        let run = h.manager.trigger("widget").unwrap().wait().await;
        assert_eq!(
            run.statuses(),
            vec![
                Status::Pending,
                Status::Building,
                Status::Pushing,
                Status::Deploying,
                Status::Success
            ]
        );
        assert!(run.tag.starts_with("manual-"));
        assert_eq!(
            run.image.as_deref(),
            Some(format!("quay.io/acme/widget:{}", run.tag).as_str())
        );
        assert!(h.engine.has_image("quay.io/acme/widget:latest"));
        assert_eq!(h.cluster.deployment_count("demo"), 1);

        let pipeline = h.manager.get("widget").unwrap();
        assert_eq!(pipeline.last_status, Some(Status::Success));
        assert!(pipeline.last_execution_time.is_some());
    }

    #[tokio::test]
    async fn test_push_failure_stops_before_deploy() {
        let h = harness().await;
        h.engine.require_auth("bot", "secret");
        h.store
            .add(RegistryProfile::new("quay", "quay.io", "bot", "wrong"))
            .unwrap();
        let mut pipeline = widget();
        pipeline.registry = Some("quay".to_string());
        h.manager.create(pipeline).await.unwrap();

        let run = h.manager.trigger("widget").unwrap().wait().await;
        assert_eq!(run.status, Status::PushFailed);
        assert!(!run.statuses().contains(&Status::Deploying));
        assert_eq!(run.error.as_ref().unwrap().kind, ErrorKind::Auth);
        // ビルド済みのイメージは残る
        assert!(h.engine.has_image(&format!("quay.io/acme/widget:{}", run.tag)));
        assert_eq!(h.cluster.deployment_count("demo"), 0);
    }

    #[tokio::test]
    async fn test_build_failure() {
        let h = harness().await;
        h.engine.fail_build("RUN make: exit code 2");
        h.manager.create(widget()).await.unwrap();

        let run = h.manager.trigger("widget").unwrap().wait().await;
        assert_eq!(
            run.statuses(),
            vec![Status::Pending, Status::Building, Status::BuildFailed]
        );
        assert_eq!(run.error.unwrap().kind, ErrorKind::Build);
        assert!(h.engine.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_deploy_without_cluster_fails_at_deploy() {
        let h = harness_with_cluster(false).await;
        h.manager.create(widget()).await.unwrap();

        let run = h.manager.trigger("widget").unwrap().wait().await;
        assert_eq!(run.status, Status::DeployFailed);
        assert_eq!(run.error.unwrap().kind, ErrorKind::Cluster);
    }

    #[tokio::test]
    async fn test_commit_triggers_run() {
        let h = harness().await;
        h.manager.create(widget()).await.unwrap();

        h.git.set_head(URL, "main", SECOND);
        let event = h.watcher.check_now(URL, "main").await.unwrap();
        assert!(event.is_some());

        let run = wait_for_status(&h.manager, "widget").await;
        assert_eq!(run.status, Status::Success);
        assert_eq!(run.trigger, Trigger::Commit);
        assert_eq!(run.commit, SECOND);
        assert_eq!(run.tag, "bbbbbbbb");
        assert_eq!(
            h.git.clones().last().unwrap().1,
            Some(GitRef::Commit(SECOND.to_string()))
        );
    }

    #[tokio::test]
    async fn test_inactive_pipeline_ignores_commits() {
        let h = harness().await;
        h.manager.create(widget()).await.unwrap();
        h.manager.set_active("widget", false).unwrap();

        h.git.set_head(URL, "main", SECOND);
        h.watcher.check_now(URL, "main").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(h.manager.get("widget").unwrap().last_run.is_none());
        assert_eq!(h.engine.builds(), 0);
    }

    #[tokio::test]
    async fn test_runs_of_one_pipeline_do_not_overlap() {
        let h = harness().await;
        h.engine.set_build_delay(Duration::from_millis(50));
        h.manager.create(widget()).await.unwrap();

        let first = h.manager.trigger("widget").unwrap();
        let second = h.manager.trigger("widget").unwrap();
        let (a, b) = tokio::join!(first.wait(), second.wait());

        assert_eq!(a.status, Status::Success);
        assert_eq!(b.status, Status::Success);
        let (earlier, later) = if a.started_at <= b.started_at { (a, b) } else { (b, a) };
        assert!(earlier.finished_at.unwrap() <= later.started_at);
    }

    #[tokio::test]
    async fn test_recreated_pipeline_waits_for_previous_run() {
        let h = harness().await;
        h.engine.set_build_delay(Duration::from_millis(80));
        h.manager.create(widget()).await.unwrap();

        let first = h.manager.trigger("widget").unwrap();
        h.manager.delete("widget").await.unwrap();
        h.manager.create(widget()).await.unwrap();
        let second = h.manager.trigger("widget").unwrap();
        let second_id = second.run_id().to_string();

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(a.status, Status::Success);
        assert_eq!(b.status, Status::Success);
        assert!(a.finished_at.unwrap() <= b.started_at);

        // 削除前の実行は作り直したパイプラインに記録されない
        let pipeline = h.manager.get("widget").unwrap();
        assert_eq!(pipeline.last_run.unwrap().id, second_id);
    }

    #[tokio::test]
    async fn test_panicking_run_is_recorded_as_failed() {
        let h = harness().await;
        h.engine.panic_on_build("engine state corrupted");
        h.manager.create(widget()).await.unwrap();

        let run = h.manager.trigger("widget").unwrap().wait().await;
        assert_eq!(run.status, Status::Failed);
        let error = run.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Engine);
        assert!(error.message.contains("engine state corrupted"));

        let pipeline = h.manager.get("widget").unwrap();
        assert_eq!(pipeline.last_status, Some(Status::Failed));
        let recorded = pipeline.last_run.unwrap();
        assert_eq!(recorded.id, run.id);
        assert_eq!(
            recorded.statuses(),
            vec![Status::Pending, Status::Building, Status::Failed]
        );

        // パニック後も同じパイプラインを再実行できる
        let again = h.manager.trigger("widget").unwrap().wait().await;
        assert_eq!(again.status, Status::Failed);
    }

    #[tokio::test]
    async fn test_panic_is_converted_to_failure() {
        let outcome = isolate(async {
            let run: Option<PipelineRun> = None;
            run.expect("boom")
        })
        .await;
        let failure = outcome.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Engine);
        assert!(failure.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_create_validation() {
        let h = harness().await;

        let err = h
            .manager
            .create(Pipeline::new("Widget_1", URL, "widget", "demo"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidPipeline(_)));

        let err = h
            .manager
            .create(Pipeline::new("widget", URL, " ", "demo"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidPipeline(_)));

        h.manager.create(widget()).await.unwrap();
        let err = h.manager.create(widget()).await.unwrap_err();
        assert!(matches!(err, EngineError::PipelineExists(_)));

        let unreachable = Pipeline::new("other", "https://git.example.com/missing.git", "x", "demo");
        let err = h.manager.create(unreachable).await.unwrap_err();
        assert_eq!(shipflow_core::Classify::kind(&err), ErrorKind::Fetch);
        assert_eq!(h.manager.list().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_unwatches_unused_repository() {
        let h = harness().await;
        h.manager.create(widget()).await.unwrap();
        let mut twin = widget();
        twin.name = "widget-staging".to_string();
        twin.deploy_namespace = "staging".to_string();
        h.manager.create(twin).await.unwrap();

        h.manager.delete("widget").await.unwrap();
        assert!(h.watcher.is_watched(URL, "main").await);

        h.manager.delete("widget-staging").await.unwrap();
        assert!(!h.watcher.is_watched(URL, "main").await);

        assert!(matches!(
            h.manager.delete("widget").await,
            Err(EngineError::PipelineNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_keeps_watch_added_elsewhere() {
        let h = harness().await;
        h.watcher.add(URL, "main", None).await.unwrap();
        h.manager.create(widget()).await.unwrap();

        h.manager.delete("widget").await.unwrap();
        assert!(h.watcher.is_watched(URL, "main").await);
    }
}
