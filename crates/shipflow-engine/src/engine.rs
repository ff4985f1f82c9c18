//! エンジン全体の組み立て
//!
//! ウォッチャー・ビルダー・プッシャー・デプロイヤー・パイプライン・ワークフローを
//! 1つのインスタンスにまとめ、ツールレジストリとして公開する。

use crate::error::Result;
use crate::params::Params;
use crate::pipeline::PipelineManager;
use crate::tools::{
    AppTools, GitTools, ImageTools, PipelineTools, RegistryTools, ToolOutput, ToolRegistry,
    ToolSpec,
};
use crate::workflow::{WorkflowOrchestrator, WorkflowTools};
use serde_json::{Map, Value};
use shipflow_build::{
    ContainerEngine, DockerConfigAuth, DockerEngine, ImageBuilder, JobClient, KubeJobClient,
    RegistryPusher, RegistryStore, SourceFetcher,
};
use shipflow_config::EngineConfig;
use shipflow_deploy::{ClusterClient, Deployer, KubeCluster};
use shipflow_git::{GitCli, GitTransport, RepoWatcher};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// エンジンが利用する外部システムへの接続
pub struct EngineParts {
    pub git: Arc<dyn GitTransport>,
    pub container: Arc<dyn ContainerEngine>,
    /// 無い場合、デプロイとクラスタ内ビルドは利用できない
    pub cluster: Option<Arc<dyn ClusterClient>>,
    pub jobs: Option<Arc<dyn JobClient>>,
    /// 無い場合は `~/.docker/config.json` を使う
    pub docker_auth: Option<DockerConfigAuth>,
}

pub struct Engine {
    config: EngineConfig,
    watcher: Arc<RepoWatcher>,
    pipelines: PipelineManager,
    orchestrator: Arc<WorkflowOrchestrator>,
    tools: ToolRegistry,
    cancel: CancellationToken,
}

impl Engine {
    pub async fn new(config: EngineConfig, parts: EngineParts) -> Result<Self> {
        let cancel = CancellationToken::new();
        let watcher = Arc::new(RepoWatcher::new(parts.git.clone()));

        let mut builder = ImageBuilder::new(
            parts.container.clone(),
            SourceFetcher::new(parts.git),
            config.build.clone(),
        )
        .with_managed_by(config.deploy.managed_by.clone());
        if let Some(jobs) = parts.jobs {
            builder = builder.with_job_client(jobs);
        }
        let builder = Arc::new(builder);

        let mut pusher = RegistryPusher::new(parts.container, Arc::new(RegistryStore::new()));
        if let Some(docker_auth) = parts.docker_auth {
            pusher = pusher.with_docker_auth(docker_auth);
        }
        let pusher = Arc::new(pusher);

        let deployer = parts
            .cluster
            .map(|cluster| Arc::new(Deployer::new(cluster, config.deploy.clone())));

        let pipelines = PipelineManager::new(
            watcher.clone(),
            builder.clone(),
            pusher.clone(),
            deployer.clone(),
            cancel.clone(),
        )
        .await;

        // ワークフローのステップは workflow_* 以外のツールから選ぶ
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(GitTools::new(watcher.clone())));
        tools.register(Arc::new(ImageTools::new(builder, cancel.clone())));
        tools.register(Arc::new(RegistryTools::new(pusher, cancel.clone())));
        tools.register(Arc::new(AppTools::new(
            deployer,
            config.deploy.clone(),
            cancel.clone(),
        )));
        tools.register(Arc::new(PipelineTools::new(pipelines.clone())));

        let orchestrator = Arc::new(WorkflowOrchestrator::new(Arc::new(tools.clone()))?);
        tools.register(Arc::new(WorkflowTools::new(orchestrator.clone())));

        tracing::debug!("Engine initialized with {} tools", tools.names().len());
        Ok(Self {
            config,
            watcher,
            pipelines,
            orchestrator,
            tools,
            cancel,
        })
    }

    /// ローカルの git・Docker と kubeconfig のクラスタに接続する
    ///
    /// クラスタに接続できない場合はクラスタ機能なしで起動する。
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        let container: Arc<dyn ContainerEngine> = Arc::new(DockerEngine::connect()?);

        let (cluster, jobs) = match KubeCluster::connect().await {
            Ok(cluster) => {
                let jobs: Arc<dyn JobClient> = Arc::new(KubeJobClient::new(cluster.client().clone()));
                let cluster: Arc<dyn ClusterClient> = Arc::new(cluster);
                (Some(cluster), Some(jobs))
            }
            Err(e) => {
                tracing::warn!("Cluster unavailable, deploy and cluster builds disabled: {}", e);
                (None, None)
            }
        };

        let parts = EngineParts {
            git: Arc::new(GitCli::new()),
            container,
            cluster,
            jobs,
            docker_auth: None,
        };
        Self::new(config, parts).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.specs()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn pipelines(&self) -> &PipelineManager {
        &self.pipelines
    }

    pub fn orchestrator(&self) -> &Arc<WorkflowOrchestrator> {
        &self.orchestrator
    }

    /// ツールを呼び出す
    pub async fn call(&self, name: &str, arguments: Map<String, Value>) -> ToolOutput {
        self.tools.call(name, &Params::from(arguments)).await
    }

    /// ポーリングループを開始する。`shutdown` で停止する
    pub fn start_watcher(&self) -> JoinHandle<()> {
        let watcher = self.watcher.clone();
        let interval = self.config.poll_interval();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move { watcher.run(interval, cancel).await })
    }

    pub fn shutdown(&self) {
        tracing::info!("Shutting down engine");
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shipflow_build::testing::FakeEngine;
    use shipflow_core::ErrorKind;
    use shipflow_deploy::testing::MemoryCluster;
    use shipflow_git::testing::FakeGit;

    const URL: &str = "https://git.example.com/acme/widget.git";

    struct Setup {
        engine: Engine,
        container: Arc<FakeEngine>,
        cluster: Arc<MemoryCluster>,
        _docker_config: tempfile::TempDir,
    }

    async fn setup(with_cluster: bool) -> Setup {
        let git = Arc::new(FakeGit::new());
        git.set_head(URL, "main", "dddddddd44444444");
        git.add_file("Dockerfile", "FROM alpine\n");
        let container = Arc::new(FakeEngine::new());
        let cluster = Arc::new(MemoryCluster::new());
        let docker_config = tempfile::tempdir().unwrap();

        let mut config = EngineConfig::default();
        config.deploy.readiness_timeout_secs = 5;
        config.deploy.readiness_poll_secs = 1;

        let parts = EngineParts {
            git,
            container: container.clone(),
            cluster: with_cluster.then(|| cluster.clone() as Arc<dyn ClusterClient>),
            jobs: None,
            docker_auth: Some(DockerConfigAuth::with_config_path(
                docker_config.path().join("config.json"),
            )),
        };
        let engine = Engine::new(config, parts).await.unwrap();
        Setup {
            engine,
            container,
            cluster,
            _docker_config: docker_config,
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_all_tools_are_registered() {
        let setup = setup(true).await;
        let names: Vec<&str> = setup.engine.specs().iter().map(|s| s.name).collect();
        for expected in [
            "git_watch_add",
            "git_watch_remove",
            "git_watch_list",
            "git_poll_now",
            "image_build",
            "image_wait",
            "image_list",
            "image_inspect",
            "image_remove",
            "registry_add",
            "registry_remove",
            "registry_list",
            "image_push",
            "app_deploy",
            "app_manifests",
            "app_list",
            "app_delete",
            "pipeline_create",
            "pipeline_list",
            "pipeline_trigger",
            "pipeline_delete",
            "workflow_analyze",
            "workflow_execute",
            "workflow_list",
            "workflow_create",
        ] {
            assert!(names.contains(&expected), "missing {}", expected);
        }
        assert_eq!(names.len(), 25);
    }

    #[tokio::test]
    async fn test_workflow_runs_through_real_tools() {
        let setup = setup(true).await;
        let output = setup
            .engine
            .call(
                "workflow_execute",
                args(json!({
                    "prompt": format!("run the complete cicd flow for {}", URL),
                    "image_name": "widget:v1",
                    "namespace": "demo",
                })),
            )
            .await;
        assert!(output.success, "{:?}", output.error);
        assert_eq!(output.data["selected_workflow"], "complete_cicd");
        assert_eq!(setup.container.builds(), 1);
        assert!(setup.container.has_image("widget:v1"));
        assert_eq!(setup.container.pushes().len(), 1);
        assert_eq!(setup.cluster.deployment_count("demo"), 1);
        assert!(setup.cluster.deployment("demo", "widget").is_some());
    }

    #[tokio::test]
    async fn test_without_cluster_other_tools_work() {
        let setup = setup(false).await;
        let output = setup.engine.call("app_list", Map::new()).await;
        assert_eq!(output.error.unwrap().kind, ErrorKind::Cluster);

        let output = setup.engine.call("registry_list", Map::new()).await;
        assert!(output.success);
        assert_eq!(output.data["count"], 0);
    }

    #[tokio::test]
    async fn test_watcher_stops_on_shutdown() {
        let setup = setup(true).await;
        let handle = setup.engine.start_watcher();
        setup.engine.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
