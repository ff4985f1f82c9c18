//! テスト用のインメモリエンジンとジョブクライアント

use crate::engine::{ContainerEngine, EngineBuildRequest, ImageDetails, ImageSummary};
use crate::error::{BuildError, Result};
use crate::job::{JobClient, JobRef, JobState};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use k8s_openapi::api::batch::v1::Job;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Default)]
struct EngineState {
    /// 参照 -> イメージ ID
    images: BTreeMap<String, String>,
    builds: Vec<EngineBuildRequest>,
    pushes: Vec<(String, Option<DockerCredentials>)>,
    push_attempts: usize,
    fail_build: Option<String>,
    fail_push: HashSet<String>,
    required_auth: Option<(String, String)>,
    build_delay: Option<Duration>,
    panic_build: Option<String>,
    next_id: usize,
}

/// イメージをメモリ上で管理するエンジン
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_image(&self, reference: &str) {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("sha256:{:064x}", state.next_id);
        state.images.insert(reference.to_string(), id);
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.state().images.contains_key(reference)
    }

    /// 以降のビルドを指定メッセージで失敗させる
    pub fn fail_build(&self, message: &str) {
        self.state().fail_build = Some(message.to_string());
    }

    /// 以降のビルドをパニックさせる
    pub fn panic_on_build(&self, message: &str) {
        self.state().panic_build = Some(message.to_string());
    }

    pub fn set_build_delay(&self, delay: Duration) {
        self.state().build_delay = Some(delay);
    }

    pub fn fail_push(&self, reference: &str) {
        self.state().fail_push.insert(reference.to_string());
    }

    /// プッシュに特定の認証情報を要求する
    pub fn require_auth(&self, username: &str, password: &str) {
        self.state().required_auth = Some((username.to_string(), password.to_string()));
    }

    /// 成功したプッシュ
    pub fn pushes(&self) -> Vec<(String, Option<DockerCredentials>)> {
        self.state().pushes.clone()
    }

    /// 失敗を含むプッシュ試行回数
    pub fn push_attempts(&self) -> usize {
        self.state().push_attempts
    }

    pub fn builds(&self) -> usize {
        self.state().builds.len()
    }

    pub fn last_build(&self) -> Option<EngineBuildRequest> {
        self.state().builds.last().cloned()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn build(
        &self,
        request: EngineBuildRequest,
        logs: &mut Vec<String>,
    ) -> Result<Option<String>> {
        let (delay, panic_message) = {
            let state = self.state();
            (state.build_delay, state.panic_build.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = panic_message {
            panic!("{}", message);
        }

        let mut state = self.state();
        logs.push("Step 1/2 : FROM alpine".to_string());
        state.builds.push(request.clone());
        if let Some(message) = state.fail_build.clone() {
            logs.push(message.clone());
            return Err(BuildError::BuildFailed(message));
        }

        state.next_id += 1;
        let id = format!("sha256:{:064x}", state.next_id);
        state.images.insert(request.tag.clone(), id.clone());
        logs.push(format!("Successfully tagged {}", request.tag));
        Ok(Some(id))
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let mut state = self.state();
        let id = state
            .images
            .get(source)
            .cloned()
            .ok_or_else(|| BuildError::ImageNotFound(source.to_string()))?;
        state.images.insert(target.to_string(), id);
        Ok(())
    }

    async fn push(
        &self,
        reference: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<Option<String>> {
        let mut state = self.state();
        state.push_attempts += 1;

        if state.fail_push.contains(reference) {
            return Err(BuildError::PushFailed {
                message: format!("blob upload unknown for {}", reference),
            });
        }
        if let Some((username, password)) = &state.required_auth {
            let presented = credentials
                .as_ref()
                .map(|c| (c.username.as_deref(), c.password.as_deref()));
            if presented != Some((Some(username.as_str()), Some(password.as_str()))) {
                return Err(BuildError::AuthFailed {
                    registry: shipflow_core::extract_registry(reference),
                    message: "unauthorized: authentication required".to_string(),
                });
            }
        }
        let id = state
            .images
            .get(reference)
            .cloned()
            .ok_or_else(|| BuildError::ImageNotFound(reference.to_string()))?;

        state.pushes.push((reference.to_string(), credentials));
        Ok(Some(format!("sha256:{}", id.trim_start_matches("sha256:"))))
    }

    async fn inspect(&self, reference: &str) -> Result<Option<ImageDetails>> {
        let state = self.state();
        let Some(id) = state.images.get(reference) else {
            return Ok(None);
        };
        let references = state
            .images
            .iter()
            .filter(|(_, v)| *v == id)
            .map(|(k, _)| k.clone())
            .collect();
        Ok(Some(ImageDetails {
            id: id.clone(),
            references,
            size: Some(1024),
            architecture: Some("amd64".to_string()),
            os: Some("linux".to_string()),
            ..Default::default()
        }))
    }

    async fn list(&self) -> Result<Vec<ImageSummary>> {
        let state = self.state();
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (reference, id) in &state.images {
            grouped.entry(id.clone()).or_default().push(reference.clone());
        }
        Ok(grouped
            .into_iter()
            .map(|(id, references)| ImageSummary {
                id,
                references,
                size: 1024,
                ..Default::default()
            })
            .collect())
    }

    async fn remove(&self, reference: &str, _force: bool) -> Result<()> {
        self.state()
            .images
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| BuildError::ImageNotFound(reference.to_string()))
    }
}

/// 状態列を順に返すジョブクライアント
#[derive(Default)]
pub struct FakeJobClient {
    states: Mutex<HashMap<String, VecDeque<JobState>>>,
    submitted: Mutex<Vec<Job>>,
}

impl FakeJobClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 最後の状態はその後も返し続ける。未設定のジョブは `Active`
    pub fn set_states(&self, name: &str, states: Vec<JobState>) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), states.into());
    }

    pub fn submitted(&self) -> Vec<Job> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl JobClient for FakeJobClient {
    async fn submit(&self, job: Job) -> Result<JobRef> {
        let job_ref = JobRef {
            namespace: job.metadata.namespace.clone().unwrap_or_default(),
            name: job.metadata.name.clone().unwrap_or_default(),
        };
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job);
        Ok(job_ref)
    }

    async fn state(&self, job: &JobRef) -> Result<JobState> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = states.get_mut(&job.name) else {
            return Ok(JobState::Active);
        };
        let state = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(state.unwrap_or(JobState::Active))
    }
}

/// ファイル一覧から tar.gz アーカイブを作る
pub fn tar_gz(files: &[(&str, &str)]) -> Vec<u8> {
    let mut data = Vec::new();
    {
        let encoder = flate2::write::GzEncoder::new(&mut data, flate2::Compression::default());
        let mut tar = tar::Builder::new(encoder);
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, path, content.as_bytes())
                .unwrap_or_else(|e| panic!("failed to append {}: {}", path, e));
        }
        tar.into_inner()
            .and_then(|encoder| encoder.finish())
            .unwrap_or_else(|e| panic!("failed to finish archive: {}", e));
    }
    data
}

/// ループバックで同じ本文を返し続ける HTTP サーバーを起動し、その URL を返す
pub async fn serve_archive(body: Vec<u8>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|e| panic!("failed to bind archive server: {}", e));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|e| panic!("archive server has no address: {}", e));
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request).await;
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(header.as_bytes()).await;
            let _ = stream.write_all(&body).await;
            let _ = stream.shutdown().await;
        }
    });
    format!("http://{}/widget.tar.gz", addr)
}
