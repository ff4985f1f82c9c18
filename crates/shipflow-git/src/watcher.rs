//! リポジトリ監視
//!
//! 登録されたリポジトリの HEAD を一定間隔でポーリングし、変化があれば
//! `CommitEvent` を購読者へ配信する。1 回のティック内のチェックは逐次実行。

use crate::error::{GitError, Result};
use crate::transport::{Credentials, GitTransport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// 監視対象のリポジトリ
#[derive(Debug, Clone, Serialize)]
pub struct Repository {
    pub url: String,
    pub branch: String,
    pub last_commit_hash: String,
    #[serde(skip)]
    pub credentials: Option<Credentials>,
    pub added_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// 直近のチェックまたは配信の失敗
    pub last_error: Option<String>,
}

/// 検知したコミット
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEvent {
    pub repo_url: String,
    pub branch: String,
    pub commit_hash: String,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub changed_files: Vec<String>,
}

/// コミットイベントの購読者
#[async_trait]
pub trait CommitListener: Send + Sync {
    async fn on_commit(&self, event: &CommitEvent) -> anyhow::Result<()>;
}

type RepoKey = (String, String);

pub struct RepoWatcher {
    transport: Arc<dyn GitTransport>,
    repos: Mutex<BTreeMap<RepoKey, Repository>>,
    listeners: RwLock<Vec<Arc<dyn CommitListener>>>,
}

impl RepoWatcher {
    pub fn new(transport: Arc<dyn GitTransport>) -> Self {
        Self {
            transport,
            repos: Mutex::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn transport(&self) -> Arc<dyn GitTransport> {
        self.transport.clone()
    }

    /// 購読者を追加（登録順に呼び出される）
    pub async fn subscribe(&self, listener: Arc<dyn CommitListener>) {
        self.listeners.write().await.push(listener);
    }

    /// リポジトリを監視対象に追加し、現在の HEAD を記録
    pub async fn add(
        &self,
        url: &str,
        branch: &str,
        credentials: Option<Credentials>,
    ) -> Result<Repository> {
        let url = url.trim();
        if url.is_empty() {
            return Err(GitError::Invalid("repository url is required".to_string()));
        }
        let branch = match branch.trim() {
            "" => "main",
            b => b,
        };
        let key = (url.to_string(), branch.to_string());

        if self.repos.lock().await.contains_key(&key) {
            return Err(GitError::AlreadyWatched {
                url: key.0,
                branch: key.1,
            });
        }

        let head = self
            .transport
            .head(url, branch, credentials.as_ref())
            .await?;

        let mut repos = self.repos.lock().await;
        if repos.contains_key(&key) {
            return Err(GitError::AlreadyWatched {
                url: key.0,
                branch: key.1,
            });
        }

        let repo = Repository {
            url: key.0.clone(),
            branch: key.1.clone(),
            last_commit_hash: head,
            credentials,
            added_at: Utc::now(),
            last_checked_at: None,
            last_error: None,
        };
        tracing::info!(
            "Watching {} ({}) at {}",
            repo.url,
            repo.branch,
            repo.last_commit_hash
        );
        repos.insert(key, repo.clone());
        Ok(repo)
    }

    /// 監視を解除（未登録なら何もしない）
    pub async fn remove(&self, url: &str, branch: &str) -> bool {
        let removed = self
            .repos
            .lock()
            .await
            .remove(&(url.to_string(), branch.to_string()))
            .is_some();
        if removed {
            tracing::info!("Stopped watching {} ({})", url, branch);
        }
        removed
    }

    pub async fn list(&self) -> Vec<Repository> {
        self.repos.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, url: &str, branch: &str) -> Option<Repository> {
        self.repos
            .lock()
            .await
            .get(&(url.to_string(), branch.to_string()))
            .cloned()
    }

    pub async fn is_watched(&self, url: &str, branch: &str) -> bool {
        self.get(url, branch).await.is_some()
    }

    /// 全リポジトリを逐次チェックし、配信したイベント数を返す
    pub async fn check_all(&self) -> usize {
        let keys: Vec<RepoKey> = self.repos.lock().await.keys().cloned().collect();
        let mut emitted = 0;
        for key in keys {
            match self.check(&key).await {
                Ok(Some(_)) => emitted += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to check {} ({}): {}", key.0, key.1, e),
            }
        }
        emitted
    }

    /// 1 リポジトリを即時チェック
    pub async fn check_now(&self, url: &str, branch: &str) -> Result<Option<CommitEvent>> {
        let key = (url.to_string(), branch.to_string());
        if !self.repos.lock().await.contains_key(&key) {
            return Err(GitError::NotWatched {
                url: key.0,
                branch: key.1,
            });
        }
        self.check(&key).await
    }

    async fn check(&self, key: &RepoKey) -> Result<Option<CommitEvent>> {
        let Some((old, credentials)) = self
            .repos
            .lock()
            .await
            .get(key)
            .map(|r| (r.last_commit_hash.clone(), r.credentials.clone()))
        else {
            return Ok(None);
        };
        let (url, branch) = (key.0.as_str(), key.1.as_str());

        let head = match self.transport.head(url, branch, credentials.as_ref()).await {
            Ok(head) => head,
            Err(e) => {
                self.record(key, Some(e.to_string())).await;
                return Err(e);
            }
        };

        if head == old {
            self.record(key, None).await;
            return Ok(None);
        }

        let previous = (!old.is_empty()).then_some(old.as_str());
        let details = match self
            .transport
            .commit_details(url, branch, previous, &head, credentials.as_ref())
            .await
        {
            Ok(details) => details,
            Err(e) => {
                tracing::warn!("Could not read details of {} in {}: {}", head, url, e);
                Default::default()
            }
        };

        let event = CommitEvent {
            repo_url: url.to_string(),
            branch: branch.to_string(),
            commit_hash: head.clone(),
            message: details.message,
            author: details.author,
            timestamp: details.timestamp.unwrap_or_else(Utc::now),
            changed_files: details.changed_files,
        };

        // コールバックより先に last_commit_hash を進める
        {
            let mut repos = self.repos.lock().await;
            let Some(repo) = repos.get_mut(key) else {
                return Ok(None);
            };
            // 同時に走った別のチェックが先に配信済み
            if repo.last_commit_hash != old {
                return Ok(None);
            }
            repo.last_commit_hash = head;
            repo.last_checked_at = Some(Utc::now());
            repo.last_error = None;
        }
        tracing::info!(
            "New commit {} on {} ({}), {} file(s) changed",
            event.commit_hash,
            url,
            branch,
            event.changed_files.len()
        );

        self.deliver(key, &event).await;
        Ok(Some(event))
    }

    async fn deliver(&self, key: &RepoKey, event: &CommitEvent) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            if let Err(e) = listener.on_commit(event).await {
                tracing::warn!(
                    "Commit listener failed for {} ({}): {:#}",
                    event.repo_url,
                    event.commit_hash,
                    e
                );
                self.record(key, Some(format!("delivery of {} failed: {}", event.commit_hash, e)))
                    .await;
            }
        }
    }

    async fn record(&self, key: &RepoKey, error: Option<String>) {
        if let Some(repo) = self.repos.lock().await.get_mut(key) {
            repo.last_checked_at = Some(Utc::now());
            repo.last_error = error;
        }
    }

    /// キャンセルされるまで一定間隔でポーリング
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 最初のティックは即時に完了する
        ticker.tick().await;

        tracing::info!("Repository watcher started (interval {:?})", interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_all().await;
                }
            }
        }
        tracing::info!("Repository watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGit;
    use shipflow_core::{Classify, ErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const URL: &str = "https://github.com/acme/widget.git";

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<CommitEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl CommitListener for Recorder {
        async fn on_commit(&self, event: &CommitEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event.clone());
            if self.fail {
                anyhow::bail!("listener exploded");
            }
            Ok(())
        }
    }

    fn watcher(git: &Arc<FakeGit>) -> RepoWatcher {
        RepoWatcher::new(git.clone())
    }

    #[tokio::test]
    async fn test_add_records_remote_head() {
        let git = Arc::new(FakeGit::new());
        git.set_head(URL, "main", "aaaa1111");
        let watcher = watcher(&git);

        let repo = watcher.add(URL, "main", None).await.unwrap();
        assert_eq!(repo.last_commit_hash, "aaaa1111");
        assert_eq!(watcher.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_add_defaults_branch_to_main() {
        let git = Arc::new(FakeGit::new());
        git.set_head(URL, "main", "aaaa1111");
        let watcher = watcher(&git);

        let repo = watcher.add(URL, "", None).await.unwrap();
        assert_eq!(repo.branch, "main");
    }

    #[tokio::test]
    async fn test_add_duplicate_is_rejected() {
        let git = Arc::new(FakeGit::new());
        git.set_head(URL, "main", "aaaa1111");
        let watcher = watcher(&git);

        watcher.add(URL, "main", None).await.unwrap();
        let err = watcher.add(URL, "main", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(watcher.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_add_unreachable_fails() {
        let git = Arc::new(FakeGit::new());
        let watcher = watcher(&git);

        let err = watcher.add(URL, "main", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fetch);
        assert!(watcher.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let git = Arc::new(FakeGit::new());
        git.set_head(URL, "main", "aaaa1111");
        let watcher = watcher(&git);
        watcher.add(URL, "main", None).await.unwrap();

        assert!(watcher.remove(URL, "main").await);
        assert!(!watcher.remove(URL, "main").await);
        assert!(!watcher.remove("https://nowhere", "dev").await);
    }

    #[tokio::test]
    async fn test_check_without_change_emits_nothing() {
        let git = Arc::new(FakeGit::new());
        git.set_head(URL, "main", "aaaa1111");
        let watcher = watcher(&git);
        let recorder = Arc::new(Recorder::default());
        watcher.subscribe(recorder.clone()).await;
        watcher.add(URL, "main", None).await.unwrap();

        assert_eq!(watcher.check_all().await, 0);
        assert!(watcher.check_now(URL, "main").await.unwrap().is_none());
        assert!(recorder.events.lock().unwrap().is_empty());
        assert_eq!(
            watcher.get(URL, "main").await.unwrap().last_commit_hash,
            "aaaa1111"
        );
    }

    #[tokio::test]
    async fn test_head_change_emits_single_event_with_diff() {
        let git = Arc::new(FakeGit::new());
        git.set_head(URL, "main", "aaaa1111");
        let watcher = watcher(&git);
        let recorder = Arc::new(Recorder::default());
        watcher.subscribe(recorder.clone()).await;
        watcher.add(URL, "main", None).await.unwrap();

        git.set_head(URL, "main", "bbbb2222");
        git.set_diff(
            "aaaa1111",
            "bbbb2222",
            &["src/main.rs", "README.md", "old.txt"],
        );

        assert_eq!(watcher.check_all().await, 1);
        assert_eq!(watcher.check_all().await, 0);

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].commit_hash, "bbbb2222");
        assert_eq!(
            events[0].changed_files,
            vec!["src/main.rs", "README.md", "old.txt"]
        );
    }

    #[tokio::test]
    async fn test_failed_listener_still_advances_hash() {
        let git = Arc::new(FakeGit::new());
        git.set_head(URL, "main", "aaaa1111");
        let watcher = watcher(&git);
        let failing = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let healthy = Arc::new(Recorder::default());
        watcher.subscribe(failing.clone()).await;
        watcher.subscribe(healthy.clone()).await;
        watcher.add(URL, "main", None).await.unwrap();

        git.set_head(URL, "main", "cccc3333");
        watcher.check_all().await;

        let repo = watcher.get(URL, "main").await.unwrap();
        assert_eq!(repo.last_commit_hash, "cccc3333");
        assert!(repo.last_error.unwrap().contains("cccc3333"));
        assert_eq!(healthy.events.lock().unwrap().len(), 1);

        // 失敗したコミットは再配信されない
        watcher.check_all().await;
        assert_eq!(failing.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_checks_deliver_once() {
        let git = Arc::new(FakeGit::new());
        git.set_head(URL, "main", "aaaa1111");
        let watcher = watcher(&git);
        let recorder = Arc::new(Recorder::default());
        watcher.subscribe(recorder.clone()).await;
        watcher.add(URL, "main", None).await.unwrap();

        git.set_head_delay(Duration::from_millis(30));
        git.set_head(URL, "main", "ffff6666");
        let (now, all) = tokio::join!(watcher.check_now(URL, "main"), watcher.check_all());

        let emitted = usize::from(now.unwrap().is_some()) + all;
        assert_eq!(emitted, 1);
        assert_eq!(recorder.events.lock().unwrap().len(), 1);
        assert_eq!(
            watcher.get(URL, "main").await.unwrap().last_commit_hash,
            "ffff6666"
        );
    }

    #[tokio::test]
    async fn test_unreachable_diff_yields_empty_files() {
        let git = Arc::new(FakeGit::new());
        git.set_head(URL, "main", "aaaa1111");
        let watcher = watcher(&git);
        watcher.add(URL, "main", None).await.unwrap();

        git.set_head(URL, "main", "dddd4444");
        let event = watcher.check_now(URL, "main").await.unwrap().unwrap();
        assert!(event.changed_files.is_empty());
    }

    #[tokio::test]
    async fn test_check_now_unknown_repository() {
        let git = Arc::new(FakeGit::new());
        let watcher = watcher(&git);
        let err = watcher.check_now(URL, "main").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let git = Arc::new(FakeGit::new());
        git.set_head(URL, "main", "aaaa1111");
        let watcher = Arc::new(watcher(&git));
        watcher.add(URL, "main", None).await.unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        struct Counter(Arc<AtomicUsize>);
        #[async_trait]
        impl CommitListener for Counter {
            async fn on_commit(&self, _event: &CommitEvent) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        watcher.subscribe(Arc::new(Counter(counter.clone()))).await;
        git.set_head(URL, "main", "eeee5555");

        let cancel = CancellationToken::new();
        let handle = {
            let watcher = watcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { watcher.run(Duration::from_millis(10), cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
