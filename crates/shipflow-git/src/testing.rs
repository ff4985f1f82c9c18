//! テスト用のインメモリ Git トランスポート

use crate::error::{GitError, Result};
use crate::transport::{CommitDetails, Credentials, GitRef, GitTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct State {
    heads: HashMap<(String, String), String>,
    diffs: HashMap<(String, String), Vec<String>>,
    required: HashMap<String, Credentials>,
    files: Vec<(String, String)>,
    clones: Vec<(String, Option<GitRef>, PathBuf)>,
    fail_clone: bool,
    head_delay: Option<Duration>,
}

/// HEAD と差分を手動で設定できる Git トランスポート
#[derive(Default)]
pub struct FakeGit {
    state: Mutex<State>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_head(&self, url: &str, branch: &str, commit: &str) {
        self.state()
            .heads
            .insert((url.to_string(), branch.to_string()), commit.to_string());
    }

    pub fn set_diff(&self, old: &str, new: &str, files: &[&str]) {
        self.state().diffs.insert(
            (old.to_string(), new.to_string()),
            files.iter().map(|f| f.to_string()).collect(),
        );
    }

    /// 指定 URL へのアクセスに認証情報を要求する
    pub fn require_credentials(&self, url: &str, credentials: Credentials) {
        self.state().required.insert(url.to_string(), credentials);
    }

    /// クローン時に書き出すファイル
    pub fn add_file(&self, path: &str, content: &str) {
        self.state()
            .files
            .push((path.to_string(), content.to_string()));
    }

    pub fn fail_clone(&self, fail: bool) {
        self.state().fail_clone = fail;
    }

    /// HEAD 取得に遅延を入れる（同時チェックの再現用）
    pub fn set_head_delay(&self, delay: Duration) {
        self.state().head_delay = Some(delay);
    }

    /// これまでのクローン要求
    pub fn clones(&self) -> Vec<(String, Option<GitRef>, PathBuf)> {
        self.state().clones.clone()
    }

    fn authorize(&self, url: &str, credentials: Option<&Credentials>) -> Result<()> {
        if let Some(required) = self.state().required.get(url)
            && credentials != Some(required)
        {
            return Err(GitError::Auth {
                url: url.to_string(),
                message: "invalid credentials".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GitTransport for FakeGit {
    async fn head(
        &self,
        url: &str,
        branch: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String> {
        self.authorize(url, credentials)?;
        let delay = self.state().head_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state()
            .heads
            .get(&(url.to_string(), branch.to_string()))
            .cloned()
            .ok_or_else(|| GitError::Fetch {
                url: url.to_string(),
                message: "repository unreachable".to_string(),
            })
    }

    async fn commit_details(
        &self,
        url: &str,
        _branch: &str,
        old: Option<&str>,
        new: &str,
        credentials: Option<&Credentials>,
    ) -> Result<CommitDetails> {
        self.authorize(url, credentials)?;
        let changed_files = old
            .and_then(|old| {
                self.state()
                    .diffs
                    .get(&(old.to_string(), new.to_string()))
                    .cloned()
            })
            .unwrap_or_default();
        Ok(CommitDetails {
            message: format!("commit {}", new),
            author: "Test <test@example.com>".to_string(),
            timestamp: None,
            changed_files,
        })
    }

    async fn clone_repo(
        &self,
        url: &str,
        git_ref: Option<&GitRef>,
        credentials: Option<&Credentials>,
        dest: &Path,
    ) -> Result<()> {
        self.authorize(url, credentials)?;
        let (files, fail) = {
            let mut state = self.state();
            state
                .clones
                .push((url.to_string(), git_ref.cloned(), dest.to_path_buf()));
            (state.files.clone(), state.fail_clone)
        };
        if fail {
            return Err(GitError::Clone {
                url: url.to_string(),
                message: "remote hung up unexpectedly".to_string(),
            });
        }

        std::fs::create_dir_all(dest)?;
        for (path, content) in files {
            let target = dest.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, content)?;
        }
        Ok(())
    }
}
