//! リポジトリ監視のツール

use super::{ParamSpec, ParamType, ToolHandler, ToolOutput, ToolSpec};
use crate::error::{EngineError, Result};
use crate::params::Params;
use async_trait::async_trait;
use serde_json::json;
use shipflow_git::{Credentials, RepoWatcher};
use std::sync::Arc;

pub struct GitTools {
    watcher: Arc<RepoWatcher>,
}

impl GitTools {
    pub fn new(watcher: Arc<RepoWatcher>) -> Self {
        Self { watcher }
    }
}

/// `username` / `password`（または `token`）から認証情報を組み立てる
pub(crate) fn credentials_from(params: &Params, prefix: &str) -> Option<Credentials> {
    let username = params.str(&format!("{}username", prefix));
    let password = params
        .str(&format!("{}password", prefix))
        .or_else(|| params.str(&format!("{}token", prefix)));
    let credentials = Credentials { username, password };
    (!credentials.is_empty()).then_some(credentials)
}

fn branch(params: &Params) -> String {
    params.str("branch").unwrap_or_else(|| "main".to_string())
}

#[async_trait]
impl ToolHandler for GitTools {
    fn specs(&self) -> Vec<ToolSpec> {
        let url = ParamSpec::required("url", ParamType::String, "Git repository URL");
        let branch = ParamSpec::optional("branch", ParamType::String, "Branch to watch (default: main)");
        vec![
            ToolSpec::new(
                "git_watch_add",
                "Start watching a git repository branch for new commits",
                vec![
                    url.clone(),
                    branch.clone(),
                    ParamSpec::optional("username", ParamType::String, "HTTPS username"),
                    ParamSpec::optional("password", ParamType::String, "HTTPS password or token"),
                ],
            ),
            ToolSpec::new(
                "git_watch_remove",
                "Stop watching a git repository branch",
                vec![url.clone(), branch.clone()],
            ),
            ToolSpec::new("git_watch_list", "List watched git repositories", vec![]),
            ToolSpec::new(
                "git_poll_now",
                "Check a watched repository for new commits immediately",
                vec![url, branch],
            ),
        ]
    }

    async fn call(&self, tool: &str, params: &Params) -> Result<ToolOutput> {
        match tool {
            "git_watch_add" => {
                let url = params.required_str("url")?;
                let repo = self
                    .watcher
                    .add(&url, &branch(params), credentials_from(params, ""))
                    .await?;
                Ok(ToolOutput::ok(repo))
            }
            "git_watch_remove" => {
                let url = params.required_str("url")?;
                let branch = branch(params);
                let removed = self.watcher.remove(&url, &branch).await;
                Ok(ToolOutput::ok(json!({
                    "url": url,
                    "branch": branch,
                    "removed": removed,
                })))
            }
            "git_watch_list" => {
                let repositories = self.watcher.list().await;
                Ok(ToolOutput::ok(json!({
                    "count": repositories.len(),
                    "repositories": repositories,
                })))
            }
            "git_poll_now" => {
                let url = params.required_str("url")?;
                let event = self.watcher.check_now(&url, &branch(params)).await?;
                Ok(ToolOutput::ok(json!({
                    "changed": event.is_some(),
                    "event": event,
                })))
            }
            other => Err(EngineError::UnknownTool(other.to_string())),
        }
    }
}
