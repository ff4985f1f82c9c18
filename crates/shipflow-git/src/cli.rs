//! git コマンドを使ったトランスポート実装
//!
//! tokio::process::Command で git を非同期に実行する。
//! 認証情報は HTTPS URL のユーザー情報部に埋め込み、エラーメッセージからは除去する。

use crate::error::{GitError, Result};
use crate::transport::{CommitDetails, Credentials, GitRef, GitTransport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::process::Output;
use tokio::process::Command;

/// git CLI によるトランスポート
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
        }
    }

    /// git 実行ファイルのパスを指定
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str], cwd: Option<&Path>) -> std::io::Result<Output> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.output().await
    }
}

#[async_trait]
impl GitTransport for GitCli {
    async fn head(
        &self,
        url: &str,
        branch: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String> {
        let remote = authenticated_url(url, credentials);
        let refname = format!("refs/heads/{}", branch);
        tracing::debug!("git ls-remote {} {}", url, refname);

        let output = self.run(&["ls-remote", &remote, &refname], None).await?;
        if !output.status.success() {
            let message = redact(&String::from_utf8_lossy(&output.stderr), &remote, url, credentials);
            return Err(classify_remote_failure(url, message, false));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ls_remote(&stdout, &refname).ok_or_else(|| GitError::BranchNotFound {
            url: url.to_string(),
            branch: branch.to_string(),
        })
    }

    async fn commit_details(
        &self,
        url: &str,
        branch: &str,
        old: Option<&str>,
        new: &str,
        credentials: Option<&Credentials>,
    ) -> Result<CommitDetails> {
        let remote = authenticated_url(url, credentials);
        let scratch = tempfile::Builder::new()
            .prefix("shipflow-git-")
            .tempdir()?;
        let repo = scratch.path();

        let output = self.run(&["init", "--bare", "--quiet"], Some(repo)).await?;
        if !output.status.success() {
            return Err(GitError::Fetch {
                url: url.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // blob を取らずにコミットとツリーだけ取得
        let refspec = format!("+refs/heads/{0}:refs/heads/{0}", branch);
        let output = self
            .run(
                &[
                    "fetch",
                    "--quiet",
                    "--no-tags",
                    "--filter=blob:none",
                    &remote,
                    &refspec,
                ],
                Some(repo),
            )
            .await?;
        if !output.status.success() {
            let message = redact(&String::from_utf8_lossy(&output.stderr), &remote, url, credentials);
            return Err(classify_remote_failure(url, message, false));
        }

        let output = self
            .run(
                &["log", "-1", "--format=%an <%ae>%x00%cI%x00%B", new],
                Some(repo),
            )
            .await?;
        if !output.status.success() {
            return Err(GitError::Fetch {
                url: url.to_string(),
                message: format!(
                    "commit {} not found after fetch: {}",
                    new,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        let mut details = parse_log(&String::from_utf8_lossy(&output.stdout));

        if let Some(old) = old.filter(|o| !o.is_empty()) {
            let output = self
                .run(&["diff", "--name-only", "--no-renames", old, new], Some(repo))
                .await?;
            if output.status.success() {
                details.changed_files = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
            } else {
                // force push などで旧コミットが到達不能
                tracing::warn!(
                    "Could not diff {}..{} for {}: {}",
                    old,
                    new,
                    url,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }

        Ok(details)
    }

    async fn clone_repo(
        &self,
        url: &str,
        git_ref: Option<&GitRef>,
        credentials: Option<&Credentials>,
        dest: &Path,
    ) -> Result<()> {
        let remote = authenticated_url(url, credentials);
        let dest_str = dest.to_string_lossy().to_string();

        let mut args = vec!["clone", "--quiet"];
        if let Some(GitRef::Branch(branch)) = git_ref {
            args.extend(["--branch", branch.as_str(), "--single-branch"]);
        }
        args.push(&remote);
        args.push(&dest_str);

        tracing::info!("Cloning {} into {}", url, dest.display());
        let output = self.run(&args, None).await?;
        if !output.status.success() {
            let message = redact(&String::from_utf8_lossy(&output.stderr), &remote, url, credentials);
            return Err(classify_remote_failure(url, message, true));
        }

        if let Some(GitRef::Commit(commit)) = git_ref {
            let output = self
                .run(&["checkout", "--quiet", commit.as_str()], Some(dest))
                .await?;
            if !output.status.success() {
                return Err(GitError::Clone {
                    url: url.to_string(),
                    message: format!(
                        "failed to checkout {}: {}",
                        commit,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }
        }

        Ok(())
    }
}

/// 認証情報を HTTPS URL に埋め込む
///
/// HTTPS 以外の URL（ssh, ローカルパス）はそのまま返す。
pub fn authenticated_url(url: &str, credentials: Option<&Credentials>) -> String {
    let Some(creds) = credentials.filter(|c| !c.is_empty()) else {
        return url.to_string();
    };
    let Some(rest) = url.strip_prefix("https://") else {
        return url.to_string();
    };
    // 既にユーザー情報を含む場合は上書きしない
    if rest.split('/').next().is_some_and(|host| host.contains('@')) {
        return url.to_string();
    }

    let user = creds.username.as_deref().filter(|u| !u.is_empty()).unwrap_or("x-access-token");
    let userinfo = match creds.password.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => format!("{}:{}", encode_userinfo(user), encode_userinfo(password)),
        None => encode_userinfo(user),
    };
    format!("https://{}@{}", userinfo, rest)
}

fn encode_userinfo(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// メッセージから認証情報を除去
fn redact(message: &str, remote: &str, url: &str, credentials: Option<&Credentials>) -> String {
    let mut safe = message.trim().replace(remote, url);
    if let Some(password) = credentials.and_then(|c| c.password.as_deref())
        && !password.is_empty()
    {
        safe = safe.replace(password, "***");
        safe = safe.replace(&encode_userinfo(password), "***");
    }
    safe
}

fn classify_remote_failure(url: &str, message: String, cloning: bool) -> GitError {
    let lower = message.to_lowercase();
    let auth_markers = [
        "authentication failed",
        "could not read username",
        "could not read password",
        "permission denied",
        "403",
        "401",
    ];
    if auth_markers.iter().any(|m| lower.contains(m)) {
        return GitError::Auth {
            url: url.to_string(),
            message,
        };
    }
    if cloning {
        GitError::Clone {
            url: url.to_string(),
            message,
        }
    } else {
        GitError::Fetch {
            url: url.to_string(),
            message,
        }
    }
}

fn parse_ls_remote(stdout: &str, refname: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (hash, name) = line.split_once('\t')?;
        (name.trim() == refname && !hash.is_empty()).then(|| hash.trim().to_string())
    })
}

fn parse_log(stdout: &str) -> CommitDetails {
    let mut parts = stdout.splitn(3, '\0');
    let author = parts.next().unwrap_or("").trim().to_string();
    let timestamp = parts
        .next()
        .and_then(|t| DateTime::parse_from_rfc3339(t.trim()).ok())
        .map(|t| t.with_timezone(&Utc));
    let message = parts.next().unwrap_or("").trim().to_string();

    CommitDetails {
        message,
        author,
        timestamp,
        changed_files: Vec::new(),
    }
}
