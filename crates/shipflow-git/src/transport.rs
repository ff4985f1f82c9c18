//! Git トランスポートの抽象

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// HTTPS Basic 認証情報
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// パスワード（トークン）のみ
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            username: None,
            password: Some(token.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.as_deref().unwrap_or("").is_empty()
            && self.password.as_deref().unwrap_or("").is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// チェックアウト対象
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitRef {
    Branch(String),
    Commit(String),
}

/// コミットの詳細と変更ファイル
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitDetails {
    pub message: String,
    pub author: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// 追加・削除・変更されたパス（リネームは削除 + 追加）
    pub changed_files: Vec<String>,
}

#[async_trait]
pub trait GitTransport: Send + Sync {
    /// ブランチの HEAD コミットハッシュを取得
    async fn head(&self, url: &str, branch: &str, credentials: Option<&Credentials>)
    -> Result<String>;

    /// `new` コミットの詳細と `old` からのツリー差分を取得
    ///
    /// `old` のコミットが到達不能な場合、差分は空になる。
    async fn commit_details(
        &self,
        url: &str,
        branch: &str,
        old: Option<&str>,
        new: &str,
        credentials: Option<&Credentials>,
    ) -> Result<CommitDetails>;

    /// `dest` へクローンし、指定があればブランチ/コミットをチェックアウト
    async fn clone_repo(
        &self,
        url: &str,
        git_ref: Option<&GitRef>,
        credentials: Option<&Credentials>,
        dest: &Path,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::basic("bot", "s3cret");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("bot"));
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn test_credentials_is_empty() {
        assert!(Credentials::default().is_empty());
        assert!(!Credentials::token("abc").is_empty());
    }
}
