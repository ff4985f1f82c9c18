//! 名前付きレジストリの認証プロファイル
//!
//! プロセス内のみで保持し、永続化しない。

use crate::error::{BuildError, Result};
use bollard::auth::DockerCredentials;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryProfile {
    pub name: String,
    /// レジストリのホスト（スキーム付きでも可）
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub insecure: bool,
}

impl fmt::Debug for RegistryProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryProfile")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("insecure", &self.insecure)
            .finish()
    }
}

impl RegistryProfile {
    pub fn new(name: &str, url: &str, username: &str, password: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            ..Default::default()
        }
    }

    /// スキームと末尾の `/` を除いたホスト
    pub fn host(&self) -> String {
        self.url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string()
    }

    /// 一覧表示用にパスワードを伏せたコピー
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.password.is_empty() {
            copy.password = "***".to_string();
        }
        copy
    }

    /// ユーザー名・パスワードが揃っているか
    pub fn validate_access(&self) -> Result<()> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(BuildError::AuthFailed {
                registry: self.host(),
                message: "username and password are required".to_string(),
            });
        }
        Ok(())
    }

    pub fn credentials(&self) -> DockerCredentials {
        DockerCredentials {
            username: Some(self.username.clone()),
            password: Some(self.password.clone()),
            email: self.email.clone(),
            serveraddress: Some(self.host()),
            ..Default::default()
        }
    }
}

/// 名前付きプロファイルのストア
#[derive(Debug, Default)]
pub struct RegistryStore {
    profiles: RwLock<HashMap<String, RegistryProfile>>,
}

impl RegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RegistryProfile>> {
        self.profiles.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RegistryProfile>> {
        self.profiles.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 追加（同名は上書き）
    pub fn add(&self, profile: RegistryProfile) -> Result<()> {
        if profile.name.trim().is_empty() {
            return Err(BuildError::InvalidConfig("registry name is required".to_string()));
        }
        if profile.host().is_empty() {
            return Err(BuildError::InvalidConfig("registry url is required".to_string()));
        }
        tracing::info!("Registered registry {} ({})", profile.name, profile.host());
        self.write().insert(profile.name.clone(), profile);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<RegistryProfile> {
        self.read().get(name).cloned()
    }

    /// パスワードを伏せた一覧（名前順）
    pub fn list(&self) -> Vec<RegistryProfile> {
        let mut profiles: Vec<_> = self.read().values().map(|p| p.redacted()).collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        profiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_remove() {
        let store = RegistryStore::new();
        store
            .add(RegistryProfile::new("quay", "https://quay.io/", "robot", "pw"))
            .unwrap();

        let profile = store.get("quay").unwrap();
        assert_eq!(profile.host(), "quay.io");
        assert_eq!(profile.password, "pw");

        assert!(store.remove("quay"));
        assert!(!store.remove("quay"));
        assert!(store.get("quay").is_none());
    }

    #[test]
    fn test_last_write_wins() {
        let store = RegistryStore::new();
        store
            .add(RegistryProfile::new("quay", "quay.io", "old", "pw"))
            .unwrap();
        store
            .add(RegistryProfile::new("quay", "quay.io", "new", "pw"))
            .unwrap();
        assert_eq!(store.get("quay").unwrap().username, "new");
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_list_redacts_passwords() {
        let store = RegistryStore::new();
        store
            .add(RegistryProfile::new("b", "ghcr.io", "u", "secret"))
            .unwrap();
        store.add(RegistryProfile::new("a", "quay.io", "", "")).unwrap();

        let listed = store.list();
        assert_eq!(listed[0].name, "a");
        assert_eq!(listed[0].password, "");
        assert_eq!(listed[1].password, "***");
    }

    #[test]
    fn test_validate_access() {
        assert!(
            RegistryProfile::new("q", "quay.io", "robot", "")
                .validate_access()
                .is_err()
        );
        assert!(
            RegistryProfile::new("q", "quay.io", "robot", "pw")
                .validate_access()
                .is_ok()
        );
    }

    #[test]
    fn test_add_requires_name_and_url() {
        let store = RegistryStore::new();
        assert!(store.add(RegistryProfile::new("", "quay.io", "", "")).is_err());
        assert!(store.add(RegistryProfile::new("q", "https://", "", "")).is_err());
    }
}
