//! Docker config.json による認証情報の解決
//!
//! 名前付きレジストリが指定されていないプッシュでは、ローカルの
//! `~/.docker/config.json`（または `DOCKER_CONFIG`）の auths と credsStore を参照する。

use crate::error::{BuildError, Result};
use base64::Engine;
use bollard::auth::DockerCredentials;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(default)]
    creds_store: Option<String>,
    /// レジストリごとの credential helper
    #[serde(default)]
    cred_helpers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    auth: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperResponse {
    username: String,
    secret: String,
}

#[derive(Debug, Clone)]
pub struct DockerConfigAuth {
    config_path: PathBuf,
}

impl Default for DockerConfigAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerConfigAuth {
    pub fn new() -> Self {
        let dir = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".docker"))
                    .unwrap_or_else(|| PathBuf::from(".docker"))
            });
        Self {
            config_path: dir.join("config.json"),
        }
    }

    pub fn with_config_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// レジストリホストの認証情報を探す
    ///
    /// 設定ファイルが無い、またはエントリが無い場合は `Ok(None)`。
    pub async fn credentials_for(&self, registry: &str) -> Result<Option<DockerCredentials>> {
        let content = match tokio::fs::read_to_string(&self.config_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Docker config not found at {}", self.config_path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(BuildError::AuthFailed {
                    registry: registry.to_string(),
                    message: format!("failed to read {}: {}", self.config_path.display(), e),
                });
            }
        };
        let config: DockerConfigFile =
            serde_json::from_str(&content).map_err(|e| BuildError::AuthFailed {
                registry: registry.to_string(),
                message: format!("failed to parse {}: {}", self.config_path.display(), e),
            })?;

        let entry = config.auths.get(registry).or_else(|| {
            // Docker Hub は歴史的な URL で登録されていることがある
            (registry == "docker.io")
                .then(|| config.auths.get("https://index.docker.io/v1/"))
                .flatten()
        });
        if let Some(auth) = entry.and_then(|e| e.auth.as_deref())
            && let Some(creds) = decode_auth(auth, registry)?
        {
            tracing::debug!("Found credentials in auths for {}", registry);
            return Ok(Some(creds));
        }

        let helper = config
            .cred_helpers
            .get(registry)
            .or(config.creds_store.as_ref());
        if let Some(helper) = helper {
            match from_helper(helper, registry).await {
                Ok(found) => return Ok(found),
                Err(e) => tracing::debug!("Credential helper {} failed: {}", helper, e),
            }
        }

        Ok(None)
    }
}

fn decode_auth(auth_b64: &str, registry: &str) -> Result<Option<DockerCredentials>> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth_b64)
        .map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("failed to decode auth: {}", e),
        })?;
    let text = String::from_utf8(decoded).map_err(|e| BuildError::AuthFailed {
        registry: registry.to_string(),
        message: format!("invalid UTF-8 in auth: {}", e),
    })?;

    Ok(text.split_once(':').map(|(username, password)| DockerCredentials {
        username: Some(username.to_string()),
        password: Some(password.to_string()),
        serveraddress: Some(registry.to_string()),
        ..Default::default()
    }))
}

async fn from_helper(helper: &str, registry: &str) -> std::io::Result<Option<DockerCredentials>> {
    let mut child = Command::new(format!("docker-credential-{}", helper))
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(registry.as_bytes()).await?;
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Ok(None);
    }

    let response: HelperResponse = serde_json::from_slice(&output.stdout)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(DockerCredentials {
        username: Some(response.username),
        password: Some(response.secret),
        serveraddress: Some(registry.to_string()),
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &std::path::Path, json: &str) -> PathBuf {
        let path = dir.join("config.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    #[tokio::test]
    async fn test_credentials_from_auths() {
        let dir = tempfile::tempdir().unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode("robot:token123");
        let path = write_config(
            dir.path(),
            &format!(r#"{{"auths":{{"quay.io":{{"auth":"{}"}}}}}}"#, encoded),
        );

        let auth = DockerConfigAuth::with_config_path(path);
        let creds = auth.credentials_for("quay.io").await.unwrap().unwrap();
        assert_eq!(creds.username.as_deref(), Some("robot"));
        assert_eq!(creds.password.as_deref(), Some("token123"));
        assert_eq!(creds.serveraddress.as_deref(), Some("quay.io"));
    }

    #[tokio::test]
    async fn test_docker_hub_legacy_key() {
        let dir = tempfile::tempdir().unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode("me:pw");
        let path = write_config(
            dir.path(),
            &format!(
                r#"{{"auths":{{"https://index.docker.io/v1/":{{"auth":"{}"}}}}}}"#,
                encoded
            ),
        );

        let auth = DockerConfigAuth::with_config_path(path);
        assert!(auth.credentials_for("docker.io").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_config_is_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        let auth = DockerConfigAuth::with_config_path(dir.path().join("missing.json"));
        assert!(auth.credentials_for("quay.io").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_config_is_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "{not json");
        let auth = DockerConfigAuth::with_config_path(path);
        let err = auth.credentials_for("quay.io").await.unwrap_err();
        assert!(matches!(err, BuildError::AuthFailed { .. }));
    }

    #[test]
    fn test_docker_config_env() {
        temp_env::with_var("DOCKER_CONFIG", Some("/tmp/custom-docker"), || {
            let auth = DockerConfigAuth::new();
            assert_eq!(
                auth.config_path,
                PathBuf::from("/tmp/custom-docker/config.json")
            );
        });
    }
}
