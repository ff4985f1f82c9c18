//! Shipflow の設定
//!
//! YAML の設定ファイルと環境変数からエンジンの既定値を読み込む。
//! ファイルが見つからない場合は組み込みの既定値を使う。

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 設定ファイルを直接指定する環境変数
pub const CONFIG_PATH_ENV: &str = "SHIPFLOW_CONFIG";
/// ポーリング間隔（秒）を上書きする環境変数
pub const POLL_INTERVAL_ENV: &str = "SHIPFLOW_POLL_INTERVAL";
/// デプロイ先の既定 namespace を上書きする環境変数
pub const NAMESPACE_ENV: &str = "SHIPFLOW_NAMESPACE";

/// エンジン全体の設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub watcher: WatcherSettings,
    pub build: BuildSettings,
    pub deploy: DeploySettings,
}

/// リポジトリ監視の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    pub poll_interval_secs: u64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
        }
    }
}

/// イメージビルドの設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// クラスタ内ビルドジョブを作成する namespace
    pub namespace: String,
    /// クラスタ内ビルドに使う kaniko executor イメージ
    pub kaniko_image: String,
    pub job_timeout_secs: u64,
    pub job_poll_secs: u64,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            namespace: "shipflow-builds".to_string(),
            kaniko_image: "gcr.io/kaniko-project/executor:latest".to_string(),
            job_timeout_secs: 1800,
            job_poll_secs: 5,
        }
    }
}

/// 外部公開リソースの種類
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureKind {
    /// OpenShift Route
    #[default]
    Route,
    /// Kubernetes Ingress
    Ingress,
}

impl std::str::FromStr for ExposureKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "route" => Ok(ExposureKind::Route),
            "ingress" => Ok(ExposureKind::Ingress),
            other => Err(format!("unknown exposure kind: {}", other)),
        }
    }
}

/// CPU / メモリの量
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantity {
    pub cpu: String,
    pub memory: String,
}

/// デプロイの既定値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    pub namespace: String,
    pub replicas: i32,
    pub port: i32,
    pub service_type: String,
    pub requests: ResourceQuantity,
    pub limits: ResourceQuantity,
    /// `app.kubernetes.io/managed-by` ラベルの値
    pub managed_by: String,
    pub exposure: ExposureKind,
    pub readiness_timeout_secs: u64,
    pub readiness_poll_secs: u64,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            replicas: 1,
            port: 8080,
            service_type: "ClusterIP".to_string(),
            requests: ResourceQuantity {
                cpu: "100m".to_string(),
                memory: "256Mi".to_string(),
            },
            limits: ResourceQuantity {
                cpu: "500m".to_string(),
                memory: "512Mi".to_string(),
            },
            managed_by: "shipflow".to_string(),
            exposure: ExposureKind::Route,
            readiness_timeout_secs: 300,
            readiness_poll_secs: 5,
        }
    }
}

impl EngineConfig {
    /// 設定ファイルを探して読み込み、環境変数の上書きを適用する
    pub fn load() -> Result<Self> {
        let mut config = match find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::from_file(&path)?
            }
            None => {
                tracing::debug!("No configuration file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// 指定したファイルから読み込む
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml_str(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// 環境変数による上書き
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(POLL_INTERVAL_ENV) {
            self.watcher.poll_interval_secs =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    name: POLL_INTERVAL_ENV,
                    value: value.clone(),
                })?;
        }
        if let Ok(value) = std::env::var(NAMESPACE_ENV)
            && !value.trim().is_empty()
        {
            self.deploy.namespace = value.trim().to_string();
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.watcher.poll_interval_secs.max(1))
    }
}

impl DeploySettings {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_secs(self.readiness_poll_secs.max(1))
    }
}

impl BuildSettings {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn job_poll(&self) -> Duration {
        Duration::from_secs(self.job_poll_secs.max(1))
    }
}

/// Shipflow の設定ディレクトリを取得
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("shipflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// 設定ファイルを探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 SHIPFLOW_CONFIG (直接パス指定)
/// 2. カレントディレクトリ: shipflow.yaml, shipflow.yml
/// 3. ./.shipflow/config.yaml
/// 4. ~/.config/shipflow/config.yaml (グローバル設定)
pub fn find_config_file() -> Option<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Some(path);
        }
        tracing::warn!("{} points to a missing file: {}", CONFIG_PATH_ENV, path.display());
    }

    if let Ok(current_dir) = std::env::current_dir() {
        for filename in ["shipflow.yaml", "shipflow.yml"] {
            let path = current_dir.join(filename);
            if path.exists() {
                return Some(path);
            }
        }

        let local = current_dir.join(".shipflow").join("config.yaml");
        if local.exists() {
            return Some(local);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("shipflow").join("config.yaml");
        if global_config.exists() {
            return Some(global_config);
        }
    }

    None
}
