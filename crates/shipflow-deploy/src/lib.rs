//! Shipflow Deploy
//!
//! アプリケーションを Deployment / Service / 外部公開リソース（Route または Ingress）
//! としてクラスタに反映する。同じ設定の再適用は冪等で、サーバー側で割り当てられた
//! フィールドは保持される。

pub mod cluster;
pub mod deployer;
pub mod error;
pub mod manifest;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cluster::{ClusterClient, Exposure, KubeCluster};
pub use deployer::{AppInfo, DeleteReport, DeployConfig, DeployResult, Deployer, ResourceSpec};
pub use error::{DeployError, Result};
pub use manifest::RenderedManifests;
pub use shipflow_config::ExposureKind;
