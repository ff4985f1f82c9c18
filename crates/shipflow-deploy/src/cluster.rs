//! クラスタ API の抽象と Kubernetes 実装

use crate::error::{DeployError, Result};
use crate::manifest::route_resource;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use serde::de::DeserializeOwned;
use shipflow_config::ExposureKind;
use std::fmt::Debug;

/// 外部公開リソース
#[derive(Debug, Clone)]
pub enum Exposure {
    /// OpenShift Route（カスタムリソース）
    Route(DynamicObject),
    Ingress(Ingress),
}

impl Exposure {
    pub fn kind(&self) -> ExposureKind {
        match self {
            Exposure::Route(_) => ExposureKind::Route,
            Exposure::Ingress(_) => ExposureKind::Ingress,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Exposure::Route(route) => &route.metadata,
            Exposure::Ingress(ingress) => &ingress.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Exposure::Route(route) => &mut route.metadata,
            Exposure::Ingress(ingress) => &mut ingress.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// 外部からアクセスできる URL
    pub fn url(&self) -> Option<String> {
        match self {
            Exposure::Route(route) => {
                let host = route.data["spec"]["host"]
                    .as_str()
                    .or_else(|| route.data["status"]["ingress"][0]["host"].as_str())
                    .filter(|h| !h.is_empty())?;
                Some(format!("https://{}", host))
            }
            Exposure::Ingress(ingress) => {
                let spec = ingress.spec.as_ref()?;
                let host = spec
                    .rules
                    .as_ref()?
                    .iter()
                    .find_map(|r| r.host.clone())?;
                let scheme = if spec.tls.as_ref().is_some_and(|t| !t.is_empty()) {
                    "https"
                } else {
                    "http"
                };
                Some(format!("{}://{}", scheme, host))
            }
        }
    }
}

/// デプロイに必要なクラスタ操作
///
/// `create_*` は既存リソースに対して `DeployError::AlreadyExists` を、
/// `replace_*` は resourceVersion の不一致に対して `DeployError::Conflict` を返す。
/// `get_*` は存在しない場合 `None`、`delete_*` は存在しない場合 `false`。
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// 作成した場合は `true`
    async fn ensure_namespace(&self, name: &str) -> Result<bool>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment)
    -> Result<Deployment>;
    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment>;
    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service>;
    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn get_exposure(
        &self,
        namespace: &str,
        kind: ExposureKind,
        name: &str,
    ) -> Result<Option<Exposure>>;
    async fn create_exposure(&self, namespace: &str, exposure: &Exposure) -> Result<Exposure>;
    async fn replace_exposure(&self, namespace: &str, exposure: &Exposure) -> Result<Exposure>;
    async fn delete_exposure(&self, namespace: &str, kind: ExposureKind, name: &str)
    -> Result<bool>;
}

/// kube クライアントによる実装
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// kubeconfig またはクラスタ内の設定から接続
    pub async fn connect() -> Result<Self> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| DeployError::Unavailable(e.to_string()))?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }

    fn routes(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &route_resource())
    }
}

fn api_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    Ok(api.get_opt(name).await?)
}

async fn create<K>(api: &Api<K>, kind: &'static str, namespace: &str, object: &K) -> Result<K>
where
    K: kube::Resource + Clone + DeserializeOwned + serde::Serialize + Debug,
{
    match api.create(&PostParams::default(), object).await {
        Ok(created) => Ok(created),
        Err(e) if api_code(&e) == Some(409) => Err(DeployError::AlreadyExists {
            kind,
            namespace: namespace.to_string(),
            name: object.meta().name.clone().unwrap_or_default(),
        }),
        Err(e) => Err(e.into()),
    }
}

async fn replace<K>(api: &Api<K>, kind: &'static str, namespace: &str, object: &K) -> Result<K>
where
    K: kube::Resource + Clone + DeserializeOwned + serde::Serialize + Debug,
{
    let name = object.meta().name.clone().unwrap_or_default();
    match api.replace(&name, &PostParams::default(), object).await {
        Ok(replaced) => Ok(replaced),
        Err(e) if api_code(&e) == Some(409) => Err(DeployError::Conflict {
            kind,
            namespace: namespace.to_string(),
            name,
        }),
        Err(e) => Err(e.into()),
    }
}

async fn delete<K>(api: &Api<K>, name: &str) -> Result<bool>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(true),
        Err(e) if api_code(&e) == Some(404) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn ensure_namespace(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if get_opt(&api, name).await?.is_some() {
            return Ok(false);
        }
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match create(&api, "Namespace", name, &namespace).await {
            Ok(_) => {
                tracing::info!("Created namespace {}", name);
                Ok(true)
            }
            Err(DeployError::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        get_opt(&Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let api = Api::namespaced(self.client.clone(), namespace);
        create(&api, "Deployment", namespace, deployment).await
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let api = Api::namespaced(self.client.clone(), namespace);
        replace(&api, "Deployment", namespace, deployment).await
    }

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        delete(&api, name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        get_opt(&Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let api = Api::namespaced(self.client.clone(), namespace);
        create(&api, "Service", namespace, service).await
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let api = Api::namespaced(self.client.clone(), namespace);
        replace(&api, "Service", namespace, service).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        delete(&api, name).await
    }

    async fn get_exposure(
        &self,
        namespace: &str,
        kind: ExposureKind,
        name: &str,
    ) -> Result<Option<Exposure>> {
        match kind {
            ExposureKind::Route => Ok(get_opt(&self.routes(namespace), name)
                .await?
                .map(Exposure::Route)),
            ExposureKind::Ingress => {
                let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
                Ok(get_opt(&api, name).await?.map(Exposure::Ingress))
            }
        }
    }

    async fn create_exposure(&self, namespace: &str, exposure: &Exposure) -> Result<Exposure> {
        match exposure {
            Exposure::Route(route) => Ok(Exposure::Route(
                create(&self.routes(namespace), "Route", namespace, route).await?,
            )),
            Exposure::Ingress(ingress) => {
                let api = Api::namespaced(self.client.clone(), namespace);
                Ok(Exposure::Ingress(
                    create(&api, "Ingress", namespace, ingress).await?,
                ))
            }
        }
    }

    async fn replace_exposure(&self, namespace: &str, exposure: &Exposure) -> Result<Exposure> {
        match exposure {
            Exposure::Route(route) => Ok(Exposure::Route(
                replace(&self.routes(namespace), "Route", namespace, route).await?,
            )),
            Exposure::Ingress(ingress) => {
                let api = Api::namespaced(self.client.clone(), namespace);
                Ok(Exposure::Ingress(
                    replace(&api, "Ingress", namespace, ingress).await?,
                ))
            }
        }
    }

    async fn delete_exposure(
        &self,
        namespace: &str,
        kind: ExposureKind,
        name: &str,
    ) -> Result<bool> {
        match kind {
            ExposureKind::Route => delete(&self.routes(namespace), name).await,
            ExposureKind::Ingress => {
                let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
                delete(&api, name).await
            }
        }
    }
}
