//! テスト用のインメモリクラスタ
//!
//! resourceVersion の一致と Service の clusterIP の不変性を API サーバーと同様に検査する。

use crate::cluster::{ClusterClient, Exposure};
use crate::error::{DeployError, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::DynamicObject;
use shipflow_config::ExposureKind;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

type Key = (String, String);

struct State {
    namespaces: BTreeSet<String>,
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    routes: BTreeMap<Key, DynamicObject>,
    ingresses: BTreeMap<Key, Ingress>,
    revision: u64,
    next_ip: u8,
    ready: bool,
    fail_exposure: bool,
    fail_delete: HashSet<String>,
    fail_get: HashSet<String>,
    race_next_create: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            namespaces: BTreeSet::new(),
            deployments: BTreeMap::new(),
            services: BTreeMap::new(),
            routes: BTreeMap::new(),
            ingresses: BTreeMap::new(),
            revision: 0,
            next_ip: 10,
            ready: true,
            fail_exposure: false,
            fail_delete: HashSet::new(),
            fail_get: HashSet::new(),
            race_next_create: false,
        }
    }
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    /// 新しい世代を割り当て、準備完了ならステータスを追いつかせる
    fn settle(&mut self, deployment: &mut Deployment, generation: i64) {
        deployment.metadata.generation = Some(generation);
        deployment.metadata.resource_version = Some(self.next_revision());
        let replicas = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        deployment.status = Some(if self.ready {
            DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(replicas),
                updated_replicas: Some(replicas),
                observed_generation: Some(generation),
                ..Default::default()
            }
        } else {
            DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(0),
                updated_replicas: Some(0),
                observed_generation: Some(generation),
                ..Default::default()
            }
        });
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn name_of(metadata: &ObjectMeta) -> String {
    metadata.name.clone().unwrap_or_default()
}

fn conflict(kind: &'static str, namespace: &str, name: &str) -> DeployError {
    DeployError::Conflict {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn exists(kind: &'static str, namespace: &str, name: &str) -> DeployError {
    DeployError::AlreadyExists {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn missing(namespace: &str, name: &str) -> DeployError {
    DeployError::NotFound {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

/// メモリ上のクラスタ
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `false` の間は Pod が準備完了にならない
    pub fn set_ready(&self, ready: bool) {
        self.state().ready = ready;
    }

    pub fn fail_exposure(&self, fail: bool) {
        self.state().fail_exposure = fail;
    }

    /// `deployment` / `service` / `route` / `ingress` の削除を失敗させる
    pub fn fail_delete(&self, resource: &str) {
        self.state().fail_delete.insert(resource.to_string());
    }

    /// `service` / `route` / `ingress` の取得を失敗させる
    pub fn fail_get(&self, resource: &str) {
        self.state().fail_get.insert(resource.to_string());
    }

    /// 次の Deployment 作成の直前に別の作成者が同名で作成したことにする
    pub fn race_next_create(&self) {
        self.state().race_next_create = true;
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state().namespaces.iter().cloned().collect()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state().deployments.get(&key(namespace, name)).cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state().services.get(&key(namespace, name)).cloned()
    }

    pub fn deployment_count(&self, namespace: &str) -> usize {
        self.state()
            .deployments
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .count()
    }

    pub fn service_count(&self, namespace: &str) -> usize {
        self.state()
            .services
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .count()
    }

    pub fn exposure_count(&self, namespace: &str) -> usize {
        let state = self.state();
        state.routes.keys().filter(|(ns, _)| ns == namespace).count()
            + state
                .ingresses
                .keys()
                .filter(|(ns, _)| ns == namespace)
                .count()
    }

    /// 管理ラベルを持たない Deployment を追加
    pub fn insert_unmanaged_deployment(&self, namespace: &str, name: &str) {
        let mut state = self.state();
        let mut deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        };
        state.settle(&mut deployment, 1);
        state.deployments.insert(key(namespace, name), deployment);
    }

    fn check_delete(&self, resource: &str) -> Result<()> {
        if self.state().fail_delete.contains(resource) {
            return Err(DeployError::Unavailable(format!(
                "{} deletion rejected",
                resource
            )));
        }
        Ok(())
    }

    fn check_get(&self, resource: &str) -> Result<()> {
        if self.state().fail_get.contains(resource) {
            return Err(DeployError::Unavailable(format!("{} lookup rejected", resource)));
        }
        Ok(())
    }
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k)).is_some_and(|x| x == v),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn ensure_namespace(&self, name: &str) -> Result<bool> {
        Ok(self.state().namespaces.insert(name.to_string()))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployment(namespace, name))
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let mut state = self.state();
        let name = name_of(&deployment.metadata);
        let k = key(namespace, &name);

        if state.race_next_create {
            state.race_next_create = false;
            let mut other = deployment.clone();
            if let Some(spec) = other.spec.as_mut() {
                spec.replicas = Some(1);
            }
            state.settle(&mut other, 1);
            state.deployments.insert(k, other);
            return Err(exists("Deployment", namespace, &name));
        }
        if state.deployments.contains_key(&k) {
            return Err(exists("Deployment", namespace, &name));
        }

        let mut created = deployment.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        state.settle(&mut created, 1);
        state.deployments.insert(k, created.clone());
        Ok(created)
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let mut state = self.state();
        let name = name_of(&deployment.metadata);
        let k = key(namespace, &name);
        let current = state
            .deployments
            .get(&k)
            .cloned()
            .ok_or_else(|| missing(namespace, &name))?;
        if deployment.metadata.resource_version != current.metadata.resource_version {
            return Err(conflict("Deployment", namespace, &name));
        }

        let mut replaced = deployment.clone();
        replaced.metadata.namespace = Some(namespace.to_string());
        replaced.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        let generation = current.metadata.generation.unwrap_or(1) + 1;
        state.settle(&mut replaced, generation);
        state.deployments.insert(k, replaced.clone());
        Ok(replaced)
    }

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>> {
        Ok(self
            .state()
            .deployments
            .iter()
            .filter(|((ns, _), d)| {
                ns == namespace && matches_selector(d.metadata.labels.as_ref(), selector)
            })
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<bool> {
        self.check_delete("deployment")?;
        Ok(self
            .state()
            .deployments
            .remove(&key(namespace, name))
            .is_some())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.check_get("service")?;
        Ok(self.service(namespace, name))
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let mut state = self.state();
        let name = name_of(&service.metadata);
        let k = key(namespace, &name);
        if state.services.contains_key(&k) {
            return Err(exists("Service", namespace, &name));
        }

        let mut created = service.clone();
        created.metadata.resource_version = Some(state.next_revision());
        let ip = format!("10.96.0.{}", state.next_ip);
        state.next_ip = state.next_ip.wrapping_add(1);
        if let Some(spec) = created.spec.as_mut() {
            spec.cluster_ip = Some(ip.clone());
            spec.cluster_ips = Some(vec![ip]);
        }
        state.services.insert(k, created.clone());
        Ok(created)
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let mut state = self.state();
        let name = name_of(&service.metadata);
        let k = key(namespace, &name);
        let current = state
            .services
            .get(&k)
            .cloned()
            .ok_or_else(|| missing(namespace, &name))?;
        if service.metadata.resource_version != current.metadata.resource_version {
            return Err(conflict("Service", namespace, &name));
        }
        let ip = |s: &Service| s.spec.as_ref().and_then(|s| s.cluster_ip.clone());
        if ip(service) != ip(&current) {
            return Err(DeployError::InvalidConfig(
                "spec.clusterIP: field is immutable".to_string(),
            ));
        }

        let mut replaced = service.clone();
        replaced.metadata.resource_version = Some(state.next_revision());
        state.services.insert(k, replaced.clone());
        Ok(replaced)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool> {
        self.check_delete("service")?;
        Ok(self.state().services.remove(&key(namespace, name)).is_some())
    }

    async fn get_exposure(
        &self,
        namespace: &str,
        kind: ExposureKind,
        name: &str,
    ) -> Result<Option<Exposure>> {
        self.check_get(match kind {
            ExposureKind::Route => "route",
            ExposureKind::Ingress => "ingress",
        })?;
        let state = self.state();
        let k = key(namespace, name);
        Ok(match kind {
            ExposureKind::Route => state.routes.get(&k).cloned().map(Exposure::Route),
            ExposureKind::Ingress => state.ingresses.get(&k).cloned().map(Exposure::Ingress),
        })
    }

    async fn create_exposure(&self, namespace: &str, exposure: &Exposure) -> Result<Exposure> {
        let mut state = self.state();
        if state.fail_exposure {
            return Err(DeployError::Unavailable(
                "the server could not find the requested resource".to_string(),
            ));
        }
        let name = exposure.name().to_string();
        let k = key(namespace, &name);
        let revision = state.next_revision();

        match exposure {
            Exposure::Route(route) => {
                if state.routes.contains_key(&k) {
                    return Err(exists("Route", namespace, &name));
                }
                let mut created = route.clone();
                created.metadata.resource_version = Some(revision);
                if created.data["spec"]["host"].is_null() {
                    // クラスタが既定のホストを割り当てる
                    created.data["spec"]["host"] =
                        serde_json::json!(format!("{}-{}.apps.cluster.local", name, namespace));
                }
                state.routes.insert(k, created.clone());
                Ok(Exposure::Route(created))
            }
            Exposure::Ingress(ingress) => {
                if state.ingresses.contains_key(&k) {
                    return Err(exists("Ingress", namespace, &name));
                }
                let mut created = ingress.clone();
                created.metadata.resource_version = Some(revision);
                state.ingresses.insert(k, created.clone());
                Ok(Exposure::Ingress(created))
            }
        }
    }

    async fn replace_exposure(&self, namespace: &str, exposure: &Exposure) -> Result<Exposure> {
        let mut state = self.state();
        if state.fail_exposure {
            return Err(DeployError::Unavailable(
                "the server could not find the requested resource".to_string(),
            ));
        }
        let name = exposure.name().to_string();
        let k = key(namespace, &name);
        let current_version = match exposure.kind() {
            ExposureKind::Route => state
                .routes
                .get(&k)
                .map(|r| r.metadata.resource_version.clone()),
            ExposureKind::Ingress => state
                .ingresses
                .get(&k)
                .map(|i| i.metadata.resource_version.clone()),
        }
        .ok_or_else(|| missing(namespace, &name))?;
        if exposure.metadata().resource_version != current_version {
            return Err(conflict("Exposure", namespace, &name));
        }

        let mut replaced = exposure.clone();
        replaced.metadata_mut().resource_version = Some(state.next_revision());
        match &replaced {
            Exposure::Route(route) => {
                state.routes.insert(k, route.clone());
            }
            Exposure::Ingress(ingress) => {
                state.ingresses.insert(k, ingress.clone());
            }
        }
        Ok(replaced)
    }

    async fn delete_exposure(
        &self,
        namespace: &str,
        kind: ExposureKind,
        name: &str,
    ) -> Result<bool> {
        let k = key(namespace, name);
        match kind {
            ExposureKind::Route => {
                self.check_delete("route")?;
                Ok(self.state().routes.remove(&k).is_some())
            }
            ExposureKind::Ingress => {
                self.check_delete("ingress")?;
                Ok(self.state().ingresses.remove(&k).is_some())
            }
        }
    }
}
