//! Deployment / Service / Route / Ingress マニフェストの生成

use crate::cluster::Exposure;
use crate::error::Result;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, HTTPGetAction, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SeccompProfile, SecurityContext, Service,
    ServicePort, ServiceSpec, TCPSocketAction,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde::Serialize;
use serde_json::json;
use shipflow_config::{ExposureKind, ResourceQuantity};
use std::collections::BTreeMap;

/// どの種類で公開したかを記録するアノテーション
pub const EXPOSURE_ANNOTATION: &str = "shipflow.dev/exposure";

/// OpenShift Route の API 定義
pub fn route_resource() -> ApiResource {
    ApiResource {
        group: "route.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "route.openshift.io/v1".to_string(),
        kind: "Route".to_string(),
        plural: "routes".to_string(),
    }
}

/// [`AppManifest::render`] の結果
#[derive(Debug, Clone, Serialize)]
pub struct RenderedManifests {
    pub name: String,
    pub namespace: String,
    pub image: String,
    /// `yaml` に含まれるリソースの種類（出力順）
    pub kinds: Vec<String>,
    pub yaml: String,
}

/// 既定値を適用済みのデプロイ内容
#[derive(Debug, Clone, PartialEq)]
pub struct AppManifest {
    pub name: String,
    pub namespace: String,
    /// タグ付きのイメージ参照
    pub image: String,
    pub version: String,
    pub replicas: i32,
    pub port: i32,
    pub service_type: String,
    pub requests: ResourceQuantity,
    pub limits: ResourceQuantity,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub health_path: Option<String>,
    pub exposure: Option<ExposureKind>,
    pub exposure_domain: Option<String>,
}

impl AppManifest {
    /// `app` / `version` を含むリソース共通ラベル
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert("app".to_string(), self.name.clone());
        labels.insert("version".to_string(), sanitize_label_value(&self.version));
        labels
    }

    pub fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), self.name.clone())])
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            annotations: (!self.annotations.is_empty()).then(|| self.annotations.clone()),
            ..Default::default()
        }
    }

    pub fn deployment(&self) -> Deployment {
        let mut metadata = self.metadata();
        if let Some(kind) = self.exposure {
            metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(EXPOSURE_ANNOTATION.to_string(), exposure_name(kind).to_string());
        }

        let env = self
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();

        Deployment {
            metadata,
            spec: Some(DeploymentSpec {
                replicas: Some(self.replicas),
                selector: LabelSelector {
                    match_labels: Some(self.selector()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        security_context: Some(PodSecurityContext {
                            run_as_non_root: Some(true),
                            seccomp_profile: Some(SeccompProfile {
                                type_: "RuntimeDefault".to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        containers: vec![Container {
                            name: self.name.clone(),
                            image: Some(self.image.clone()),
                            ports: Some(vec![ContainerPort {
                                name: Some("http".to_string()),
                                container_port: self.port,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            }]),
                            env: Some(env),
                            resources: Some(ResourceRequirements {
                                requests: Some(quantities(&self.requests)),
                                limits: Some(quantities(&self.limits)),
                                ..Default::default()
                            }),
                            readiness_probe: Some(self.probe(5, 10)),
                            liveness_probe: Some(self.probe(30, 20)),
                            security_context: Some(SecurityContext {
                                allow_privilege_escalation: Some(false),
                                capabilities: Some(Capabilities {
                                    drop: Some(vec!["ALL".to_string()]),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn probe(&self, initial_delay: i32, period: i32) -> Probe {
        let port = IntOrString::Int(self.port);
        let (http_get, tcp_socket) = match self.health_path.as_deref() {
            Some(path) if !path.is_empty() => (
                Some(HTTPGetAction {
                    path: Some(path.to_string()),
                    port,
                    ..Default::default()
                }),
                None,
            ),
            _ => (
                None,
                Some(TCPSocketAction {
                    port,
                    ..Default::default()
                }),
            ),
        };
        Probe {
            http_get,
            tcp_socket,
            initial_delay_seconds: Some(initial_delay),
            period_seconds: Some(period),
            ..Default::default()
        }
    }

    pub fn service(&self) -> Service {
        Service {
            metadata: self.metadata(),
            spec: Some(ServiceSpec {
                type_: Some(self.service_type.clone()),
                selector: Some(self.selector()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: self.port,
                    target_port: Some(IntOrString::Int(self.port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// 外部公開ホスト（ドメイン指定時のみ）
    pub fn external_host(&self) -> Option<String> {
        self.exposure_domain
            .as_deref()
            .map(|d| d.trim().trim_start_matches('.'))
            .filter(|d| !d.is_empty())
            .map(|domain| format!("{}-{}.{}", self.name, self.namespace, domain))
    }

    /// 公開しない設定なら `None`
    pub fn exposure(&self) -> Option<Exposure> {
        match self.exposure? {
            ExposureKind::Route => Some(Exposure::Route(self.route())),
            ExposureKind::Ingress => Some(Exposure::Ingress(self.ingress())),
        }
    }

    /// クラスタに適用するリソースを複数ドキュメントの YAML に書き出す
    pub fn render(&self) -> Result<RenderedManifests> {
        let mut kinds = vec!["Deployment".to_string(), "Service".to_string()];
        let mut documents = vec![
            serde_yaml::to_string(&self.deployment())?,
            serde_yaml::to_string(&self.service())?,
        ];
        match self.exposure() {
            Some(Exposure::Route(route)) => {
                kinds.push("Route".to_string());
                documents.push(serde_yaml::to_string(&route)?);
            }
            Some(Exposure::Ingress(ingress)) => {
                kinds.push("Ingress".to_string());
                documents.push(serde_yaml::to_string(&ingress)?);
            }
            None => {}
        }
        Ok(RenderedManifests {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            image: self.image.clone(),
            kinds,
            yaml: documents.join("---\n"),
        })
    }

    fn route(&self) -> DynamicObject {
        let mut route = DynamicObject::new(&self.name, &route_resource()).within(&self.namespace);
        route.metadata.labels = Some(self.labels());
        let mut spec = json!({
            "to": { "kind": "Service", "name": self.name, "weight": 100 },
            "port": { "targetPort": "http" },
            "tls": { "termination": "edge", "insecureEdgeTerminationPolicy": "Redirect" },
        });
        if let Some(host) = self.external_host() {
            spec["host"] = json!(host);
        }
        route.data = json!({ "spec": spec });
        route
    }

    fn ingress(&self) -> Ingress {
        Ingress {
            metadata: self.metadata(),
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: self.external_host(),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: self.name.clone(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(self.port),
                                        ..Default::default()
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

pub fn exposure_name(kind: ExposureKind) -> &'static str {
    match kind {
        ExposureKind::Route => "route",
        ExposureKind::Ingress => "ingress",
    }
}

fn quantities(resources: &ResourceQuantity) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(resources.cpu.clone())),
        ("memory".to_string(), Quantity(resources.memory.clone())),
    ])
}

/// ラベル値として使える形に整える（63 文字以内、英数字で始まり英数字で終わる）
pub fn sanitize_label_value(value: &str) -> String {
    let mut sanitized: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized.truncate(63);
    sanitized
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}
