//! master 组件：endpoint、证书与控制平面进程
//!
//! 负载均衡器的主机名由云控制器异步分配，在此之前本阶段返回 NotReady。
//! 证书与 kubeconfig 依赖该主机名，因此只能在门控之后生成。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, KeyToPath, PodSpec, PodTemplateSpec, Secret, Service, ServicePort, ServiceSpec,
    Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use tracing::info;

use kit_common::models::naming;
use kit_common::{ControlPlane, OperatorConfig, Result};

use super::{cluster_labels, generate_secret_data, namespace_of, secret_volume, ControlPlaneDeps};
use crate::apply::{ensure_create, ensure_patch, owned_by};
use crate::bootstrap::manifests::{
    apiserver_container, controller_manager_container, scheduler_container, KUBE_APISERVER,
    KUBE_CONTROLLER_MANAGER, KUBE_SCHEDULER,
};
use crate::bootstrap::{ArtifactWriter, ClusterConfig};
use crate::readiness::require;
use crate::store::{get_typed, ObjectKey, ObjectStore};
use crate::subcontroller::SubController;

const API_SERVER_PORT: i32 = 443;

pub struct MasterStage {
    store: Arc<dyn ObjectStore>,
    writer: Arc<dyn ArtifactWriter>,
    config: Arc<OperatorConfig>,
}

impl MasterStage {
    pub fn new(deps: &ControlPlaneDeps) -> Self {
        Self {
            store: deps.store.clone(),
            writer: deps.writer.clone(),
            config: deps.config.clone(),
        }
    }

    async fn ensure_endpoint_service(&self, parent: &ControlPlane) -> Result<ObjectKey> {
        let cluster = parent.cluster_name();
        let namespace = namespace_of(parent)?;
        let name = naming::service_name_for(&cluster)?;
        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                annotations: Some(BTreeMap::from([
                    (
                        "service.beta.kubernetes.io/aws-load-balancer-scheme".to_string(),
                        "internet-facing".to_string(),
                    ),
                    (
                        "service.beta.kubernetes.io/aws-load-balancer-type".to_string(),
                        "nlb-ip".to_string(),
                    ),
                    (
                        "service.beta.kubernetes.io/aws-load-balancer-target-group-attributes"
                            .to_string(),
                        "stickiness.enabled=true,stickiness.type=source_ip".to_string(),
                    ),
                ])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".into()),
                selector: Some(cluster_labels(&cluster, KUBE_APISERVER)),
                ports: Some(vec![ServicePort {
                    name: Some(naming::apiserver_port_name(&cluster)?),
                    port: API_SERVER_PORT,
                    target_port: Some(IntOrString::Int(API_SERVER_PORT)),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        // 云控制器会修改 Service，只创建不更新
        ensure_create(self.store.as_ref(), &owned_by(parent, service)?).await?;
        Ok(ObjectKey::namespaced(namespace, name))
    }

    /// 负载均衡器分配的主机名
    async fn endpoint(&self, key: &ObjectKey) -> Result<String> {
        let service = get_typed::<Service>(self.store.as_ref(), key).await?;
        let hostname = service
            .and_then(|s| s.status)
            .and_then(|s| s.load_balancer)
            .and_then(|lb| lb.ingress)
            .and_then(|ingress| ingress.into_iter().next())
            .and_then(|ingress| ingress.hostname.or(ingress.ip))
            .filter(|hostname| !hostname.is_empty());
        require(hostname, format!("Service {key} 的负载均衡器主机名"))
    }

    /// 证书与 kubeconfig 只生成一次，之后沿用已有的 Secret
    async fn ensure_pki_secret(&self, parent: &ControlPlane, config: &ClusterConfig) -> Result<Secret> {
        let name = naming::pki_secret_name(&config.name)?;
        let key = ObjectKey::namespaced(namespace_of(parent)?, name.clone());
        if let Some(existing) = get_typed::<Secret>(self.store.as_ref(), &key).await? {
            return Ok(existing);
        }

        let writer = self.writer.clone();
        let cluster = config.clone();
        let data = generate_secret_data(move |dir| {
            let pki_dir = dir.join("pki");
            writer.write_certificates(&cluster, &pki_dir)?;
            writer.write_kubeconfigs(&cluster, &pki_dir, dir)
        })
        .await?;
        let secret = owned_by(
            parent,
            Secret {
                metadata: ObjectMeta {
                    name: Some(name),
                    namespace: key.namespace.clone(),
                    labels: Some(cluster_labels(&config.name, KUBE_APISERVER)),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            },
        )?;
        ensure_create(self.store.as_ref(), &secret).await?;
        info!("已生成 {} 的证书与 kubeconfig", config.name);
        Ok(secret)
    }
}

/// 将扁平的 Secret 键映射回 /etc/kubernetes 下的目录结构
fn pki_items(secret: &Secret) -> Option<Vec<KeyToPath>> {
    let data = secret.data.as_ref().filter(|d| !d.is_empty())?;
    Some(
        data.keys()
            .map(|key| KeyToPath {
                key: key.clone(),
                path: if key.ends_with(".conf") {
                    key.clone()
                } else {
                    format!("pki/{key}")
                },
                mode: None,
            })
            .collect(),
    )
}

fn deployment(
    parent: &ControlPlane,
    component: &str,
    container: Container,
    volumes: Vec<Volume>,
) -> Result<Deployment> {
    let cluster = parent.cluster_name();
    let labels = cluster_labels(&cluster, component);
    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(naming::component_name(&cluster, component)?),
            namespace: Some(namespace_of(parent)?),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(parent.spec.master.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[async_trait]
impl SubController<ControlPlane> for MasterStage {
    fn name(&self) -> &'static str {
        "master"
    }

    async fn reconcile(&self, parent: &mut ControlPlane) -> Result<()> {
        let service = self.ensure_endpoint_service(parent).await?;
        let endpoint = self.endpoint(&service).await?;
        parent.status.get_or_insert_with(Default::default).endpoint = Some(endpoint.clone());

        let config = ClusterConfig::for_control_plane(parent, Some(&endpoint), &self.config.images)?;
        let pki = self.ensure_pki_secret(parent, &config).await?;
        let pki_name = pki.metadata.name.clone().unwrap_or_default();
        parent.status.get_or_insert_with(Default::default).pki_secret = Some(pki_name.clone());

        let k8s_certs = secret_volume("k8s-certs", &pki_name, pki_items(&pki));
        let etcd_certs = secret_volume("etcd-certs", &naming::etcd_pki_secret_name(&config.name)?, None);
        let deployments = [
            deployment(
                parent,
                KUBE_APISERVER,
                apiserver_container(&config),
                vec![k8s_certs.clone(), etcd_certs],
            )?,
            deployment(
                parent,
                KUBE_CONTROLLER_MANAGER,
                controller_manager_container(&config),
                vec![k8s_certs.clone()],
            )?,
            deployment(
                parent,
                KUBE_SCHEDULER,
                scheduler_container(&config),
                vec![k8s_certs],
            )?,
        ];
        for deployment in deployments {
            ensure_patch(self.store.as_ref(), &owned_by(parent, deployment)?).await?;
        }
        Ok(())
    }

    /// 所有资源都归 ControlPlane 所有，随其级联删除
    async fn finalize(&self, _parent: &mut ControlPlane) -> Result<()> {
        Ok(())
    }
}
