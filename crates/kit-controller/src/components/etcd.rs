//! etcd 集群
//!
//! 以 StatefulSet 运行，通过 headless Service 提供稳定的成员域名。
//! etcd 证书保存在独立的 Secret 中，只在 Secret 不存在时生成一次。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec,
    ResourceRequirements, Secret, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use tracing::info;

use kit_common::models::naming;
use kit_common::{ControlPlane, OperatorConfig, Result};

use super::{cluster_labels, generate_secret_data, namespace_of, secret_volume, ControlPlaneDeps};
use crate::apply::{ensure_create, ensure_patch, owned_by};
use crate::bootstrap::manifests::{etcd_container, ETCD};
use crate::bootstrap::{ArtifactWriter, ClusterConfig};
use crate::store::{get_typed, ObjectKey, ObjectStore};
use crate::subcontroller::SubController;

const DATA_VOLUME_SIZE: &str = "10Gi";

pub struct EtcdStage {
    store: Arc<dyn ObjectStore>,
    writer: Arc<dyn ArtifactWriter>,
    config: Arc<OperatorConfig>,
}

impl EtcdStage {
    pub fn new(deps: &ControlPlaneDeps) -> Self {
        Self {
            store: deps.store.clone(),
            writer: deps.writer.clone(),
            config: deps.config.clone(),
        }
    }

    async fn ensure_certificates(&self, parent: &ControlPlane, config: &ClusterConfig) -> Result<String> {
        let name = naming::etcd_pki_secret_name(&config.name)?;
        let namespace = namespace_of(parent)?;
        let key = ObjectKey::namespaced(namespace.clone(), name.clone());
        if get_typed::<Secret>(self.store.as_ref(), &key).await?.is_some() {
            return Ok(name);
        }

        let writer = self.writer.clone();
        let cluster = config.clone();
        let data =
            generate_secret_data(move |dir| writer.write_etcd_certificates(&cluster, dir)).await?;
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace),
                labels: Some(cluster_labels(&config.name, ETCD)),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        ensure_create(self.store.as_ref(), &owned_by(parent, secret)?).await?;
        info!("已生成 {} 的 etcd 证书", config.name);
        Ok(name)
    }
}

fn headless_service(parent: &ControlPlane, name: &str, labels: &BTreeMap<String, String>) -> Result<Service> {
    let port = |name: &str, port: i32| ServicePort {
        name: Some(name.into()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".into()),
        ..Default::default()
    };
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace_of(parent)?),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".into()),
            selector: Some(labels.clone()),
            publish_not_ready_addresses: Some(true),
            ports: Some(vec![port("client", 2379), port("peer", 2380)]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn stateful_set(
    parent: &ControlPlane,
    config: &ClusterConfig,
    name: &str,
    pki_secret: &str,
    labels: &BTreeMap<String, String>,
) -> Result<StatefulSet> {
    let data_claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("etcd-data".into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(DATA_VOLUME_SIZE.into()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace_of(parent)?),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(parent.spec.etcd.replicas),
            service_name: name.into(),
            pod_management_policy: Some("Parallel".into()),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![etcd_container(config)],
                    volumes: Some(vec![secret_volume("etcd-certs", pki_secret, None)]),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![data_claim]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[async_trait]
impl SubController<ControlPlane> for EtcdStage {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn reconcile(&self, parent: &mut ControlPlane) -> Result<()> {
        let config = ClusterConfig::for_control_plane(parent, parent.endpoint(), &self.config.images)?;
        let name = naming::etcd_name(&config.name)?;
        let labels = cluster_labels(&config.name, ETCD);

        let pki_secret = self.ensure_certificates(parent, &config).await?;
        let service = owned_by(parent, headless_service(parent, &name, &labels)?)?;
        ensure_patch(self.store.as_ref(), &service).await?;
        let statefulset = owned_by(
            parent,
            stateful_set(parent, &config, &name, &pki_secret, &labels)?,
        )?;
        ensure_patch(self.store.as_ref(), &statefulset).await
    }

    /// Service、StatefulSet 与证书随 ControlPlane 级联删除
    async fn finalize(&self, _parent: &mut ControlPlane) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::tests::{control_plane, harness};

    #[tokio::test]
    async fn test_etcd_resources_converge() {
        let h = harness();
        let mut cp = control_plane(&h.store);
        let stage = EtcdStage::new(&h.deps);

        stage.reconcile(&mut cp).await.unwrap();
        let key = ObjectKey::namespaced("tenants", "demo-etcd");
        let sts = h.store.get_typed::<StatefulSet>(&key).unwrap();
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name, "demo-etcd");
        let command = spec.template.spec.unwrap().containers[0].command.clone().unwrap();
        assert!(command.contains(&"--name=$(POD_NAME)".to_string()));

        let service = h.store.get_typed::<Service>(&key).unwrap();
        assert_eq!(service.spec.unwrap().cluster_ip.as_deref(), Some("None"));

        let secret = h
            .store
            .get_typed::<Secret>(&ObjectKey::namespaced("tenants", "demo-etcd-pki"))
            .unwrap();
        let data = secret.data.unwrap();
        for file in ["ca.crt", "server.crt", "peer.key", "apiserver-etcd-client.crt"] {
            assert!(data.contains_key(file), "{file} 缺失");
        }

        h.store.clear_calls();
        stage.reconcile(&mut cp).await.unwrap();
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn test_existing_certificates_are_adopted() {
        let h = harness();
        let mut cp = control_plane(&h.store);
        let mut existing = Secret::default();
        existing.metadata.name = Some("demo-etcd-pki".into());
        existing.metadata.namespace = Some("tenants".into());
        h.store.insert(&existing).unwrap();

        EtcdStage::new(&h.deps).reconcile(&mut cp).await.unwrap();
        assert_eq!(h.store.creates_of("Secret"), 0);
        let secret = h
            .store
            .get_typed::<Secret>(&ObjectKey::namespaced("tenants", "demo-etcd-pki"))
            .unwrap();
        assert!(secret.data.is_none());
    }
}
