//! 租户集群插件：kube-proxy
//!
//! 与前面的阶段不同，这里的对象写入租户集群自身的 API Server，
//! 连接凭据取自 master 阶段生成的 admin kubeconfig。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, RollingUpdateDaemonSet,
};
use k8s_openapi::api::core::v1::{
    Container, KeyToPath, PodSpec, PodTemplateSpec, ResourceRequirements, Secret,
    SecretVolumeSource, SecurityContext, ServiceAccount, Toleration, Volume,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::info;

use kit_common::models::naming;
use kit_common::{ControlPlane, Error, OperatorConfig, Result};

use super::{namespace_of, ControlPlaneDeps};
use crate::apply::{ensure_create, ensure_patch};
use crate::bootstrap::kubeconfig::KubeConfig;
use crate::bootstrap::manifests::{host_path_volume, mount};
use crate::bootstrap::{ClusterConfig, ADMIN_KUBECONFIG};
use crate::readiness::require;
use crate::store::{get_typed, KubeStore, ObjectKey, ObjectStore};
use crate::subcontroller::SubController;

const KUBE_SYSTEM: &str = "kube-system";
const KUBE_PROXY: &str = "kube-proxy";
const KUBECONFIG_KEY: &str = "config";
const CA_CERT_KEY: &str = "ca.crt";

/// 根据 kubeconfig 建立到租户集群的连接
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, kubeconfig: &[u8]) -> Result<Arc<dyn ObjectStore>>;
}

/// 使用 kube 客户端连接租户 API Server
#[derive(Debug, Default, Clone)]
pub struct KubeconfigConnector;

#[async_trait]
impl ClusterConnector for KubeconfigConnector {
    async fn connect(&self, kubeconfig: &[u8]) -> Result<Arc<dyn ObjectStore>> {
        let yaml = std::str::from_utf8(kubeconfig)
            .map_err(|e| Error::Store(format!("kubeconfig 不是合法的 UTF-8: {e}")))?;
        let kubeconfig = Kubeconfig::from_yaml(yaml)
            .map_err(|e| Error::Store(format!("解析 kubeconfig 失败: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::Store(format!("加载 kubeconfig 失败: {e}")))?;
        let client = Client::try_from(config)?;
        Ok(Arc::new(KubeStore::new(client)))
    }
}

pub struct KubeProxyStage {
    store: Arc<dyn ObjectStore>,
    connector: Arc<dyn ClusterConnector>,
    config: Arc<OperatorConfig>,
}

impl KubeProxyStage {
    pub fn new(deps: &ControlPlaneDeps) -> Self {
        Self {
            store: deps.store.clone(),
            connector: deps.connector.clone(),
            config: deps.config.clone(),
        }
    }

    /// 读取 PKI Secret 中的 admin kubeconfig 与集群 CA
    async fn credentials(&self, parent: &ControlPlane, secret: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = ObjectKey::namespaced(namespace_of(parent)?, secret);
        let secret = require(
            get_typed::<Secret>(self.store.as_ref(), &key).await?,
            format!("Secret {key}"),
        )?;
        let mut data = secret.data.unwrap_or_default();
        let admin = require(data.remove(ADMIN_KUBECONFIG), format!("{key} 中的 {ADMIN_KUBECONFIG}"))?;
        let ca = require(data.remove(CA_CERT_KEY), format!("{key} 中的 {CA_CERT_KEY}"))?;
        Ok((admin.0, ca.0))
    }
}

fn service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(KUBE_PROXY.into()),
            namespace: Some(KUBE_SYSTEM.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn cluster_role_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some("kit:kube-proxy".into()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "ClusterRole".into(),
            name: "system:node-proxier".into(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name: KUBE_PROXY.into(),
            namespace: Some(KUBE_SYSTEM.into()),
            ..Default::default()
        }]),
    }
}

fn kubeconfig_secret(name: &str, kubeconfig: String) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(KUBE_SYSTEM.into()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            KUBECONFIG_KEY.to_string(),
            ByteString(kubeconfig.into_bytes()),
        )])),
        ..Default::default()
    }
}

fn daemon_set(image: String, config_secret: &str) -> DaemonSet {
    let labels = BTreeMap::from([("k8s-app".to_string(), KUBE_PROXY.to_string())]);
    let kubeconfig_volume = Volume {
        name: "kubeproxy-kubeconfig".into(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(config_secret.into()),
            default_mode: Some(0o400),
            items: Some(vec![KeyToPath {
                key: KUBECONFIG_KEY.into(),
                path: "kubeconfig".into(),
                mode: None,
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    let container = Container {
        name: "kubeproxy".into(),
        image: Some(image),
        command: Some(vec![KUBE_PROXY.into()]),
        args: Some(vec![
            "--kubeconfig=/var/lib/kube-proxy/kubeconfig".into(),
            "--iptables-min-sync-period=0s".into(),
            "--oom-score-adj=-998".into(),
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([("cpu".to_string(), Quantity("1".into()))])),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            mount("varlog", "/var/log", false),
            mount("xtables-lock", "/run/xtables.lock", false),
            mount("lib-modules", "/lib/modules", true),
            mount("kubeproxy-kubeconfig", "/var/lib/kube-proxy", true),
        ]),
        ..Default::default()
    };

    DaemonSet {
        metadata: ObjectMeta {
            name: Some("kubeproxy-daemonset".into()),
            namespace: Some(KUBE_SYSTEM.into()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("RollingUpdate".into()),
                rolling_update: Some(RollingUpdateDaemonSet::default()),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    termination_grace_period_seconds: Some(1),
                    service_account_name: Some(KUBE_PROXY.into()),
                    host_network: Some(true),
                    dns_policy: Some("ClusterFirst".into()),
                    priority_class_name: Some("system-node-critical".into()),
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".into()),
                        ..Default::default()
                    }]),
                    containers: vec![container],
                    volumes: Some(vec![
                        host_path_volume("varlog", "/var/log", None),
                        host_path_volume("xtables-lock", "/run/xtables.lock", Some("FileOrCreate")),
                        host_path_volume("lib-modules", "/lib/modules", None),
                        kubeconfig_volume,
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl SubController<ControlPlane> for KubeProxyStage {
    fn name(&self) -> &'static str {
        "addons"
    }

    async fn reconcile(&self, parent: &mut ControlPlane) -> Result<()> {
        let cluster = parent.cluster_name();
        let endpoint = require(parent.endpoint().map(str::to_string), format!("{cluster} 的 endpoint"))?;
        let pki_secret = require(
            parent.status.as_ref().and_then(|s| s.pki_secret.clone()),
            format!("{cluster} 的 PKI Secret"),
        )?;
        let config = ClusterConfig::for_control_plane(parent, Some(&endpoint), &self.config.images)?;
        let (admin, ca) = self.credentials(parent, &pki_secret).await?;
        let tenant = self.connector.connect(&admin).await?;

        ensure_patch(tenant.as_ref(), &service_account()).await?;
        ensure_create(tenant.as_ref(), &cluster_role_binding()).await?;

        let config_name = naming::kube_proxy_config_name(&cluster)?;
        let kubeconfig = KubeConfig::with_token_file("default", &config.server_url()?, &ca).to_yaml()?;
        ensure_patch(tenant.as_ref(), &kubeconfig_secret(&config_name, kubeconfig)).await?;
        ensure_patch(tenant.as_ref(), &daemon_set(config.image(KUBE_PROXY), &config_name)).await?;
        info!("{} 的 kube-proxy 已就绪", cluster);
        Ok(())
    }

    /// 租户集群随控制平面一同删除
    async fn finalize(&self, _parent: &mut ControlPlane) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::tests::{control_plane, harness, Harness};
    use kit_common::ControlPlaneStatus;

    fn ready_control_plane(h: &Harness) -> ControlPlane {
        let mut cp = control_plane(&h.store);
        cp.status = Some(ControlPlaneStatus {
            endpoint: Some("lb.example.com".into()),
            pki_secret: Some("demo-pki".into()),
            ..Default::default()
        });
        let mut secret = Secret::default();
        secret.metadata.name = Some("demo-pki".into());
        secret.metadata.namespace = Some("tenants".into());
        secret.data = Some(BTreeMap::from([
            ("admin.conf".to_string(), ByteString(b"admin-kubeconfig".to_vec())),
            ("ca.crt".to_string(), ByteString(b"ca-pem".to_vec())),
        ]));
        h.store.insert(&secret).unwrap();
        cp
    }

    #[tokio::test]
    async fn test_waits_for_endpoint() {
        let h = harness();
        let mut cp = control_plane(&h.store);
        let err = KubeProxyStage::new(&h.deps).reconcile(&mut cp).await.unwrap_err();
        assert!(err.is_not_ready());
        assert!(h.connector.kubeconfigs.lock().unwrap().is_empty());
        assert!(h.tenant.is_empty());
    }

    #[tokio::test]
    async fn test_installs_kube_proxy_in_tenant() {
        let h = harness();
        let mut cp = ready_control_plane(&h);
        let stage = KubeProxyStage::new(&h.deps);
        stage.reconcile(&mut cp).await.unwrap();

        assert_eq!(
            h.connector.kubeconfigs.lock().unwrap().clone(),
            vec![b"admin-kubeconfig".to_vec()]
        );
        assert_eq!(h.tenant.count::<ServiceAccount>(), 1);
        assert_eq!(h.tenant.count::<ClusterRoleBinding>(), 1);
        // 租户集群中的对象不写入管理集群
        assert_eq!(h.store.count::<DaemonSet>(), 0);

        let secret = h
            .tenant
            .get_typed::<Secret>(&ObjectKey::namespaced("kube-system", "demo-kubeproxy-config"))
            .unwrap();
        let kubeconfig: KubeConfig =
            serde_yaml::from_slice(&secret.data.unwrap()["config"].0).unwrap();
        assert_eq!(kubeconfig.clusters[0].cluster.server, "https://lb.example.com:443");
        assert_eq!(kubeconfig.clusters[0].cluster.certificate_authority_data.0, b"ca-pem");
        assert!(kubeconfig.users[0].user.token_file.is_some());

        let ds = h
            .tenant
            .get_typed::<DaemonSet>(&ObjectKey::namespaced("kube-system", "kubeproxy-daemonset"))
            .unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.host_network, Some(true));
        assert_eq!(pod.service_account_name.as_deref(), Some("kube-proxy"));
        let volume = pod
            .volumes
            .unwrap()
            .into_iter()
            .find(|v| v.name == "kubeproxy-kubeconfig")
            .unwrap();
        assert_eq!(volume.secret.unwrap().default_mode, Some(256));

        // 第二次协调只会尝试创建 ClusterRoleBinding，其余对象没有差异
        h.tenant.clear_calls();
        stage.reconcile(&mut cp).await.unwrap();
        assert_eq!(h.tenant.writes(), 1);
        assert_eq!(h.tenant.creates_of("ClusterRoleBinding"), 1);
        assert_eq!(h.tenant.count::<ClusterRoleBinding>(), 1);
    }

    #[tokio::test]
    async fn test_missing_admin_kubeconfig_is_not_ready() {
        let h = harness();
        let mut cp = control_plane(&h.store);
        cp.status = Some(ControlPlaneStatus {
            endpoint: Some("lb.example.com".into()),
            pki_secret: Some("demo-pki".into()),
            ..Default::default()
        });
        let err = KubeProxyStage::new(&h.deps).reconcile(&mut cp).await.unwrap_err();
        assert!(err.is_not_ready());
    }
}
