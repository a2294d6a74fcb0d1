//! 组件子控制器
//!
//! ControlPlane 依次经过 security-groups → etcd → master → addons，
//! Substrate 依次经过 address → cluster-config。顺序在这里静态声明，
//! 清理时由组合器逆序执行。

mod address;
mod cluster_config;
mod etcd;
mod kube_proxy;
mod master;
mod security_groups;

pub use address::AddressStage;
pub use cluster_config::ClusterConfigStage;
pub use etcd::EtcdStage;
pub use kube_proxy::{ClusterConnector, KubeProxyStage, KubeconfigConnector};
pub use master::MasterStage;
pub use security_groups::SecurityGroupStage;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{KeyToPath, SecretVolumeSource, Volume};
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};

use kit_common::{ControlPlane, Error, OperatorConfig, Result, Substrate};

use crate::bootstrap::pki::read_tree;
use crate::bootstrap::ArtifactWriter;
use crate::cloud::{AddressProvider, BucketStore, IdentityProvider};
use crate::composer::Composer;
use crate::store::ObjectStore;

/// 标记托管资源所属集群的标签
pub const CLUSTER_LABEL: &str = "kit.k8s.sh/cluster";

/// ControlPlane 组件共享的依赖
#[derive(Clone)]
pub struct ControlPlaneDeps {
    pub store: Arc<dyn ObjectStore>,
    pub writer: Arc<dyn ArtifactWriter>,
    pub connector: Arc<dyn ClusterConnector>,
    pub config: Arc<OperatorConfig>,
}

/// Substrate 组件共享的依赖
#[derive(Clone)]
pub struct SubstrateDeps {
    pub buckets: Arc<dyn BucketStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub addresses: Arc<dyn AddressProvider>,
    pub writer: Arc<dyn ArtifactWriter>,
    pub config: Arc<OperatorConfig>,
}

pub fn control_plane_composer(deps: &ControlPlaneDeps) -> Composer<ControlPlane> {
    Composer::new("control-plane")
        .stage(SecurityGroupStage::new(deps.store.clone()))
        .stage(EtcdStage::new(deps))
        .stage(MasterStage::new(deps))
        .stage(KubeProxyStage::new(deps))
}

pub fn substrate_composer(deps: &SubstrateDeps) -> Composer<Substrate> {
    Composer::new("substrate")
        .stage(AddressStage::new(deps.addresses.clone()))
        .stage(ClusterConfigStage::new(deps))
}

pub(crate) fn namespace_of<K: Resource>(object: &K) -> Result<String> {
    object
        .namespace()
        .ok_or_else(|| Error::InvalidSpec(format!("{} 缺少 namespace", object.name_any())))
}

pub(crate) fn cluster_labels(cluster: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = crate::bootstrap::manifests::labels(component);
    labels.insert(CLUSTER_LABEL.to_string(), cluster.to_string());
    labels
}

pub(crate) fn secret_volume(name: &str, secret: &str, items: Option<Vec<KeyToPath>>) -> Volume {
    Volume {
        name: name.into(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.into()),
            items,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// 在临时目录中运行写入器，返回生成的文件作为 Secret 数据
///
/// 子目录中的文件以文件名为键，同名文件以后写入的为准。
/// 写入器在阻塞线程池中执行。
pub(crate) async fn generate_secret_data(
    generate: impl FnOnce(&Path) -> Result<()> + Send + 'static,
) -> Result<BTreeMap<String, ByteString>> {
    crate::blocking(move || {
        let dir = tempfile::tempdir()?;
        generate(dir.path())?;
        Ok(read_tree(dir.path())?
            .into_iter()
            .map(|(key, value)| {
                let name = key.rsplit('/').next().unwrap_or(&key).to_string();
                (name, ByteString(value))
            })
            .collect())
    })
    .await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use kit_common::{ControlPlaneSpec, EtcdSpec, MasterSpec};

    use crate::bootstrap::DefaultArtifactWriter;
    use crate::store::MemoryStore;

    /// 始终连接到同一个内存存储的连接器
    pub(crate) struct FixedConnector {
        pub tenant: Arc<MemoryStore>,
        pub kubeconfigs: std::sync::Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl ClusterConnector for FixedConnector {
        async fn connect(&self, kubeconfig: &[u8]) -> Result<Arc<dyn ObjectStore>> {
            self.kubeconfigs.lock().unwrap().push(kubeconfig.to_vec());
            Ok(self.tenant.clone())
        }
    }

    pub(crate) struct Harness {
        pub store: Arc<MemoryStore>,
        pub tenant: Arc<MemoryStore>,
        pub connector: Arc<FixedConnector>,
        pub deps: ControlPlaneDeps,
    }

    pub(crate) fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let tenant = Arc::new(MemoryStore::new());
        let connector = Arc::new(FixedConnector {
            tenant: tenant.clone(),
            kubeconfigs: Default::default(),
        });
        let deps = ControlPlaneDeps {
            store: store.clone(),
            writer: Arc::new(DefaultArtifactWriter),
            connector: connector.clone(),
            config: Arc::new(OperatorConfig::default()),
        };
        Harness {
            store,
            tenant,
            connector,
            deps,
        }
    }

    /// 已持久化（带 uid）的 ControlPlane
    pub(crate) fn control_plane(store: &MemoryStore) -> ControlPlane {
        let mut cp = ControlPlane::new(
            "demo",
            ControlPlaneSpec {
                kubernetes_version: None,
                etcd: EtcdSpec { replicas: 3 },
                master: MasterSpec { replicas: 2 },
            },
        );
        cp.metadata.namespace = Some("tenants".into());
        store.insert(&cp).unwrap()
    }

    #[tokio::test]
    async fn test_generate_secret_data_flattens_paths() {
        let data = generate_secret_data(|dir| {
            crate::bootstrap::write_file(&dir.join("pki/ca.crt"), "ca")?;
            crate::bootstrap::write_file(&dir.join("admin.conf"), "admin")
        })
        .await
        .unwrap();
        assert_eq!(data.keys().collect::<Vec<_>>(), vec!["admin.conf", "ca.crt"]);
        assert_eq!(data["ca.crt"].0, b"ca");
    }
}
