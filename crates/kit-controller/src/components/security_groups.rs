//! 每个控制平面组件的 SecurityGroup 对象

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use tracing::debug;

use kit_common::models::naming;
use kit_common::{
    group_name, ControlPlane, Result, SecurityGroup, SecurityGroupSpec, COMPONENTS,
};

use super::namespace_of;
use crate::apply::{ensure_delete, ensure_patch, owned_by};
use crate::store::{ObjectKey, ObjectStore};
use crate::subcontroller::SubController;

pub struct SecurityGroupStage {
    store: Arc<dyn ObjectStore>,
}

impl SecurityGroupStage {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SubController<ControlPlane> for SecurityGroupStage {
    fn name(&self) -> &'static str {
        "security-groups"
    }

    async fn reconcile(&self, parent: &mut ControlPlane) -> Result<()> {
        let cluster = parent.cluster_name();
        let namespace = namespace_of(parent)?;
        for component in COMPONENTS {
            let group = SecurityGroup {
                metadata: ObjectMeta {
                    name: Some(naming::security_group_name(&cluster, component)?),
                    namespace: Some(namespace.clone()),
                    ..Default::default()
                },
                spec: SecurityGroupSpec {
                    group_name: group_name(&cluster, component),
                    cluster_name: cluster.clone(),
                },
            };
            ensure_patch(self.store.as_ref(), &owned_by(parent, group)?).await?;
        }
        Ok(())
    }

    /// 显式删除，不依赖 owner reference 级联
    async fn finalize(&self, parent: &mut ControlPlane) -> Result<()> {
        let cluster = parent.cluster_name();
        let namespace = namespace_of(parent)?;
        for component in COMPONENTS.iter().rev() {
            let name = naming::security_group_name(&cluster, component)?;
            ensure_delete::<SecurityGroup>(
                self.store.as_ref(),
                &ObjectKey::namespaced(namespace.clone(), name),
            )
            .await?;
        }
        debug!("已删除 {} 的安全组对象", cluster);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::tests::control_plane;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_groups_created_once_and_deleted() {
        let store = Arc::new(MemoryStore::new());
        let mut cp = control_plane(&store);
        let stage = SecurityGroupStage::new(store.clone());

        stage.reconcile(&mut cp).await.unwrap();
        stage.reconcile(&mut cp).await.unwrap();
        assert_eq!(store.count::<SecurityGroup>(), 2);
        assert_eq!(store.creates_of("SecurityGroup"), 2);
        assert_eq!(store.patches_of("SecurityGroup"), 0);

        let etcd = store
            .get_typed::<SecurityGroup>(&ObjectKey::namespaced("tenants", "demo-etcd"))
            .unwrap();
        assert_eq!(etcd.spec.group_name, "kit-demo-etcd");
        assert_eq!(
            etcd.metadata.owner_references.unwrap()[0].uid,
            cp.metadata.uid.clone().unwrap()
        );

        stage.finalize(&mut cp).await.unwrap();
        assert_eq!(store.count::<SecurityGroup>(), 0);
        // 不存在时清理同样成功
        stage.finalize(&mut cp).await.unwrap();
    }
}
