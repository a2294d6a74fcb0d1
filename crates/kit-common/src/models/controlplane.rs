//! ControlPlane 自定义资源
//!
//! 用户通过 ControlPlane 声明一个嵌套的 Kubernetes 控制平面，
//! Operator 负责创建 etcd、API Server、controller-manager、scheduler 以及 kube-proxy。

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::models::condition::ReconcileStatus;
use crate::models::desired_state::DesiredState;

/// 控制平面规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "kit.k8s.sh", version = "v1alpha1", kind = "ControlPlane", namespaced)]
#[kube(status = "ControlPlaneStatus", shortname = "cp")]
#[kube(printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Endpoint", "type":"string", "jsonPath":".status.endpoint"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Kubernetes 版本标签，为空时使用 Operator 配置中的默认值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,

    #[serde(default)]
    pub etcd: EtcdSpec,

    #[serde(default)]
    pub master: MasterSpec,
}

/// etcd 规范
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct EtcdSpec {
    #[serde(default = "default_etcd_replicas")]
    pub replicas: i32,
}

/// master 组件规范
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct MasterSpec {
    #[serde(default = "default_master_replicas")]
    pub replicas: i32,
}

impl Default for EtcdSpec {
    fn default() -> Self {
        Self {
            replicas: default_etcd_replicas(),
        }
    }
}

impl Default for MasterSpec {
    fn default() -> Self {
        Self {
            replicas: default_master_replicas(),
        }
    }
}

fn default_etcd_replicas() -> i32 {
    3
}

fn default_master_replicas() -> i32 {
    1
}

/// 控制平面状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    #[serde(flatten)]
    pub reconcile: ReconcileStatus,

    /// API Server 对外地址（负载均衡器主机名）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// 存放证书与 kubeconfig 的 Secret 名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pki_secret: Option<String>,
}

impl ControlPlane {
    /// 集群名称即对象名称
    pub fn cluster_name(&self) -> String {
        self.name_any()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.endpoint.as_deref())
    }
}

impl DesiredState for ControlPlane {
    fn reconcile_status(&self) -> Option<&ReconcileStatus> {
        self.status.as_ref().map(|s| &s.reconcile)
    }

    fn reconcile_status_mut(&mut self) -> &mut ReconcileStatus {
        &mut self.status.get_or_insert_with(Default::default).reconcile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let cp: ControlPlane = serde_json::from_value(serde_json::json!({
            "apiVersion": "kit.k8s.sh/v1alpha1",
            "kind": "ControlPlane",
            "metadata": {"name": "demo", "namespace": "default"},
            "spec": {}
        }))
        .unwrap();
        assert_eq!(cp.spec.etcd.replicas, 3);
        assert_eq!(cp.spec.master.replicas, 1);
        assert_eq!(cp.cluster_name(), "demo");
        assert!(!cp.is_ready());
    }

    #[test]
    fn test_status_flattens_reconcile_state() {
        let mut cp = ControlPlane::new("demo", ControlPlaneSpec {
            kubernetes_version: None,
            etcd: EtcdSpec::default(),
            master: MasterSpec::default(),
        });
        cp.reconcile_status_mut().mark_ready();
        cp.status.as_mut().unwrap().endpoint = Some("lb.example.com".into());

        let value = serde_json::to_value(&cp).unwrap();
        assert_eq!(value["status"]["phase"], "Ready");
        assert_eq!(value["status"]["endpoint"], "lb.example.com");
        assert!(cp.is_ready());
    }
}
