//! Substrate 自定义资源
//!
//! Substrate 描述承载租户控制平面的底层基础设施。云上网络资源的细节
//! 由外部协作方负责，这里只关心对外地址以及生成并上传的集群引导制品。

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::models::condition::ReconcileStatus;
use crate::models::desired_state::DesiredState;

/// Substrate 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "kit.sh", version = "v1alpha1", kind = "Substrate", namespaced)]
#[kube(status = "SubstrateStatus")]
#[kube(printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Address", "type":"string", "jsonPath":".status.cluster.address"}"#)]
#[serde(rename_all = "camelCase")]
pub struct SubstrateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<VpcSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<SubnetSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct VpcSpec {
    pub cidr: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SubnetSpec {
    pub zone: String,
    pub cidr: String,
    #[serde(default)]
    pub public: bool,
}

/// Substrate 状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubstrateStatus {
    #[serde(flatten)]
    pub reconcile: ReconcileStatus,

    #[serde(default)]
    pub cluster: ClusterStatus,
}

/// 引导出的集群信息，节点加入工具依赖这些字段
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// 控制平面对外地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// 本地生成的 admin kubeconfig 路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config: Option<String>,

    /// 保存引导制品的桶
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

impl Substrate {
    pub fn address(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.cluster.address.as_deref())
    }

    pub fn cluster_status_mut(&mut self) -> &mut ClusterStatus {
        &mut self.status.get_or_insert_with(Default::default).cluster
    }
}

impl DesiredState for Substrate {
    fn reconcile_status(&self) -> Option<&ReconcileStatus> {
        self.status.as_ref().map(|s| &s.reconcile)
    }

    fn reconcile_status_mut(&mut self) -> &mut ReconcileStatus {
        &mut self.status.get_or_insert_with(Default::default).reconcile
    }
}
