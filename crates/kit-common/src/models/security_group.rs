//! SecurityGroup 自定义资源
//!
//! 每个控制平面组件对应一个 SecurityGroup 对象，真正的云上安全组
//! 由独立的基础设施控制器根据该对象创建。

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// 受支持的控制平面组件
pub const COMPONENTS: [&str; 2] = ["etcd", "master"];

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "infrastructure.kit.k8s.sh", version = "v1alpha1", kind = "SecurityGroup", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroupSpec {
    /// 云上安全组名称
    pub group_name: String,
    pub cluster_name: String,
}

/// 云上安全组名称
pub fn group_name(cluster: &str, component: &str) -> String {
    format!("kit-{cluster}-{component}")
}
