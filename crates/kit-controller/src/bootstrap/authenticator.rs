//! AWS IAM authenticator
//!
//! 租户控制平面节点通过固定的 IAM 角色加入集群，authenticator 把该角色
//! 映射为 `system:node:{{EC2PrivateDNSName}}`。API Server 通过 webhook
//! kubeconfig 调用 authenticator 完成 token 认证。

use std::path::Path;

use k8s_openapi::api::core::v1::Container;
use serde::{Deserialize, Serialize};

use kit_common::models::naming;
use kit_common::Result;

use super::manifests::{host_path_volume, mount, static_pod};
use super::{write_file, ClusterConfig};

/// authenticator 生成的 webhook kubeconfig，API Server 以此调用 authenticator
pub const WEBHOOK_KUBECONFIG: &str = "/var/aws-iam-authenticator/kubeconfig/kubeconfig.yaml";

pub const CONFIG_DIR: &str = "/etc/aws-iam-authenticator";
pub const STATE_DIR: &str = "/var/aws-iam-authenticator";
pub const MANIFEST_FILE: &str = "aws-iam-authenticator.yaml";
const NAME: &str = "aws-iam-authenticator";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorConfig {
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    pub server: ServerConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub map_roles: Vec<RoleMapping>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RoleMapping {
    #[serde(rename = "roleARN")]
    pub role_arn: String,
    pub username: String,
    pub groups: Vec<String>,
}

impl AuthenticatorConfig {
    pub fn for_cluster(config: &ClusterConfig, account_id: &str) -> Self {
        Self {
            cluster_id: config.name.clone(),
            server: ServerConfig {
                map_roles: vec![RoleMapping {
                    role_arn: naming::node_role_arn(account_id, &config.name),
                    username: "system:node:{{EC2PrivateDNSName}}".into(),
                    groups: vec!["system:bootstrappers".into(), "system:nodes".into()],
                }],
            },
        }
    }
}

pub fn write_config(config: &ClusterConfig, account_id: &str, dir: &Path) -> Result<()> {
    let yaml = serde_yaml::to_string(&AuthenticatorConfig::for_cluster(config, account_id))?;
    write_file(&dir.join("config.yaml"), yaml)
}

pub fn write_static_pod(config: &ClusterConfig, dir: &Path) -> Result<()> {
    let container = Container {
        name: NAME.into(),
        image: Some(config.images.authenticator_image.clone()),
        args: Some(vec![
            "server".into(),
            format!("--config={CONFIG_DIR}/config.yaml"),
            format!("--state-dir={STATE_DIR}"),
            format!("--generate-kubeconfig={WEBHOOK_KUBECONFIG}"),
        ]),
        volume_mounts: Some(vec![
            mount("config", CONFIG_DIR, true),
            mount("state", STATE_DIR, false),
        ]),
        ..Default::default()
    };
    let pod = static_pod(
        NAME,
        container,
        vec![
            host_path_volume("config", CONFIG_DIR, None),
            host_path_volume("state", STATE_DIR, Some("DirectoryOrCreate")),
        ],
    );
    write_file(&dir.join(MANIFEST_FILE), serde_yaml::to_string(&pod)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::tests::substrate_config;

    #[test]
    fn test_config_maps_node_role() {
        let dir = tempfile::tempdir().unwrap();
        write_config(&substrate_config(), "123456789012", dir.path()).unwrap();
        let yaml = std::fs::read_to_string(dir.path().join("config.yaml")).unwrap();
        assert!(yaml.contains("clusterID: sub"));

        let parsed: AuthenticatorConfig = serde_yaml::from_str(&yaml).unwrap();
        let mapping = &parsed.server.map_roles[0];
        assert_eq!(
            mapping.role_arn,
            "arn:aws:iam::123456789012:role/sub-tenant-controlplane-node-role"
        );
        assert_eq!(mapping.username, "system:node:{{EC2PrivateDNSName}}");
        assert_eq!(mapping.groups.len(), 2);
    }
}
