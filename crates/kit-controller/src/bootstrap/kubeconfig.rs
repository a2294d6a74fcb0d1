//! kubeconfig 文件生成

use std::path::Path;

use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};

use kit_common::Result;

use super::pki::{issue, load_ca, CertSpec, Usage};
use super::{write_file, ClusterConfig, ADMIN_KUBECONFIG};

/// Pod 内 service account token 路径
pub const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct KubeConfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub contexts: Vec<NamedContext>,
    pub users: Vec<NamedUser>,
    pub current_context: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEntry,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    pub server: String,
    pub certificate_authority_data: ByteString,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContextEntry {
    pub cluster: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NamedUser {
    pub name: String,
    pub user: UserEntry,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<ByteString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<ByteString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,
}

impl KubeConfig {
    /// 单集群、单用户的 kubeconfig
    pub fn new(cluster: &str, server: &str, ca_pem: &[u8], user_name: &str, user: UserEntry) -> Self {
        let context = format!("{user_name}@{cluster}");
        Self {
            api_version: "v1".into(),
            kind: "Config".into(),
            clusters: vec![NamedCluster {
                name: cluster.into(),
                cluster: ClusterEntry {
                    server: server.into(),
                    certificate_authority_data: ByteString(ca_pem.to_vec()),
                },
            }],
            contexts: vec![NamedContext {
                name: context.clone(),
                context: ContextEntry {
                    cluster: cluster.into(),
                    user: user_name.into(),
                    namespace: None,
                },
            }],
            users: vec![NamedUser {
                name: user_name.into(),
                user,
            }],
            current_context: context,
        }
    }

    /// 使用 service account token 认证，供集群内的 DaemonSet 使用
    pub fn with_token_file(cluster: &str, server: &str, ca_pem: &[u8]) -> Self {
        Self::new(
            cluster,
            server,
            ca_pem,
            "default",
            UserEntry {
                token_file: Some(SERVICE_ACCOUNT_TOKEN.into()),
                ..Default::default()
            },
        )
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// (文件名, CN, O)
fn component_identities(config: &ClusterConfig) -> Vec<(&'static str, String, Option<&'static str>)> {
    vec![
        (ADMIN_KUBECONFIG, "kubernetes-admin".into(), Some("system:masters")),
        (
            "kubelet.conf",
            format!("system:node:{}", config.name),
            Some("system:nodes"),
        ),
        (
            "controller-manager.conf",
            "system:kube-controller-manager".into(),
            None,
        ),
        ("scheduler.conf", "system:kube-scheduler".into(), None),
    ]
}

/// 使用集群 CA 签发客户端证书，生成各组件的 kubeconfig；已存在的文件保留
pub fn write_component_kubeconfigs(config: &ClusterConfig, pki_dir: &Path, dir: &Path) -> Result<()> {
    let server = config.server_url()?;
    let ca = load_ca(pki_dir, "ca")?;
    let ca_pem = std::fs::read(pki_dir.join("ca.crt"))?;

    for (file, common_name, organization) in component_identities(config) {
        let path = dir.join(file);
        if path.is_file() {
            continue;
        }
        let (cert, key) = issue(
            &ca,
            &CertSpec {
                name: file,
                common_name: &common_name,
                organization,
                sans: Vec::new(),
                usage: Usage::Client,
            },
        )?;
        let kubeconfig = KubeConfig::new(
            &config.name,
            &server,
            &ca_pem,
            &common_name,
            UserEntry {
                client_certificate_data: Some(ByteString(cert.into_bytes())),
                client_key_data: Some(ByteString(key.into_bytes())),
                token_file: None,
            },
        );
        write_file(&path, kubeconfig.to_yaml()?)?;
    }
    Ok(())
}
