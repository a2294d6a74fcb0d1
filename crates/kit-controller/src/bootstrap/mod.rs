//! 集群引导制品
//!
//! 每个写入器都是作用于目标目录的纯函数：输入 `ClusterConfig`，输出文件，
//! 除文件系统外没有其他副作用。已存在的证书与 kubeconfig 会被保留，
//! 重复调用不会轮换密钥。

pub mod authenticator;
pub mod kubeconfig;
pub mod manifests;
pub mod pki;
pub mod systemd;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use kube::ResourceExt;

use kit_common::config::ImageConfig;
use kit_common::models::naming;
use kit_common::{ControlPlane, Error, Result, Substrate};

/// 证书目录（相对于暂存根目录）
pub const PKI_PATH: &str = "etc/kubernetes/pki";
pub const KUBECONFIG_PATH: &str = "etc/kubernetes";
pub const MANIFEST_PATH: &str = "etc/kubernetes/manifests";
pub const SYSTEMD_PATH: &str = "etc/systemd/system";
pub const AUTHENTICATOR_PATH: &str = "etc/aws-iam-authenticator";

pub const ADMIN_KUBECONFIG: &str = "admin.conf";

/// 容器内的 kubeconfig 目录
pub const KUBECONFIG_DIR: &str = "/etc/kubernetes";

const API_SERVER_PORT: u16 = 443;
const SERVICE_CLUSTER_IP: &str = "10.96.0.1";

/// 生成引导制品所需的集群参数
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    pub name: String,
    /// API Server 对外地址，IP 或主机名
    pub endpoint: Option<String>,
    pub bind_port: u16,
    pub cert_sans: Vec<String>,
    pub etcd_sans: Vec<String>,
    pub etcd_servers: String,
    /// 容器内证书目录
    pub pki_dir: String,
    pub etcd_pki_dir: String,
    pub etcd_args: BTreeMap<String, String>,
    pub apiserver_args: BTreeMap<String, String>,
    pub kubelet_args: BTreeMap<String, String>,
    pub kubernetes_version: String,
    pub images: ImageConfig,
}

impl ClusterConfig {
    /// Substrate 上的单节点控制平面，etcd 与 API Server 以静态 Pod 运行
    pub fn for_substrate(substrate: &Substrate, images: &ImageConfig) -> Result<Self> {
        let name = substrate.name_any();
        let address = substrate
            .address()
            .ok_or_else(|| Error::NotReady(format!("Substrate {name} 尚未分配地址")))?
            .to_string();

        let mut etcd_args = BTreeMap::new();
        etcd_args.insert("name".into(), name.clone());
        etcd_args.insert("data-dir".into(), "/var/lib/etcd".into());
        etcd_args.insert("initial-cluster".into(), format!("{name}=https://127.0.0.1:2380"));
        etcd_args.insert("initial-cluster-state".into(), "new".into());
        etcd_args.insert("listen-peer-urls".into(), "https://127.0.0.1:2380".into());
        etcd_args.insert("listen-client-urls".into(), "https://127.0.0.1:2379".into());
        etcd_args.insert("advertise-client-urls".into(), "https://127.0.0.1:2379".into());
        etcd_args.insert("initial-advertise-peer-urls".into(), "https://127.0.0.1:2380".into());

        let mut apiserver_args = BTreeMap::new();
        apiserver_args.insert(
            "authentication-token-webhook-config-file".into(),
            authenticator::WEBHOOK_KUBECONFIG.into(),
        );

        let mut kubelet_args = BTreeMap::new();
        kubelet_args.insert("cgroup-driver".into(), "systemd".into());
        kubelet_args.insert("network-plugin".into(), "cni".into());
        kubelet_args.insert("pod-infra-container-image".into(), images.pause_image());

        Ok(Self {
            cert_sans: api_server_sans(&address, &name),
            etcd_sans: vec!["localhost".into(), "127.0.0.1".into()],
            etcd_servers: "https://127.0.0.1:2379".into(),
            endpoint: Some(address),
            bind_port: API_SERVER_PORT,
            pki_dir: "/etc/kubernetes/pki".into(),
            etcd_pki_dir: "/etc/kubernetes/pki/etcd".into(),
            etcd_args,
            apiserver_args,
            kubelet_args,
            kubernetes_version: images.kubernetes_version.clone(),
            images: images.clone(),
            name,
        })
    }

    /// 运行在管理集群中的控制平面，etcd 以 StatefulSet、master 组件以 Deployment 运行
    ///
    /// endpoint 在负载均衡器分配主机名之前为空，此时只能生成 etcd 相关制品。
    pub fn for_control_plane(
        control_plane: &ControlPlane,
        endpoint: Option<&str>,
        images: &ImageConfig,
    ) -> Result<Self> {
        let name = control_plane.cluster_name();
        let namespace = control_plane
            .namespace()
            .ok_or_else(|| Error::InvalidSpec(format!("ControlPlane {name} 缺少 namespace")))?;
        let etcd = naming::etcd_name(&name)?;
        let etcd_domain = format!("{etcd}.{namespace}.svc");
        let replicas = control_plane.spec.etcd.replicas.max(1);

        let initial_cluster = (0..replicas)
            .map(|i| format!("{etcd}-{i}=https://{etcd}-{i}.{etcd_domain}:2380"))
            .collect::<Vec<_>>()
            .join(",");
        let mut etcd_args = BTreeMap::new();
        etcd_args.insert("name".into(), "$(POD_NAME)".into());
        etcd_args.insert("data-dir".into(), "/var/lib/etcd".into());
        etcd_args.insert("initial-cluster".into(), initial_cluster);
        etcd_args.insert("initial-cluster-state".into(), "new".into());
        etcd_args.insert("listen-peer-urls".into(), "https://0.0.0.0:2380".into());
        etcd_args.insert("listen-client-urls".into(), "https://0.0.0.0:2379".into());
        etcd_args.insert(
            "advertise-client-urls".into(),
            format!("https://$(POD_NAME).{etcd_domain}:2379"),
        );
        etcd_args.insert(
            "initial-advertise-peer-urls".into(),
            format!("https://$(POD_NAME).{etcd_domain}:2380"),
        );

        let kubernetes_version = control_plane
            .spec
            .kubernetes_version
            .clone()
            .unwrap_or_else(|| images.kubernetes_version.clone());

        Ok(Self {
            cert_sans: endpoint
                .map(|endpoint| api_server_sans(endpoint, &name))
                .unwrap_or_default(),
            etcd_sans: vec![
                "localhost".into(),
                "127.0.0.1".into(),
                etcd_domain.clone(),
                format!("*.{etcd_domain}"),
            ],
            etcd_servers: format!("https://{etcd_domain}:2379"),
            endpoint: endpoint.map(str::to_string),
            bind_port: API_SERVER_PORT,
            pki_dir: "/etc/kubernetes/pki".into(),
            etcd_pki_dir: "/etc/etcd/pki".into(),
            etcd_args,
            apiserver_args: BTreeMap::new(),
            kubelet_args: BTreeMap::new(),
            kubernetes_version,
            images: images.clone(),
            name,
        })
    }

    /// API Server 地址，尚未分配 endpoint 时返回 NotReady
    pub fn server_url(&self) -> Result<String> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| Error::NotReady(format!("集群 {} 尚未分配 endpoint", self.name)))?;
        Ok(format!("https://{}:{}", endpoint, self.bind_port))
    }

    /// endpoint 是 IP 时作为 advertise-address
    pub fn advertise_address(&self) -> Option<IpAddr> {
        self.endpoint.as_deref().and_then(|e| e.parse().ok())
    }

    pub fn image(&self, component: &str) -> String {
        self.images
            .kubernetes_image(component, Some(&self.kubernetes_version))
    }
}

fn api_server_sans(endpoint: &str, name: &str) -> Vec<String> {
    vec![
        endpoint.to_string(),
        name.to_string(),
        "kubernetes".into(),
        "kubernetes.default".into(),
        "kubernetes.default.svc".into(),
        "kubernetes.default.svc.cluster.local".into(),
        SERVICE_CLUSTER_IP.into(),
    ]
}

/// 引导制品写入器
pub trait ArtifactWriter: Send + Sync {
    /// etcd CA 以及 server、peer、apiserver-etcd-client 证书
    fn write_etcd_certificates(&self, config: &ClusterConfig, dir: &Path) -> Result<()>;

    /// 集群 CA、API Server 证书、kubelet 客户端证书与 service account 密钥对
    fn write_certificates(&self, config: &ClusterConfig, dir: &Path) -> Result<()>;

    /// admin、kubelet、controller-manager、scheduler 的 kubeconfig
    fn write_kubeconfigs(&self, config: &ClusterConfig, pki_dir: &Path, dir: &Path) -> Result<()>;

    fn write_static_pods(&self, config: &ClusterConfig, dir: &Path) -> Result<()>;

    fn write_systemd_units(&self, config: &ClusterConfig, dir: &Path) -> Result<()>;

    /// IAM authenticator 配置与静态 Pod
    fn write_authenticator(
        &self,
        config: &ClusterConfig,
        account_id: &str,
        config_dir: &Path,
        manifest_dir: &Path,
    ) -> Result<()>;
}

/// 默认写入器
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultArtifactWriter;

impl ArtifactWriter for DefaultArtifactWriter {
    fn write_etcd_certificates(&self, config: &ClusterConfig, dir: &Path) -> Result<()> {
        pki::write_etcd_tree(config, dir)
    }

    fn write_certificates(&self, config: &ClusterConfig, dir: &Path) -> Result<()> {
        pki::write_cluster_tree(config, dir)
    }

    fn write_kubeconfigs(&self, config: &ClusterConfig, pki_dir: &Path, dir: &Path) -> Result<()> {
        kubeconfig::write_component_kubeconfigs(config, pki_dir, dir)
    }

    fn write_static_pods(&self, config: &ClusterConfig, dir: &Path) -> Result<()> {
        manifests::write_static_pods(config, dir)
    }

    fn write_systemd_units(&self, config: &ClusterConfig, dir: &Path) -> Result<()> {
        systemd::write_kubelet_unit(config, dir)
    }

    fn write_authenticator(
        &self,
        config: &ClusterConfig,
        account_id: &str,
        config_dir: &Path,
        manifest_dir: &Path,
    ) -> Result<()> {
        authenticator::write_config(config, account_id, config_dir)?;
        authenticator::write_static_pod(config, manifest_dir)
    }
}

/// 生成 Substrate 节点所需的全部制品，返回 admin kubeconfig 路径
pub fn write_node_bundle(
    writer: &dyn ArtifactWriter,
    config: &ClusterConfig,
    account_id: &str,
    root: &Path,
) -> Result<PathBuf> {
    let pki_dir = root.join(PKI_PATH);
    let kubeconfig_dir = root.join(KUBECONFIG_PATH);
    let manifest_dir = root.join(MANIFEST_PATH);

    writer
        .write_certificates(config, &pki_dir)
        .and_then(|_| writer.write_etcd_certificates(config, &pki_dir.join("etcd")))
        .map_err(|e| Error::Generate(format!("生成证书失败: {e}")))?;
    writer
        .write_kubeconfigs(config, &pki_dir, &kubeconfig_dir)
        .map_err(|e| Error::Generate(format!("生成 kubeconfig 失败: {e}")))?;
    writer
        .write_static_pods(config, &manifest_dir)
        .map_err(|e| Error::Generate(format!("生成静态 Pod 清单失败: {e}")))?;
    writer
        .write_systemd_units(config, &root.join(SYSTEMD_PATH))
        .map_err(|e| Error::Generate(format!("生成 kubelet 服务配置失败: {e}")))?;
    writer
        .write_authenticator(config, account_id, &root.join(AUTHENTICATOR_PATH), &manifest_dir)
        .map_err(|e| Error::Generate(format!("生成 authenticator 配置失败: {e}")))?;

    Ok(kubeconfig_dir.join(ADMIN_KUBECONFIG))
}

/// 写入文件，必要时创建父目录
pub(crate) fn write_file(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kit_common::{ControlPlaneSpec, OperatorConfig, SubstrateSpec, SubstrateStatus};

    pub(crate) fn substrate_with_address(address: Option<&str>) -> Substrate {
        let mut substrate = Substrate::new("sub", SubstrateSpec::default());
        substrate.metadata.namespace = Some("default".into());
        let mut status = SubstrateStatus::default();
        status.cluster.address = address.map(str::to_string);
        substrate.status = Some(status);
        substrate
    }

    pub(crate) fn substrate_config() -> ClusterConfig {
        ClusterConfig::for_substrate(
            &substrate_with_address(Some("10.0.0.10")),
            &OperatorConfig::default().images,
        )
        .unwrap()
    }

    #[test]
    fn test_substrate_config_requires_address() {
        let images = OperatorConfig::default().images;
        let err = ClusterConfig::for_substrate(&substrate_with_address(None), &images).unwrap_err();
        assert!(err.is_not_ready());

        let config = substrate_config();
        assert_eq!(config.server_url().unwrap(), "https://10.0.0.10:443");
        assert!(config.advertise_address().is_some());
        assert!(config.cert_sans.contains(&"10.96.0.1".to_string()));
        assert_eq!(config.etcd_args["initial-cluster"], "sub=https://127.0.0.1:2380");
    }

    #[test]
    fn test_control_plane_config() {
        let mut cp = ControlPlane::new("demo", ControlPlaneSpec {
            kubernetes_version: Some("v1.22.0".into()),
            etcd: Default::default(),
            master: Default::default(),
        });
        cp.metadata.namespace = Some("tenants".into());
        let images = OperatorConfig::default().images;

        let config = ClusterConfig::for_control_plane(&cp, None, &images).unwrap();
        assert!(config.server_url().unwrap_err().is_not_ready());
        assert!(config.cert_sans.is_empty());
        assert_eq!(config.etcd_servers, "https://demo-etcd.tenants.svc:2379");
        assert_eq!(config.etcd_args["initial-cluster"].split(',').count(), 3);
        assert!(config.image("kube-apiserver").ends_with(":v1.22.0"));

        let config = ClusterConfig::for_control_plane(&cp, Some("lb.example.com"), &images).unwrap();
        assert_eq!(config.server_url().unwrap(), "https://lb.example.com:443");
        assert!(config.advertise_address().is_none());
    }

    #[test]
    fn test_node_bundle_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = substrate_config();
        let admin =
            write_node_bundle(&DefaultArtifactWriter, &config, "123456789012", dir.path()).unwrap();
        assert!(admin.ends_with("etc/kubernetes/admin.conf"));

        for file in [
            "etc/kubernetes/pki/ca.crt",
            "etc/kubernetes/pki/sa.pub",
            "etc/kubernetes/pki/etcd/server.crt",
            "etc/kubernetes/kubelet.conf",
            "etc/kubernetes/manifests/etcd.yaml",
            "etc/kubernetes/manifests/kube-apiserver.yaml",
            "etc/kubernetes/manifests/aws-iam-authenticator.yaml",
            "etc/systemd/system/kubelet.service",
            "etc/aws-iam-authenticator/config.yaml",
        ] {
            assert!(dir.path().join(file).is_file(), "{file} 缺失");
        }
    }
}
