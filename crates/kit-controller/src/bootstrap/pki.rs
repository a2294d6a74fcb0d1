//! 证书树
//!
//! 布局与 kubeadm 保持一致：集群 CA 与组件证书位于 pki 目录，
//! etcd 相关证书位于独立目录。已存在的 CA 会被加载并继续用于签发，
//! 已存在的叶子证书不会被覆盖。

use std::collections::BTreeMap;
use std::path::Path;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use tracing::debug;
use walkdir::WalkDir;

use kit_common::{Error, Result};

use super::{write_file, ClusterConfig};
use crate::artifacts::relative_key;

/// 证书用途
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    Server,
    Client,
    Peer,
}

/// 叶子证书描述
#[derive(Debug, Clone)]
pub struct CertSpec<'a> {
    pub name: &'a str,
    pub common_name: &'a str,
    pub organization: Option<&'a str>,
    pub sans: Vec<String>,
    pub usage: Usage,
}

fn generate_error(what: &str, e: impl std::fmt::Display) -> Error {
    Error::Generate(format!("{what}: {e}"))
}

fn distinguished_name(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    if let Some(org) = organization {
        dn.push(DnType::OrganizationName, org);
    }
    dn
}

/// 加载 `<name>.crt`/`<name>.key`，不存在时生成新的 CA
pub fn ensure_ca(dir: &Path, name: &str, common_name: &str) -> Result<Certificate> {
    let cert_path = dir.join(format!("{name}.crt"));
    let key_path = dir.join(format!("{name}.key"));
    if cert_path.is_file() && key_path.is_file() {
        debug!("复用已有 CA {}", cert_path.display());
        return load_ca(dir, name);
    }

    let mut params = CertificateParams::new(Vec::<String>::new());
    params.distinguished_name = distinguished_name(common_name, None);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let ca = Certificate::from_params(params).map_err(|e| generate_error(name, e))?;
    let pem = ca.serialize_pem().map_err(|e| generate_error(name, e))?;
    write_file(&cert_path, pem)?;
    write_file(&key_path, ca.serialize_private_key_pem())?;
    Ok(ca)
}

/// 加载已存在的 CA
pub fn load_ca(dir: &Path, name: &str) -> Result<Certificate> {
    let cert_pem = std::fs::read_to_string(dir.join(format!("{name}.crt")))
        .map_err(|e| generate_error(&format!("读取 {name}.crt"), e))?;
    let key_pem = std::fs::read_to_string(dir.join(format!("{name}.key")))
        .map_err(|e| generate_error(&format!("读取 {name}.key"), e))?;
    let key = KeyPair::from_pem(&key_pem).map_err(|e| generate_error(name, e))?;
    let params =
        CertificateParams::from_ca_cert_pem(&cert_pem, key).map_err(|e| generate_error(name, e))?;
    Certificate::from_params(params).map_err(|e| generate_error(name, e))
}

/// 由 CA 签发证书，返回 (证书, 私钥) PEM
pub fn issue(ca: &Certificate, spec: &CertSpec<'_>) -> Result<(String, String)> {
    let mut params = CertificateParams::new(spec.sans.clone());
    params.distinguished_name = distinguished_name(spec.common_name, spec.organization);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = match spec.usage {
        Usage::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
        Usage::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
        Usage::Peer => vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ],
    };
    let cert = Certificate::from_params(params).map_err(|e| generate_error(spec.name, e))?;
    let pem = cert
        .serialize_pem_with_signer(ca)
        .map_err(|e| generate_error(spec.name, e))?;
    Ok((pem, cert.serialize_private_key_pem()))
}

/// 签发并写入叶子证书，文件已存在时跳过
pub fn ensure_leaf(dir: &Path, ca: &Certificate, spec: &CertSpec<'_>) -> Result<()> {
    let cert_path = dir.join(format!("{}.crt", spec.name));
    let key_path = dir.join(format!("{}.key", spec.name));
    if cert_path.is_file() && key_path.is_file() {
        return Ok(());
    }
    let (cert, key) = issue(ca, spec)?;
    write_file(&cert_path, cert)?;
    write_file(&key_path, key)
}

/// service account 签名密钥对
fn ensure_service_account_keys(dir: &Path) -> Result<()> {
    let key_path = dir.join("sa.key");
    let pub_path = dir.join("sa.pub");
    if key_path.is_file() && pub_path.is_file() {
        return Ok(());
    }
    let key = KeyPair::generate(&PKCS_ECDSA_P256_SHA256).map_err(|e| generate_error("sa", e))?;
    write_file(&key_path, key.serialize_pem())?;
    write_file(&pub_path, key.public_key_pem())
}

pub fn write_cluster_tree(config: &ClusterConfig, dir: &Path) -> Result<()> {
    let ca = ensure_ca(dir, "ca", "kubernetes")?;
    ensure_leaf(
        dir,
        &ca,
        &CertSpec {
            name: "apiserver",
            common_name: "kube-apiserver",
            organization: None,
            sans: config.cert_sans.clone(),
            usage: Usage::Server,
        },
    )?;
    ensure_leaf(
        dir,
        &ca,
        &CertSpec {
            name: "apiserver-kubelet-client",
            common_name: "kube-apiserver-kubelet-client",
            organization: Some("system:masters"),
            sans: Vec::new(),
            usage: Usage::Client,
        },
    )?;
    ensure_service_account_keys(dir)
}

pub fn write_etcd_tree(config: &ClusterConfig, dir: &Path) -> Result<()> {
    let ca = ensure_ca(dir, "ca", "etcd-ca")?;
    ensure_leaf(
        dir,
        &ca,
        &CertSpec {
            name: "server",
            common_name: &config.name,
            organization: None,
            sans: config.etcd_sans.clone(),
            usage: Usage::Peer,
        },
    )?;
    ensure_leaf(
        dir,
        &ca,
        &CertSpec {
            name: "peer",
            common_name: &config.name,
            organization: None,
            sans: config.etcd_sans.clone(),
            usage: Usage::Peer,
        },
    )?;
    ensure_leaf(
        dir,
        &ca,
        &CertSpec {
            name: "apiserver-etcd-client",
            common_name: "kube-apiserver-etcd-client",
            organization: Some("system:masters"),
            sans: Vec::new(),
            usage: Usage::Client,
        },
    )
}

/// 读取目录下所有文件，键为 `/` 分隔的相对路径
pub fn read_tree(dir: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| generate_error(&format!("遍历 {}", dir.display()), e))?;
        if entry.file_type().is_file() {
            files.insert(relative_key(dir, entry.path())?, std::fs::read(entry.path())?);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::tests::substrate_config;

    #[test]
    fn test_cluster_tree_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let config = substrate_config();

        write_cluster_tree(&config, dir.path()).unwrap();
        let first = read_tree(dir.path()).unwrap();
        assert!(first.contains_key("ca.crt"));
        assert!(first.contains_key("apiserver.key"));
        assert!(first.contains_key("sa.pub"));

        write_cluster_tree(&config, dir.path()).unwrap();
        assert_eq!(read_tree(dir.path()).unwrap(), first);
    }

    #[test]
    fn test_leaf_signed_by_loaded_ca() {
        let dir = tempfile::tempdir().unwrap();
        let config = substrate_config();
        write_etcd_tree(&config, dir.path()).unwrap();

        std::fs::remove_file(dir.path().join("server.crt")).unwrap();
        let loaded = load_ca(dir.path(), "ca").unwrap();
        let (cert, key) = issue(
            &loaded,
            &CertSpec {
                name: "server",
                common_name: "sub",
                organization: None,
                sans: config.etcd_sans.clone(),
                usage: Usage::Peer,
            },
        )
        .unwrap();
        assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(key.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_missing_ca_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_ca(dir.path(), "ca"), Err(Error::Generate(_))));
    }
}
