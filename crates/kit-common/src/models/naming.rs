//! 确定性命名
//!
//! 所有托管资源的名称都由期望状态对象的身份推导而来，
//! 进程崩溃后重新协调时会找到并接管已有资源，而不是重复创建。

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

/// DNS 名称长度上限
pub const MAX_NAME_LENGTH: usize = 63;

/// 租户控制平面节点角色后缀
pub const TENANT_CONTROL_PLANE_NODE_ROLE: &str = "tenant-controlplane-node-role";

static DNS_1035_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]([-a-z0-9]*[a-z0-9])?$").expect("合法的正则表达式"));

/// 校验名称是否为合法的 DNS-1035 标签
pub fn validate_label(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::InvalidSpec(format!(
            "名称 {name} 超过 {MAX_NAME_LENGTH} 个字符"
        )));
    }
    if !DNS_1035_LABEL.is_match(name) {
        return Err(Error::InvalidSpec(format!("名称 {name} 不是合法的 DNS-1035 标签")));
    }
    Ok(())
}

fn derived(name: String) -> Result<String> {
    validate_label(&name)?;
    Ok(name)
}

/// 控制平面 endpoint Service 名称
pub fn service_name_for(cluster: &str) -> Result<String> {
    derived(format!("{cluster}-cp"))
}

pub fn apiserver_port_name(cluster: &str) -> Result<String> {
    derived(format!("{cluster}-cp-port"))
}

/// 每个控制平面组件的安全组对象名称
pub fn security_group_name(cluster: &str, component: &str) -> Result<String> {
    derived(format!("{cluster}-{component}"))
}

pub fn etcd_name(cluster: &str) -> Result<String> {
    derived(format!("{cluster}-etcd"))
}

pub fn component_name(cluster: &str, component: &str) -> Result<String> {
    derived(format!("{cluster}-{component}"))
}

pub fn pki_secret_name(cluster: &str) -> Result<String> {
    derived(format!("{cluster}-pki"))
}

pub fn etcd_pki_secret_name(cluster: &str) -> Result<String> {
    derived(format!("{cluster}-etcd-pki"))
}

pub fn kube_proxy_config_name(cluster: &str) -> Result<String> {
    derived(format!("{cluster}-kubeproxy-config"))
}

/// Substrate 制品桶名称，同时用作本地暂存目录名
pub fn bucket_name(namespace: &str, name: &str) -> Result<String> {
    derived(format!("kit-{namespace}-{name}"))
}

/// 租户控制平面节点的 IAM 角色 ARN
pub fn node_role_arn(account_id: &str, substrate: &str) -> String {
    format!("arn:aws:iam::{account_id}:role/{substrate}-{TENANT_CONTROL_PLANE_NODE_ROLE}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("demo", true)]
    #[case("demo-1", true)]
    #[case("1demo", false)]
    #[case("Demo", false)]
    #[case("demo-", false)]
    #[case("", false)]
    fn test_validate_label(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(validate_label(name).is_ok(), valid);
    }

    #[test]
    fn test_derived_names() {
        assert_eq!(service_name_for("demo").unwrap(), "demo-cp");
        assert_eq!(apiserver_port_name("demo").unwrap(), "demo-cp-port");
        assert_eq!(security_group_name("demo", "etcd").unwrap(), "demo-etcd");
        assert_eq!(bucket_name("default", "sub").unwrap(), "kit-default-sub");
        assert_eq!(etcd_pki_secret_name("demo").unwrap(), "demo-etcd-pki");
        assert_eq!(
            node_role_arn("123456789012", "sub"),
            "arn:aws:iam::123456789012:role/sub-tenant-controlplane-node-role"
        );
    }

    #[test]
    fn test_long_names_are_rejected() {
        let cluster = "a".repeat(60);
        let err = service_name_for(&cluster).unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
        assert!(!err.is_retryable());
    }
}
