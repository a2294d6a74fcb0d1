//! 自定义资源定义模块
//!
//! 资源类型本身定义在 kit-common 中，这里负责生成需要注册到集群的
//! CustomResourceDefinition。

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

use kit_common::{ControlPlane, SecurityGroup, Substrate};

/// Operator 管理的全部 CRD
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![ControlPlane::crd(), Substrate::crd(), SecurityGroup::crd()]
}

/// 以多文档 YAML 输出所有 CRD
pub fn render() -> serde_yaml::Result<String> {
    let mut out = String::new();
    for crd in crds() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_all_kinds() {
        let yaml = render().unwrap();
        assert_eq!(yaml.matches("kind: CustomResourceDefinition").count(), 3);
        for name in [
            "controlplanes.kit.k8s.sh",
            "substrates.kit.sh",
            "securitygroups.infrastructure.kit.k8s.sh",
        ] {
            assert!(yaml.contains(name), "缺少 {name}");
        }
    }
}
