//! systemd 单元

use std::path::Path;

use kit_common::Result;

use super::{write_file, ClusterConfig, KUBECONFIG_DIR};

pub const KUBELET_UNIT: &str = "kubelet.service";

pub fn kubelet_unit(config: &ClusterConfig) -> String {
    let mut args = vec![
        format!("--hostname-override={}", config.name),
        "--address=127.0.0.1".to_string(),
        format!("--pod-manifest-path={KUBECONFIG_DIR}/manifests"),
        format!("--kubeconfig={KUBECONFIG_DIR}/kubelet.conf"),
        "--container-runtime=docker".to_string(),
        "--node-labels=kit.sh/substrate=control-plane".to_string(),
    ];
    args.extend(config.kubelet_args.iter().map(|(k, v)| format!("--{k}={v}")));

    format!(
        "[Unit]\n\
         After=docker.service iptables-restore.service\n\
         Requires=docker.service\n\
         \n\
         [Service]\n\
         ExecStart=/usr/bin/kubelet {}\n\
         Restart=always\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        args.join(" ")
    )
}

pub fn write_kubelet_unit(config: &ClusterConfig, dir: &Path) -> Result<()> {
    write_file(&dir.join(KUBELET_UNIT), kubelet_unit(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::tests::substrate_config;

    #[test]
    fn test_kubelet_unit() {
        let unit = kubelet_unit(&substrate_config());
        assert!(unit.starts_with("[Unit]\n"));
        assert!(unit.contains("--hostname-override=sub"));
        assert!(unit.contains("--cgroup-driver=systemd"));
        assert!(unit.contains(
            "--pod-infra-container-image=public.ecr.aws/eks-distro/kubernetes/pause:v1.21.2-eks-1-21-4"
        ));
        assert!(unit.contains("Restart=always\n"));
    }
}
