//! 控制平面组件的容器定义与静态 Pod 清单
//!
//! 同一组容器定义既用于 Substrate 节点上的静态 Pod，
//! 也用于 ControlPlane 在管理集群中的 StatefulSet 与 Deployment。

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HostPathVolumeSource, ObjectFieldSelector,
    Pod, PodSpec, SecurityContext, Volume, VolumeMount,
};
use kube::api::ObjectMeta;

use kit_common::Result;

use super::{authenticator, write_file, ClusterConfig, KUBECONFIG_DIR};

pub const ETCD: &str = "etcd";
pub const KUBE_APISERVER: &str = "kube-apiserver";
pub const KUBE_CONTROLLER_MANAGER: &str = "kube-controller-manager";
pub const KUBE_SCHEDULER: &str = "kube-scheduler";

const SERVICE_CIDR: &str = "10.96.0.0/12";

pub fn labels(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("component".to_string(), component.to_string()),
        ("tier".to_string(), "control-plane".to_string()),
    ])
}

fn flags(args: &BTreeMap<String, String>) -> Vec<String> {
    args.iter().map(|(k, v)| format!("--{k}={v}")).collect()
}

pub fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.into(),
        mount_path: path.into(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

pub fn host_path_volume(name: &str, path: &str, type_: Option<&str>) -> Volume {
    Volume {
        name: name.into(),
        host_path: Some(HostPathVolumeSource {
            path: path.into(),
            type_: type_.map(str::to_string),
        }),
        ..Default::default()
    }
}

pub fn etcd_container(config: &ClusterConfig) -> Container {
    let pki = &config.etcd_pki_dir;
    let mut args = BTreeMap::from([
        ("cert-file".to_string(), format!("{pki}/server.crt")),
        ("key-file".to_string(), format!("{pki}/server.key")),
        ("peer-cert-file".to_string(), format!("{pki}/peer.crt")),
        ("peer-key-file".to_string(), format!("{pki}/peer.key")),
        ("trusted-ca-file".to_string(), format!("{pki}/ca.crt")),
        ("peer-trusted-ca-file".to_string(), format!("{pki}/ca.crt")),
        ("client-cert-auth".to_string(), "true".to_string()),
        ("peer-client-cert-auth".to_string(), "true".to_string()),
    ]);
    args.extend(config.etcd_args.clone());

    let mut command = vec![ETCD.to_string()];
    command.extend(flags(&args));
    Container {
        name: ETCD.into(),
        image: Some(config.images.etcd_image()),
        command: Some(command),
        env: Some(vec![EnvVar {
            name: "POD_NAME".into(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ports: Some(vec![
            container_port("client", 2379),
            container_port("peer", 2380),
        ]),
        volume_mounts: Some(vec![
            mount("etcd-data", "/var/lib/etcd", false),
            mount("etcd-certs", pki, true),
        ]),
        ..Default::default()
    }
}

pub fn apiserver_container(config: &ClusterConfig) -> Container {
    let pki = &config.pki_dir;
    let etcd_pki = &config.etcd_pki_dir;
    let mut args = BTreeMap::from([
        ("secure-port".to_string(), config.bind_port.to_string()),
        ("allow-privileged".to_string(), "true".to_string()),
        ("authorization-mode".to_string(), "Node,RBAC".to_string()),
        ("client-ca-file".to_string(), format!("{pki}/ca.crt")),
        ("enable-bootstrap-token-auth".to_string(), "true".to_string()),
        ("etcd-servers".to_string(), config.etcd_servers.clone()),
        ("etcd-cafile".to_string(), format!("{etcd_pki}/ca.crt")),
        ("etcd-certfile".to_string(), format!("{etcd_pki}/apiserver-etcd-client.crt")),
        ("etcd-keyfile".to_string(), format!("{etcd_pki}/apiserver-etcd-client.key")),
        (
            "kubelet-client-certificate".to_string(),
            format!("{pki}/apiserver-kubelet-client.crt"),
        ),
        (
            "kubelet-client-key".to_string(),
            format!("{pki}/apiserver-kubelet-client.key"),
        ),
        (
            "service-account-issuer".to_string(),
            "https://kubernetes.default.svc.cluster.local".to_string(),
        ),
        ("service-account-key-file".to_string(), format!("{pki}/sa.pub")),
        (
            "service-account-signing-key-file".to_string(),
            format!("{pki}/sa.key"),
        ),
        ("service-cluster-ip-range".to_string(), SERVICE_CIDR.to_string()),
        ("tls-cert-file".to_string(), format!("{pki}/apiserver.crt")),
        ("tls-private-key-file".to_string(), format!("{pki}/apiserver.key")),
    ]);
    if let Some(address) = config.advertise_address() {
        args.insert("advertise-address".into(), address.to_string());
    }
    args.extend(config.apiserver_args.clone());

    let mut command = vec![KUBE_APISERVER.to_string()];
    command.extend(flags(&args));
    let mut mounts = vec![
        mount("k8s-certs", KUBECONFIG_DIR, true),
        mount("etcd-certs", etcd_pki, true),
    ];
    if config
        .apiserver_args
        .contains_key("authentication-token-webhook-config-file")
    {
        mounts.push(mount(
            "authenticator-config",
            authenticator::WEBHOOK_KUBECONFIG,
            true,
        ));
    }
    Container {
        name: KUBE_APISERVER.into(),
        image: Some(config.image(KUBE_APISERVER)),
        command: Some(command),
        ports: Some(vec![container_port("https", i32::from(config.bind_port))]),
        volume_mounts: Some(mounts),
        ..Default::default()
    }
}

pub fn controller_manager_container(config: &ClusterConfig) -> Container {
    let pki = &config.pki_dir;
    let kubeconfig = format!("{KUBECONFIG_DIR}/controller-manager.conf");
    let args = BTreeMap::from([
        ("kubeconfig".to_string(), kubeconfig.clone()),
        ("authentication-kubeconfig".to_string(), kubeconfig.clone()),
        ("authorization-kubeconfig".to_string(), kubeconfig),
        ("bind-address".to_string(), "127.0.0.1".to_string()),
        ("cluster-signing-cert-file".to_string(), format!("{pki}/ca.crt")),
        ("cluster-signing-key-file".to_string(), format!("{pki}/ca.key")),
        ("root-ca-file".to_string(), format!("{pki}/ca.crt")),
        (
            "service-account-private-key-file".to_string(),
            format!("{pki}/sa.key"),
        ),
        ("use-service-account-credentials".to_string(), "true".to_string()),
        ("leader-elect".to_string(), "true".to_string()),
    ]);
    let mut command = vec![KUBE_CONTROLLER_MANAGER.to_string()];
    command.extend(flags(&args));
    Container {
        name: KUBE_CONTROLLER_MANAGER.into(),
        image: Some(config.image(KUBE_CONTROLLER_MANAGER)),
        command: Some(command),
        volume_mounts: Some(vec![mount("k8s-certs", KUBECONFIG_DIR, true)]),
        ..Default::default()
    }
}

pub fn scheduler_container(config: &ClusterConfig) -> Container {
    let kubeconfig = format!("{KUBECONFIG_DIR}/scheduler.conf");
    let args = BTreeMap::from([
        ("kubeconfig".to_string(), kubeconfig.clone()),
        ("authentication-kubeconfig".to_string(), kubeconfig.clone()),
        ("authorization-kubeconfig".to_string(), kubeconfig),
        ("bind-address".to_string(), "127.0.0.1".to_string()),
        ("leader-elect".to_string(), "true".to_string()),
    ]);
    let mut command = vec![KUBE_SCHEDULER.to_string()];
    command.extend(flags(&args));
    Container {
        name: KUBE_SCHEDULER.into(),
        image: Some(config.image(KUBE_SCHEDULER)),
        command: Some(command),
        volume_mounts: Some(vec![mount("k8s-certs", KUBECONFIG_DIR, true)]),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.into()),
        container_port: port,
        ..Default::default()
    }
}

/// kube-system 中以 hostNetwork 运行的静态 Pod
pub fn static_pod(component: &str, container: Container, volumes: Vec<Volume>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(component.into()),
            namespace: Some("kube-system".into()),
            labels: Some(labels(component)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            host_network: Some(true),
            priority_class_name: Some("system-node-critical".into()),
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// etcd、kube-apiserver、kube-controller-manager、kube-scheduler 的静态 Pod
pub fn static_pods(config: &ClusterConfig) -> Vec<Pod> {
    let k8s_certs = host_path_volume("k8s-certs", KUBECONFIG_DIR, Some("DirectoryOrCreate"));
    let etcd_certs = host_path_volume("etcd-certs", &config.etcd_pki_dir, Some("DirectoryOrCreate"));

    let mut apiserver_volumes = vec![k8s_certs.clone(), etcd_certs.clone()];
    if config
        .apiserver_args
        .contains_key("authentication-token-webhook-config-file")
    {
        apiserver_volumes.push(host_path_volume(
            "authenticator-config",
            authenticator::WEBHOOK_KUBECONFIG,
            Some("FileOrCreate"),
        ));
    }

    let mut etcd = etcd_container(config);
    etcd.env = None;
    vec![
        static_pod(
            ETCD,
            etcd,
            vec![
                host_path_volume("etcd-data", "/var/lib/etcd", Some("DirectoryOrCreate")),
                etcd_certs,
            ],
        ),
        static_pod(KUBE_APISERVER, apiserver_container(config), apiserver_volumes),
        static_pod(
            KUBE_CONTROLLER_MANAGER,
            controller_manager_container(config),
            vec![k8s_certs.clone()],
        ),
        static_pod(KUBE_SCHEDULER, scheduler_container(config), vec![k8s_certs]),
    ]
}

pub fn write_static_pods(config: &ClusterConfig, dir: &Path) -> Result<()> {
    for pod in static_pods(config) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        write_file(&dir.join(format!("{name}.yaml")), serde_yaml::to_string(&pod)?)?;
    }
    Ok(())
}

/// 以特权模式运行的容器
pub fn privileged() -> Option<SecurityContext> {
    Some(SecurityContext {
        privileged: Some(true),
        ..Default::default()
    })
}
