//! KIT Operator - 嵌套控制平面的 Kubernetes Operator
//!
//! 该模块把协调引擎接入真实集群：ControlPlane 与 Substrate 各由一个
//! kube 运行时控制器驱动，并在同一进程中导出 Prometheus 指标与健康检查端点。

pub mod controller;
pub mod crd;
pub mod metrics;
pub mod reconcile;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::Api;
use kube::runtime::controller::Controller as KubeController;
use kube::runtime::watcher;
use kube::Client;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info};

use kit_common::{ControlPlane, OperatorConfig, SecurityGroup, Substrate};
use kit_controller::bootstrap::DefaultArtifactWriter;
use kit_controller::cloud::LocalCloud;
use kit_controller::components::{ControlPlaneDeps, KubeconfigConnector, SubstrateDeps};
use kit_controller::{KubeRecorder, KubeStore, ObjectStore, Reconciler};

use crate::controller::KindContext;
use crate::metrics::Metrics;
use crate::reconcile::{ControlPlaneController, SubstrateController};

const REPORTER: &str = "kit-operator";

/// Operator 主结构体
pub struct KitOperator {
    client: Client,
    config: Arc<OperatorConfig>,
    metrics: Metrics,
    control_planes: Arc<KindContext<ControlPlaneController>>,
    substrates: Arc<KindContext<SubstrateController>>,
    /// 通知控制器停止
    shutdown: RwLock<Vec<oneshot::Sender<()>>>,
    /// 指标服务器
    background: RwLock<Vec<JoinHandle<()>>>,
    controllers: RwLock<Vec<JoinHandle<()>>>,
}

impl KitOperator {
    /// 创建新的 Operator 实例
    pub fn new(client: Client, config: OperatorConfig) -> Result<Self> {
        let config = Arc::new(config);
        let metrics = Metrics::new().context("注册指标失败")?;
        let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone()));
        let recorder = Arc::new(KubeRecorder::new(client.clone(), REPORTER));
        let cloud = Arc::new(LocalCloud::new(&config.cloud));
        let writer = Arc::new(DefaultArtifactWriter);

        let control_plane_deps = ControlPlaneDeps {
            store: store.clone(),
            writer: writer.clone(),
            connector: Arc::new(KubeconfigConnector),
            config: config.clone(),
        };
        let substrate_deps = SubstrateDeps {
            buckets: cloud.clone(),
            identity: cloud.clone(),
            addresses: cloud,
            writer,
            config: config.clone(),
        };

        let control_planes = KindContext::new(
            Reconciler::new(
                ControlPlaneController::new(&control_plane_deps),
                store.clone(),
                recorder.clone(),
                config.reconcile.clone(),
            ),
            &config.reconcile,
            metrics.clone(),
        );
        let substrates = KindContext::new(
            Reconciler::new(
                SubstrateController::new(&substrate_deps),
                store,
                recorder,
                config.reconcile.clone(),
            ),
            &config.reconcile,
            metrics.clone(),
        );

        Ok(Self {
            client,
            config,
            metrics,
            control_planes: Arc::new(control_planes),
            substrates: Arc::new(substrates),
            shutdown: RwLock::new(Vec::new()),
            background: RwLock::new(Vec::new()),
            controllers: RwLock::new(Vec::new()),
        })
    }

    /// 启动 Operator
    pub async fn start(&self) -> Result<()> {
        let metrics_config = &self.config.metrics;
        let addr: SocketAddr = format!("{}:{}", metrics_config.listen_address, metrics_config.port)
            .parse()
            .context("指标服务器地址无效")?;
        let metrics = self.metrics.clone();
        self.background.write().await.push(tokio::spawn(async move {
            if let Err(e) = metrics::serve(metrics, addr).await {
                error!("指标服务器错误: {}", e);
            }
        }));

        let config = watcher::Config::default();
        let client = &self.client;

        // 托管资源的变更（例如负载均衡器分配主机名）会触发所属 ControlPlane 的协调
        let control_planes = KubeController::new(Api::<ControlPlane>::all(client.clone()), config.clone())
            .owns(Api::<SecurityGroup>::all(client.clone()), config.clone())
            .owns(Api::<Service>::all(client.clone()), config.clone())
            .owns(Api::<StatefulSet>::all(client.clone()), config.clone())
            .owns(Api::<Deployment>::all(client.clone()), config.clone())
            .owns(Api::<Secret>::all(client.clone()), config.clone());
        let substrates = KubeController::new(Api::<Substrate>::all(client.clone()), config);

        let (control_plane_tx, control_plane_rx) = oneshot::channel::<()>();
        let (substrate_tx, substrate_rx) = oneshot::channel::<()>();
        self.shutdown
            .write()
            .await
            .extend([control_plane_tx, substrate_tx]);

        let mut handles = self.controllers.write().await;
        handles.push(tokio::spawn(controller::run(
            control_planes,
            self.control_planes.clone(),
            async move {
                let _ = control_plane_rx.await;
            },
        )));
        handles.push(tokio::spawn(controller::run(
            substrates,
            self.substrates.clone(),
            async move {
                let _ = substrate_rx.await;
            },
        )));

        info!("KIT Operator 已启动");
        Ok(())
    }

    /// 停止 Operator，等待进行中的协调完成
    pub async fn stop(&self) -> Result<()> {
        for tx in self.shutdown.write().await.drain(..) {
            let _ = tx.send(());
        }
        for handle in self.controllers.write().await.drain(..) {
            handle.await.context("控制器异常退出")?;
        }
        for handle in self.background.write().await.drain(..) {
            handle.abort();
        }

        info!("KIT Operator 已停止");
        Ok(())
    }
}
