//! 控制器模块
//!
//! 每种期望状态对象由一个 kube 运行时控制器驱动。运行时负责监听、
//! 按对象去重并保证同一对象同一时刻只有一次协调；本模块把协调器接入
//! 运行时：协调结果映射为调度动作，错误按对象的失败次数退避重试。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use kube::runtime::controller::{Action, Controller as KubeController, Error as ControllerError};
use tracing::{debug, error, info, warn};

use kit_common::config::ReconcileConfig;
use kit_common::{Error, Result};
use kit_controller::{Controller, ObjectKey, Reconciler, RetryBackoff};

use crate::metrics::{Metrics, OUTCOME_ERROR, OUTCOME_REQUEUE, OUTCOME_SUCCESS};

/// 单一资源类型的协调上下文
pub struct KindContext<C: Controller> {
    reconciler: Reconciler<C>,
    backoff: RetryBackoff,
    metrics: Metrics,
    timeout: Duration,
}

impl<C: Controller> KindContext<C> {
    pub fn new(reconciler: Reconciler<C>, config: &ReconcileConfig, metrics: Metrics) -> Self {
        Self {
            reconciler,
            backoff: RetryBackoff::new(config.backoff.clone()),
            metrics,
            timeout: config.timeout(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.reconciler.name()
    }

    pub fn backoff(&self) -> &RetryBackoff {
        &self.backoff
    }

    /// 在超时限制内协调一个对象
    pub async fn process(&self, key: &ObjectKey) -> Result<Action> {
        let started = Instant::now();
        self.metrics.reconcile_started(self.name());
        let result = match tokio::time::timeout(self.timeout, self.reconciler.reconcile(key)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("协调 {key} 超过 {:?}", self.timeout))),
        };
        self.metrics.reconcile_finished(self.name());

        let outcome = match &result {
            Ok(r) if r.requeue => OUTCOME_REQUEUE,
            Ok(_) => OUTCOME_SUCCESS,
            Err(_) => OUTCOME_ERROR,
        };
        self.metrics
            .observe_reconcile(self.name(), outcome, started.elapsed());

        let result = result?;
        self.backoff.on_success(key);
        if let Some(delay) = result.requeue_after.filter(|_| result.requeue) {
            debug!("{} 将在 {:?} 后重新协调", key, delay);
        }
        Ok(result.into_action())
    }

    /// 失败后的调度动作
    pub fn on_error(&self, key: &ObjectKey, error: &Error) -> Action {
        let delay = self.backoff.on_error(key, error);
        warn!(
            "协调 {} {} 出错，{:?} 后重试 (第 {} 次): {}",
            self.name(),
            key,
            delay,
            self.backoff.failures(key),
            error
        );
        Action::requeue(delay)
    }
}

async fn reconcile<C: Controller>(object: Arc<C::Object>, ctx: Arc<KindContext<C>>) -> Result<Action> {
    ctx.process(&ObjectKey::of(object.as_ref())).await
}

fn error_policy<C: Controller>(object: Arc<C::Object>, error: &Error, ctx: Arc<KindContext<C>>) -> Action {
    ctx.on_error(&ObjectKey::of(object.as_ref()), error)
}

/// 运行控制器，直到 `shutdown` 完成且进行中的协调结束
pub async fn run<C, F>(controller: KubeController<C::Object>, ctx: Arc<KindContext<C>>, shutdown: F)
where
    C: Controller,
    F: Future<Output = ()> + Send + Sync + 'static,
{
    let name = ctx.name();
    info!("启动 {} 控制器", name);
    controller
        .graceful_shutdown_on(shutdown)
        .run(reconcile::<C>, error_policy::<C>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!("{} 协调完成", object),
                // 协调错误已由 error_policy 记录
                Err(ControllerError::ReconcilerFailed(..)) => {}
                Err(e) => error!("{} 控制器错误: {}", name, e),
            }
        })
        .await;
    info!("{} 控制器已停止", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use kit_common::{ControlPlane, ControlPlaneSpec, EtcdSpec, MasterSpec, OperatorConfig};
    use kit_controller::{MemoryRecorder, MemoryStore, ReconcileResult};

    #[derive(Default)]
    struct Counting {
        calls: Arc<AtomicUsize>,
        delay: Option<Duration>,
        fail: bool,
    }

    #[async_trait]
    impl Controller for Counting {
        type Object = ControlPlane;

        fn name(&self) -> &'static str {
            "controlplane"
        }

        fn finalizer(&self) -> &'static str {
            "kit.k8s.sh/test"
        }

        async fn reconcile(&self, _object: &mut ControlPlane) -> Result<ReconcileResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(Error::Cloud("throttled".into()));
            }
            Ok(ReconcileResult::done())
        }

        async fn finalize(&self, _object: &mut ControlPlane) -> Result<ReconcileResult> {
            Ok(ReconcileResult::done())
        }
    }

    fn context(counting: Counting, timeout_seconds: u64) -> (KindContext<Counting>, Metrics) {
        let store = Arc::new(MemoryStore::new());
        let mut cp = ControlPlane::new(
            "demo",
            ControlPlaneSpec {
                kubernetes_version: None,
                etcd: EtcdSpec { replicas: 1 },
                master: MasterSpec { replicas: 1 },
            },
        );
        cp.metadata.namespace = Some("tenants".into());
        store.insert(&cp).unwrap();

        let mut config = OperatorConfig::default().reconcile;
        config.timeout_seconds = timeout_seconds;
        config.backoff.jitter = 0.0;
        let metrics = Metrics::new().unwrap();
        let reconciler = Reconciler::new(counting, store, Arc::new(MemoryRecorder::new()), config.clone());
        (KindContext::new(reconciler, &config, metrics.clone()), metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_with_backoff() {
        let counting = Counting {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let (ctx, metrics) = context(counting, 1);
        let key = ObjectKey::namespaced("tenants", "demo");

        let err = ctx.process(&key).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(ctx.on_error(&key, &err), Action::requeue(Duration::from_secs(1)));
        assert_eq!(ctx.backoff().failures(&key), 1);

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains(r#"kit_reconcile_total{kind="controlplane",outcome="error"} 1"#));
        assert!(text.contains(r#"kit_reconcile_in_flight{kind="controlplane"} 0"#));
    }

    #[tokio::test]
    async fn test_success_resets_failures_and_awaits_change() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (failing, _) = context(
            Counting {
                calls: calls.clone(),
                fail: true,
                ..Default::default()
            },
            30,
        );
        let key = ObjectKey::namespaced("tenants", "demo");
        for expected in [1, 2, 4] {
            let err = failing.process(&key).await.unwrap_err();
            assert_eq!(failing.on_error(&key, &err), Action::requeue(Duration::from_secs(expected)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let (ctx, metrics) = context(Counting::default(), 30);
        ctx.backoff().on_error(&key, &Error::Cloud("x".into()));
        assert_eq!(ctx.process(&key).await.unwrap(), Action::await_change());
        assert_eq!(ctx.backoff().failures(&key), 0);
        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains(r#"kit_reconcile_total{kind="controlplane",outcome="success"} 1"#));
    }

    #[tokio::test]
    async fn test_missing_object_awaits_change() {
        let (ctx, _) = context(Counting::default(), 30);
        let action = ctx.process(&ObjectKey::namespaced("tenants", "gone")).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
