//! 顶层协调循环
//!
//! 每次调用处理一个对象：重新读取对象，若已请求删除则走清理路径，
//! 清理成功后移除本控制器的 finalizer；否则确保 finalizer 存在并执行协调。
//! 协调结论写回 status 的阶段与条件，失败与关键转换记录为 Kubernetes 事件。

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use kit_common::config::ReconcileConfig;
use kit_common::{DesiredState, Result};

use crate::apply::{full_merge_diff, is_empty_patch};
use crate::events::{actions, reasons, EventRecorder};
use crate::readiness::{Outcome, ReconcileResult};
use crate::store::{api_resource, get_typed, ObjectKey, ObjectStore};

/// 单一资源类型的控制器
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    type Object: DesiredState;

    fn name(&self) -> &'static str;

    /// 阻止对象在清理完成前被移除的 finalizer
    fn finalizer(&self) -> &'static str;

    async fn reconcile(&self, object: &mut Self::Object) -> Result<ReconcileResult>;

    /// 返回 `requeue` 表示清理仍在进行，finalizer 保留
    async fn finalize(&self, object: &mut Self::Object) -> Result<ReconcileResult>;
}

/// 驱动某个 Controller 的协调器
pub struct Reconciler<C> {
    controller: C,
    store: Arc<dyn ObjectStore>,
    recorder: Arc<dyn EventRecorder>,
    config: ReconcileConfig,
}

impl<C: Controller> Reconciler<C> {
    pub fn new(
        controller: C,
        store: Arc<dyn ObjectStore>,
        recorder: Arc<dyn EventRecorder>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            controller,
            store,
            recorder,
            config,
        }
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn name(&self) -> &'static str {
        self.controller.name()
    }

    #[instrument(skip(self), fields(
        kind = self.controller.name(),
        namespace = key.namespace.as_deref().unwrap_or_default(),
        name = %key.name,
    ))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileResult> {
        let Some(object) = get_typed::<C::Object>(self.store.as_ref(), key).await? else {
            debug!("对象已不存在，跳过");
            return Ok(ReconcileResult::done());
        };

        if object.is_terminating() {
            self.finalize(key, object).await
        } else {
            self.apply(key, object).await
        }
    }

    async fn apply(&self, key: &ObjectKey, mut object: C::Object) -> Result<ReconcileResult> {
        self.ensure_finalizer(key, &mut object).await?;

        let before = status_of(&object)?;
        let was_ready = object.is_ready();
        let generation = object.meta().generation;
        object.reconcile_status_mut().mark_provisioning(generation);

        let result = self.controller.reconcile(&mut object).await;
        let (outcome, result) = Outcome::classify(result, self.config.not_ready_requeue());
        outcome.apply(object.reconcile_status_mut());

        match &outcome {
            Outcome::Ready if !was_ready => {
                info!("{} 已就绪", key);
                self.publish(&object, EventType::Normal, reasons::READY, actions::RECONCILE, None)
                    .await;
            }
            Outcome::Waiting(message) => debug!("等待依赖就绪: {}", message),
            Outcome::Failed(message) => {
                warn!("协调 {} 失败: {}", key, message);
                self.publish(
                    &object,
                    EventType::Warning,
                    reasons::RECONCILE_FAILED,
                    actions::RECONCILE,
                    Some(message.clone()),
                )
                .await;
            }
            Outcome::Ready => {}
        }

        self.write_status(key, &before, &mut object).await;
        result
    }

    async fn finalize(&self, key: &ObjectKey, mut object: C::Object) -> Result<ReconcileResult> {
        let finalizer = self.controller.finalizer();
        if !object.has_finalizer(finalizer) {
            debug!("对象删除中且没有 {} finalizer，跳过", finalizer);
            return Ok(ReconcileResult::done());
        }

        let before = status_of(&object)?;
        object.reconcile_status_mut().mark_terminating();

        match self.controller.finalize(&mut object).await {
            Ok(result) if result.requeue => {
                debug!("{} 清理尚未完成", key);
                self.write_status(key, &before, &mut object).await;
                Ok(result)
            }
            Ok(_) => {
                self.write_status(key, &before, &mut object).await;
                self.remove_finalizer(key, &object).await?;
                info!("{} 清理完成，已移除 finalizer", key);
                self.publish(&object, EventType::Normal, reasons::FINALIZED, actions::FINALIZE, None)
                    .await;
                Ok(ReconcileResult::done())
            }
            Err(e) if e.is_not_ready() => {
                debug!("清理等待依赖: {}", e);
                self.write_status(key, &before, &mut object).await;
                Ok(ReconcileResult::requeue_after(self.config.not_ready_requeue()))
            }
            Err(e) => {
                warn!("清理 {} 失败: {}", key, e);
                object.reconcile_status_mut().mark_failed(e.to_string());
                self.publish(
                    &object,
                    EventType::Warning,
                    reasons::FINALIZE_FAILED,
                    actions::FINALIZE,
                    Some(e.to_string()),
                )
                .await;
                self.write_status(key, &before, &mut object).await;
                Err(e)
            }
        }
    }

    async fn ensure_finalizer(&self, key: &ObjectKey, object: &mut C::Object) -> Result<()> {
        let finalizer = self.controller.finalizer();
        if object.has_finalizer(finalizer) {
            return Ok(());
        }
        let mut finalizers = object.finalizers().to_vec();
        finalizers.push(finalizer.to_string());
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": object.resource_version(),
            }
        });
        let updated = self
            .store
            .patch(&api_resource::<C::Object>(), key, patch)
            .await?;
        object.meta_mut().finalizers = Some(finalizers);
        object.meta_mut().resource_version = resource_version_of(&updated);
        debug!("已添加 finalizer {}", finalizer);
        Ok(())
    }

    async fn remove_finalizer(&self, key: &ObjectKey, object: &C::Object) -> Result<()> {
        let finalizer = self.controller.finalizer();
        let rest: Vec<String> = object
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        let patch = json!({
            "metadata": {
                "finalizers": rest,
                "resourceVersion": object.resource_version(),
            }
        });
        self.store
            .patch(&api_resource::<C::Object>(), key, patch)
            .await?;
        Ok(())
    }

    /// 写回 status；失败只记录日志，不掩盖协调结果
    async fn write_status(&self, key: &ObjectKey, before: &Value, object: &mut C::Object) {
        let after = match status_of(object) {
            Ok(after) => after,
            Err(e) => {
                warn!("序列化 {} 的 status 失败: {}", key, e);
                return;
            }
        };
        let patch = full_merge_diff(before, &after);
        if is_empty_patch(&patch) {
            return;
        }
        match self
            .store
            .patch_status(&api_resource::<C::Object>(), key, json!({ "status": patch }))
            .await
        {
            Ok(updated) => object.meta_mut().resource_version = resource_version_of(&updated),
            Err(e) => warn!("更新 {} 的 status 失败: {}", key, e),
        }
    }

    async fn publish(
        &self,
        object: &C::Object,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.recorder
            .publish(&object.object_ref(&()), type_, reason, action, note)
            .await;
    }
}

fn status_of<K: DesiredState>(object: &K) -> Result<Value> {
    let mut value = serde_json::to_value(object)?;
    Ok(value
        .get_mut("status")
        .map(Value::take)
        .unwrap_or(Value::Null))
}

fn resource_version_of(object: &Value) -> Option<String> {
    object
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryRecorder;
    use crate::store::MemoryStore;
    use kit_common::{
        ConditionStatus, ControlPlane, ControlPlaneSpec, Error, OperatorConfig, Phase,
        CONDITION_READY,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    const FINALIZER: &str = "kit.k8s.sh/test";

    /// 按脚本返回结果的控制器，脚本耗尽后返回成功
    #[derive(Default)]
    struct Scripted {
        reconcile: Mutex<VecDeque<Result<ReconcileResult>>>,
        finalize: Mutex<VecDeque<Result<ReconcileResult>>>,
        finalize_calls: Mutex<usize>,
    }

    impl Scripted {
        fn reconcile_with(self, results: Vec<Result<ReconcileResult>>) -> Self {
            *self.reconcile.lock().unwrap() = results.into();
            self
        }

        fn finalize_with(self, results: Vec<Result<ReconcileResult>>) -> Self {
            *self.finalize.lock().unwrap() = results.into();
            self
        }
    }

    #[async_trait]
    impl Controller for Scripted {
        type Object = ControlPlane;

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn finalizer(&self) -> &'static str {
            FINALIZER
        }

        async fn reconcile(&self, object: &mut ControlPlane) -> Result<ReconcileResult> {
            let next = self.reconcile.lock().unwrap().pop_front();
            if matches!(next, None | Some(Ok(_))) {
                object.status.get_or_insert_with(Default::default).endpoint =
                    Some("lb.example.com".into());
            }
            next.unwrap_or_else(|| Ok(ReconcileResult::done()))
        }

        async fn finalize(&self, _object: &mut ControlPlane) -> Result<ReconcileResult> {
            *self.finalize_calls.lock().unwrap() += 1;
            let next = self.finalize.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(ReconcileResult::done()))
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        recorder: Arc<MemoryRecorder>,
        reconciler: Reconciler<Scripted>,
        key: ObjectKey,
    }

    fn fixture(controller: Scripted) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(MemoryRecorder::new());
        let mut cp = ControlPlane::new(
            "demo",
            ControlPlaneSpec {
                kubernetes_version: None,
                etcd: Default::default(),
                master: Default::default(),
            },
        );
        cp.metadata.namespace = Some("default".into());
        store.insert(&cp).unwrap();
        Fixture {
            reconciler: Reconciler::new(
                controller,
                store.clone(),
                recorder.clone(),
                OperatorConfig::default().reconcile,
            ),
            key: ObjectKey::namespaced("default", "demo"),
            store,
            recorder,
        }
    }

    impl Fixture {
        fn object(&self) -> Option<ControlPlane> {
            self.store.get_typed::<ControlPlane>(&self.key)
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_first_pass_adds_finalizer_and_becomes_ready() {
        let f = fixture(Scripted::default());
        let result = f.reconciler.reconcile(&f.key).await.unwrap();
        assert_eq!(result, ReconcileResult::done());

        let cp = f.object().unwrap();
        assert!(cp.has_finalizer(FINALIZER));
        let status = cp.status.as_ref().unwrap();
        assert_eq!(status.reconcile.phase, Phase::Ready);
        assert_eq!(status.reconcile.observed_generation, Some(1));
        assert_eq!(status.endpoint.as_deref(), Some("lb.example.com"));
        assert_eq!(f.recorder.reasons(), vec!["Ready"]);
    }

    #[tokio::test]
    async fn test_converged_object_issues_no_writes() {
        let f = fixture(Scripted::default());
        f.reconciler.reconcile(&f.key).await.unwrap();
        f.store.clear_calls();

        for _ in 0..3 {
            f.reconciler.reconcile(&f.key).await.unwrap();
        }
        assert!(f.store.calls().is_empty());
        assert_eq!(f.recorder.reasons(), vec!["Ready"]);
    }

    #[tokio::test]
    async fn test_not_ready_requeues_without_error() {
        let f = fixture(Scripted::default().reconcile_with(vec![
            Err(Error::NotReady("负载均衡器主机名".into()).in_stage("master")),
            Err(Error::NotReady("负载均衡器主机名".into()).in_stage("master")),
        ]));
        let delay = OperatorConfig::default().reconcile.not_ready_requeue();

        for _ in 0..2 {
            let result = f.reconciler.reconcile(&f.key).await.unwrap();
            assert_eq!(result, ReconcileResult::requeue_after(delay));
            let cp = f.object().unwrap();
            let ready = cp.reconcile_status().unwrap().condition(CONDITION_READY).unwrap();
            assert_eq!(ready.status, ConditionStatus::False);
            assert_eq!(ready.reason.as_deref(), Some("WaitingForSubResources"));
        }
        assert!(f.recorder.warnings().is_empty());

        f.reconciler.reconcile(&f.key).await.unwrap();
        assert!(f.object().unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_failure_is_recorded_on_status_and_event() {
        let f = fixture(
            Scripted::default().reconcile_with(vec![Err(Error::Cloud("throttled".into()).in_stage("etcd"))]),
        );
        let err = f.reconciler.reconcile(&f.key).await.unwrap_err();
        assert!(err.is_retryable());

        let cp = f.object().unwrap();
        let status = cp.reconcile_status().unwrap();
        assert!(!status.is_ready());
        assert!(status.last_error.as_deref().unwrap().starts_with("etcd 阶段失败"));
        let warnings = f.recorder.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].reason, "ReconcileFailed");
        assert_eq!(warnings[0].object, "default/demo");
    }

    #[tokio::test]
    async fn test_finalizer_removed_only_after_successful_finalize() {
        let f = fixture(Scripted::default().finalize_with(vec![
            Err(Error::Cloud("bucket busy".into())),
            Ok(ReconcileResult::requeue_after(Duration::from_secs(1))),
            Ok(ReconcileResult::done()),
        ]));
        f.reconciler.reconcile(&f.key).await.unwrap();
        f.store
            .delete(&api_resource::<ControlPlane>(), &f.key)
            .await
            .unwrap();
        assert!(f.object().unwrap().is_terminating());

        assert!(f.reconciler.reconcile(&f.key).await.is_err());
        let cp = f.object().unwrap();
        assert!(cp.has_finalizer(FINALIZER));
        assert_eq!(cp.reconcile_status().unwrap().phase, Phase::Terminating);
        assert_eq!(f.recorder.warnings()[0].reason, "FinalizeFailed");

        let pending = f.reconciler.reconcile(&f.key).await.unwrap();
        assert!(pending.requeue);
        assert!(f.object().is_some());

        let result = f.reconciler.reconcile(&f.key).await.unwrap();
        assert_eq!(result, ReconcileResult::done());
        assert!(f.object().is_none());
        assert_eq!(*f.reconciler.controller().finalize_calls.lock().unwrap(), 3);
        assert_eq!(f.recorder.reasons().last().map(String::as_str), Some("Finalized"));

        // 对象移除后的调用是空操作
        assert_eq!(f.reconciler.reconcile(&f.key).await.unwrap(), ReconcileResult::done());
    }

    #[tokio::test]
    async fn test_foreign_finalizers_are_preserved() {
        let f = fixture(Scripted::default());
        f.reconciler.reconcile(&f.key).await.unwrap();
        f.store
            .patch(
                &api_resource::<ControlPlane>(),
                &f.key,
                json!({"metadata": {"finalizers": [FINALIZER, "other.io/keep"]}}),
            )
            .await
            .unwrap();
        f.store
            .delete(&api_resource::<ControlPlane>(), &f.key)
            .await
            .unwrap();

        f.reconciler.reconcile(&f.key).await.unwrap();
        let cp = f.object().unwrap();
        assert_eq!(cp.finalizers().to_vec(), vec!["other.io/keep".to_string()]);

        // 本控制器的 finalizer 已移除，不再调用清理
        f.reconciler.reconcile(&f.key).await.unwrap();
        assert_eq!(*f.reconciler.controller().finalize_calls.lock().unwrap(), 1);
    }
}
