//! Kubernetes 事件记录
//!
//! 协调结果以 Event 的形式记录在期望状态对象上，运维人员可以通过
//! `kubectl describe` 查看。事件发送失败只记录警告，不影响协调结果。

use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// 事件原因
pub mod reasons {
    pub const READY: &str = "Ready";
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    pub const FINALIZED: &str = "Finalized";
    pub const FINALIZE_FAILED: &str = "FinalizeFailed";
}

/// 事件动作
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const FINALIZE: &str = "Finalize";
}

/// 事件发布接口
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// 基于 kube Recorder 的实现
pub struct KubeRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeRecorder {
    pub fn new(client: Client, controller: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeRecorder {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference.clone());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(reason, action, error = %e, "发送 Kubernetes 事件失败");
        }
    }
}

/// 已记录的事件
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub object: String,
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

/// 内存事件记录器，单节点运行与测试使用
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn warnings(&self) -> Vec<RecordedEvent> {
        self.events().into_iter().filter(|e| e.warning).collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let object = match (&reference.namespace, &reference.name) {
            (Some(ns), Some(name)) => format!("{ns}/{name}"),
            (None, Some(name)) => name.clone(),
            _ => String::new(),
        };
        let event = RecordedEvent {
            object,
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_recorder_keeps_order() {
        let recorder = MemoryRecorder::new();
        let reference = ObjectReference {
            namespace: Some("default".into()),
            name: Some("demo".into()),
            ..Default::default()
        };
        recorder
            .publish(&reference, EventType::Warning, reasons::RECONCILE_FAILED, actions::RECONCILE, Some("boom".into()))
            .await;
        recorder
            .publish(&reference, EventType::Normal, reasons::READY, actions::RECONCILE, None)
            .await;

        assert_eq!(recorder.reasons(), vec!["ReconcileFailed", "Ready"]);
        let warnings = recorder.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].object, "default/demo");
        assert_eq!(warnings[0].note.as_deref(), Some("boom"));
    }
}
