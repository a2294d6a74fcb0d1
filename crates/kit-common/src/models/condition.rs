//! 状态条件与阶段
//!
//! 每个期望状态对象的 status 中都内嵌 `ReconcileStatus`，
//! 记录协调阶段和 `Ready` 等布尔条件，供外部调用方判断是否可以继续。

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Ready 条件类型
pub const CONDITION_READY: &str = "Ready";

/// 协调阶段
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    /// 尚未开始协调
    #[default]
    Pending,
    /// 正在创建或等待依赖
    Provisioning,
    /// 所有阶段都已成功
    Ready,
    /// 删除中，正在执行清理
    Terminating,
}

/// 条件取值
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// 状态条件
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// 条件类型，例如 Ready
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 条件取值最近一次变化的时间
    pub last_transition_time: DateTime<Utc>,
}

/// 所有自定义资源共享的协调状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// 最近一次协调失败的错误信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ReconcileStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// 设置条件；取值未变化时保留原有的 lastTransitionTime
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: Option<String>,
    ) {
        let reason = Some(reason.to_string());
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = Utc::now();
                }
                existing.status = status;
                existing.reason = reason;
                existing.message = message;
            }
            None => self.conditions.push(Condition {
                type_: type_.to_string(),
                status,
                reason,
                message,
                last_transition_time: Utc::now(),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.condition(CONDITION_READY)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Pending → Provisioning，在第一次协调时触发
    pub fn mark_provisioning(&mut self, generation: Option<i64>) {
        if self.phase == Phase::Pending {
            self.phase = Phase::Provisioning;
        }
        if self.condition(CONDITION_READY).is_none() {
            self.set_condition(CONDITION_READY, ConditionStatus::Unknown, "Provisioning", None);
        }
        if self.observed_generation != generation {
            self.observed_generation = generation;
        }
    }

    /// 所有阶段在同一轮协调中成功
    pub fn mark_ready(&mut self) {
        self.phase = Phase::Ready;
        self.last_error = None;
        self.set_condition(CONDITION_READY, ConditionStatus::True, "Reconciled", None);
    }

    /// 依赖尚未就绪，稍后重试
    pub fn mark_waiting(&mut self, message: String) {
        self.phase = Phase::Provisioning;
        self.set_condition(
            CONDITION_READY,
            ConditionStatus::False,
            "WaitingForSubResources",
            Some(message),
        );
    }

    pub fn mark_failed(&mut self, message: String) {
        if self.phase == Phase::Ready {
            self.phase = Phase::Provisioning;
        }
        self.set_condition(
            CONDITION_READY,
            ConditionStatus::False,
            "ReconcileFailed",
            Some(message.clone()),
        );
        self.last_error = Some(message);
    }

    pub fn mark_terminating(&mut self) {
        self.phase = Phase::Terminating;
        self.set_condition(CONDITION_READY, ConditionStatus::False, "Terminating", None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let mut status = ReconcileStatus::default();
        assert_eq!(status.phase, Phase::Pending);
        assert!(!status.is_ready());

        status.mark_provisioning(Some(1));
        assert_eq!(status.phase, Phase::Provisioning);
        assert_eq!(status.observed_generation, Some(1));

        status.mark_waiting("endpoint".into());
        assert!(!status.is_ready());

        status.mark_ready();
        assert_eq!(status.phase, Phase::Ready);
        assert!(status.is_ready());
        assert_eq!(status.conditions.len(), 1);

        status.mark_failed("boom".into());
        assert_eq!(status.phase, Phase::Provisioning);
        assert_eq!(status.last_error.as_deref(), Some("boom"));
        assert!(!status.is_ready());
    }

    #[test]
    fn test_transition_time_only_moves_on_change() {
        let mut status = ReconcileStatus::default();
        status.mark_waiting("a".into());
        let first = status.condition(CONDITION_READY).unwrap().last_transition_time;
        status.mark_waiting("b".into());
        let second = status.condition(CONDITION_READY).unwrap();
        assert_eq!(second.last_transition_time, first);
        assert_eq!(second.message.as_deref(), Some("b"));
    }

    #[test]
    fn test_serialized_shape() {
        let mut status = ReconcileStatus::default();
        status.mark_ready();
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["phase"], "Ready");
        assert_eq!(value["conditions"][0]["type"], "Ready");
        assert_eq!(value["conditions"][0]["status"], "True");
        assert!(value.get("lastError").is_none());
    }
}
