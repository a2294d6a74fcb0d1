//! 就绪门控
//!
//! 依赖异步分配的基础设施（例如负载均衡器主机名）尚未就绪时，
//! 阶段返回 `Error::NotReady`。协调循环将其转换为不计入退避的
//! `ReconcileResult::requeue_after`，与真正的失败区分开。

use std::time::Duration;

use kube::runtime::controller::Action;

use kit_common::{Error, ReconcileStatus, Result};

/// 单次协调的调度结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// 已收敛，等待下一次外部变更
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: true,
            requeue_after: Some(delay),
        }
    }

    /// 转换为 kube 控制器的调度动作
    pub fn into_action(self) -> Action {
        if self.requeue {
            Action::requeue(self.requeue_after.unwrap_or_default())
        } else {
            Action::await_change()
        }
    }
}

/// 取出前置条件的值，缺失时返回 NotReady
pub fn require<T>(value: Option<T>, what: impl Into<String>) -> Result<T> {
    value.ok_or_else(|| Error::NotReady(what.into()))
}

/// 一轮协调的结论，决定状态条件如何更新
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ready,
    Waiting(String),
    Failed(String),
}

impl Outcome {
    /// 将阶段返回值映射为结论与调度结果；NotReady 不视为错误
    pub fn classify(
        result: Result<ReconcileResult>,
        not_ready_delay: Duration,
    ) -> (Self, Result<ReconcileResult>) {
        match result {
            Ok(r) if r.requeue => (
                Outcome::Waiting("等待下一轮协调".to_string()),
                Ok(r),
            ),
            Ok(r) => (Outcome::Ready, Ok(r)),
            Err(e) if e.is_not_ready() => (
                Outcome::Waiting(e.to_string()),
                Ok(ReconcileResult::requeue_after(not_ready_delay)),
            ),
            Err(e) => (Outcome::Failed(e.to_string()), Err(e)),
        }
    }

    pub fn apply(&self, status: &mut ReconcileStatus) {
        match self {
            Outcome::Ready => status.mark_ready(),
            Outcome::Waiting(message) => status.mark_waiting(message.clone()),
            Outcome::Failed(message) => status.mark_failed(message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kit_common::Phase;

    #[test]
    fn test_not_ready_is_not_an_error() {
        let delay = Duration::from_secs(5);
        let (outcome, result) = Outcome::classify(
            Err(Error::NotReady("lb".into()).in_stage("master")),
            delay,
        );
        assert!(matches!(outcome, Outcome::Waiting(_)));
        assert_eq!(result.unwrap(), ReconcileResult::requeue_after(delay));

        let (outcome, result) = Outcome::classify(Err(Error::Cloud("boom".into())), delay);
        assert!(matches!(outcome, Outcome::Failed(_)));
        assert!(result.is_err());
    }

    #[test]
    fn test_outcome_updates_status() {
        let mut status = ReconcileStatus::default();
        status.mark_provisioning(Some(1));
        Outcome::Waiting("lb".into()).apply(&mut status);
        assert_eq!(status.phase, Phase::Provisioning);
        assert!(!status.is_ready());

        Outcome::Ready.apply(&mut status);
        assert!(status.is_ready());
    }

    #[test]
    fn test_result_maps_to_action() {
        let delay = Duration::from_secs(5);
        assert_eq!(ReconcileResult::done().into_action(), Action::await_change());
        assert_eq!(ReconcileResult::requeue_after(delay).into_action(), Action::requeue(delay));
        assert_eq!(ReconcileResult::requeue().into_action(), Action::requeue(Duration::ZERO));
    }

    #[test]
    fn test_require() {
        assert_eq!(require(Some(1), "x").unwrap(), 1);
        assert!(require::<u8>(None, "x").unwrap_err().is_not_ready());
    }
}
