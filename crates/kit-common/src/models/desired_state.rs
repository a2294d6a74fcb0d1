//! 期望状态对象抽象
//!
//! 协调循环只依赖这里定义的能力：读取元数据、访问内嵌的协调状态。
//! 具体的自定义资源（ControlPlane、Substrate）各自实现该 trait。

use std::fmt::Debug;

use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::condition::ReconcileStatus;

/// 由协调循环驱动的期望状态对象
pub trait DesiredState:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// 只读访问协调状态，status 尚未写入时返回 None
    fn reconcile_status(&self) -> Option<&ReconcileStatus>;

    /// 可写访问协调状态，必要时创建默认 status
    fn reconcile_status_mut(&mut self) -> &mut ReconcileStatus;

    /// 是否已请求删除
    fn is_terminating(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    fn is_ready(&self) -> bool {
        self.reconcile_status()
            .map(ReconcileStatus::is_ready)
            .unwrap_or(false)
    }
}
