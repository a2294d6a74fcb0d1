//! KIT 协调引擎
//!
//! 该模块实现嵌套控制平面的协调逻辑：幂等的资源应用原语、
//! 引导制品的生成与批量同步、按依赖顺序组合的组件子控制器，
//! 以及驱动期望状态对象收敛的协调循环。

pub mod apply;
pub mod artifacts;
pub mod bootstrap;
pub mod cloud;
pub mod components;
pub mod composer;
pub mod events;
pub mod readiness;
pub mod reconciler;
pub mod retry;
pub mod store;
pub mod subcontroller;

pub use composer::Composer;
pub use events::{EventRecorder, KubeRecorder, MemoryRecorder};
pub use readiness::{Outcome, ReconcileResult};
pub use reconciler::{Controller, Reconciler};
pub use retry::RetryBackoff;
pub use store::{KubeStore, MemoryStore, ObjectKey, ObjectStore};
pub use subcontroller::SubController;

/// 在阻塞线程池中执行同步任务（密钥生成、文件读写、目录遍历）
pub(crate) async fn blocking<T, F>(task: F) -> kit_common::Result<T>
where
    F: FnOnce() -> kit_common::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|e| {
        kit_common::Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("阻塞任务异常退出: {e}"),
        ))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocking_runs_off_runtime_thread() {
        let caller = std::thread::current().id();
        let worker = blocking(|| Ok(std::thread::current().id())).await.unwrap();
        assert_ne!(caller, worker);
    }

    #[tokio::test]
    async fn test_blocking_panic_becomes_error() {
        let err = blocking::<(), _>(|| panic!("boom")).await.unwrap_err();
        assert!(matches!(err, kit_common::Error::Io(_)));
    }
}
