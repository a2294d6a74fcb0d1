//! 子控制器
//!
//! 子控制器负责期望状态对象的一个逻辑组件。它本身无状态，只持有所需的
//! 客户端；所有状态都保存在期望状态对象与托管资源中。

use async_trait::async_trait;

use kit_common::Result;

/// 子控制器能力
///
/// `reconcile` 必须幂等，不能假设任何一次调用是第一次；
/// `finalize` 在组件从未创建时也必须成功，返回前需释放其拥有的外部资源。
#[async_trait]
pub trait SubController<P: Send + Sync>: Send + Sync {
    /// 阶段名称，用于日志与错误上下文
    fn name(&self) -> &'static str;

    async fn reconcile(&self, parent: &mut P) -> Result<()>;

    async fn finalize(&self, parent: &mut P) -> Result<()>;
}
