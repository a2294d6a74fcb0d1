//! 云服务接口
//!
//! 子控制器只通过这里的窄接口访问云资源，所有资源都以期望状态对象
//! 推导出的确定性名称寻址。`LocalCloud` 提供基于本地文件系统的实现。

mod local;

pub use local::LocalCloud;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use kit_common::Result;

use crate::store::ObjectKey;

/// 单次批量删除的最大对象数
pub const MAX_BATCH_DELETE: usize = 1000;

/// 持久化对象存储（桶）
///
/// `create_bucket` 在桶已归当前账号所有时返回 `Error::AlreadyExists`，
/// `delete_bucket` 与 `list_objects` 在桶不存在时返回 `Error::NotFound`。
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// 删除空桶
    async fn delete_bucket(&self, bucket: &str) -> Result<()>;

    async fn list_objects(&self, bucket: &str) -> Result<Vec<String>>;

    /// 批量删除，单次最多 `MAX_BATCH_DELETE` 个键
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()>;

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;
}

/// 账号身份查询
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn account_id(&self) -> Result<String>;
}

/// Substrate 对外地址分配
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AddressProvider: Send + Sync {
    /// 确保为 owner 分配稳定地址；地址仍在分配中时返回 None
    async fn ensure_address(&self, owner: &ObjectKey) -> Result<Option<String>>;

    async fn release_address(&self, owner: &ObjectKey) -> Result<()>;
}
