//! 声明式对象存储
//!
//! 协调引擎通过 `ObjectStore` 访问 Kubernetes API。接口以 JSON 值为载体，
//! 保持对象安全，便于在生产环境使用 kube 客户端、在测试中使用内存实现。
//! 所有读取都直接访问权威存储，不存在进程内缓存。

mod kubernetes;
mod memory;

pub use kubernetes::KubeStore;
pub use memory::{MemoryStore, StoreCall};

use std::fmt;

use kube::core::ApiResource;
use kube::{Resource, ResourceExt};
use async_trait::async_trait;
use serde_json::Value;

use kit_common::{Error, Result};

/// 对象定位键
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// 从已有对象的元数据构造
    pub fn of<K: Resource>(object: &K) -> Self {
        Self {
            namespace: object.namespace(),
            name: object.name_any(),
        }
    }

    /// 从 JSON 对象的 metadata 中解析
    pub fn from_value(value: &Value) -> Result<Self> {
        let metadata = value
            .get("metadata")
            .ok_or_else(|| Error::Store("对象缺少 metadata".to_string()))?;
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Store("对象缺少 metadata.name".to_string()))?;
        Ok(Self {
            namespace: metadata
                .get("namespace")
                .and_then(Value::as_str)
                .map(str::to_string),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// 声明式对象存储接口
///
/// `NotFound` 与 `AlreadyExists` 是正常结果：`get` 以 `None` 表示不存在，
/// `create` 与 `delete` 分别返回 `Error::AlreadyExists` / `Error::NotFound`，
/// 由调用方决定是否吸收。
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<Value>>;

    async fn create(&self, resource: &ApiResource, object: Value) -> Result<Value>;

    /// 应用 JSON merge patch；patch 中携带 metadata.resourceVersion 时按乐观并发校验
    async fn patch(&self, resource: &ApiResource, key: &ObjectKey, patch: Value) -> Result<Value>;

    /// 对 status 子资源应用 JSON merge patch
    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: Value,
    ) -> Result<Value>;

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<()>;
}

/// 获取类型 K 对应的 ApiResource
pub fn api_resource<K: Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

/// 读取并解码为类型 K
pub async fn get_typed<K>(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + serde::de::DeserializeOwned,
{
    match store.get(&api_resource::<K>(), key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}
