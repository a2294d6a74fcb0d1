//! 内存对象存储
//!
//! 行为与 API Server 的对象语义保持一致：resourceVersion 与 uid 由存储分配，
//! 更新使用 JSON merge patch 并按 resourceVersion 做乐观并发校验，
//! 带 finalizer 的对象删除时只设置 deletionTimestamp，finalizer 清空后才真正移除，
//! 移除时按 owner reference 级联删除从属对象。单节点运行与测试都使用该实现。

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use kube::core::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use kit_common::{Error, Result};

use super::{api_resource, ObjectKey, ObjectStore};
use crate::apply::merge_apply;

/// 记录的写操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Create { kind: String, key: ObjectKey },
    Patch { kind: String, key: ObjectKey },
    PatchStatus { kind: String, key: ObjectKey },
    Delete { kind: String, key: ObjectKey },
}

impl StoreCall {
    pub fn kind(&self) -> &str {
        match self {
            StoreCall::Create { kind, .. }
            | StoreCall::Patch { kind, .. }
            | StoreCall::PatchStatus { kind, .. }
            | StoreCall::Delete { kind, .. } => kind,
        }
    }
}

/// (apiVersion, kind)
type TypeKey = (String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<TypeKey, BTreeMap<ObjectKey, Value>>,
    revision: u64,
    calls: Vec<StoreCall>,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn bucket(&mut self, resource: &ApiResource) -> &mut BTreeMap<ObjectKey, Value> {
        self.objects.entry(type_key(resource)).or_default()
    }

    /// 处理删除请求：有 finalizer 时只打删除标记，否则移除并级联
    fn delete_object(&mut self, type_key: &TypeKey, key: &ObjectKey) {
        let Some(object) = self.objects.get(type_key).and_then(|b| b.get(key)) else {
            return;
        };
        if has_finalizers(object) {
            if object.pointer("/metadata/deletionTimestamp").is_none() {
                let revision = self.next_revision();
                if let Some(object) = self.objects.get_mut(type_key).and_then(|b| b.get_mut(key)) {
                    object["metadata"]["deletionTimestamp"] = Value::String(now());
                    object["metadata"]["resourceVersion"] = Value::String(revision);
                }
            }
            return;
        }
        self.remove_object(type_key, key);
    }

    fn remove_object(&mut self, type_key: &TypeKey, key: &ObjectKey) {
        let Some(removed) = self.objects.get_mut(type_key).and_then(|b| b.remove(key)) else {
            return;
        };
        debug!("移除对象 {} {}", type_key.1, key);
        let Some(uid) = removed.pointer("/metadata/uid").and_then(Value::as_str) else {
            return;
        };

        let dependents: Vec<(TypeKey, ObjectKey)> = self
            .objects
            .iter()
            .flat_map(|(tk, bucket)| {
                bucket
                    .iter()
                    .filter(move |(_, object)| is_owned_by(object, uid))
                    .map(move |(k, _)| (tk.clone(), k.clone()))
            })
            .collect();
        for (tk, k) in dependents {
            self.delete_object(&tk, &k);
        }
    }
}

/// 内存中的声明式对象存储
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 直接写入对象，不记录调用；返回带有存储分配字段的对象
    pub fn insert<K>(&self, object: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let resource = api_resource::<K>();
        let mut value = serde_json::to_value(object)?;
        let key = ObjectKey::from_value(&value)?;
        let mut state = self.state();
        let revision = state.next_revision();
        stamp_new(&resource, &mut value, &revision);
        state.bucket(&resource).insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    /// 模拟外部控制器更新 status，例如负载均衡器分配主机名
    pub fn set_status<K>(&self, key: &ObjectKey, status: Value) -> Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        let resource = api_resource::<K>();
        let mut state = self.state();
        let revision = state.next_revision();
        let object = state
            .bucket(&resource)
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        object["status"] = status;
        object["metadata"]["resourceVersion"] = Value::String(revision);
        Ok(())
    }

    pub fn get_typed<K>(&self, key: &ObjectKey) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let resource = api_resource::<K>();
        self.state()
            .objects
            .get(&type_key(&resource))
            .and_then(|bucket| bucket.get(key))
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn list<K>(&self) -> Vec<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let resource = api_resource::<K>();
        self.state()
            .objects
            .get(&type_key(&resource))
            .map(|bucket| {
                bucket
                    .values()
                    .filter_map(|value| serde_json::from_value(value.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count<K>(&self) -> usize
    where
        K: Resource<DynamicType = ()>,
    {
        let resource = api_resource::<K>();
        self.state()
            .objects
            .get(&type_key(&resource))
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// 所有对象的总数
    pub fn len(&self) -> usize {
        self.state().objects.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// 对某一资源类型发起的 create 次数（包括返回 AlreadyExists 的请求）
    pub fn creates_of(&self, kind: &str) -> usize {
        self.count_calls(kind, |c| matches!(c, StoreCall::Create { .. }))
    }

    pub fn patches_of(&self, kind: &str) -> usize {
        self.count_calls(kind, |c| matches!(c, StoreCall::Patch { .. }))
    }

    pub fn deletes_of(&self, kind: &str) -> usize {
        self.count_calls(kind, |c| matches!(c, StoreCall::Delete { .. }))
    }

    /// 所有写操作的次数，status 更新除外
    pub fn writes(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| !matches!(c, StoreCall::PatchStatus { .. }))
            .count()
    }

    fn count_calls(&self, kind: &str, pred: impl Fn(&StoreCall) -> bool) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.kind() == kind && pred(c))
            .count()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<Value>> {
        Ok(self
            .state()
            .objects
            .get(&type_key(resource))
            .and_then(|bucket| bucket.get(key))
            .cloned())
    }

    async fn create(&self, resource: &ApiResource, mut object: Value) -> Result<Value> {
        let key = ObjectKey::from_value(&object)?;
        let mut state = self.state();
        state.calls.push(StoreCall::Create {
            kind: resource.kind.clone(),
            key: key.clone(),
        });
        if state.bucket(resource).contains_key(&key) {
            return Err(Error::AlreadyExists(format!("{} {}", resource.kind, key)));
        }
        let revision = state.next_revision();
        stamp_new(resource, &mut object, &revision);
        state.bucket(resource).insert(key, object.clone());
        Ok(object)
    }

    async fn patch(&self, resource: &ApiResource, key: &ObjectKey, mut patch: Value) -> Result<Value> {
        let tk = type_key(resource);
        let mut state = self.state();
        state.calls.push(StoreCall::Patch {
            kind: resource.kind.clone(),
            key: key.clone(),
        });
        let revision = state.next_revision();
        let object = state
            .bucket(resource)
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("{} {}", resource.kind, key)))?;

        let expected = patch
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
            .and_then(|metadata| metadata.remove("resourceVersion"));
        if let Some(expected) = expected {
            if object.pointer("/metadata/resourceVersion") != Some(&expected) {
                return Err(Error::Conflict(format!(
                    "{} {} 的 resourceVersion 已过期",
                    resource.kind, key
                )));
            }
        }
        if let Some(patch) = patch.as_object_mut() {
            patch.remove("status");
        }

        let spec_before = object.get("spec").cloned();
        merge_apply(object, &patch);
        if object.get("spec").cloned() != spec_before {
            let generation = object
                .pointer("/metadata/generation")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            object["metadata"]["generation"] = Value::from(generation + 1);
        }
        object["metadata"]["resourceVersion"] = Value::String(revision);
        let result = object.clone();

        // finalizer 清空后完成删除
        if result.pointer("/metadata/deletionTimestamp").is_some() && !has_finalizers(&result) {
            state.remove_object(&tk, key);
        }
        Ok(result)
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: Value,
    ) -> Result<Value> {
        let mut state = self.state();
        state.calls.push(StoreCall::PatchStatus {
            kind: resource.kind.clone(),
            key: key.clone(),
        });
        let revision = state.next_revision();
        let object = state
            .bucket(resource)
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("{} {}", resource.kind, key)))?;
        if let Some(status) = patch.get("status") {
            merge_apply(&mut object["status"], status);
        }
        object["metadata"]["resourceVersion"] = Value::String(revision);
        Ok(object.clone())
    }

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<()> {
        let tk = type_key(resource);
        let mut state = self.state();
        state.calls.push(StoreCall::Delete {
            kind: resource.kind.clone(),
            key: key.clone(),
        });
        if !state.bucket(resource).contains_key(key) {
            return Err(Error::NotFound(format!("{} {}", resource.kind, key)));
        }
        state.delete_object(&tk, key);
        Ok(())
    }
}

fn type_key(resource: &ApiResource) -> TypeKey {
    (resource.api_version.clone(), resource.kind.clone())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn stamp_new(resource: &ApiResource, object: &mut Value, revision: &str) {
    object["apiVersion"] = Value::String(resource.api_version.clone());
    object["kind"] = Value::String(resource.kind.clone());
    let metadata = &mut object["metadata"];
    metadata["uid"] = Value::String(format!("uid-{revision}"));
    metadata["resourceVersion"] = Value::String(revision.to_string());
    metadata["generation"] = Value::from(1);
    metadata["creationTimestamp"] = Value::String(now());
    if let Some(map) = metadata.as_object_mut() {
        map.remove("deletionTimestamp");
    }
}

fn has_finalizers(object: &Value) -> bool {
    object
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map(|f| !f.is_empty())
        .unwrap_or(false)
}

fn is_owned_by(object: &Value, uid: &str) -> bool {
    object
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .any(|r| r.get("uid").and_then(Value::as_str) == Some(uid))
        })
        .unwrap_or(false)
}
