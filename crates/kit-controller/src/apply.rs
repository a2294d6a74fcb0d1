//! 幂等资源应用原语
//!
//! `ensure_create` 与 `ensure_patch` 可以用同一个期望对象调用任意多次，
//! 最终收敛到相同的状态。原语内部只做一次尝试，不包含重试循环；
//! 瞬时错误直接返回给上层，由协调循环按退避策略重新调度。

use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use kit_common::{Error, Result};

use crate::store::{api_resource, ObjectKey, ObjectStore};

/// 创建对象；存储返回"已存在"时视为成功
pub async fn ensure_create<K>(store: &dyn ObjectStore, desired: &K) -> Result<()>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let resource = api_resource::<K>();
    let key = ObjectKey::of(desired);
    match store.create(&resource, serde_json::to_value(desired)?).await {
        Ok(_) => {
            info!("已创建 {} {}", resource.kind, key);
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            debug!("{} {} 已存在", resource.kind, key);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// 读取现有对象并合并更新；对象不存在时创建
///
/// 现有对象先解码为类型 K，只比较 K 能表达的字段。
/// 差异为空时不发起任何写操作。
pub async fn ensure_patch<K>(store: &dyn ObjectStore, desired: &K) -> Result<()>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let resource = api_resource::<K>();
    let key = ObjectKey::of(desired);
    let desired_value = serde_json::to_value(desired)?;

    let Some(live) = store.get(&resource, &key).await? else {
        return match store.create(&resource, desired_value).await {
            Ok(_) => {
                info!("已创建 {} {}", resource.kind, key);
                Ok(())
            }
            // 并发创建的情况下由下一轮协调负责合并
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        };
    };

    let current: K = serde_json::from_value(live)?;
    let patch = merge_diff(&serde_json::to_value(&current)?, &desired_value);
    if is_empty_patch(&patch) {
        debug!("{} {} 已是期望状态", resource.kind, key);
        return Ok(());
    }

    store.patch(&resource, &key, patch).await?;
    info!("已更新 {} {}", resource.kind, key);
    Ok(())
}

/// 删除对象；对象不存在时视为成功
pub async fn ensure_delete<K>(store: &dyn ObjectStore, key: &ObjectKey) -> Result<()>
where
    K: Resource<DynamicType = ()>,
{
    let resource = api_resource::<K>();
    match store.delete(&resource, key).await {
        Ok(()) => {
            info!("已删除 {} {}", resource.kind, key);
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// 为对象设置唯一的控制器 owner reference
pub fn owned_by<O, K>(owner: &O, mut object: K) -> Result<K>
where
    O: Resource<DynamicType = ()>,
    K: Resource,
{
    let reference = owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::Store(format!("{} 尚未持久化，缺少 uid", owner.name_any()))
    })?;
    object.meta_mut().owner_references = Some(vec![reference]);
    Ok(object)
}

/// 计算从 live 到 desired 的 JSON merge patch，只覆盖 desired 中出现的字段
///
/// status 由 status 子资源单独维护，这里始终跳过。
pub fn merge_diff(live: &Value, desired: &Value) -> Value {
    let mut patch = object_diff(live, desired, false);
    if let Value::Object(map) = &mut patch {
        map.remove("status");
    }
    patch
}

/// 计算完整的 JSON merge patch，old 中存在而 new 中缺失的字段置为 null
pub fn full_merge_diff(old: &Value, new: &Value) -> Value {
    object_diff(old, new, true)
}

fn object_diff(live: &Value, desired: &Value, remove_missing: bool) -> Value {
    let (Value::Object(live), Value::Object(desired)) = (live, desired) else {
        return desired.clone();
    };

    let mut patch = Map::new();
    for (key, want) in desired {
        match live.get(key) {
            Some(have) if have == want => {}
            Some(have @ Value::Object(_)) if want.is_object() => {
                let nested = object_diff(have, want, remove_missing);
                if !is_empty_patch(&nested) {
                    patch.insert(key.clone(), nested);
                }
            }
            None if want.is_null() => {}
            _ => {
                patch.insert(key.clone(), want.clone());
            }
        }
    }
    if remove_missing {
        for key in live.keys() {
            if !desired.contains_key(key) {
                patch.insert(key.clone(), Value::Null);
            }
        }
    }
    Value::Object(patch)
}

pub fn is_empty_patch(patch: &Value) -> bool {
    matches!(patch, Value::Object(map) if map.is_empty())
}

/// 按 RFC 7386 将 merge patch 应用到目标对象
pub fn merge_apply(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                merge_apply(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
