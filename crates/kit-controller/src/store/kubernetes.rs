//! 基于 kube 客户端的对象存储实现

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::debug;

use kit_common::{Error, Result};

use super::{ObjectKey, ObjectStore};

/// 直接访问 API Server 的对象存储
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

fn describe(resource: &ApiResource, key: &ObjectKey) -> String {
    format!("{} {}", resource.kind, key)
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<Value>> {
        let api = self.api(resource, key.namespace.as_deref());
        match api.get_opt(&key.name).await {
            Ok(Some(object)) => Ok(Some(serde_json::to_value(object)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::from_kube(e, describe(resource, key))),
        }
    }

    async fn create(&self, resource: &ApiResource, object: Value) -> Result<Value> {
        let key = ObjectKey::from_value(&object)?;
        let object: DynamicObject = serde_json::from_value(object)?;
        let api = self.api(resource, key.namespace.as_deref());
        debug!("创建 {}", describe(resource, &key));
        let created = api
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| Error::from_kube(e, describe(resource, &key)))?;
        Ok(serde_json::to_value(created)?)
    }

    async fn patch(&self, resource: &ApiResource, key: &ObjectKey, patch: Value) -> Result<Value> {
        let api = self.api(resource, key.namespace.as_deref());
        debug!("更新 {}", describe(resource, key));
        let patched = api
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, describe(resource, key)))?;
        Ok(serde_json::to_value(patched)?)
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: Value,
    ) -> Result<Value> {
        let api = self.api(resource, key.namespace.as_deref());
        let patched = api
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, describe(resource, key)))?;
        Ok(serde_json::to_value(patched)?)
    }

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<()> {
        let api = self.api(resource, key.namespace.as_deref());
        debug!("删除 {}", describe(resource, key));
        api.delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| Error::from_kube(e, describe(resource, key)))?;
        Ok(())
    }
}
