//! 基于本地文件系统的云服务实现
//!
//! 桶是根目录下的子目录，对象键是桶内的相对路径。
//! 账号 ID 与地址分配来自 Operator 配置，适用于单节点部署和开发环境。

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};
use walkdir::WalkDir;

use kit_common::config::CloudConfig;
use kit_common::{Error, Result};

use super::{AddressProvider, BucketStore, IdentityProvider, MAX_BATCH_DELETE};
use crate::artifacts::relative_key;
use crate::store::ObjectKey;

/// 本地云服务
#[derive(Debug, Clone)]
pub struct LocalCloud {
    root: PathBuf,
    account_id: String,
    addresses: BTreeMap<String, String>,
}

impl LocalCloud {
    pub fn new(config: &CloudConfig) -> Self {
        Self {
            root: config.bucket_root.clone(),
            account_id: config.account_id.clone(),
            addresses: config.addresses.clone(),
        }
    }

    fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::Cloud(format!("非法的对象键: {key}")));
        }
        Ok(self.bucket_path(bucket).join(relative))
    }

    async fn require_bucket(&self, bucket: &str) -> Result<PathBuf> {
        let path = self.bucket_path(bucket);
        if !fs::try_exists(&path).await? {
            return Err(Error::NotFound(format!("桶 {bucket}")));
        }
        Ok(path)
    }
}

#[async_trait]
impl BucketStore for LocalCloud {
    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let path = self.bucket_path(bucket);
        if fs::try_exists(&path).await? {
            return Err(Error::AlreadyExists(format!("桶 {bucket}")));
        }
        fs::create_dir_all(&path).await?;
        info!("已创建桶 {}", bucket);
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let path = self.require_bucket(bucket).await?;
        match fs::remove_dir(&path).await {
            Ok(()) => {
                info!("已删除桶 {}", bucket);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("桶 {bucket}")))
            }
            Err(e) => Err(Error::Cloud(format!("删除桶 {bucket} 失败，桶可能非空: {e}"))),
        }
    }

    async fn list_objects(&self, bucket: &str) -> Result<Vec<String>> {
        let path = self.require_bucket(bucket).await?;
        let bucket = bucket.to_string();
        crate::blocking(move || {
            let mut keys = Vec::new();
            for entry in WalkDir::new(&path).sort_by_file_name() {
                let entry =
                    entry.map_err(|e| Error::Cloud(format!("遍历桶 {bucket} 失败: {e}")))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                keys.push(relative_key(&path, entry.path())?);
            }
            Ok(keys)
        })
        .await
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        if keys.len() > MAX_BATCH_DELETE {
            return Err(Error::Cloud(format!(
                "单次最多删除 {MAX_BATCH_DELETE} 个对象，收到 {}",
                keys.len()
            )));
        }
        let root = self.require_bucket(bucket).await?;
        for key in keys {
            let path = self.object_path(bucket, key)?;
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            prune_empty_parents(&root, &path).await;
        }
        debug!("已从桶 {} 删除 {} 个对象", bucket, keys.len());
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.require_bucket(bucket).await?;
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, body).await?;
        debug!("已上传 {}/{}", bucket, key);
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for LocalCloud {
    async fn account_id(&self) -> Result<String> {
        Ok(self.account_id.clone())
    }
}

#[async_trait]
impl AddressProvider for LocalCloud {
    async fn ensure_address(&self, owner: &ObjectKey) -> Result<Option<String>> {
        Ok(self.addresses.get(&owner.to_string()).cloned())
    }

    async fn release_address(&self, owner: &ObjectKey) -> Result<()> {
        // 静态分配的地址由配置管理，无需释放
        debug!("释放 {} 的地址", owner);
        Ok(())
    }
}

async fn prune_empty_parents(root: &Path, path: &Path) {
    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == root || fs::remove_dir(current).await.is_err() {
            break;
        }
        dir = current.parent();
    }
}
