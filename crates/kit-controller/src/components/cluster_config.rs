//! Substrate 集群引导制品
//!
//! 在本地暂存目录生成证书、kubeconfig、静态 Pod 清单和 kubelet 服务配置，
//! 再整体上传到以 Substrate 身份命名的桶中。暂存目录与桶同名，
//! 重复协调时沿用已有的证书。

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use kit_common::models::naming;
use kit_common::{OperatorConfig, Result, Substrate};

use super::{namespace_of, SubstrateDeps};
use crate::artifacts::{empty_bucket, upload_with_iterator, DirectoryIterator};
use crate::bootstrap::{write_node_bundle, ArtifactWriter, ClusterConfig};
use crate::cloud::{BucketStore, IdentityProvider};
use crate::readiness::require;
use crate::subcontroller::SubController;

pub struct ClusterConfigStage {
    buckets: Arc<dyn BucketStore>,
    identity: Arc<dyn IdentityProvider>,
    writer: Arc<dyn ArtifactWriter>,
    config: Arc<OperatorConfig>,
}

impl ClusterConfigStage {
    pub fn new(deps: &SubstrateDeps) -> Self {
        Self {
            buckets: deps.buckets.clone(),
            identity: deps.identity.clone(),
            writer: deps.writer.clone(),
            config: deps.config.clone(),
        }
    }

    fn bucket_for(&self, parent: &Substrate) -> Result<String> {
        naming::bucket_name(&namespace_of(parent)?, &parent.name_any())
    }

    fn staging_dir(&self, bucket: &str) -> PathBuf {
        self.config.paths.staging_root.join(bucket)
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        match self.buckets.create_bucket(bucket).await {
            Err(e) if e.is_already_exists() => {
                debug!("桶 {} 已存在", bucket);
                Ok(())
            }
            other => other,
        }
    }
}

#[async_trait]
impl SubController<Substrate> for ClusterConfigStage {
    fn name(&self) -> &'static str {
        "cluster-config"
    }

    async fn reconcile(&self, parent: &mut Substrate) -> Result<()> {
        require(parent.address(), format!("Substrate {} 的地址", parent.name_any()))?;
        let bucket = self.bucket_for(parent)?;
        self.ensure_bucket(&bucket).await?;

        let account_id = self.identity.account_id().await?;
        let config = ClusterConfig::for_substrate(parent, &self.config.images)?;
        let root = self.staging_dir(&bucket);
        let writer = self.writer.clone();
        let (admin, mut iterator) = crate::blocking(move || {
            let admin = write_node_bundle(writer.as_ref(), &config, &account_id, &root)?;
            Ok((admin, DirectoryIterator::new(root)?))
        })
        .await?;
        let uploaded = upload_with_iterator(self.buckets.as_ref(), &bucket, &mut iterator).await?;
        info!("Substrate {} 的引导制品已同步，共 {} 个文件", parent.name_any(), uploaded);

        let cluster = parent.cluster_status_mut();
        cluster.kube_config = Some(admin.to_string_lossy().into_owned());
        cluster.bucket = Some(bucket);
        Ok(())
    }

    async fn finalize(&self, parent: &mut Substrate) -> Result<()> {
        let bucket = self.bucket_for(parent)?;
        empty_bucket(self.buckets.as_ref(), &bucket).await?;
        match self.buckets.delete_bucket(&bucket).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        match tokio::fs::remove_dir_all(self.staging_dir(&bucket)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        info!("已清理 Substrate {} 的引导制品", parent.name_any());
        Ok(())
    }
}
