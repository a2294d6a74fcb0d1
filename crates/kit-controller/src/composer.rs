//! 依赖编排
//!
//! 组合器持有一个静态声明的子控制器序列。`reconcile` 正序执行，
//! `finalize` 逆序执行，任一阶段出错立即中止并返回该错误。

use async_trait::async_trait;
use tracing::{debug, info};

use kit_common::Result;

use crate::subcontroller::SubController;

/// 按固定顺序执行的子控制器序列
pub struct Composer<P> {
    name: &'static str,
    stages: Vec<Box<dyn SubController<P>>>,
}

impl<P: Send + Sync> Composer<P> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            stages: Vec::new(),
        }
    }

    /// 追加一个阶段，依赖它的阶段必须在其后追加
    pub fn stage(mut self, stage: impl SubController<P> + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn reconcile(&self, parent: &mut P) -> Result<()> {
        for stage in &self.stages {
            debug!("{}: 协调阶段 {}", self.name, stage.name());
            stage
                .reconcile(parent)
                .await
                .map_err(|e| e.in_stage(stage.name()))?;
        }
        Ok(())
    }

    pub async fn finalize(&self, parent: &mut P) -> Result<()> {
        for stage in self.stages.iter().rev() {
            debug!("{}: 清理阶段 {}", self.name, stage.name());
            stage
                .finalize(parent)
                .await
                .map_err(|e| e.in_stage(stage.name()))?;
        }
        info!("{}: 所有阶段清理完成", self.name);
        Ok(())
    }
}

#[async_trait]
impl<P: Send + Sync> SubController<P> for Composer<P> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn reconcile(&self, parent: &mut P) -> Result<()> {
        Composer::reconcile(self, parent).await
    }

    async fn finalize(&self, parent: &mut P) -> Result<()> {
        Composer::finalize(self, parent).await
    }
}
