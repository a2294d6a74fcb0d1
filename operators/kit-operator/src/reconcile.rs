//! 资源协调模块
//!
//! 每种期望状态对象对应一个控制器，控制器把对象交给组件组合器，
//! 由组合器按依赖顺序驱动各子控制器。

use async_trait::async_trait;

use kit_common::{ControlPlane, Result, Substrate};
use kit_controller::components::{
    control_plane_composer, substrate_composer, ControlPlaneDeps, SubstrateDeps,
};
use kit_controller::{Composer, Controller, ReconcileResult};

pub const CONTROL_PLANE_FINALIZER: &str = "kit.k8s.sh/controlplane";
pub const SUBSTRATE_FINALIZER: &str = "kit.sh/substrate";

/// ControlPlane 控制器
pub struct ControlPlaneController {
    composer: Composer<ControlPlane>,
}

impl ControlPlaneController {
    pub fn new(deps: &ControlPlaneDeps) -> Self {
        Self {
            composer: control_plane_composer(deps),
        }
    }
}

#[async_trait]
impl Controller for ControlPlaneController {
    type Object = ControlPlane;

    fn name(&self) -> &'static str {
        "controlplane"
    }

    fn finalizer(&self) -> &'static str {
        CONTROL_PLANE_FINALIZER
    }

    async fn reconcile(&self, object: &mut ControlPlane) -> Result<ReconcileResult> {
        self.composer.reconcile(object).await?;
        Ok(ReconcileResult::done())
    }

    async fn finalize(&self, object: &mut ControlPlane) -> Result<ReconcileResult> {
        self.composer.finalize(object).await?;
        Ok(ReconcileResult::done())
    }
}

/// Substrate 控制器
pub struct SubstrateController {
    composer: Composer<Substrate>,
}

impl SubstrateController {
    pub fn new(deps: &SubstrateDeps) -> Self {
        Self {
            composer: substrate_composer(deps),
        }
    }
}

#[async_trait]
impl Controller for SubstrateController {
    type Object = Substrate;

    fn name(&self) -> &'static str {
        "substrate"
    }

    fn finalizer(&self) -> &'static str {
        SUBSTRATE_FINALIZER
    }

    async fn reconcile(&self, object: &mut Substrate) -> Result<ReconcileResult> {
        self.composer.reconcile(object).await?;
        Ok(ReconcileResult::done())
    }

    async fn finalize(&self, object: &mut Substrate) -> Result<ReconcileResult> {
        self.composer.finalize(object).await?;
        Ok(ReconcileResult::done())
    }
}
