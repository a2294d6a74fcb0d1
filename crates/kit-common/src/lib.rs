//! KIT Common - 跨模块共享工具与数据结构
//!
//! 该模块提供 KIT 项目中所有组件共享的数据结构、错误处理和配置。
//! 包括 ControlPlane、Substrate 等自定义资源、协调状态以及统一的错误类型。

pub mod config;
pub mod error;
pub mod models;

/// 重新导出常用类型，方便使用
pub use config::OperatorConfig;
pub use error::Error;
pub use error::Result;
pub use models::condition::*;
pub use models::controlplane::*;
pub use models::desired_state::DesiredState;
pub use models::security_group::*;
pub use models::substrate::*;
