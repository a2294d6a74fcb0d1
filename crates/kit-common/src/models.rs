//! 数据模型模块
//!
//! 该模块定义了 KIT 使用的自定义资源（ControlPlane、Substrate、SecurityGroup）、
//! 通用的协调状态以及确定性命名规则。

pub mod condition;
pub mod controlplane;
pub mod desired_state;
pub mod naming;
pub mod security_group;
pub mod substrate;
