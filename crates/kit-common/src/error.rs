//! 错误处理模块
//!
//! 该模块提供 KIT 项目的统一错误类型。协调过程中出现的错误被划分为
//! 几类：前置条件未满足（NotReady）、已存在/不存在（由幂等原语吸收）、
//! 瞬时基础设施错误（退避重试）以及永久性配置错误。

use std::io;
use thiserror::Error;

/// KIT 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 对象不存在
    #[error("对象不存在: {0}")]
    NotFound(String),

    /// 对象已存在
    #[error("对象已存在: {0}")]
    AlreadyExists(String),

    /// 乐观并发冲突，resourceVersion 已过期
    #[error("对象版本冲突: {0}")]
    Conflict(String),

    /// 依赖的子资源尚未就绪，需要稍后重试
    #[error("等待子资源就绪: {0}")]
    NotReady(String),

    /// 期望状态对象本身不合法
    #[error("无效的资源定义: {0}")]
    InvalidSpec(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 声明式对象存储错误
    #[error("对象存储错误: {0}")]
    Store(String),

    /// Kubernetes API 错误
    #[error("Kubernetes API 错误: {0}")]
    Kube(#[from] kube::Error),

    /// 云服务错误
    #[error("云服务错误: {0}")]
    Cloud(String),

    /// 引导制品生成错误
    #[error("制品生成错误: {0}")]
    Generate(String),

    /// 单次协调超时
    #[error("协调超时: {0}")]
    Timeout(String),

    /// 子控制器执行失败，携带阶段名称
    #[error("{stage} 阶段失败: {source}")]
    Stage {
        /// 子控制器名称
        stage: &'static str,
        /// 原始错误
        #[source]
        source: Box<Error>,
    },

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// KIT 结果类型别名
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// 为错误附加子控制器阶段名称
    pub fn in_stage(self, stage: &'static str) -> Self {
        Error::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// 去掉阶段包装后的根错误
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), Error::AlreadyExists(_))
    }

    /// 前置条件未满足，不视为失败
    pub fn is_not_ready(&self) -> bool {
        matches!(self.root(), Error::NotReady(_))
    }

    /// 是否值得按指数退避重试
    ///
    /// 永久性错误同样会被重试，只是直接使用最大退避间隔，
    /// 等待运维人员修正期望状态。
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::InvalidSpec(_) | Error::Config(_) => false,
            Error::Json(_) | Error::Yaml(_) => false,
            Error::Kube(kube::Error::Api(response)) => {
                let code = response.code;
                !(400..500).contains(&code) || code == 409 || code == 429
            }
            _ => true,
        }
    }

    /// 将 kube 客户端错误按照 HTTP 状态码归类
    pub fn from_kube(err: kube::Error, what: impl Into<String>) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 404 => Error::NotFound(what.into()),
            kube::Error::Api(response) if response.code == 409 => {
                if response.reason == "AlreadyExists" {
                    Error::AlreadyExists(what.into())
                } else {
                    Error::Conflict(format!("{}: {}", what.into(), response.message))
                }
            }
            _ => Error::Kube(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_stage_wrapping_preserves_classification() {
        let err = Error::NotReady("endpoint".into()).in_stage("master");
        assert!(err.is_not_ready());
        assert!(err.to_string().starts_with("master 阶段失败"));

        let nested = Error::AlreadyExists("svc".into()).in_stage("etcd").in_stage("control-plane");
        assert!(nested.is_already_exists());
        assert!(!nested.is_not_found());
    }

    #[test]
    fn test_kube_error_mapping() {
        assert!(Error::from_kube(api_error(404, "NotFound"), "svc").is_not_found());
        assert!(Error::from_kube(api_error(409, "AlreadyExists"), "svc").is_already_exists());
        assert!(matches!(
            Error::from_kube(api_error(409, "Conflict"), "svc"),
            Error::Conflict(_)
        ));
        assert!(matches!(
            Error::from_kube(api_error(500, "InternalError"), "svc"),
            Error::Kube(_)
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Cloud("throttled".into()).is_retryable());
        assert!(Error::Conflict("rv".into()).is_retryable());
        assert!(!Error::InvalidSpec("bad name".into()).in_stage("master").is_retryable());
        assert!(!Error::Kube(api_error(422, "Invalid")).is_retryable());
        assert!(Error::Kube(api_error(429, "TooManyRequests")).is_retryable());
    }
}
