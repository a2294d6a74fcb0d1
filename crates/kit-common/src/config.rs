//! 配置管理模块
//!
//! Operator 在启动时加载一次配置：内置默认值 → 可选的 YAML/JSON 文件 →
//! `KIT__SECTION__KEY` 形式的环境变量。加载后的配置以 `Arc` 传入各个
//! 控制器构造函数，运行期间不会被修改。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Operator 配置结构
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorConfig {
    /// 镜像配置
    pub images: ImageConfig,
    /// 路径配置
    pub paths: PathConfig,
    /// 协调循环配置
    pub reconcile: ReconcileConfig,
    /// 云服务配置
    pub cloud: CloudConfig,
    /// 指标服务器配置
    pub metrics: MetricsConfig,
}

/// 镜像配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageConfig {
    pub repository: String,
    pub kubernetes_version: String,
    pub etcd_repository: String,
    pub etcd_version: String,
    pub pause_version: String,
    pub authenticator_image: String,
}

/// 路径配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathConfig {
    /// 生成引导制品的本地暂存根目录
    pub staging_root: PathBuf,
}

/// 协调循环配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileConfig {
    /// 单次协调的超时时间（秒）
    pub timeout_seconds: u64,
    /// 依赖未就绪时的重新入队间隔（秒）
    pub not_ready_requeue_seconds: u64,
    /// 错误退避配置
    pub backoff: BackoffConfig,
}

/// 指数退避配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    pub initial_seconds: f64,
    pub max_seconds: f64,
    pub multiplier: f64,
    /// 抖动比例，取值 0.0 到 1.0
    pub jitter: f64,
}

/// 云服务配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudConfig {
    pub region: String,
    pub account_id: String,
    /// 本地桶存储根目录
    pub bucket_root: PathBuf,
    /// 预先分配给 Substrate 的地址，键为 `<namespace>/<name>`
    #[serde(default)]
    pub addresses: BTreeMap<String, String>,
}

/// 指标服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub listen_address: String,
    pub port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            images: ImageConfig {
                repository: "public.ecr.aws/eks-distro/kubernetes".to_string(),
                kubernetes_version: "v1.21.2-eks-1-21-4".to_string(),
                etcd_repository: "public.ecr.aws/eks-distro/etcd-io".to_string(),
                etcd_version: "v3.4.16-eks-1-21-7".to_string(),
                pause_version: "v1.21.2-eks-1-21-4".to_string(),
                authenticator_image: "public.ecr.aws/eks-distro/kubernetes-sigs/aws-iam-authenticator:v0.5.3-eks-1-21-4".to_string(),
            },
            paths: PathConfig {
                staging_root: PathBuf::from("/tmp"),
            },
            reconcile: ReconcileConfig {
                timeout_seconds: 120,
                not_ready_requeue_seconds: 5,
                backoff: BackoffConfig::default(),
            },
            cloud: CloudConfig {
                region: "us-west-2".to_string(),
                account_id: "000000000000".to_string(),
                bucket_root: PathBuf::from("/var/lib/kit/buckets"),
                addresses: BTreeMap::new(),
            },
            metrics: MetricsConfig {
                listen_address: "0.0.0.0".to_string(),
                port: 8080,
            },
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_seconds: 1.0,
            max_seconds: 300.0,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl ImageConfig {
    pub fn kubernetes_image(&self, component: &str, version: Option<&str>) -> String {
        format!(
            "{}/{}:{}",
            self.repository,
            component,
            version.unwrap_or(&self.kubernetes_version)
        )
    }

    pub fn etcd_image(&self) -> String {
        format!("{}/etcd:{}", self.etcd_repository, self.etcd_version)
    }

    pub fn pause_image(&self) -> String {
        format!("{}/pause:{}", self.repository, self.pause_version)
    }
}

impl ReconcileConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn not_ready_requeue(&self) -> Duration {
        Duration::from_secs(self.not_ready_requeue_seconds)
    }
}

/// 退避上限允许的最大值（一天）
pub const MAX_BACKOFF_SECONDS: f64 = 86_400.0;

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::from_secs_f64(MAX_BACKOFF_SECONDS))
}

impl BackoffConfig {
    /// 第 `attempt` 次失败（从 0 开始）后的等待时间，上限为 max_seconds
    pub fn delay_for_attempt(&self, attempt: u32, random: f64) -> Duration {
        let base = self.initial_seconds * self.multiplier.powi(attempt.min(64) as i32);
        let capped = base.min(self.max_seconds);
        let jitter_range = capped * self.jitter;
        let jittered = capped + (random * 2.0 - 1.0) * jitter_range;
        seconds(jittered.clamp(0.0, self.max_seconds))
    }

    /// 退避延迟上限
    pub fn max_delay(&self) -> Duration {
        seconds(self.max_seconds)
    }
}

impl OperatorConfig {
    /// 加载配置：默认值、可选配置文件、环境变量依次覆盖
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&OperatorConfig::default())
            .map_err(|e| Error::Config(format!("构建默认配置失败: {e}")))?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            let format = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("json") => FileFormat::Json,
                _ => {
                    return Err(Error::Config(
                        "不支持的配置文件格式，仅支持 YAML 或 JSON".to_string(),
                    ))
                }
            };
            let file = path
                .to_str()
                .ok_or_else(|| Error::Config(format!("配置路径无效: {path:?}")))?;
            builder = builder.add_source(File::with_name(file).format(format));
        }

        let config: OperatorConfig = builder
            .add_source(Environment::with_prefix("KIT").separator("__"))
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| Error::Config(format!("配置格式错误: {e}")))?;

        config.validate()?;
        debug!(?config, "配置加载完成");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let backoff = &self.reconcile.backoff;
        let values = [
            backoff.initial_seconds,
            backoff.max_seconds,
            backoff.multiplier,
            backoff.jitter,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::Config("backoff 配置必须是有限数值".to_string()));
        }
        if backoff.max_seconds > MAX_BACKOFF_SECONDS {
            return Err(Error::Config(format!(
                "backoff.max_seconds 不能超过 {MAX_BACKOFF_SECONDS}"
            )));
        }
        if backoff.initial_seconds <= 0.0 || backoff.max_seconds < backoff.initial_seconds {
            return Err(Error::Config(
                "backoff.max_seconds 必须不小于 backoff.initial_seconds".to_string(),
            ));
        }
        if backoff.multiplier < 1.0 {
            return Err(Error::Config("backoff.multiplier 必须不小于 1".to_string()));
        }
        if !(0.0..=1.0).contains(&backoff.jitter) {
            return Err(Error::Config("backoff.jitter 必须在 0 到 1 之间".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = OperatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.images.etcd_image(),
            "public.ecr.aws/eks-distro/etcd-io/etcd:v3.4.16-eks-1-21-7"
        );
        assert_eq!(
            config.images.kubernetes_image("kube-proxy", None),
            "public.ecr.aws/eks-distro/kubernetes/kube-proxy:v1.21.2-eks-1-21-4"
        );
    }

    #[test]
    fn test_load_yaml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "reconcile:\n  timeout_seconds: 60\ncloud:\n  account_id: \"123456789012\"\n  addresses:\n    default/sub: 10.0.0.1"
        )
        .unwrap();

        let config = OperatorConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.reconcile.timeout_seconds, 60);
        assert_eq!(config.reconcile.not_ready_requeue_seconds, 5);
        assert_eq!(config.cloud.account_id, "123456789012");
        assert_eq!(config.cloud.addresses.get("default/sub").map(String::as_str), Some("10.0.0.1"));
    }

    #[test]
    fn test_rejects_unknown_format() {
        let err = OperatorConfig::load(Some(Path::new("/etc/kit/config.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let backoff = BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        };
        assert_eq!(backoff.delay_for_attempt(0, 0.5), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(3, 0.5), Duration::from_secs(8));
        assert_eq!(backoff.delay_for_attempt(40, 0.5), Duration::from_secs(300));
    }

    #[test]
    fn test_oversized_backoff_is_clamped() {
        let backoff = BackoffConfig {
            max_seconds: 1e20,
            jitter: 0.0,
            ..BackoffConfig::default()
        };
        assert_eq!(backoff.max_delay(), Duration::from_secs(86_400));
        assert_eq!(backoff.delay_for_attempt(64, 0.5), Duration::from_secs(86_400));
    }

    #[rstest]
    #[case::max_below_initial(10.0, 5.0, 2.0, 0.1)]
    #[case::shrinking_multiplier(1.0, 300.0, 0.5, 0.1)]
    #[case::jitter_out_of_range(1.0, 300.0, 2.0, 1.5)]
    #[case::infinite_max(1.0, f64::INFINITY, 2.0, 0.1)]
    #[case::huge_max(1.0, 1e20, 2.0, 0.1)]
    #[case::nan_multiplier(1.0, 300.0, f64::NAN, 0.1)]
    fn test_invalid_backoff_rejected(
        #[case] initial_seconds: f64,
        #[case] max_seconds: f64,
        #[case] multiplier: f64,
        #[case] jitter: f64,
    ) {
        let mut config = OperatorConfig::default();
        config.reconcile.backoff = BackoffConfig {
            initial_seconds,
            max_seconds,
            multiplier,
            jitter,
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
