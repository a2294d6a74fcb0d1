//! kit-operator 命令行入口

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kit_common::OperatorConfig;
use kit_operator::{crd, KitOperator};

#[derive(Parser, Debug)]
#[command(name = "kit-operator", version, about = "嵌套 Kubernetes 控制平面 Operator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 运行 Operator
    Run {
        /// 配置文件路径（YAML 或 JSON）
        #[arg(long)]
        config: Option<PathBuf>,

        /// 以 JSON 格式输出日志
        #[arg(long)]
        json_logs: bool,
    },
    /// 输出 CRD 定义
    Crd,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Crd => {
            print!("{}", crd::render().context("生成 CRD 失败")?);
            Ok(())
        }
        Command::Run { config, json_logs } => {
            init_tracing(json_logs);
            let config = OperatorConfig::load(config.as_deref()).context("加载配置失败")?;
            let client = Client::try_default()
                .await
                .context("创建 Kubernetes 客户端失败")?;

            let operator = KitOperator::new(client, config)?;
            operator.start().await?;

            tokio::signal::ctrl_c().await.context("等待退出信号失败")?;
            info!("收到退出信号");
            operator.stop().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses_run_flags() {
        Cli::command().debug_assert();
        let cli = Cli::parse_from(["kit-operator", "run", "--config", "kit.yaml", "--json-logs"]);
        match cli.command {
            Command::Run { config, json_logs } => {
                assert_eq!(config, Some(PathBuf::from("kit.yaml")));
                assert!(json_logs);
            }
            Command::Crd => panic!("应解析为 run"),
        }
    }
}
