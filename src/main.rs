//! tokenizer-deploy - Tokenizer API 部署工具
//!
//! Usage:
//! - Deploy: `tokenizer-deploy deploy`
//! - Pre-flight checks only: `tokenizer-deploy validate`
//! - Stop and remove a deployment: `tokenizer-deploy rollback`
//! - Custom config and method: `tokenizer-deploy --config deploy.json --method systemd deploy`

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;

use xjp_tokenizer_deploy::config::env;
use xjp_tokenizer_deploy::config::env::constants::VERSION;
use xjp_tokenizer_deploy::domain::{DeployMethod, ValidationStatus};
use xjp_tokenizer_deploy::services::{
    DeploymentManager, LoggingObserver, Orchestrator, SystemValidator, ValidationCollaborator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Deploy,
    Validate,
    Rollback,
}

/// 命令行参数
#[derive(Debug)]
struct CliArgs {
    command: Command,
    config_path: Option<PathBuf>,
    method: Option<DeployMethod>,
    deployment_id: Option<String>,
    json_logs: bool,
}

/// 解析命令行参数
fn parse_args() -> anyhow::Result<CliArgs> {
    let args: Vec<String> = std::env::args().collect();
    let mut command = None;
    let mut config_path = None;
    let mut method = None;
    let mut deployment_id = None;
    let mut json_logs = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                config_path = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--method" if i + 1 < args.len() => {
                let value = &args[i + 1];
                method = Some(
                    DeployMethod::parse(value)
                        .with_context(|| format!("unknown deployment method: {}", value))?,
                );
                i += 2;
            }
            "--id" if i + 1 < args.len() => {
                deployment_id = Some(args[i + 1].clone());
                i += 2;
            }
            "--json-logs" => {
                json_logs = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("tokenizer-deploy {}", VERSION);
                std::process::exit(0);
            }
            "deploy" => {
                command = Some(Command::Deploy);
                i += 1;
            }
            "validate" => {
                command = Some(Command::Validate);
                i += 1;
            }
            "rollback" => {
                command = Some(Command::Rollback);
                i += 1;
            }
            other => bail!("unexpected argument: {}", other),
        }
    }

    let Some(command) = command else {
        print_help();
        bail!("missing command");
    };

    Ok(CliArgs {
        command,
        config_path,
        method,
        deployment_id,
        json_logs,
    })
}

fn print_help() {
    println!("tokenizer-deploy {} - Tokenizer API 部署工具", VERSION);
    println!();
    println!("USAGE:");
    println!("    tokenizer-deploy [OPTIONS] <COMMAND>");
    println!();
    println!("OPTIONS:");
    println!("    --config <FILE>      JSON configuration file");
    println!("    --method <METHOD>    docker | systemd | standalone");
    println!("    --id <ID>            Deployment id (default: generated)");
    println!("    --json-logs          Emit logs as JSON");
    println!("    -h, --help           Print help information");
    println!("    -V, --version        Print version");
    println!();
    println!("COMMANDS:");
    println!("    deploy               Run the full deployment");
    println!("    validate             Run pre-flight checks only");
    println!("    rollback             Stop the service and remove its artifacts");
    println!();
    println!("ENVIRONMENT:");
    println!("    TOKENIZER_*, SEARCH_ENGINE_*   Override configuration values");
    println!("    RUST_LOG                       Log filter (default: info)");
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: CliArgs) -> anyhow::Result<bool> {
    let config = env::load(cli.config_path.as_deref(), cli.method)
        .context("failed to load configuration")?;

    tracing::info!(
        version = VERSION,
        method = %config.method(),
        service = %config.service().name,
        "tokenizer-deploy starting"
    );

    match cli.command {
        Command::Deploy => {
            let orchestrator = Orchestrator::builder(config)
                .observer(Arc::new(LoggingObserver))
                .build();
            let result = orchestrator.deploy(cli.deployment_id).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if let Some(status) = orchestrator.get_deployment_status().await {
                tracing::debug!(status = %serde_json::to_string(&status)?, "Final deployment status");
            }
            Ok(result.success)
        }
        Command::Validate => {
            let report = SystemValidator::new()
                .run_comprehensive_validation(&config)
                .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.overall_status != ValidationStatus::Failed)
        }
        Command::Rollback => {
            let report = DeploymentManager::new(config).rollback().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.is_valid())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(cli.json_logs);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
