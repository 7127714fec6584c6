//! fleet-exec 命令行入口
//! 对一个目标执行一个白名单操作，并把结构化结果输出为 JSON

use fleet_exec::{
    config::AppConfig,
    models::target::{ActionRequest, Target},
    services::{JsonLinesAuditSink, StaticCredentialResolver},
    ssh::{
        ConnectionPool, ExecutorSettings, HostKeyPolicy, KnownHosts, PoolSettings, RusshConnector,
        SshExecutor,
    },
    telemetry,
    whitelist::CommandWhitelist,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("--version") => {
            println!("fleet-exec {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") | None => {
            print_help();
            return Ok(());
        }
        _ => {}
    }

    if args.len() < 3 {
        eprintln!("缺少参数");
        print_help();
        std::process::exit(2);
    }

    let address = args[1].clone();
    let action = args[2].clone();
    let mut request = ActionRequest::new(Target::new(address.clone(), address), action, initiator());
    for pair in &args[3..] {
        match pair.split_once('=') {
            Some((name, value)) => request = request.with_param(name, value),
            None => {
                eprintln!("参数格式应为 key=value: {}", pair);
                std::process::exit(2);
            }
        }
    }

    // 加载 .env 文件（开发环境）
    if let Ok(env) = std::env::var("FLEET_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::dotenv().ok();
    }

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志
    telemetry::init_telemetry(&config.logging)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "fleet-exec starting");

    // 3. 主机密钥策略
    let known_hosts = match &config.ssh.known_hosts_file {
        Some(path) => KnownHosts::load(path).await,
        None => KnownHosts::new(),
    };
    let policy = HostKeyPolicy::new(config.ssh.host_key_policy(), known_hosts);

    // 4. 连接池、白名单、审计
    let pool = ConnectionPool::new(
        PoolSettings::from_settings(&config.ssh),
        Arc::new(RusshConnector::new(policy)),
        Arc::new(StaticCredentialResolver::from_settings(&config.ssh)),
    );
    let reaper = pool.spawn_reaper(config.ssh.reaper_interval());

    let whitelist = Arc::new(CommandWhitelist::builtin()?);
    let audit = Arc::new(JsonLinesAuditSink::open(&config.audit.path).await?);

    let executor = SshExecutor::new(
        pool.clone(),
        whitelist,
        audit,
        ExecutorSettings::from_settings(&config.ssh),
    );

    // 5. Ctrl+C 取消正在执行的命令
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl+C received, cancelling execution");
                cancel.cancel();
            }
        });
    }

    let outcome = executor.execute(request, &cancel).await;

    // 6. 关闭
    pool.shutdown().await;
    let _ = reaper.await;

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            std::process::exit(result.exit_code.clamp(0, 255));
        }
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::json!({
                    "code": e.code(),
                    "message": e.user_message(),
                })
            );
            tracing::error!(code = e.code(), error = %e, "Execution failed");
            std::process::exit(1);
        }
    }
}

/// 审计记录中的发起者
fn initiator() -> String {
    std::env::var("USER").unwrap_or_else(|_| "cli".to_string())
}

/// 打印帮助信息
fn print_help() {
    println!("fleet-exec {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: fleet-exec <目标地址> <操作> [key=value ...]");
    println!();
    println!("示例:");
    println!("  fleet-exec nas.lan restart_service service_name=nginx");
    println!("  fleet-exec pi.lan docker_logs container=homeassistant lines=100");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 FLEET_ 前缀的环境变量完成，例如 FLEET_SSH__PRIVATE_KEY_PATH");
}
