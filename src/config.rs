//! 配置系统
//! 从环境变量加载所有配置，使用 Secret 包装敏感信息

use config::{Config, ConfigError, Environment};
use secrecy::Secret;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::ssh::HostKeyVerification;

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty, compact
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshSettings {
    /// 默认私钥文件路径
    pub private_key_path: String,
    /// 私钥密码（可选，使用 Secret 包装）
    #[serde(default)]
    pub private_key_passphrase: Option<Secret<String>>,
    /// 按密钥引用覆盖的私钥路径
    #[serde(default)]
    pub identities: HashMap<String, String>,
    /// 默认 SSH 用户名
    pub default_username: String,
    /// 默认端口
    pub port: u16,
    /// 连接池条目存活时间（秒）
    pub pool_ttl_secs: u64,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 拨号阶段的额外重试次数（与命令执行重试互不相关）
    pub connect_retries: u32,
    /// 拨号重试间隔（毫秒）
    pub connect_retry_backoff_ms: u64,
    /// 命令执行默认超时（秒）
    pub command_timeout_secs: u64,
    /// stdout/stderr 各自的截断上限（字节）
    pub output_limit_bytes: usize,
    /// 过期连接清理间隔（秒）
    pub reaper_interval_secs: u64,
    /// 主机密钥验证策略（strict/accept/disabled）
    pub host_key_verification: String,
    /// known_hosts 文件路径（可选）
    #[serde(default)]
    pub known_hosts_file: Option<String>,
}

impl SshSettings {
    pub fn pool_ttl(&self) -> Duration {
        Duration::from_secs(self.pool_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_retry_backoff_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    /// 解析主机密钥验证策略，未知值在 validate 阶段已被拒绝
    pub fn host_key_policy(&self) -> HostKeyVerification {
        self.host_key_verification.parse().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// JSON Lines 审计文件路径
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub ssh: SshSettings,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
}

/// 默认私钥位置：$HOME/.ssh/id_ed25519
fn default_private_key_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    format!("{}/.ssh/id_ed25519", home.trim_end_matches('/'))
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Config::builder();

        // 添加默认配置
        settings = settings
            .set_default("ssh.private_key_path", default_private_key_path())?
            .set_default("ssh.default_username", "root")?
            .set_default("ssh.port", 22)?
            .set_default("ssh.pool_ttl_secs", 300)?
            .set_default("ssh.connect_timeout_secs", 10)?
            .set_default("ssh.connect_retries", 0)?
            .set_default("ssh.connect_retry_backoff_ms", 2000)?
            .set_default("ssh.command_timeout_secs", 30)?
            .set_default("ssh.output_limit_bytes", 10 * 1024)?
            .set_default("ssh.reaper_interval_secs", 60)?
            .set_default("ssh.host_key_verification", "accept")?
            .set_default("audit.path", "audit.jsonl")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?;

        // 从环境变量加载配置（前缀为 FLEET_）
        settings = settings.add_source(
            Environment::with_prefix("FLEET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 验证日志级别
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        // 验证日志格式
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty, compact",
                    self.logging.format
                )))
            }
        }

        // 验证主机密钥策略
        if let Err(e) = self.ssh.host_key_verification.parse::<HostKeyVerification>() {
            return Err(ConfigError::Message(e));
        }

        if self.ssh.pool_ttl_secs == 0 {
            return Err(ConfigError::Message("ssh.pool_ttl_secs must be > 0".to_string()));
        }

        if self.ssh.connect_timeout_secs == 0 || self.ssh.command_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "ssh.connect_timeout_secs and ssh.command_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.ssh.output_limit_bytes < 256 {
            return Err(ConfigError::Message(
                "ssh.output_limit_bytes must be at least 256".to_string(),
            ));
        }

        if self.ssh.default_username.trim().is_empty() {
            return Err(ConfigError::Message("ssh.default_username must not be empty".to_string()));
        }

        Ok(())
    }
}
