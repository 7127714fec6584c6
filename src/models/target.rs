//! 目标主机与执行请求模型

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// 主机名语法：RFC 1123 标签，以点分隔
static HOSTNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$")
        .expect("hostname regex")
});

/// 远程目标主机
///
/// 连接池以 `id` 为键，并记住连接建立时使用的 `address`；
/// 地址一旦变化，旧的池条目会被作废。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// 目标标识（通常是 agent 上报的主机 ID）
    pub id: String,
    /// 可解析的主机名
    pub address: String,
    /// 端口覆盖
    #[serde(default)]
    pub port: Option<u16>,
    /// 用户名覆盖，未设置时使用服务默认用户名
    #[serde(default)]
    pub username: Option<String>,
    /// 私钥引用，由凭据解析器解释
    #[serde(default)]
    pub key_ref: Option<String>,
}

impl Target {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port: None,
            username: None,
            key_ref: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_key_ref(mut self, key_ref: impl Into<String>) -> Self {
        self.key_ref = Some(key_ref.into());
        self
    }

    /// 校验地址语法，返回失败原因
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("target id is empty".to_string());
        }
        let address = self.address.trim();
        if address.is_empty() {
            return Err("address is empty".to_string());
        }
        if address.parse::<IpAddr>().is_ok() {
            return Err("address must be a hostname, not an IP literal".to_string());
        }
        if address.len() > 253 || !HOSTNAME_RE.is_match(address) {
            return Err("address is not a valid hostname".to_string());
        }
        if self.port == Some(0) {
            return Err("port must be non-zero".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.id, self.address)
    }
}

/// 允许的远程操作类型（封闭枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    RestartService,
    StartService,
    StopService,
    ServiceStatus,
    ServiceLogs,
    ApplyUpdates,
    ClearLogs,
    DockerStart,
    DockerStop,
    DockerRestart,
    DockerLogs,
    DiskUsage,
    Reboot,
}

impl ActionType {
    pub const ALL: [ActionType; 13] = [
        ActionType::RestartService,
        ActionType::StartService,
        ActionType::StopService,
        ActionType::ServiceStatus,
        ActionType::ServiceLogs,
        ActionType::ApplyUpdates,
        ActionType::ClearLogs,
        ActionType::DockerStart,
        ActionType::DockerStop,
        ActionType::DockerRestart,
        ActionType::DockerLogs,
        ActionType::DiskUsage,
        ActionType::Reboot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::RestartService => "restart_service",
            ActionType::StartService => "start_service",
            ActionType::StopService => "stop_service",
            ActionType::ServiceStatus => "service_status",
            ActionType::ServiceLogs => "service_logs",
            ActionType::ApplyUpdates => "apply_updates",
            ActionType::ClearLogs => "clear_logs",
            ActionType::DockerStart => "docker_start",
            ActionType::DockerStop => "docker_stop",
            ActionType::DockerRestart => "docker_restart",
            ActionType::DockerLogs => "docker_logs",
            ActionType::DiskUsage => "disk_usage",
            ActionType::Reboot => "reboot",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| format!("Unknown action type: {}", sanitize_label(s)))
    }
}

/// 把调用方提供的标签压缩成可安全写入日志的形式
pub fn sanitize_label(raw: &str) -> String {
    raw.chars()
        .take(64)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '?'
            }
        })
        .collect()
}

/// 调用方的执行意图：只有操作类型与参数，从不接受原始命令
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub target: Target,
    pub action: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// 发起者身份（写入审计记录）
    pub initiator: String,
    /// 单次请求的超时覆盖
    #[serde(default, skip_serializing)]
    pub timeout: Option<Duration>,
}

impl ActionRequest {
    pub fn new(target: Target, action: impl Into<String>, initiator: impl Into<String>) -> Self {
        Self {
            target,
            action: action.into(),
            params: HashMap::new(),
            initiator: initiator.into(),
            timeout: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
