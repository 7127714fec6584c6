//! 统一错误模型
//! 定义白名单、连接、执行三层的错误类型

use thiserror::Error;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, ExecError>;

/// 执行请求的错误类型
///
/// 白名单层错误（前四项）与输入校验错误都发生在建立连接之前。
/// 错误信息中永远不包含构造出的命令文本。
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    #[error("Unknown action type: {action}")]
    UnknownActionType { action: String },

    #[error("Missing parameter '{parameter}' for action {action}")]
    MissingParameter { action: String, parameter: String },

    #[error("Shell metacharacter {character:?} rejected in parameter '{parameter}'")]
    ShellMetacharacterRejected { parameter: String, character: char },

    #[error("Parameter '{parameter}' failed validation: {reason}")]
    ParameterValidationFailed { parameter: String, reason: String },

    #[error("Invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("Resolved command for action {action} is empty")]
    EmptyCommand { action: String },

    #[error("SSH connection to {target} failed (action {action}, attempt {attempts}): {source}")]
    ConnectionFailed {
        target: String,
        action: String,
        attempts: u32,
        #[source]
        source: ConnectError,
    },

    #[error("Command timed out on {target} after {elapsed_ms} ms (action {action}, attempt {attempts})")]
    CommandTimeout {
        target: String,
        action: String,
        attempts: u32,
        elapsed_ms: u64,
    },

    #[error("Execution cancelled on {target} (action {action}, attempt {attempts})")]
    Cancelled {
        target: String,
        action: String,
        attempts: u32,
    },

    #[error("SSH execution on {target} failed after {attempts} attempts (action {action}): {source}")]
    ExecutionFailed {
        target: String,
        action: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
}

impl ExecError {
    /// 获取稳定的错误码
    pub fn code(&self) -> &'static str {
        match self {
            ExecError::UnknownActionType { .. } => "UNKNOWN_ACTION",
            ExecError::MissingParameter { .. } => "MISSING_PARAMETER",
            ExecError::ShellMetacharacterRejected { .. } => "SHELL_METACHARACTER",
            ExecError::ParameterValidationFailed { .. } => "PARAMETER_INVALID",
            ExecError::InvalidTarget { .. } => "INVALID_TARGET",
            ExecError::EmptyCommand { .. } => "EMPTY_COMMAND",
            ExecError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            ExecError::CommandTimeout { .. } => "COMMAND_TIMEOUT",
            ExecError::Cancelled { .. } => "CANCELLED",
            ExecError::ExecutionFailed { .. } => "EXECUTION_FAILED",
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            ExecError::UnknownActionType { action } => format!("Unknown action type: {}", action),
            ExecError::MissingParameter { parameter, .. } => {
                format!("Missing required parameter: {}", parameter)
            }
            ExecError::ShellMetacharacterRejected { parameter, .. } => {
                format!("Parameter '{}' contains a forbidden character", parameter)
            }
            ExecError::ParameterValidationFailed { parameter, .. } => {
                format!("Parameter '{}' is not valid", parameter)
            }
            ExecError::InvalidTarget { .. } => "Target address is not valid".to_string(),
            ExecError::EmptyCommand { .. } => "Command is empty".to_string(),
            ExecError::ConnectionFailed { source, .. } => match source {
                ConnectError::AuthRejected { .. } => "SSH authentication failed".to_string(),
                ConnectError::Dns { .. } => "Target hostname could not be resolved".to_string(),
                ConnectError::Timeout { .. } => "SSH connection timed out".to_string(),
                _ => "SSH connection failed".to_string(),
            },
            ExecError::CommandTimeout { elapsed_ms, .. } => {
                format!("Command timed out after {} ms", elapsed_ms)
            }
            ExecError::Cancelled { .. } => "Execution cancelled".to_string(),
            ExecError::ExecutionFailed { .. } => "SSH command execution failed".to_string(),
        }
    }

    /// 是否为连接前被拒绝的请求
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ExecError::UnknownActionType { .. }
                | ExecError::MissingParameter { .. }
                | ExecError::ShellMetacharacterRejected { .. }
                | ExecError::ParameterValidationFailed { .. }
                | ExecError::InvalidTarget { .. }
                | ExecError::EmptyCommand { .. }
        )
    }
}

/// 建立 SSH 会话失败的原因
///
/// DNS、认证、超时必须保持可区分，调用方据此决定是否值得重试。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("DNS resolution failed for {host}: {reason}")]
    Dns { host: String, reason: String },

    #[error("connect timeout after {timeout_secs}s: {host}")]
    Timeout { host: String, timeout_secs: u64 },

    #[error("I/O error connecting to {host}: {reason}")]
    Io { host: String, reason: String },

    #[error("SSH handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },

    #[error("host key for {host} rejected")]
    HostKeyRejected { host: String },

    #[error("authentication rejected for {username}@{host}")]
    AuthRejected { host: String, username: String },

    #[error("credential resolution failed: {0}")]
    Credentials(#[from] CredentialError),

    #[error("connection pool is shut down")]
    PoolShutdown,
}

impl ConnectError {
    /// 拨号重试只针对瞬时故障
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectError::Timeout { .. } | ConnectError::Io { .. })
    }

    /// 指标标签
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectError::Dns { .. } => "dns",
            ConnectError::Timeout { .. } => "timeout",
            ConnectError::Io { .. } => "io",
            ConnectError::Handshake { .. } => "handshake",
            ConnectError::HostKeyRejected { .. } => "host_key",
            ConnectError::AuthRejected { .. } => "auth",
            ConnectError::Credentials(_) => "credentials",
            ConnectError::PoolShutdown => "shutdown",
        }
    }
}

/// 凭据解析错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("no identity configured for key reference '{0}'")]
    UnknownKeyRef(String),

    #[error("failed to read private key {path}: {reason}")]
    KeyUnreadable { path: String, reason: String },

    #[error("private key could not be decoded: {0}")]
    KeyInvalid(String),
}

/// 命令执行过程中的传输层错误（区别于干净的非零退出码）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to open channel: {0}")]
    ChannelOpen(String),

    #[error("failed to start command: {0}")]
    Exec(String),

    #[error("channel closed before exit status was received")]
    ChannelClosed,

    #[error("session disconnected: {0}")]
    Disconnected(String),
}

/// 审计写入错误
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ExecError::UnknownActionType { action: "x".to_string() }.code(),
            "UNKNOWN_ACTION"
        );
        assert_eq!(
            ExecError::Cancelled {
                target: "pi".to_string(),
                action: "reboot".to_string(),
                attempts: 1
            }
            .code(),
            "CANCELLED"
        );
    }

    #[test]
    fn test_user_message_no_sensitive_info() {
        let error = ExecError::ConnectionFailed {
            target: "nas.lan".to_string(),
            action: "disk_usage".to_string(),
            attempts: 1,
            source: ConnectError::Credentials(CredentialError::KeyUnreadable {
                path: "/home/ops/.ssh/id_ed25519".to_string(),
                reason: "permission denied".to_string(),
            }),
        };
        let message = error.user_message();
        assert_eq!(message, "SSH connection failed");
        assert!(!message.contains(".ssh"));
    }

    #[test]
    fn test_connect_error_retryable() {
        assert!(ConnectError::Timeout { host: "a".to_string(), timeout_secs: 10 }.is_retryable());
        assert!(!ConnectError::AuthRejected {
            host: "a".to_string(),
            username: "root".to_string()
        }
        .is_retryable());
        assert!(!ConnectError::Dns { host: "a".to_string(), reason: "nx".to_string() }
            .is_retryable());
    }

    #[test]
    fn test_rejections_are_pre_connection() {
        let rejected = ExecError::ShellMetacharacterRejected {
            parameter: "service_name".to_string(),
            character: ';',
        };
        assert!(rejected.is_rejection());
        assert!(rejected.to_string().contains("';'"));

        let timeout = ExecError::CommandTimeout {
            target: "pi".to_string(),
            action: "apply_updates".to_string(),
            attempts: 1,
            elapsed_ms: 30_000,
        };
        assert!(!timeout.is_rejection());
    }
}
