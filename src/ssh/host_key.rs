//! 主机密钥验证
//!
//! 指纹统一为公钥原始字节的 SHA256（hex 编码），known_hosts 文件与握手时计算方式一致。

use base64::Engine;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 主机密钥验证策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyVerification {
    /// 严格模式：只接受已知的主机密钥
    Strict,
    /// 接受模式：首次连接时接受新密钥，之后验证
    #[default]
    Accept,
    /// 禁用验证（不安全，仅用于开发/测试）
    Disabled,
}

impl std::str::FromStr for HostKeyVerification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "accept" => Ok(Self::Accept),
            "disabled" | "none" | "false" => Ok(Self::Disabled),
            _ => Err(format!("Unknown host key verification mode: {}", s)),
        }
    }
}

/// 计算公钥字节的 SHA256 指纹
pub fn fingerprint(public_key_bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(public_key_bytes);
    hex::encode(hasher.finalize())
}

/// known_hosts 中的主机标识统一为 `host:port`
fn host_key_id(host: &str, port: u16) -> String {
    format!("{}:{}", host.to_lowercase(), port)
}

/// 已知主机密钥表
///
/// Accept 模式下首次见到的密钥会被记住，后续连接必须匹配。
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    entries: Arc<DashMap<String, String>>,
}

impl KnownHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: &str, port: u16, fingerprint: String) {
        self.entries.insert(host_key_id(host, port), fingerprint);
    }

    pub fn get(&self, host: &str, port: u16) -> Option<String> {
        self.entries
            .get(&host_key_id(host, port))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 解析 OpenSSH known_hosts 格式
    ///
    /// 支持逗号分隔的多个主机与 `[host]:port` 写法；哈希主机名（`|1|`）与标记行被跳过。
    pub fn parse(content: &str) -> Self {
        let known = Self::new();

        for line in content.lines() {
            let line = line.trim();

            // 跳过空行和注释
            if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let key_bytes = match base64::engine::general_purpose::STANDARD.decode(parts[2]) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(error = %e, "Skipping known_hosts entry with undecodable key");
                    continue;
                }
            };
            let print = fingerprint(&key_bytes);

            for pattern in parts[0].split(',') {
                if pattern.starts_with('|') {
                    continue;
                }
                let (host, port) = match pattern.strip_prefix('[') {
                    Some(rest) => match rest.split_once("]:") {
                        Some((host, port)) => match port.parse::<u16>() {
                            Ok(port) => (host, port),
                            Err(_) => continue,
                        },
                        None => continue,
                    },
                    None => (pattern, 22),
                };
                known.insert(host, port, print.clone());
            }
        }

        known
    }

    /// 从文件加载 known_hosts；读取失败时返回空表并记录错误
    pub async fn load(path: &str) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let known = Self::parse(&content);
                if known.is_empty() {
                    warn!(file_path = %path, "No valid entries found in known_hosts file");
                } else {
                    info!(file_path = %path, count = known.len(), "Loaded known_hosts from file");
                }
                known
            }
            Err(e) => {
                error!(error = %e, file_path = %path, "Failed to read known_hosts file");
                Self::new()
            }
        }
    }
}

/// 主机密钥校验器
#[derive(Debug, Clone)]
pub struct HostKeyPolicy {
    mode: HostKeyVerification,
    known_hosts: KnownHosts,
}

impl HostKeyPolicy {
    pub fn new(mode: HostKeyVerification, known_hosts: KnownHosts) -> Self {
        Self { mode, known_hosts }
    }

    pub fn mode(&self) -> HostKeyVerification {
        self.mode
    }

    /// 根据验证策略判定是否接受服务器公钥
    pub fn verify(&self, host: &str, port: u16, public_key_bytes: &[u8]) -> bool {
        if self.mode == HostKeyVerification::Disabled {
            warn!(host = %host, port, "Host key verification DISABLED - accepting all keys");
            return true;
        }

        let actual = fingerprint(public_key_bytes);
        match self.known_hosts.get(host, port) {
            Some(expected) if expected == actual => {
                debug!(host = %host, port, "Host key verified");
                true
            }
            Some(expected) => {
                error!(
                    host = %host,
                    port,
                    expected = %expected,
                    actual = %actual,
                    "Host key mismatch - REJECTING CONNECTION"
                );
                false
            }
            None if self.mode == HostKeyVerification::Accept => {
                info!(
                    host = %host,
                    port,
                    fingerprint = %actual,
                    "First time connecting - accepting host key"
                );
                self.known_hosts.insert(host, port, actual);
                true
            }
            None => {
                error!(host = %host, port, "Unknown host in strict mode - rejecting connection");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
    const KEY_B: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIBbJ5XRqTZpD7rBg1dJZqCSQnmgrY8tCwzDpBwMfP2Wp";

    fn bytes(key: &str) -> Vec<u8> {
        base64::engine::general_purpose::STANDARD.decode(key).unwrap()
    }

    #[test]
    fn test_host_key_verification_from_str() {
        assert_eq!("strict".parse::<HostKeyVerification>().unwrap(), HostKeyVerification::Strict);
        assert_eq!("ACCEPT".parse::<HostKeyVerification>().unwrap(), HostKeyVerification::Accept);
        assert_eq!("none".parse::<HostKeyVerification>().unwrap(), HostKeyVerification::Disabled);
        assert!("sometimes".parse::<HostKeyVerification>().is_err());
    }

    #[test]
    fn test_parse_known_hosts() {
        let content = format!(
            "# homelab\nnas.lan,nas ssh-ed25519 {a}\n[pi.lan]:2222 ssh-ed25519 {b}\n|1|abc=|def= ssh-ed25519 {a}\nbroken-line\n",
            a = KEY_A,
            b = KEY_B
        );
        let known = KnownHosts::parse(&content);

        assert_eq!(known.len(), 3);
        assert_eq!(known.get("nas.lan", 22), Some(fingerprint(&bytes(KEY_A))));
        assert_eq!(known.get("NAS", 22), Some(fingerprint(&bytes(KEY_A))));
        assert_eq!(known.get("pi.lan", 2222), Some(fingerprint(&bytes(KEY_B))));
        assert_eq!(known.get("pi.lan", 22), None);
    }

    #[test]
    fn test_strict_mode_rejects_unknown_and_mismatch() {
        let known = KnownHosts::new();
        known.insert("nas.lan", 22, fingerprint(&bytes(KEY_A)));
        let policy = HostKeyPolicy::new(HostKeyVerification::Strict, known);

        assert!(policy.verify("nas.lan", 22, &bytes(KEY_A)));
        assert!(!policy.verify("nas.lan", 22, &bytes(KEY_B)));
        assert!(!policy.verify("pi.lan", 22, &bytes(KEY_A)));
    }

    #[test]
    fn test_accept_mode_pins_first_key() {
        let policy = HostKeyPolicy::new(HostKeyVerification::Accept, KnownHosts::new());

        assert!(policy.verify("pi.lan", 22, &bytes(KEY_A)));
        assert!(policy.verify("pi.lan", 22, &bytes(KEY_A)));
        assert!(!policy.verify("pi.lan", 22, &bytes(KEY_B)));
    }

    #[test]
    fn test_disabled_mode_accepts_everything() {
        let policy = HostKeyPolicy::new(HostKeyVerification::Disabled, KnownHosts::new());
        assert!(policy.verify("pi.lan", 22, &bytes(KEY_B)));
    }
}
