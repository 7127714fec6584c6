//! 主机凭据解析
//!
//! 把 Target 解析为连接地址与 SSH 身份。密钥的分发与加密不在本模块范围内，
//! 这里只负责按引用找到私钥并读取。

use async_trait::async_trait;
use secrecy::Secret;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::config::SshSettings;
use crate::error::CredentialError;
use crate::models::target::Target;

/// 解析后的连接参数
#[derive(Clone)]
pub struct ResolvedHost {
    pub address: String,
    pub port: u16,
    pub username: String,
    /// 私钥内容（PEM / OpenSSH 格式）
    pub private_key: Secret<String>,
    pub passphrase: Option<Secret<String>>,
}

impl fmt::Debug for ResolvedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedHost")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ResolvedHost {
    /// 获取目标地址字符串
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.address, self.port)
    }
}

/// 凭据解析器
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, target: &Target) -> Result<ResolvedHost, CredentialError>;
}

/// 基于配置的凭据解析器
///
/// 用户名：目标覆盖 > 默认用户名；私钥：`identities[key_ref]` > 默认私钥路径。
pub struct StaticCredentialResolver {
    default_key_path: String,
    identities: HashMap<String, String>,
    passphrase: Option<Secret<String>>,
    default_username: String,
    default_port: u16,
}

impl StaticCredentialResolver {
    pub fn from_settings(settings: &SshSettings) -> Self {
        Self {
            default_key_path: settings.private_key_path.clone(),
            identities: settings.identities.clone(),
            passphrase: settings.private_key_passphrase.clone(),
            default_username: settings.default_username.clone(),
            default_port: settings.port,
        }
    }

    fn key_path(&self, target: &Target) -> Result<&str, CredentialError> {
        match &target.key_ref {
            Some(key_ref) => self
                .identities
                .get(key_ref)
                .map(String::as_str)
                .ok_or_else(|| CredentialError::UnknownKeyRef(key_ref.clone())),
            None => Ok(&self.default_key_path),
        }
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, target: &Target) -> Result<ResolvedHost, CredentialError> {
        let path = self.key_path(target)?;
        let private_key = tokio::fs::read_to_string(path).await.map_err(|e| {
            CredentialError::KeyUnreadable {
                path: path.to_string(),
                reason: e.to_string(),
            }
        })?;

        let username = target
            .username
            .clone()
            .unwrap_or_else(|| self.default_username.clone());

        debug!(target_id = %target.id, username = %username, key_path = %path, "Resolved SSH identity");

        Ok(ResolvedHost {
            address: target.address.trim().to_string(),
            port: target.port.unwrap_or(self.default_port),
            username,
            private_key: Secret::new(private_key),
            passphrase: self.passphrase.clone(),
        })
    }
}
