//! SSH 传输层
//!
//! `SshConnector` / `SshSession` 是连接池与具体 SSH 实现之间的接缝。
//! 默认实现基于 russh：一个会话上可以并发开启多个 channel。

use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use secrecy::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info};

use crate::error::{ConnectError, CredentialError, TransportError};
use crate::models::result::{OutputBuffer, RemoteOutput};
use crate::services::credential_resolver::ResolvedHost;
use crate::ssh::host_key::HostKeyPolicy;

/// 建立并认证 SSH 会话
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(
        &self,
        host: &ResolvedHost,
        connect_timeout: Duration,
    ) -> Result<Box<dyn SshSession>, ConnectError>;
}

/// 已认证的 SSH 会话
#[async_trait]
pub trait SshSession: Send + Sync {
    /// 在新 channel 上执行命令，直到远端关闭 channel
    async fn exec(&self, command: &str, output_limit: usize) -> Result<RemoteOutput, TransportError>;

    /// 传输层是否仍然可用
    fn is_alive(&self) -> bool;

    async fn close(&self);
}

/// russh 客户端会话处理器
#[derive(Clone)]
struct SessionHandler {
    policy: HostKeyPolicy,
    host: String,
    port: u16,
}

#[async_trait]
impl client::Handler for SessionHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(self
            .policy
            .verify(&self.host, self.port, &server_public_key.public_key_bytes()))
    }
}

/// 基于 russh 的连接器
pub struct RusshConnector {
    policy: HostKeyPolicy,
    client_config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new(policy: HostKeyPolicy) -> Self {
        Self {
            policy,
            client_config: Arc::new(client::Config::default()),
        }
    }
}

fn map_russh_error(e: russh::Error, host: &str) -> ConnectError {
    match e {
        russh::Error::UnknownKey => ConnectError::HostKeyRejected {
            host: host.to_string(),
        },
        russh::Error::IO(io) => ConnectError::Io {
            host: host.to_string(),
            reason: io.to_string(),
        },
        other => ConnectError::Handshake {
            host: host.to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(
        &self,
        host: &ResolvedHost,
        connect_timeout: Duration,
    ) -> Result<Box<dyn SshSession>, ConnectError> {
        let deadline = Instant::now() + connect_timeout;
        let timed_out = || ConnectError::Timeout {
            host: host.address.clone(),
            timeout_secs: connect_timeout.as_secs(),
        };

        // 先解码私钥，避免握手成功后才发现凭据不可用
        let key = russh_keys::decode_secret_key(
            host.private_key.expose_secret(),
            host.passphrase.as_ref().map(|p| p.expose_secret().as_str()),
        )
        .map_err(|e| ConnectError::Credentials(CredentialError::KeyInvalid(e.to_string())))?;

        // 显式解析 DNS，使解析失败与 TCP 失败可区分
        let addrs: Vec<SocketAddr> =
            match timeout_at(deadline, tokio::net::lookup_host((host.address.as_str(), host.port))).await {
                Err(_) => return Err(timed_out()),
                Ok(Err(e)) => {
                    return Err(ConnectError::Dns {
                        host: host.address.clone(),
                        reason: e.to_string(),
                    })
                }
                Ok(Ok(iter)) => iter.collect(),
            };

        if addrs.is_empty() {
            return Err(ConnectError::Dns {
                host: host.address.clone(),
                reason: "no addresses returned".to_string(),
            });
        }

        let handler = SessionHandler {
            policy: self.policy.clone(),
            host: host.address.clone(),
            port: host.port,
        };

        // 依次尝试解析出的地址（IPv6/IPv4 双栈）
        let mut last_error = None;
        let mut connected = None;
        for addr in addrs {
            match timeout_at(deadline, client::connect(self.client_config.clone(), addr, handler.clone())).await {
                Err(_) => return Err(timed_out()),
                Ok(Ok(handle)) => {
                    connected = Some(handle);
                    break;
                }
                Ok(Err(e)) => {
                    let mapped = map_russh_error(e, &host.address);
                    debug!(addr = %addr, error = %mapped, "SSH connect attempt failed");
                    if matches!(mapped, ConnectError::HostKeyRejected { .. }) {
                        return Err(mapped);
                    }
                    last_error = Some(mapped);
                }
            }
        }

        let mut handle = match connected {
            Some(handle) => handle,
            None => {
                return Err(last_error.unwrap_or_else(|| ConnectError::Io {
                    host: host.address.clone(),
                    reason: "no address accepted the connection".to_string(),
                }))
            }
        };

        // 认证
        let authenticated = timeout_at(
            deadline,
            handle.authenticate_publickey(host.username.clone(), Arc::new(key)),
        )
        .await
        .map_err(|_| timed_out())?
        .map_err(|e| map_russh_error(e, &host.address))?;

        if !authenticated {
            error!(host = %host.address, username = %host.username, "SSH认证失败");
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
            return Err(ConnectError::AuthRejected {
                host: host.address.clone(),
                username: host.username.clone(),
            });
        }

        info!(endpoint = %host.endpoint(), "SSH session established");

        Ok(Box::new(RusshSession {
            handle: Mutex::new(handle),
            host: host.address.clone(),
        }))
    }
}

/// russh 会话
struct RusshSession {
    handle: Mutex<client::Handle<SessionHandler>>,
    host: String,
}

/// 信号终止的进程按 shell 惯例映射为 128 + 信号值
fn signal_exit_code(signal: &russh::Sig) -> i32 {
    let number = match signal {
        russh::Sig::HUP => 1,
        russh::Sig::INT => 2,
        russh::Sig::QUIT => 3,
        russh::Sig::ILL => 4,
        russh::Sig::ABRT => 6,
        russh::Sig::FPE => 8,
        russh::Sig::KILL => 9,
        russh::Sig::USR1 => 10,
        russh::Sig::SEGV => 11,
        russh::Sig::PIPE => 13,
        russh::Sig::ALRM => 14,
        russh::Sig::TERM => 15,
        _ => return 255,
    };
    128 + number
}

#[async_trait]
impl SshSession for RusshSession {
    async fn exec(&self, command: &str, output_limit: usize) -> Result<RemoteOutput, TransportError> {
        let mut channel = {
            let handle = self.handle.lock().await;
            if handle.is_closed() {
                return Err(TransportError::Disconnected(self.host.clone()));
            }
            handle
                .channel_open_session()
                .await
                .map_err(|e| TransportError::ChannelOpen(e.to_string()))?
        };

        channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::Exec(e.to_string()))?;

        let mut stdout = OutputBuffer::new(output_limit);
        let mut stderr = OutputBuffer::new(output_limit);
        let mut exit_code = None;

        // 读取输出直到 channel 关闭
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.push(data),
                ChannelMsg::ExtendedData { ref data, ext } => {
                    // SSH_EXTENDED_DATA_STDERR
                    if ext == 1 {
                        stderr.push(data);
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status as i32),
                ChannelMsg::ExitSignal { ref signal_name, .. } => {
                    exit_code = Some(signal_exit_code(signal_name))
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        match exit_code {
            Some(exit_code) => Ok(RemoteOutput {
                exit_code,
                stdout,
                stderr,
            }),
            None => Err(TransportError::ChannelClosed),
        }
    }

    fn is_alive(&self) -> bool {
        // 正在开 channel 的会话视为存活
        match self.handle.try_lock() {
            Ok(handle) => !handle.is_closed(),
            Err(_) => true,
        }
    }

    async fn close(&self) {
        let handle = self.handle.lock().await;
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
    }
}
