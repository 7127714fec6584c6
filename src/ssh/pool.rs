//! SSH 连接池
//!
//! 以 target id 为键保存已认证的会话。同一目标的建连严格串行：
//! 第一个调用者拨号，其余调用者等待并复用结果（成功时共享连接，失败时共享同一个错误）。
//! 不同目标之间互不阻塞。

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SshSettings;
use crate::error::{ConnectError, TransportError};
use crate::models::result::RemoteOutput;
use crate::models::target::Target;
use crate::services::credential_resolver::CredentialResolver;
use crate::ssh::transport::{SshConnector, SshSession};

/// 连接池参数
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// 连接存活时间
    pub ttl: Duration,
    /// 单次拨号超时
    pub connect_timeout: Duration,
    /// 瞬时故障的额外拨号次数
    pub connect_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            connect_retries: 0,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

impl PoolSettings {
    pub fn from_settings(settings: &SshSettings) -> Self {
        Self {
            ttl: settings.pool_ttl(),
            connect_timeout: settings.connect_timeout(),
            connect_retries: settings.connect_retries,
            retry_backoff: settings.connect_retry_backoff(),
        }
    }
}

/// 池中的一个会话
///
/// 由连接池独占；调用者每次借用它执行一条命令。
/// 被移出连接池（过期、地址变化、失效）后，会话要等最后一个借用者归还才真正关闭。
pub struct PooledConnection {
    id: Uuid,
    target_id: String,
    address: String,
    session: Box<dyn SshSession>,
    created_at: Instant,
    expires_at: Instant,
    borrowed: AtomicUsize,
    /// 已移出连接池
    retired: AtomicBool,
    /// 会话已关闭（保证 close 只调用一次）
    closed: AtomicBool,
}

impl PooledConnection {
    fn new(target: &Target, session: Box<dyn SshSession>, ttl: Duration) -> Self {
        let created_at = Instant::now();
        Self {
            id: Uuid::new_v4(),
            target_id: target.id.clone(),
            address: target.address.clone(),
            session,
            created_at,
            expires_at: created_at + ttl,
            borrowed: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// 建连时使用的地址
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn is_alive(&self) -> bool {
        self.session.is_alive()
    }

    /// 当前借出次数
    pub fn borrowed(&self) -> usize {
        self.borrowed.load(Ordering::SeqCst)
    }

    /// 是否已移出连接池
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn return_borrow(&self) {
        let _ = self
            .borrowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// 已移出连接池且无人借用时关闭会话
    async fn close_if_idle(&self) {
        if self.is_retired() && self.borrowed() == 0 {
            self.force_close().await;
        }
    }

    async fn force_close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.session.close().await;
        }
    }

    pub async fn exec(&self, command: &str, output_limit: usize) -> Result<RemoteOutput, TransportError> {
        self.session.exec(command, output_limit).await
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("target_id", &self.target_id)
            .field("address", &self.address)
            .field("borrowed", &self.borrowed())
            .field("retired", &self.is_retired())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct SlotState {
    conn: Option<Arc<PooledConnection>>,
    /// 最近一次拨号的失败原因，供排队等待的调用者共享
    last_error: Option<ConnectError>,
}

#[derive(Default)]
struct TargetSlot {
    state: Mutex<SlotState>,
    /// 每完成一次拨号加一
    generation: AtomicU64,
}

/// 连接池统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub targets: usize,
    pub connections: usize,
    pub in_use: usize,
}

/// SSH 连接池
pub struct ConnectionPool {
    settings: PoolSettings,
    connector: Arc<dyn SshConnector>,
    resolver: Arc<dyn CredentialResolver>,
    slots: DashMap<String, Arc<TargetSlot>>,
    open: AtomicUsize,
    closed: AtomicBool,
    shutdown_token: CancellationToken,
}

impl ConnectionPool {
    pub fn new(
        settings: PoolSettings,
        connector: Arc<dyn SshConnector>,
        resolver: Arc<dyn CredentialResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            connector,
            resolver,
            slots: DashMap::new(),
            open: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 获取目标的连接；没有可用连接时拨号
    pub async fn acquire(&self, target: &Target) -> Result<Arc<PooledConnection>, ConnectError> {
        if self.is_shut_down() {
            return Err(ConnectError::PoolShutdown);
        }

        let slot = self
            .slots
            .entry(target.id.clone())
            .or_default()
            .value()
            .clone();

        // 在排队前记下代数，用来判断等待期间是否有人替我们拨过号
        let observed = slot.generation.load(Ordering::SeqCst);
        let mut state = slot.state.lock().await;

        if self.is_shut_down() {
            return Err(ConnectError::PoolShutdown);
        }

        if slot.generation.load(Ordering::SeqCst) != observed {
            if let Some(err) = &state.last_error {
                debug!(target_id = %target.id, error = %err, "Sharing result of concurrent dial");
                return Err(err.clone());
            }
        }

        if let Some(conn) = state.conn.clone() {
            let stale_reason = if conn.address != target.address {
                Some("address_changed")
            } else if conn.is_expired() {
                Some("expired")
            } else if !conn.is_alive() {
                Some("stale")
            } else {
                None
            };

            match stale_reason {
                None => {
                    conn.borrowed.fetch_add(1, Ordering::SeqCst);
                    debug!(target_id = %target.id, conn_id = %conn.id, "Reusing pooled SSH connection");
                    return Ok(conn);
                }
                Some(reason) => {
                    state.conn = None;
                    self.retire(&conn, reason);
                    conn.close_if_idle().await;
                }
            }
        }

        let result = self.dial(target).await;
        slot.generation.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(conn) => {
                conn.borrowed.fetch_add(1, Ordering::SeqCst);
                state.conn = Some(conn.clone());
                state.last_error = None;
                let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
                metrics::gauge!("ssh_pool_connections").set(open as f64);
                Ok(conn)
            }
            Err(err) => {
                state.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// 归还连接
    ///
    /// 池中的连接保持打开；已被移出连接池的连接在最后一次归还时关闭。
    pub async fn release(&self, conn: &PooledConnection) {
        conn.return_borrow();
        conn.close_if_idle().await;
    }

    /// 强制关闭并移除目标的连接
    pub async fn evict(&self, target_id: &str) -> bool {
        let slot = match self.slots.get(target_id) {
            Some(slot) => slot.value().clone(),
            None => return false,
        };

        let conn = slot.state.lock().await.conn.take();
        match conn {
            Some(conn) => {
                self.retire(&conn, "evicted");
                conn.force_close().await;
                true
            }
            None => false,
        }
    }

    /// 丢弃一个借出的连接
    ///
    /// 归还借用，并在池中仍是同一个连接时把它移出连接池。
    /// 会话在没有其他借用者后关闭。
    pub async fn discard(&self, conn: &Arc<PooledConnection>, reason: &'static str) {
        if let Some(slot) = self.slots.get(&conn.target_id).map(|s| s.value().clone()) {
            let mut state = slot.state.lock().await;
            if state.conn.as_ref().map(|c| c.id) == Some(conn.id) {
                state.conn = None;
                drop(state);
                self.retire(conn, reason);
            }
        }

        conn.return_borrow();
        conn.close_if_idle().await;
    }

    /// 清理所有过期连接，返回关闭的数量
    pub async fn purge_expired(&self) -> usize {
        let slots: Vec<Arc<TargetSlot>> = self.slots.iter().map(|s| s.value().clone()).collect();
        let mut purged = 0;

        for slot in slots {
            let expired = {
                let mut state = slot.state.lock().await;
                match &state.conn {
                    // 借出中的连接留给下一次 acquire 或清理处理
                    Some(conn) if conn.is_expired() && conn.borrowed() == 0 => state.conn.take(),
                    _ => None,
                }
            };
            if let Some(conn) = expired {
                self.retire(&conn, "expired");
                conn.close_if_idle().await;
                purged += 1;
            }
        }

        // 移除无人引用且为空的槽位
        self.slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || slot
                    .state
                    .try_lock()
                    .map(|state| state.conn.is_some())
                    .unwrap_or(true)
        });

        if purged > 0 {
            info!(purged, "Purged expired SSH connections");
        }
        purged
    }

    /// 关闭连接池：关闭所有连接，之后的 acquire 返回 PoolShutdown
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_token.cancel();

        let slots: Vec<Arc<TargetSlot>> = self.slots.iter().map(|s| s.value().clone()).collect();
        for slot in slots {
            let conn = slot.state.lock().await.conn.take();
            if let Some(conn) = conn {
                self.retire(&conn, "shutdown");
                conn.force_close().await;
            }
        }
        self.slots.clear();

        info!("SSH connection pool shut down");
    }

    /// 启动后台清理任务；连接池关闭或被释放后任务退出
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let token = self.shutdown_token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即完成
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.purge_expired().await;
                    }
                }
            }
            debug!("SSH pool reaper stopped");
        })
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            targets: self.slots.len(),
            ..Default::default()
        };
        for slot in self.slots.iter() {
            // 正在拨号的槽位不计入
            if let Ok(state) = slot.value().state.try_lock() {
                if let Some(conn) = &state.conn {
                    stats.connections += 1;
                    if conn.borrowed() > 0 {
                        stats.in_use += 1;
                    }
                }
            }
        }
        stats
    }

    async fn dial(&self, target: &Target) -> Result<Arc<PooledConnection>, ConnectError> {
        let host = match self.resolver.resolve(target).await {
            Ok(host) => host,
            Err(e) => {
                metrics::counter!("ssh_pool_dials_total", "result" => "credentials").increment(1);
                warn!(target_id = %target.id, error = %e, "Credential resolution failed");
                return Err(ConnectError::Credentials(e));
            }
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.connector.connect(&host, self.settings.connect_timeout).await {
                Ok(session) => {
                    metrics::counter!("ssh_pool_dials_total", "result" => "ok").increment(1);
                    let conn = Arc::new(PooledConnection::new(target, session, self.settings.ttl));
                    info!(
                        target_id = %target.id,
                        endpoint = %host.endpoint(),
                        conn_id = %conn.id,
                        attempt,
                        "SSH connection pooled"
                    );
                    return Ok(conn);
                }
                Err(e) => {
                    metrics::counter!("ssh_pool_dials_total", "result" => e.kind()).increment(1);
                    if e.is_retryable() && attempt <= self.settings.connect_retries {
                        warn!(
                            target_id = %target.id,
                            error = %e,
                            attempt,
                            backoff_ms = self.settings.retry_backoff.as_millis() as u64,
                            "SSH dial failed, retrying"
                        );
                        tokio::time::sleep(self.settings.retry_backoff).await;
                        continue;
                    }
                    warn!(target_id = %target.id, error = %e, attempt, "SSH dial failed");
                    return Err(e);
                }
            }
        }
    }

    /// 把已移出槽位的连接标记为退役；关闭由调用方决定
    fn retire(&self, conn: &PooledConnection, reason: &'static str) {
        if conn.retired.swap(true, Ordering::SeqCst) {
            return;
        }
        metrics::counter!("ssh_pool_evictions_total", "reason" => reason).increment(1);
        let open = self
            .open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|prev| prev - 1)
            .unwrap_or(0);
        metrics::gauge!("ssh_pool_connections").set(open as f64);

        info!(
            target_id = %conn.target_id,
            conn_id = %conn.id,
            age_secs = conn.age().as_secs(),
            borrowed = conn.borrowed(),
            reason,
            "Retiring pooled SSH connection"
        );
    }
}
