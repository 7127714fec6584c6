//! SSH执行器
//!
//! 校验 → 白名单 → 获取连接 → 远程执行（超时/重试）→ 结构化结果 → 审计。
//! 每次 `execute` 调用恰好产生一条审计记录。

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::error::{ExecError, TransportError};
use crate::models::audit::{AuditOutcome, AuditRecord};
use crate::models::result::CommandResult;
use crate::models::target::{sanitize_label, ActionRequest};
use crate::services::audit_service::AuditSink;
use crate::ssh::pool::ConnectionPool;
use crate::whitelist::CommandWhitelist;

/// 传输失败时的最大执行次数（首次 + 一次重试）
const MAX_EXEC_ATTEMPTS: u32 = 2;

/// 审计写入的等待上限
const AUDIT_APPEND_TIMEOUT: Duration = Duration::from_secs(5);

/// 执行器参数
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// 默认命令超时
    pub default_timeout: Duration,
    /// stdout / stderr 各自的字节上限
    pub output_limit: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            output_limit: 10 * 1024,
        }
    }
}

impl ExecutorSettings {
    pub fn from_settings(settings: &crate::config::SshSettings) -> Self {
        Self {
            default_timeout: settings.command_timeout(),
            output_limit: settings.output_limit_bytes,
        }
    }
}

/// 一次执行的内部结果，供审计使用
struct Execution {
    command: Option<String>,
    attempts: u32,
    outcome: Result<CommandResult, ExecError>,
}

impl Execution {
    fn rejected(error: ExecError) -> Self {
        Self {
            command: None,
            attempts: 0,
            outcome: Err(error),
        }
    }
}

/// SSH执行器
pub struct SshExecutor {
    pool: Arc<ConnectionPool>,
    whitelist: Arc<CommandWhitelist>,
    audit: Arc<dyn AuditSink>,
    settings: ExecutorSettings,
}

impl SshExecutor {
    pub fn new(
        pool: Arc<ConnectionPool>,
        whitelist: Arc<CommandWhitelist>,
        audit: Arc<dyn AuditSink>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            pool,
            whitelist,
            audit,
            settings,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// 执行一个白名单操作
    ///
    /// 非零退出码是成功的结果而不是错误；只有校验拒绝、连接失败、超时、
    /// 取消和重试后仍失败的传输错误才返回 `Err`。
    pub async fn execute(
        &self,
        request: ActionRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, ExecError> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "ssh_execute",
            request_id = %request_id,
            target = %request.target,
            action = %sanitize_label(&request.action),
            initiator = %request.initiator,
        );

        async move {
            let started = Instant::now();
            let execution = self.run(&request, cancel).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let record = AuditRecord::from_execution(
                &request,
                execution.command,
                &execution.outcome,
                execution.attempts,
                duration_ms,
            );
            self.record_metrics(&record, started.elapsed());
            self.append_audit(&record).await;

            execution.outcome
        }
        .instrument(span)
        .await
    }

    async fn run(&self, request: &ActionRequest, cancel: &CancellationToken) -> Execution {
        let target = &request.target;
        let action = sanitize_label(&request.action);

        if let Err(reason) = target.validate() {
            warn!(reason = %reason, "Rejected request with invalid target");
            return Execution::rejected(ExecError::InvalidTarget {
                target: sanitize_label(&target.id),
                reason,
            });
        }

        let command = match self.whitelist.resolve(&request.action, &request.params) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Whitelist rejected request");
                return Execution::rejected(e);
            }
        };

        if command.trim().is_empty() {
            warn!("Rejected empty command");
            return Execution::rejected(ExecError::EmptyCommand { action });
        }

        let timeout = request.timeout.unwrap_or(self.settings.default_timeout);
        let mut attempts: u32 = 0;

        let outcome = loop {
            attempts += 1;

            let cancelled = || ExecError::Cancelled {
                target: target.id.clone(),
                action: action.clone(),
                attempts,
            };

            if cancel.is_cancelled() {
                info!(attempts, "Execution cancelled before dispatch");
                break Err(cancelled());
            }

            let conn = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(attempts, "Execution cancelled while acquiring connection");
                    break Err(cancelled());
                }
                acquired = self.pool.acquire(target) => match acquired {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, attempts, "SSH connection failed");
                        break Err(ExecError::ConnectionFailed {
                            target: target.id.clone(),
                            action: action.clone(),
                            attempts,
                            source: e,
                        });
                    }
                },
            };

            debug!(conn_id = %conn.id(), attempt = attempts, command = %command, "Dispatching command");
            let started = Instant::now();

            let run = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                run = tokio::time::timeout(timeout, conn.exec(&command, self.settings.output_limit)) => Some(run),
            };

            match run {
                None => {
                    self.pool.discard(&conn, "cancelled").await;
                    info!(attempts, command = %command, "Execution cancelled, connection evicted");
                    break Err(cancelled());
                }
                Some(Err(_elapsed)) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    self.pool.discard(&conn, "timeout").await;
                    warn!(
                        command = %command,
                        elapsed_ms,
                        timeout_ms = timeout.as_millis() as u64,
                        "Command timed out, connection evicted"
                    );
                    break Err(ExecError::CommandTimeout {
                        target: target.id.clone(),
                        action: action.clone(),
                        attempts,
                        elapsed_ms,
                    });
                }
                Some(Ok(Err(e))) => {
                    self.pool.discard(&conn, "transport").await;
                    warn!(command = %command, error = %e, attempts, "SSH transport failure");
                    if attempts < MAX_EXEC_ATTEMPTS {
                        continue;
                    }
                    break Err(self.execution_failed(request, &action, attempts, e));
                }
                Some(Ok(Ok(output))) => {
                    self.pool.release(&conn).await;
                    let duration_ms = started.elapsed().as_millis() as u64;
                    let result = CommandResult::from_output(output, conn.address(), duration_ms);

                    if result.is_success() {
                        info!(command = %command, exit_code = result.exit_code, duration_ms, "Command completed");
                    } else {
                        warn!(
                            command = %command,
                            exit_code = result.exit_code,
                            duration_ms,
                            stderr = %result.output_summary(200),
                            "Command exited with non-zero status"
                        );
                    }
                    break Ok(result);
                }
            }
        };

        Execution {
            command: Some(command),
            attempts,
            outcome,
        }
    }

    fn execution_failed(
        &self,
        request: &ActionRequest,
        action: &str,
        attempts: u32,
        source: TransportError,
    ) -> ExecError {
        ExecError::ExecutionFailed {
            target: request.target.id.clone(),
            action: action.to_string(),
            attempts,
            source,
        }
    }

    fn record_metrics(&self, record: &AuditRecord, elapsed: Duration) {
        let action = match record.outcome {
            // 被拒绝的请求可能带着任意操作名，不作为标签
            AuditOutcome::Rejected => "rejected".to_string(),
            _ => record.action.clone(),
        };
        metrics::counter!(
            "ssh_exec_total",
            "action" => action,
            "outcome" => record.outcome.as_str()
        )
        .increment(1);
        metrics::histogram!("ssh_exec_duration_seconds").record(elapsed.as_secs_f64());
    }

    async fn append_audit(&self, record: &AuditRecord) {
        match tokio::time::timeout(AUDIT_APPEND_TIMEOUT, self.audit.append(record)).await {
            Ok(Ok(())) => debug!(audit_id = %record.id, "Audit record appended"),
            Ok(Err(e)) => error!(
                audit_id = %record.id,
                outcome = record.outcome.as_str(),
                error = %e,
                "Failed to append audit record"
            ),
            Err(_) => error!(
                audit_id = %record.id,
                outcome = record.outcome.as_str(),
                timeout_secs = AUDIT_APPEND_TIMEOUT.as_secs(),
                "Audit append timed out"
            ),
        }
    }
}
