//! 审计领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExecError;
use crate::models::result::CommandResult;
use crate::models::target::ActionRequest;

/// 一次执行的结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    NonZeroExit,
    Rejected,
    Failed,
    Timeout,
    Cancelled,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::NonZeroExit => "non_zero_exit",
            AuditOutcome::Rejected => "rejected",
            AuditOutcome::Failed => "failed",
            AuditOutcome::Timeout => "timeout",
            AuditOutcome::Cancelled => "cancelled",
        }
    }

    pub fn from_result(result: &Result<CommandResult, ExecError>) -> Self {
        match result {
            Ok(r) if r.is_success() => AuditOutcome::Success,
            Ok(_) => AuditOutcome::NonZeroExit,
            Err(e) if e.is_rejection() => AuditOutcome::Rejected,
            Err(ExecError::CommandTimeout { .. }) => AuditOutcome::Timeout,
            Err(ExecError::Cancelled { .. }) => AuditOutcome::Cancelled,
            Err(_) => AuditOutcome::Failed,
        }
    }
}

/// 审计记录：每次 execute 调用恰好一条
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub target_id: String,
    pub target_address: String,
    pub action: String,
    /// 解析后的命令；请求未产生命令时为空
    pub command: Option<String>,
    pub outcome: AuditOutcome,
    pub result: Option<CommandResult>,
    pub error_code: Option<String>,
    pub failure_reason: Option<String>,
    pub initiator: String,
    pub attempts: u32,
    pub duration_ms: u64,
    pub occurred_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn from_execution(
        request: &ActionRequest,
        command: Option<String>,
        result: &Result<CommandResult, ExecError>,
        attempts: u32,
        duration_ms: u64,
    ) -> Self {
        let (result_body, error_code, failure_reason) = match result {
            Ok(r) => (Some(r.clone()), None, None),
            Err(e) => (None, Some(e.code().to_string()), Some(e.to_string())),
        };

        Self {
            id: Uuid::new_v4(),
            target_id: request.target.id.clone(),
            target_address: request.target.address.clone(),
            action: crate::models::target::sanitize_label(&request.action),
            command,
            outcome: AuditOutcome::from_result(result),
            result: result_body,
            error_code,
            failure_reason,
            initiator: request.initiator.clone(),
            attempts,
            duration_ms,
            occurred_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::target::Target;

    #[test]
    fn test_rejected_record_has_no_command() {
        let request = ActionRequest::new(Target::new("nas", "nas.lan"), "restart_service", "alice")
            .with_param("service_name", "nginx; rm -rf /");
        let result = Err(ExecError::ShellMetacharacterRejected {
            parameter: "service_name".to_string(),
            character: ';',
        });
        let record = AuditRecord::from_execution(&request, None, &result, 0, 0);

        assert_eq!(record.outcome, AuditOutcome::Rejected);
        assert!(record.command.is_none());
        assert_eq!(record.error_code.as_deref(), Some("SHELL_METACHARACTER"));
        assert!(!record.failure_reason.unwrap().contains("rm -rf"));
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&AuditOutcome::NonZeroExit).unwrap();
        assert_eq!(json, "\"non_zero_exit\"");
    }
}
