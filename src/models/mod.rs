//! 数据模型模块
//! 目标主机、执行请求、执行结果与审计记录

pub mod audit;
pub mod result;
pub mod target;

pub use audit::{AuditOutcome, AuditRecord};
pub use result::{CommandResult, OutputBuffer, RemoteOutput};
pub use target::{ActionRequest, ActionType, Target};
