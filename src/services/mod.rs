//! 协作服务：凭据解析与审计持久化

pub mod audit_service;
pub mod credential_resolver;

pub use audit_service::{AuditSink, JsonLinesAuditSink, MemoryAuditSink};
pub use credential_resolver::{CredentialResolver, ResolvedHost, StaticCredentialResolver};
