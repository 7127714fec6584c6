//! 舰队远程执行库
//! 提供命令白名单、SSH 连接池与执行器

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod ssh;
pub mod telemetry;
pub mod whitelist;
