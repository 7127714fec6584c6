//! SSH 模块
//! 传输、连接池、主机密钥验证与执行器

pub mod executor;
pub mod host_key;
pub mod pool;
pub mod transport;

pub use executor::{ExecutorSettings, SshExecutor};
pub use host_key::{HostKeyPolicy, HostKeyVerification, KnownHosts};
pub use pool::{ConnectionPool, PoolSettings, PoolStats, PooledConnection};
pub use transport::{RusshConnector, SshConnector, SshSession};
