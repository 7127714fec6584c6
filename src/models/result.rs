//! 统一执行结果模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 有上限的输出缓冲区
///
/// 超出上限的字节被丢弃，但总字节数仍被统计，用于生成显式的截断标记。
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    data: Vec<u8>,
    limit: usize,
    total: usize,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len();
        let room = self.limit.saturating_sub(self.data.len());
        if room > 0 {
            let take = room.min(chunk.len());
            self.data.extend_from_slice(&chunk[..take]);
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total
    }

    pub fn is_truncated(&self) -> bool {
        self.total > self.data.len()
    }

    /// 转为文本；截断时追加标记
    pub fn into_text(self) -> (String, bool) {
        let truncated = self.is_truncated();
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if truncated {
            text.push_str(&format!("\n...(truncated, {} bytes total)", self.total));
        }
        (text, truncated)
    }
}

/// 远程命令的原始输出（传输层产物）
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub exit_code: i32,
    pub stdout: OutputBuffer,
    pub stderr: OutputBuffer,
}

/// 执行结果：一次干净退出（任意退出码）的命令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// 退出码
    pub exit_code: i32,
    /// 标准输出
    pub stdout: String,
    /// 标准错误
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// 执行时长（毫秒）
    pub duration_ms: u64,
    /// 实际连接的主机名
    pub host: String,
    pub completed_at: DateTime<Utc>,
}

impl CommandResult {
    pub fn from_output(output: RemoteOutput, host: impl Into<String>, duration_ms: u64) -> Self {
        let (stdout, stdout_truncated) = output.stdout.into_text();
        let (stderr, stderr_truncated) = output.stderr.into_text();
        Self {
            exit_code: output.exit_code,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            duration_ms,
            host: host.into(),
            completed_at: Utc::now(),
        }
    }

    /// 判断是否成功
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// 获取输出摘要（限制长度，按字符边界截断）
    pub fn output_summary(&self, max_len: usize) -> String {
        let full = format!("{}\n{}", self.stdout, self.stderr).trim().to_string();
        if full.len() <= max_len {
            return full;
        }
        let mut end = max_len;
        while !full.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &full[..end])
    }
}
