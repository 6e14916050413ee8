//! Spoke（聊天平台端点）
//!
//! 核心只通过 `ChatSpoke` 发消息；具体平台（Discord、Slack、终端……）各自实现。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::message::PostMessage;

/// 投递失败（下一次 tick 重试）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Chat platform unreachable: {0}")]
    Unreachable(String),

    #[error("Message rejected by platform: {0}")]
    Rejected(String),

    #[error("Rate limited, retry after {0}s")]
    RateLimited(u64),
}

/// 聊天平台出站端口
#[async_trait]
pub trait ChatSpoke: Send + Sync {
    /// 平台名（日志用）
    fn name(&self) -> &str;

    /// 发送消息；成功时返回平台消息 ID（若平台提供）
    async fn post_message(&self, message: &PostMessage) -> Result<Option<String>, DeliveryError>;
}

/// 终端端点：把出站消息打印到 stdout
pub struct ConsoleSpoke {
    counter: Mutex<u64>,
}

impl ConsoleSpoke {
    pub fn new() -> Self {
        Self {
            counter: Mutex::new(0),
        }
    }

    fn next_id(&self) -> String {
        let mut counter = self.counter.lock().unwrap_or_else(|e| e.into_inner());
        *counter += 1;
        format!("console-{}", *counter)
    }
}

impl Default for ConsoleSpoke {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatSpoke for ConsoleSpoke {
    fn name(&self) -> &str {
        "console"
    }

    async fn post_message(&self, message: &PostMessage) -> Result<Option<String>, DeliveryError> {
        let id = self.next_id();
        let rendered = format!(
            "\n[#{} | {} | {}]\n{}\n",
            message.channel_id, message.correlation_id, id, message.text
        );
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(rendered.as_bytes())
            .await
            .map_err(|e| DeliveryError::Unreachable(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| DeliveryError::Unreachable(e.to_string()))?;
        Ok(Some(id))
    }
}

/// 记录型端点（测试替身）：保存每条发出的意图，可切换为失败
#[derive(Default)]
pub struct RecordingSpoke {
    sent: Mutex<Vec<PostMessage>>,
    failing: AtomicBool,
}

impl RecordingSpoke {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开后所有发送返回 Unreachable
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<PostMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 按 correlation_id 前缀计数（如 "standup:"、"follow-up:"）
    pub fn count_with_prefix(&self, prefix: &str) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.correlation_id.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl ChatSpoke for RecordingSpoke {
    fn name(&self) -> &str {
        "recording"
    }

    async fn post_message(&self, message: &PostMessage) -> Result<Option<String>, DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Unreachable("recording spoke set to fail".to_string()));
        }
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        sent.push(message.clone());
        Ok(Some(format!("rec-{}", sent.len())))
    }
}
