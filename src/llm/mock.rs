//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 三种行为：固定回复、固定失败、超长延迟（模拟超时）。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};

#[derive(Debug, Clone)]
enum Behavior {
    Reply(String),
    Fail(String),
    Hang(Duration),
}

/// Mock 客户端
#[derive(Debug)]
pub struct MockLlmClient {
    behavior: Behavior,
    calls: AtomicUsize,
}

impl MockLlmClient {
    /// 每次返回同一段文本
    pub fn replying(reply: impl Into<String>) -> Self {
        Self::with(Behavior::Reply(reply.into()))
    }

    /// 每次返回错误
    pub fn failing(reason: impl Into<String>) -> Self {
        Self::with(Behavior::Fail(reason.into()))
    }

    /// 睡眠 `delay` 后才回复，用来触发调用方的超时
    pub fn hanging(delay: Duration) -> Self {
        Self::with(Behavior::Hang(delay))
    }

    fn with(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    /// 被调用次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Reply(text) => Ok(text.clone()),
            Behavior::Fail(reason) => Err(reason.clone()),
            Behavior::Hang(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(r#"{"today": "late", "tomorrow": "late"}"#.to_string())
            }
        }
    }
}
