//! 聊天平台消息协议
//!
//! 出站只有一种意图（PostMessage），入站只有一种事件（InboundMessage）；平台细节留在各 Spoke 里。

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::core::CycleError;
use crate::cycle::CommitmentId;

/// 出站消息意图
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMessage {
    pub channel_id: String,
    pub text: String,
    /// `standup:<date>` 或 `follow-up:<commitment id>`
    pub correlation_id: String,
}

impl PostMessage {
    pub fn standup(channel_id: impl Into<String>, date: NaiveDate, text: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            text: text.into(),
            correlation_id: format!("standup:{date}"),
        }
    }

    pub fn follow_up(
        channel_id: impl Into<String>,
        commitment_id: CommitmentId,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            text: text.into(),
            correlation_id: format!("follow-up:{commitment_id}"),
        }
    }
}

/// 入站消息事件（至少一次投递）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    pub channel_id: String,
    pub text: String,
    pub message_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_bot: bool,
    /// 被回复的消息 ID（平台的 reply / thread 引用）
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl InboundMessage {
    /// 缺少用户、频道、消息 ID 或时间戳的事件视为畸形
    pub fn validate(&self) -> Result<DateTime<Utc>, CycleError> {
        let missing = [
            ("user_id", self.user_id.trim().is_empty()),
            ("channel_id", self.channel_id.trim().is_empty()),
            ("message_id", self.message_id.trim().is_empty()),
        ]
        .into_iter()
        .find(|(_, empty)| *empty)
        .map(|(field, _)| field);

        if let Some(field) = missing {
            return Err(CycleError::MalformedInboundEvent(format!("missing {field}")));
        }
        self.timestamp
            .ok_or_else(|| CycleError::MalformedInboundEvent("missing timestamp".to_string()))
    }

    /// 展示名，缺省时用 user_id
    pub fn display_name(&self) -> &str {
        if self.username.trim().is_empty() {
            &self.user_id
        } else {
            &self.username
        }
    }
}
