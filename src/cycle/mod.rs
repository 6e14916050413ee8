//! 站会周期数据模型
//!
//! - **CycleConfig**：频道、站会时刻、时区、跟进提前量、回复窗口（持久化，仅管理操作可改）
//! - **StandupCycle**：每个日历日一条，Scheduled → Sent → WindowClosed
//! - **Commitment**：每个 (用户, 日期) 一条，Pending → FollowedUp → Completed / Incomplete / Unknown
//! - **FollowUpRecord**：每条承诺至多一条，幂等键为 commitment_id

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::core::clock::{local_date, local_instant, timezone_or_utc};
use crate::core::CycleError;
use crate::extraction::ExtractionMode;

pub const DEFAULT_STANDUP_HOUR: u32 = 17;
pub const DEFAULT_STANDUP_MINUTE: u32 = 0;
pub const DEFAULT_FOLLOW_UP_OFFSET_MINUTES: u32 = 30;
pub const DEFAULT_RESPONSE_WINDOW_HOURS: u32 = 3;

/// 回复窗口必须短于一天，保证次日站会前上一轮窗口一定已关闭
pub const MAX_RESPONSE_WINDOW_HOURS: u32 = 23;
pub const MAX_FOLLOW_UP_OFFSET_MINUTES: u32 = 12 * 60;

/// 站会配置（整个进程一份，持久化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleConfig {
    pub channel_id: Option<String>,
    pub standup_hour: u32,
    pub standup_minute: u32,
    /// IANA 时区名
    pub timezone: String,
    pub follow_up_offset_minutes: u32,
    pub response_window_hours: u32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            channel_id: None,
            standup_hour: DEFAULT_STANDUP_HOUR,
            standup_minute: DEFAULT_STANDUP_MINUTE,
            timezone: "UTC".to_string(),
            follow_up_offset_minutes: DEFAULT_FOLLOW_UP_OFFSET_MINUTES,
            response_window_hours: DEFAULT_RESPONSE_WINDOW_HOURS,
        }
    }
}

impl CycleConfig {
    pub fn validate(&self) -> Result<(), CycleError> {
        validate_schedule(self.standup_hour, self.standup_minute)?;
        if !(1..=MAX_RESPONSE_WINDOW_HOURS).contains(&self.response_window_hours) {
            return Err(CycleError::InvalidSchedule(format!(
                "response window must be 1-{} hours, got {}",
                MAX_RESPONSE_WINDOW_HOURS, self.response_window_hours
            )));
        }
        if self.follow_up_offset_minutes > MAX_FOLLOW_UP_OFFSET_MINUTES {
            return Err(CycleError::InvalidSchedule(format!(
                "follow-up offset must be at most {} minutes, got {}",
                MAX_FOLLOW_UP_OFFSET_MINUTES, self.follow_up_offset_minutes
            )));
        }
        crate::core::clock::parse_timezone(&self.timezone)?;
        Ok(())
    }

    pub fn tz(&self) -> Tz {
        timezone_or_utc(&self.timezone)
    }

    /// `now` 在配置时区下是哪一天
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        local_date(now, self.tz())
    }

    /// 某天的站会时刻（UTC）
    pub fn standup_at(&self, date: NaiveDate) -> DateTime<Utc> {
        local_instant(date, self.standup_hour, self.standup_minute, self.tz())
    }

    /// 某天开始发送跟进的时刻：站会前 follow_up_offset_minutes 分钟
    pub fn follow_ups_due_at(&self, date: NaiveDate) -> DateTime<Utc> {
        self.standup_at(date) - Duration::minutes(i64::from(self.follow_up_offset_minutes))
    }

    pub fn response_window(&self) -> Duration {
        Duration::hours(i64::from(self.response_window_hours))
    }
}

/// 校验站会时刻：hour∈[0,23]，minute∈[0,59]
pub fn validate_schedule(hour: u32, minute: u32) -> Result<(), CycleError> {
    if hour > 23 || minute > 59 {
        return Err(CycleError::InvalidSchedule(format!(
            "hour must be 0-23 and minute 0-59, got {:02}:{:02}",
            hour, minute
        )));
    }
    Ok(())
}

/// 周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStatus {
    Scheduled,
    Sent,
    WindowClosed,
}

/// 某一天的站会实例
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandupCycle {
    pub cycle_date: NaiveDate,
    pub prompt_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub window_closes_at: Option<DateTime<Utc>>,
    pub status: CycleStatus,
}

impl StandupCycle {
    pub fn scheduled(cycle_date: NaiveDate) -> Self {
        Self {
            cycle_date,
            prompt_message_id: None,
            sent_at: None,
            window_closes_at: None,
            status: CycleStatus::Scheduled,
        }
    }

    /// 已发送，窗口到 `sent_at + window`（含边界）
    pub fn mark_sent(&mut self, message_id: Option<String>, sent_at: DateTime<Utc>, window: Duration) {
        self.prompt_message_id = message_id;
        self.sent_at = Some(sent_at);
        self.window_closes_at = Some(sent_at + window);
        self.status = CycleStatus::Sent;
    }

    /// `at` 时刻窗口是否仍接受回复：关闭时刻当下仍接受，之后一律拒绝
    pub fn accepts_reply_at(&self, at: DateTime<Utc>) -> bool {
        self.status == CycleStatus::Sent
            && self.window_closes_at.is_some_and(|closes| at <= closes)
    }

    pub fn window_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == CycleStatus::Sent && self.window_closes_at.is_some_and(|closes| now > closes)
    }
}

/// 承诺 ID（存储自增主键）
pub type CommitmentId = i64;

/// 承诺状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitmentStatus {
    Pending,
    FollowedUp,
    Completed,
    Incomplete,
    Unknown,
}

impl CommitmentStatus {
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            CommitmentStatus::Completed | CommitmentStatus::Incomplete | CommitmentStatus::Unknown
        )
    }
}

/// 跟进回复的三元分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Completed,
    Incomplete,
    Unknown,
}

impl From<Resolution> for CommitmentStatus {
    fn from(r: Resolution) -> Self {
        match r {
            Resolution::Completed => CommitmentStatus::Completed,
            Resolution::Incomplete => CommitmentStatus::Incomplete,
            Resolution::Unknown => CommitmentStatus::Unknown,
        }
    }
}

/// 用户某天的承诺
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub id: CommitmentId,
    pub user_id: String,
    pub username: String,
    pub cycle_date: NaiveDate,
    pub today_text: String,
    pub tomorrow_text: String,
    pub raw_text: String,
    pub source_message_id: String,
    pub extraction_mode: ExtractionMode,
    pub status: CommitmentStatus,
    pub updated_at: DateTime<Utc>,
}

impl Commitment {
    /// 是否有可跟进的内容
    pub fn has_pledge(&self) -> bool {
        !self.tomorrow_text.trim().is_empty()
    }
}

/// 写入承诺的入参（按 (user_id, cycle_date) upsert）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentDraft {
    pub user_id: String,
    pub username: String,
    pub cycle_date: NaiveDate,
    pub today_text: String,
    pub tomorrow_text: String,
    pub raw_text: String,
    pub source_message_id: String,
    pub extraction_mode: ExtractionMode,
    pub received_at: DateTime<Utc>,
}

/// 跟进记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpRecord {
    pub commitment_id: CommitmentId,
    pub user_id: String,
    pub sent_at: DateTime<Utc>,
    pub message_id: Option<String>,
    pub response_text: Option<String>,
    pub resolved_status: Option<Resolution>,
    pub responded_at: Option<DateTime<Utc>>,
}

macro_rules! text_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($ty), other)),
                }
            }
        }
    };
}

text_enum!(CycleStatus {
    Scheduled => "scheduled",
    Sent => "sent",
    WindowClosed => "window_closed",
});

text_enum!(CommitmentStatus {
    Pending => "pending",
    FollowedUp => "followed_up",
    Completed => "completed",
    Incomplete => "incomplete",
    Unknown => "unknown",
});

text_enum!(Resolution {
    Completed => "completed",
    Incomplete => "incomplete",
    Unknown => "unknown",
});
