//! 站会核心错误类型
//!
//! 与调度循环配合：投递失败下一轮 tick 重试，存储不可用只中止当前调用，抽取失败在抽取层内部降级、不会出现在这里。

use thiserror::Error;

use crate::gateway::DeliveryError;
use crate::repository::RepositoryError;

/// 调度器、关联器与管理操作可能返回的错误
#[derive(Error, Debug)]
pub enum CycleError {
    /// 出站消息发送失败（频道不可达等），下一轮 tick 自动重试
    #[error("Transient delivery error: {0}")]
    TransientDelivery(#[from] DeliveryError),

    /// 存储不可用：中止本次 tick / 消息处理，进程不退出
    #[error("Repository unavailable: {0}")]
    RepositoryUnavailable(#[from] RepositoryError),

    /// 入站事件缺少 user / channel / timestamp
    #[error("Malformed inbound event: {0}")]
    MalformedInboundEvent(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("No standup channel configured")]
    NoChannel,
}

impl CycleError {
    /// 是否属于「下一轮自动重试即可」的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CycleError::TransientDelivery(_) | CycleError::RepositoryUnavailable(_)
        )
    }
}
