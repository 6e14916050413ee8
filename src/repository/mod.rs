//! 周期存储
//!
//! 持久化状态的唯一所有者：CycleConfig、StandupCycle、Commitment、FollowUpRecord，以及已处理的入站消息 ID。
//! 每次写入都是按自然键的单次原子 upsert；调度器与关联器每次调用都重新读取，不在内存里保留状态。

mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::cycle::{
    Commitment, CommitmentDraft, CommitmentId, CommitmentStatus, CycleConfig, FollowUpRecord,
    Resolution, StandupCycle,
};

pub use sqlite::SqliteRepository;

/// 存储层错误
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage task failed: {0}")]
    Task(String),

    #[error("Storage lock poisoned")]
    Poisoned,

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),
}

/// 周期存储接口
#[async_trait]
pub trait CycleRepository: Send + Sync {
    /// 读取持久化的站会配置（首次启动为 None）
    async fn load_config(&self) -> Result<Option<CycleConfig>, RepositoryError>;

    async fn save_config(&self, config: &CycleConfig) -> Result<(), RepositoryError>;

    /// 按日期读取周期
    async fn get_cycle(&self, date: NaiveDate) -> Result<Option<StandupCycle>, RepositoryError>;

    /// 所有未终结（Scheduled / Sent）的周期，按日期升序
    async fn open_cycles(&self) -> Result<Vec<StandupCycle>, RepositoryError>;

    /// 最近一个未终结周期
    async fn latest_open_cycle(&self) -> Result<Option<StandupCycle>, RepositoryError> {
        Ok(self.open_cycles().await?.pop())
    }

    /// 按 cycle_date upsert
    async fn upsert_cycle(&self, cycle: &StandupCycle) -> Result<(), RepositoryError>;

    /// 按 (user_id, cycle_date) upsert：已存在时覆盖文本、来源消息与抽取方式（后写者胜），状态不变
    async fn upsert_commitment(&self, draft: &CommitmentDraft) -> Result<Commitment, RepositoryError>;

    async fn get_commitment(&self, id: CommitmentId) -> Result<Option<Commitment>, RepositoryError>;

    /// 用户某天的承诺
    async fn commitment_for(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<Commitment>, RepositoryError>;

    /// 日期早于 `date` 且仍为 Pending 的承诺（待跟进）
    async fn pending_commitments_before(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<Commitment>, RepositoryError>;

    /// 某天的全部承诺
    async fn commitments_for_date(&self, date: NaiveDate) -> Result<Vec<Commitment>, RepositoryError>;

    /// 某天尚未结束的承诺（Pending / FollowedUp）
    async fn pending_commitments_for_date(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<Commitment>, RepositoryError> {
        Ok(self
            .commitments_for_date(date)
            .await?
            .into_iter()
            .filter(|c| !c.status.is_resolved())
            .collect())
    }

    /// 用户最近的承诺，按日期倒序
    async fn user_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Commitment>, RepositoryError>;

    /// 写入跟进记录并把承诺推进到 FollowedUp（同一本地事务）
    ///
    /// 返回 false 表示该承诺已有跟进记录，本次未写入。
    async fn record_follow_up(
        &self,
        commitment_id: CommitmentId,
        sent_at: DateTime<Utc>,
        message_id: Option<String>,
    ) -> Result<bool, RepositoryError>;

    /// 没有可跟进内容的 Pending 承诺直接结束（不写跟进记录）
    async fn resolve_commitment_without_follow_up(
        &self,
        commitment_id: CommitmentId,
        status: CommitmentStatus,
    ) -> Result<bool, RepositoryError>;

    /// 用户最近一条尚未回复的跟进
    async fn open_follow_up_for(&self, user_id: &str)
        -> Result<Option<FollowUpRecord>, RepositoryError>;

    async fn follow_up_for(
        &self,
        commitment_id: CommitmentId,
    ) -> Result<Option<FollowUpRecord>, RepositoryError>;

    /// 保存跟进回复与分类，并同步承诺状态；返回 false 表示该跟进已被回复过
    async fn resolve_follow_up(
        &self,
        commitment_id: CommitmentId,
        response_text: &str,
        resolution: Resolution,
        responded_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// 入站消息是否已成功处理过
    async fn is_message_processed(&self, message_id: &str) -> Result<bool, RepositoryError>;

    /// 消息处理成功后记录其 ID；返回 false 表示此前已记录过
    async fn mark_message_processed(
        &self,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}
