//! 管理操作
//!
//! CycleConfig 的唯一修改入口；每次修改先校验，再整体写回存储，下一次 tick 立即生效。

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};

use crate::core::clock::parse_timezone;
use crate::core::{Clock, CycleError};
use crate::cycle::{
    validate_schedule, Commitment, CycleConfig, CycleStatus, StandupCycle, MAX_RESPONSE_WINDOW_HOURS,
};
use crate::repository::CycleRepository;
use crate::scheduler::{FollowUpPreview, Scheduler, TickReport};

/// skip_today 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipOutcome {
    /// 今天的提问尚未发出，已取消
    Skipped,
    /// 提问已发出，提前关闭了回复窗口
    ClosedEarly,
    /// 今天的周期本来就已结束
    AlreadyClosed,
}

/// 管理服务
pub struct AdminService {
    repo: Arc<dyn CycleRepository>,
    scheduler: Arc<Scheduler>,
    clock: Arc<dyn Clock>,
}

impl AdminService {
    pub fn new(repo: Arc<dyn CycleRepository>, scheduler: Arc<Scheduler>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            scheduler,
            clock,
        }
    }

    pub async fn get_config(&self) -> Result<CycleConfig, CycleError> {
        Ok(self.repo.load_config().await?.unwrap_or_default())
    }

    pub async fn set_channel(&self, channel_id: &str) -> Result<CycleConfig, CycleError> {
        let channel_id = channel_id.trim();
        if channel_id.is_empty() {
            return Err(CycleError::NoChannel);
        }
        self.update(|cfg| {
            cfg.channel_id = Some(channel_id.to_string());
            Ok(())
        })
        .await
    }

    pub async fn set_schedule(&self, hour: u32, minute: u32) -> Result<CycleConfig, CycleError> {
        validate_schedule(hour, minute)?;
        self.update(|cfg| {
            cfg.standup_hour = hour;
            cfg.standup_minute = minute;
            Ok(())
        })
        .await
    }

    pub async fn set_timezone(&self, name: &str) -> Result<CycleConfig, CycleError> {
        let tz = parse_timezone(name)?;
        self.update(|cfg| {
            cfg.timezone = tz.name().to_string();
            Ok(())
        })
        .await
    }

    pub async fn set_response_window(&self, hours: u32) -> Result<CycleConfig, CycleError> {
        if !(1..=MAX_RESPONSE_WINDOW_HOURS).contains(&hours) {
            return Err(CycleError::InvalidSchedule(format!(
                "response window must be 1-{} hours, got {}",
                MAX_RESPONSE_WINDOW_HOURS, hours
            )));
        }
        self.update(|cfg| {
            cfg.response_window_hours = hours;
            Ok(())
        })
        .await
    }

    /// 某天尚未结束（Pending / FollowedUp）的承诺
    pub async fn list_pending_commitments(&self, date: NaiveDate) -> Result<Vec<Commitment>, CycleError> {
        Ok(self.repo.pending_commitments_for_date(date).await?)
    }

    /// 某天的全部承诺
    pub async fn list_commitments(&self, date: NaiveDate) -> Result<Vec<Commitment>, CycleError> {
        Ok(self.repo.commitments_for_date(date).await?)
    }

    pub async fn user_history(&self, user_id: &str, limit: usize) -> Result<Vec<Commitment>, CycleError> {
        Ok(self.repo.user_history(user_id, limit).await?)
    }

    pub async fn trigger_standup_now(&self) -> Result<TickReport, CycleError> {
        self.require_channel().await?;
        self.scheduler.trigger_standup_now(self.clock.now()).await
    }

    pub async fn trigger_follow_ups_now(&self) -> Result<TickReport, CycleError> {
        self.require_channel().await?;
        self.scheduler.trigger_follow_ups_now(self.clock.now()).await
    }

    /// `date` 缺省时为配置时区下的今天
    pub async fn preview_follow_ups(
        &self,
        date: Option<NaiveDate>,
    ) -> Result<Vec<FollowUpPreview>, CycleError> {
        let date = match date {
            Some(date) => date,
            None => self.today().await?,
        };
        self.scheduler.preview_follow_ups(date).await
    }

    /// 关闭今天的周期而不发送提问
    pub async fn skip_today(&self) -> Result<SkipOutcome, CycleError> {
        let today = self.today().await?;
        let mut cycle = self
            .repo
            .get_cycle(today)
            .await?
            .unwrap_or_else(|| StandupCycle::scheduled(today));

        let outcome = match cycle.status {
            CycleStatus::WindowClosed => return Ok(SkipOutcome::AlreadyClosed),
            CycleStatus::Scheduled => SkipOutcome::Skipped,
            CycleStatus::Sent => SkipOutcome::ClosedEarly,
        };
        cycle.status = CycleStatus::WindowClosed;
        self.repo.upsert_cycle(&cycle).await?;
        tracing::info!("Standup for {} skipped ({:?})", today, outcome);
        Ok(outcome)
    }

    async fn today(&self) -> Result<NaiveDate, CycleError> {
        let now: DateTime<Utc> = self.clock.now();
        Ok(self.get_config().await?.today(now))
    }

    async fn require_channel(&self) -> Result<(), CycleError> {
        match self.get_config().await?.channel_id {
            Some(_) => Ok(()),
            None => Err(CycleError::NoChannel),
        }
    }

    async fn update(
        &self,
        apply: impl FnOnce(&mut CycleConfig) -> Result<(), CycleError>,
    ) -> Result<CycleConfig, CycleError> {
        let mut config = self.get_config().await?;
        apply(&mut config)?;
        config.validate()?;
        self.repo.save_config(&config).await?;
        tracing::info!("Cycle config updated: {:?}", config);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::gateway::RecordingSpoke;
    use crate::repository::SqliteRepository;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn admin(now: &str) -> (AdminService, Arc<RecordingSpoke>) {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let spoke = Arc::new(RecordingSpoke::new());
        let scheduler = Arc::new(Scheduler::new(repo.clone(), spoke.clone()));
        let clock = Arc::new(ManualClock::new(at(now)));
        (AdminService::new(repo, scheduler, clock), spoke)
    }

    #[tokio::test]
    async fn test_setters_validate_and_persist() {
        let (admin, _spoke) = admin("2024-05-01T08:00:00Z");
        admin.set_channel("C9").await.unwrap();
        admin.set_schedule(9, 30).await.unwrap();
        admin.set_timezone("America/New_York").await.unwrap();
        admin.set_response_window(5).await.unwrap();

        let cfg = admin.get_config().await.unwrap();
        assert_eq!(cfg.channel_id.as_deref(), Some("C9"));
        assert_eq!((cfg.standup_hour, cfg.standup_minute), (9, 30));
        assert_eq!(cfg.timezone, "America/New_York");
        assert_eq!(cfg.response_window_hours, 5);

        assert!(matches!(admin.set_schedule(24, 0).await, Err(CycleError::InvalidSchedule(_))));
        assert!(matches!(admin.set_timezone("Mars/Base").await, Err(CycleError::UnknownTimezone(_))));
        assert!(admin.set_response_window(0).await.is_err());
        assert!(matches!(admin.set_channel("  ").await, Err(CycleError::NoChannel)));
        assert_eq!(admin.get_config().await.unwrap(), cfg);
    }

    #[tokio::test]
    async fn test_trigger_requires_channel() {
        let (admin, spoke) = admin("2024-05-01T08:00:00Z");
        assert!(matches!(admin.trigger_standup_now().await, Err(CycleError::NoChannel)));

        admin.set_channel("C1").await.unwrap();
        assert!(admin.trigger_standup_now().await.unwrap().standup_sent);
        assert!(!admin.trigger_standup_now().await.unwrap().standup_sent);
        assert_eq!(spoke.count_with_prefix("standup:"), 1);
    }

    #[tokio::test]
    async fn test_skip_today_blocks_standup() {
        let (admin, spoke) = admin("2024-05-01T08:00:00Z");
        admin.set_channel("C1").await.unwrap();
        assert_eq!(admin.skip_today().await.unwrap(), SkipOutcome::Skipped);
        assert_eq!(admin.skip_today().await.unwrap(), SkipOutcome::AlreadyClosed);

        assert!(!admin.trigger_standup_now().await.unwrap().standup_sent);
        assert!(spoke.sent().is_empty());
    }
}
