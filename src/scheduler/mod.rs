//! 站会调度器
//!
//! `tick(now)` 是电平触发的：每次都从存储重新推导"该做什么"，幂等性只看持久化状态，内存里不保留"上次发过"的标记。
//! 一次 tick 内的顺序：读配置 → 关闭过期窗口 → 跟进 → 站会提问。
//! 发送失败时不改状态，下一次 tick 自然重试。

mod prompts;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;

use crate::core::{Clock, CycleError};
use crate::cycle::{Commitment, CommitmentStatus, CycleConfig, CycleStatus, StandupCycle};
use crate::gateway::{ChatSpoke, PostMessage};
use crate::repository::CycleRepository;

pub use prompts::{follow_up_prompt, standup_prompt};

/// 单次 tick 的结果摘要（日志与测试用）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// 因窗口到期关闭的周期
    pub windows_closed: usize,
    /// 从未发出就已过期的周期
    pub missed_cycles_closed: usize,
    pub follow_ups_sent: usize,
    pub follow_ups_failed: usize,
    /// 没有可跟进内容、直接结束的承诺
    pub resolved_without_follow_up: usize,
    pub standup_sent: bool,
    pub standup_failed: bool,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == TickReport::default()
    }
}

/// 跟进预演：将要发出的消息，不发送、不记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUpPreview {
    pub commitment: Commitment,
    pub text: String,
}

/// 站会调度器
pub struct Scheduler {
    repo: Arc<dyn CycleRepository>,
    spoke: Arc<dyn ChatSpoke>,
}

impl Scheduler {
    pub fn new(repo: Arc<dyn CycleRepository>, spoke: Arc<dyn ChatSpoke>) -> Self {
        Self { repo, spoke }
    }

    /// 周期性调用，幂等
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, CycleError> {
        let config = self.load_config().await?;
        let today = config.today(now);
        let mut report = TickReport::default();

        self.close_expired(today, now, &mut report).await?;

        if now >= config.follow_ups_due_at(today) {
            self.send_follow_ups(&config, today, now, &mut report).await?;
        }

        if now >= config.standup_at(today) {
            self.send_standup(&config, today, now, &mut report).await?;
        }

        if !report.is_idle() {
            tracing::info!("Tick at {} ({}): {:?}", now, today, report);
        }
        Ok(report)
    }

    /// 立即发送今天的站会提问（跳过时间检查，保留幂等检查）
    pub async fn trigger_standup_now(&self, now: DateTime<Utc>) -> Result<TickReport, CycleError> {
        let config = self.load_config().await?;
        let today = config.today(now);
        let mut report = TickReport::default();
        self.close_expired(today, now, &mut report).await?;
        self.send_standup(&config, today, now, &mut report).await?;
        Ok(report)
    }

    /// 立即发送到期的跟进（跳过时间检查，保留幂等检查）
    pub async fn trigger_follow_ups_now(&self, now: DateTime<Utc>) -> Result<TickReport, CycleError> {
        let config = self.load_config().await?;
        let today = config.today(now);
        let mut report = TickReport::default();
        self.send_follow_ups(&config, today, now, &mut report).await?;
        Ok(report)
    }

    /// 预演 `date` 当天会发出的跟进
    pub async fn preview_follow_ups(&self, date: NaiveDate) -> Result<Vec<FollowUpPreview>, CycleError> {
        let pending = self.repo.pending_commitments_before(date).await?;
        Ok(pending
            .into_iter()
            .filter(Commitment::has_pledge)
            .map(|commitment| {
                let text = follow_up_prompt(&commitment);
                FollowUpPreview { commitment, text }
            })
            .collect())
    }

    /// 长期运行的 tick 循环，直到 token 取消
    pub async fn run(&self, clock: Arc<dyn Clock>, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!("Scheduler started (tick every {:?})", interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick(clock.now()).await {
                        Ok(_) => {}
                        Err(e) if e.is_retryable() => {
                            tracing::warn!("Tick failed, retrying next tick: {}", e);
                        }
                        Err(e) => tracing::error!("Tick failed: {}", e),
                    }
                }
            }
        }
    }

    async fn load_config(&self) -> Result<CycleConfig, CycleError> {
        Ok(self.repo.load_config().await?.unwrap_or_default())
    }

    /// Sent 且窗口到期 → WindowClosed；早于今天仍是 Scheduled 的 → 作为错过关闭
    async fn close_expired(
        &self,
        today: NaiveDate,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), CycleError> {
        for mut cycle in self.repo.open_cycles().await? {
            if cycle.window_expired_at(now) {
                cycle.status = CycleStatus::WindowClosed;
                self.repo.upsert_cycle(&cycle).await?;
                tracing::info!("Response window closed for {}", cycle.cycle_date);
                report.windows_closed += 1;
            } else if cycle.status == CycleStatus::Scheduled && cycle.cycle_date < today {
                cycle.status = CycleStatus::WindowClosed;
                self.repo.upsert_cycle(&cycle).await?;
                tracing::warn!("Standup for {} was never sent, closing as missed", cycle.cycle_date);
                report.missed_cycles_closed += 1;
            }
        }
        Ok(())
    }

    async fn send_follow_ups(
        &self,
        config: &CycleConfig,
        today: NaiveDate,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), CycleError> {
        let pending = self.repo.pending_commitments_before(today).await?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut channel_warned = false;
        for commitment in pending {
            if !commitment.has_pledge() {
                if self
                    .repo
                    .resolve_commitment_without_follow_up(commitment.id, CommitmentStatus::Unknown)
                    .await?
                {
                    tracing::debug!(
                        "Commitment {} from {} has nothing to follow up, resolved as unknown",
                        commitment.id,
                        commitment.user_id
                    );
                    report.resolved_without_follow_up += 1;
                }
                continue;
            }

            let Some(channel_id) = config.channel_id.as_deref() else {
                if !channel_warned {
                    tracing::warn!("No standup channel configured, skipping follow-ups");
                    channel_warned = true;
                }
                continue;
            };

            let message =
                PostMessage::follow_up(channel_id, commitment.id, follow_up_prompt(&commitment));
            match self.spoke.post_message(&message).await {
                Ok(message_id) => {
                    if self.repo.record_follow_up(commitment.id, now, message_id).await? {
                        tracing::info!(
                            "Sent follow-up to {} for commitment {}",
                            commitment.user_id,
                            commitment.id
                        );
                        report.follow_ups_sent += 1;
                    } else {
                        tracing::warn!("Follow-up for commitment {} already recorded", commitment.id);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to deliver follow-up for commitment {} via {}: {}",
                        commitment.id,
                        self.spoke.name(),
                        e
                    );
                    report.follow_ups_failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn send_standup(
        &self,
        config: &CycleConfig,
        today: NaiveDate,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), CycleError> {
        let mut cycle = match self.repo.get_cycle(today).await? {
            Some(cycle) if cycle.status != CycleStatus::Scheduled => return Ok(()),
            Some(cycle) => cycle,
            None => {
                let cycle = StandupCycle::scheduled(today);
                self.repo.upsert_cycle(&cycle).await?;
                cycle
            }
        };

        let blocking = self
            .repo
            .open_cycles()
            .await?
            .into_iter()
            .find(|c| c.cycle_date != today);
        if let Some(other) = blocking {
            tracing::debug!(
                "Cycle {} still open (closes at {:?}), holding standup for {}",
                other.cycle_date,
                other.window_closes_at,
                today
            );
            return Ok(());
        }

        let Some(channel_id) = config.channel_id.as_deref() else {
            tracing::warn!("No standup channel configured, skipping standup for {}", today);
            return Ok(());
        };

        let message = PostMessage::standup(channel_id, today, standup_prompt(today));
        match self.spoke.post_message(&message).await {
            Ok(message_id) => {
                cycle.mark_sent(message_id, now, config.response_window());
                self.repo.upsert_cycle(&cycle).await?;
                tracing::info!(
                    "Sent standup for {} to channel {}, window closes at {:?}",
                    today,
                    channel_id,
                    cycle.window_closes_at
                );
                report.standup_sent = true;
            }
            Err(e) => {
                tracing::warn!("Failed to deliver standup for {} via {}: {}", today, self.spoke.name(), e);
                report.standup_failed = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::CommitmentDraft;
    use crate::extraction::ExtractionMode;
    use crate::gateway::RecordingSpoke;
    use crate::repository::SqliteRepository;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    async fn setup(channel: Option<&str>) -> (Scheduler, Arc<SqliteRepository>, Arc<RecordingSpoke>) {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let config = CycleConfig {
            channel_id: channel.map(str::to_string),
            ..CycleConfig::default()
        };
        repo.save_config(&config).await.unwrap();
        let spoke = Arc::new(RecordingSpoke::new());
        (Scheduler::new(repo.clone(), spoke.clone()), repo, spoke)
    }

    async fn pending(repo: &SqliteRepository, user: &str, d: u32, tomorrow: &str) -> Commitment {
        repo.upsert_commitment(&CommitmentDraft {
            user_id: user.to_string(),
            username: user.to_string(),
            cycle_date: day(d),
            today_text: "did things".to_string(),
            tomorrow_text: tomorrow.to_string(),
            raw_text: "did things".to_string(),
            source_message_id: format!("{user}-{d}"),
            extraction_mode: ExtractionMode::Pattern,
            received_at: at("2024-05-01T17:10:00Z"),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_nothing_before_standup_time() {
        let (scheduler, _repo, spoke) = setup(Some("C1")).await;
        let report = scheduler.tick(at("2024-05-01T16:59:00Z")).await.unwrap();
        assert!(report.is_idle());
        assert!(spoke.sent().is_empty());
    }

    #[tokio::test]
    async fn test_standup_sent_once_per_day() {
        let (scheduler, repo, spoke) = setup(Some("C1")).await;
        let report = scheduler.tick(at("2024-05-01T17:00:00Z")).await.unwrap();
        assert!(report.standup_sent);
        scheduler.tick(at("2024-05-01T17:00:30Z")).await.unwrap();
        scheduler.tick(at("2024-05-01T18:00:00Z")).await.unwrap();
        assert_eq!(spoke.count_with_prefix("standup:2024-05-01"), 1);

        let cycle = repo.get_cycle(day(1)).await.unwrap().unwrap();
        assert_eq!(cycle.status, CycleStatus::Sent);
        assert_eq!(cycle.window_closes_at, Some(at("2024-05-01T20:00:00Z")));
        assert_eq!(cycle.prompt_message_id.as_deref(), Some("rec-1"));
    }

    #[tokio::test]
    async fn test_window_closes_after_deadline() {
        let (scheduler, repo, _spoke) = setup(Some("C1")).await;
        scheduler.tick(at("2024-05-01T17:00:00Z")).await.unwrap();

        let report = scheduler.tick(at("2024-05-01T20:00:00Z")).await.unwrap();
        assert_eq!(report.windows_closed, 0);
        let report = scheduler.tick(at("2024-05-01T20:00:01Z")).await.unwrap();
        assert_eq!(report.windows_closed, 1);
        let cycle = repo.get_cycle(day(1)).await.unwrap().unwrap();
        assert_eq!(cycle.status, CycleStatus::WindowClosed);
    }

    #[tokio::test]
    async fn test_no_channel_skips_emission_but_closes_windows() {
        let (scheduler, repo, spoke) = setup(None).await;
        let report = scheduler.tick(at("2024-05-01T17:00:00Z")).await.unwrap();
        assert!(!report.standup_sent);
        assert!(spoke.sent().is_empty());
        assert_eq!(repo.get_cycle(day(1)).await.unwrap().unwrap().status, CycleStatus::Scheduled);

        let report = scheduler.tick(at("2024-05-02T09:00:00Z")).await.unwrap();
        assert_eq!(report.missed_cycles_closed, 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_retries_next_tick() {
        let (scheduler, repo, spoke) = setup(Some("C1")).await;
        spoke.set_failing(true);
        let report = scheduler.tick(at("2024-05-01T17:00:00Z")).await.unwrap();
        assert!(report.standup_failed);
        assert_eq!(repo.get_cycle(day(1)).await.unwrap().unwrap().status, CycleStatus::Scheduled);

        spoke.set_failing(false);
        let report = scheduler.tick(at("2024-05-01T17:00:30Z")).await.unwrap();
        assert!(report.standup_sent);
        assert_eq!(spoke.count_with_prefix("standup:"), 1);
    }

    #[tokio::test]
    async fn test_follow_ups_precede_standup() {
        let (scheduler, repo, spoke) = setup(Some("C1")).await;
        pending(&repo, "u1", 1, "will write tests").await;

        scheduler.tick(at("2024-05-02T17:00:00Z")).await.unwrap();
        let sent = spoke.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].correlation_id.starts_with("follow-up:"));
        assert_eq!(sent[1].correlation_id, "standup:2024-05-02");
    }

    #[tokio::test]
    async fn test_follow_up_due_offset_and_idempotent() {
        let (scheduler, repo, spoke) = setup(Some("C1")).await;
        let c = pending(&repo, "u1", 1, "will write tests").await;

        let report = scheduler.tick(at("2024-05-02T16:29:00Z")).await.unwrap();
        assert_eq!(report.follow_ups_sent, 0);

        let report = scheduler.tick(at("2024-05-02T16:30:00Z")).await.unwrap();
        assert_eq!(report.follow_ups_sent, 1);
        let report = scheduler.tick(at("2024-05-02T16:30:00Z")).await.unwrap();
        assert_eq!(report.follow_ups_sent, 0);

        assert_eq!(spoke.count_with_prefix("follow-up:"), 1);
        let stored = repo.get_commitment(c.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommitmentStatus::FollowedUp);
        assert!(repo.follow_up_for(c.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_pledge_resolves_without_emission() {
        let (scheduler, repo, spoke) = setup(Some("C1")).await;
        let c = pending(&repo, "u1", 1, "").await;

        let report = scheduler.tick(at("2024-05-02T16:30:00Z")).await.unwrap();
        assert_eq!(report.resolved_without_follow_up, 1);
        assert_eq!(spoke.count_with_prefix("follow-up:"), 0);
        let stored = repo.get_commitment(c.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommitmentStatus::Unknown);
    }

    #[tokio::test]
    async fn test_failed_follow_up_stays_pending() {
        let (scheduler, repo, spoke) = setup(Some("C1")).await;
        let c = pending(&repo, "u1", 1, "will write tests").await;
        spoke.set_failing(true);

        let report = scheduler.tick(at("2024-05-02T16:30:00Z")).await.unwrap();
        assert_eq!(report.follow_ups_failed, 1);
        let stored = repo.get_commitment(c.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommitmentStatus::Pending);
        assert!(repo.follow_up_for(c.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trigger_standup_bypasses_time_not_idempotency() {
        let (scheduler, _repo, spoke) = setup(Some("C1")).await;
        let report = scheduler.trigger_standup_now(at("2024-05-01T09:00:00Z")).await.unwrap();
        assert!(report.standup_sent);
        let report = scheduler.trigger_standup_now(at("2024-05-01T09:01:00Z")).await.unwrap();
        assert!(!report.standup_sent);
        scheduler.tick(at("2024-05-01T17:00:00Z")).await.unwrap();
        assert_eq!(spoke.count_with_prefix("standup:"), 1);
    }

    #[tokio::test]
    async fn test_preview_sends_nothing() {
        let (scheduler, repo, spoke) = setup(Some("C1")).await;
        let c = pending(&repo, "u1", 1, "will write tests").await;
        pending(&repo, "u2", 1, "").await;

        let preview = scheduler.preview_follow_ups(day(2)).await.unwrap();
        assert_eq!(preview.len(), 1);
        assert_eq!(preview[0].commitment.id, c.id);
        assert!(spoke.sent().is_empty());
        let stored = repo.get_commitment(c.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommitmentStatus::Pending);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (scheduler, _repo, _spoke) = setup(Some("C1")).await;
        let clock: Arc<dyn Clock> = Arc::new(crate::core::ManualClock::new(at("2024-05-01T08:00:00Z")));
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(
            Duration::from_secs(1),
            scheduler.run(clock, Duration::from_millis(10), token),
        )
        .await
        .unwrap();
    }
}
