//! 回复关联器
//!
//! 把入站消息对到当前打开的回复窗口，抽取承诺并写入存储；窗口外的消息若能对上未回复的跟进，则作为跟进回复分类。
//! 只写存储，不发消息。

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::CycleError;
use crate::cycle::{Commitment, CommitmentDraft, CycleStatus, FollowUpRecord, Resolution, StandupCycle};
use crate::extraction::FallbackExtractor;
use crate::gateway::InboundMessage;
use crate::repository::CycleRepository;

/// 入站消息的去向
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// 写入（或覆盖）了站会承诺
    Commitment(Commitment),
    /// 记录了跟进回复
    FollowUpReply {
        commitment_id: i64,
        resolution: Resolution,
    },
    /// 丢弃：畸形事件
    Malformed,
    /// 丢弃：机器人消息
    FromBot,
    /// 丢弃：非站会频道
    OtherChannel,
    /// 丢弃：重复投递
    Duplicate,
    /// 丢弃：回复的不是站会提问
    UnrelatedReply,
    /// 忽略：没有打开的窗口，也没有待回复的跟进
    Ignored,
}

/// 回复关联器
pub struct ResponseCorrelator {
    repo: Arc<dyn CycleRepository>,
    extractor: Arc<FallbackExtractor>,
}

impl ResponseCorrelator {
    pub fn new(repo: Arc<dyn CycleRepository>, extractor: Arc<FallbackExtractor>) -> Self {
        Self { repo, extractor }
    }

    /// 原始消息流入口：过滤、去重、路由
    pub async fn on_message(&self, message: &InboundMessage) -> Result<Routed, CycleError> {
        let received_at = match message.validate() {
            Ok(at) => at,
            Err(e) => {
                tracing::warn!("Dropping inbound event: {}", e);
                return Ok(Routed::Malformed);
            }
        };
        if message.is_bot {
            return Ok(Routed::FromBot);
        }

        let config = self.repo.load_config().await?.unwrap_or_default();
        if config.channel_id.as_deref() != Some(message.channel_id.as_str()) {
            return Ok(Routed::OtherChannel);
        }

        let cycle = self.repo.latest_open_cycle().await?;
        let answers_follow_up = match message.reply_to.as_deref() {
            Some(reply_to) => self.replies_to_follow_up(&message.user_id, reply_to).await?,
            None => false,
        };
        if let (Some(reply_to), Some(cycle)) = (message.reply_to.as_deref(), cycle.as_ref()) {
            if cycle.prompt_message_id.as_deref().is_some_and(|prompt| prompt != reply_to)
                && !answers_follow_up
            {
                tracing::debug!(
                    "Message {} replies to {}, not the standup prompt",
                    message.message_id,
                    reply_to
                );
                return Ok(Routed::UnrelatedReply);
            }
        }

        if self.repo.is_message_processed(&message.message_id).await? {
            tracing::debug!("Duplicate delivery of message {}", message.message_id);
            return Ok(Routed::Duplicate);
        }

        let routed = self
            .route(message, cycle.as_ref(), answers_follow_up, received_at)
            .await?;

        // 处理成功后才记录；处理失败的消息重投时会再处理一次
        if !self
            .repo
            .mark_message_processed(&message.message_id, received_at)
            .await?
        {
            tracing::debug!("Message {} was processed concurrently", message.message_id);
        }
        Ok(routed)
    }

    /// 显式回复跟进消息的走跟进路径；其余消息窗口打开时记为承诺，否则尝试作为跟进回复
    async fn route(
        &self,
        message: &InboundMessage,
        cycle: Option<&StandupCycle>,
        answers_follow_up: bool,
        received_at: DateTime<Utc>,
    ) -> Result<Routed, CycleError> {
        if !answers_follow_up && cycle.is_some_and(|c| c.accepts_reply_at(received_at)) {
            let stored = self
                .handle_message(
                    &message.user_id,
                    message.display_name(),
                    &message.text,
                    &message.message_id,
                    received_at,
                )
                .await?;
            return Ok(stored.map_or(Routed::Ignored, Routed::Commitment));
        }

        match self
            .handle_follow_up_reply(&message.user_id, &message.text, received_at)
            .await?
        {
            Some(record) => Ok(Routed::FollowUpReply {
                commitment_id: record.commitment_id,
                resolution: record.resolved_status.unwrap_or(Resolution::Unknown),
            }),
            None => {
                log_near_miss(cycle, &message.user_id, received_at);
                Ok(Routed::Ignored)
            }
        }
    }

    /// 窗口内的站会回复 → 承诺（后写者胜）；窗口外返回 None，不产生任何副作用
    pub async fn handle_message(
        &self,
        user_id: &str,
        username: &str,
        text: &str,
        message_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Option<Commitment>, CycleError> {
        let Some(cycle) = self.repo.latest_open_cycle().await? else {
            return Ok(None);
        };
        if !cycle.accepts_reply_at(received_at) {
            log_near_miss(Some(&cycle), user_id, received_at);
            return Ok(None);
        }

        let extraction = self.extractor.extract(text).await;
        let (today_text, tomorrow_text) = extraction.texts();
        tracing::debug!(
            "Extracted {} commitment from {} ({:?})",
            extraction.mode(),
            user_id,
            extraction
        );

        let draft = CommitmentDraft {
            user_id: user_id.to_string(),
            username: username.to_string(),
            cycle_date: cycle.cycle_date,
            today_text: today_text.to_string(),
            tomorrow_text: tomorrow_text.to_string(),
            raw_text: text.to_string(),
            source_message_id: message_id.to_string(),
            extraction_mode: extraction.mode(),
            received_at,
        };
        if let Some(previous) = self.repo.commitment_for(user_id, cycle.cycle_date).await? {
            tracing::debug!(
                "Reply {} from {} replaces commitment {} (source {})",
                message_id,
                user_id,
                previous.id,
                previous.source_message_id
            );
        }
        let commitment = self.repo.upsert_commitment(&draft).await?;
        tracing::info!(
            "Recorded {} commitment {} for {} on {}",
            commitment.extraction_mode,
            commitment.id,
            user_id,
            commitment.cycle_date
        );
        Ok(Some(commitment))
    }

    /// 跟进回复：保存回复并分类，同步承诺状态；用户没有待回复的跟进时返回 None
    pub async fn handle_follow_up_reply(
        &self,
        user_id: &str,
        text: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Option<FollowUpRecord>, CycleError> {
        let Some(record) = self.repo.open_follow_up_for(user_id).await? else {
            return Ok(None);
        };

        let resolution = self.extractor.classify(text).await;
        if !self
            .repo
            .resolve_follow_up(record.commitment_id, text, resolution, received_at)
            .await?
        {
            tracing::debug!("Follow-up {} was answered concurrently", record.commitment_id);
            return Ok(None);
        }
        tracing::info!(
            "Commitment {} from {} resolved as {}",
            record.commitment_id,
            user_id,
            resolution
        );

        Ok(self.repo.follow_up_for(record.commitment_id).await?)
    }

    async fn replies_to_follow_up(&self, user_id: &str, reply_to: &str) -> Result<bool, CycleError> {
        Ok(self
            .repo
            .open_follow_up_for(user_id)
            .await?
            .and_then(|r| r.message_id)
            .is_some_and(|id| id == reply_to))
    }
}

fn log_near_miss(cycle: Option<&StandupCycle>, user_id: &str, received_at: DateTime<Utc>) {
    match cycle {
        Some(c) if c.status == CycleStatus::Sent => {
            if let Some(closes) = c.window_closes_at.filter(|closes| received_at > *closes) {
                tracing::info!(
                    "Late reply from {} for {}: window closed at {}, received {}",
                    user_id,
                    c.cycle_date,
                    closes,
                    received_at
                );
            }
        }
        _ => tracing::debug!("No open standup window for message from {}", user_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::cycle::{CommitmentId, CommitmentStatus, CycleConfig};
    use crate::extraction::ExtractionMode;
    use crate::repository::{RepositoryError, SqliteRepository};
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    async fn setup() -> (ResponseCorrelator, Arc<SqliteRepository>) {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        repo.save_config(&CycleConfig {
            channel_id: Some("C1".into()),
            ..CycleConfig::default()
        })
        .await
        .unwrap();
        let mut cycle = StandupCycle::scheduled(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        cycle.mark_sent(Some("prompt-1".into()), at("2024-05-01T17:00:00Z"), Duration::hours(3));
        repo.upsert_cycle(&cycle).await.unwrap();
        let correlator =
            ResponseCorrelator::new(repo.clone(), Arc::new(FallbackExtractor::pattern_only()));
        (correlator, repo)
    }

    fn inbound(id: &str, text: &str, at_str: &str) -> InboundMessage {
        InboundMessage {
            user_id: "u1".into(),
            username: "ada".into(),
            channel_id: "C1".into(),
            text: text.into(),
            message_id: id.into(),
            timestamp: Some(at(at_str)),
            is_bot: false,
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn test_window_boundary() {
        let (correlator, _repo) = setup().await;
        let closes = at("2024-05-01T20:00:00Z");
        let text = "Today: fixed the login bug. Tomorrow: will write tests.";

        let on_time = correlator
            .handle_message("u1", "ada", text, "m1", closes)
            .await
            .unwrap();
        assert!(on_time.is_some());

        let late = correlator
            .handle_message("u2", "bob", text, "m2", closes + Duration::microseconds(1))
            .await
            .unwrap();
        assert!(late.is_none());
    }

    #[tokio::test]
    async fn test_extracted_texts_are_stored() {
        let (correlator, _repo) = setup().await;
        let c = correlator
            .handle_message(
                "u1",
                "ada",
                "Today: fixed the login bug. Tomorrow: will write tests.",
                "m1",
                at("2024-05-01T17:05:00Z"),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.today_text, "fixed the login bug.");
        assert_eq!(c.tomorrow_text, "will write tests.");
        assert_eq!(c.extraction_mode, ExtractionMode::Pattern);
        assert_eq!(c.status, CommitmentStatus::Pending);
    }

    #[tokio::test]
    async fn test_unparsed_keeps_raw_text() {
        let (correlator, _repo) = setup().await;
        let c = correlator
            .handle_message("u1", "ada", "busy today, will update later", "m1", at("2024-05-01T17:05:00Z"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.extraction_mode, ExtractionMode::Unparsed);
        assert_eq!(c.raw_text, "busy today, will update later");
        assert!(!c.has_pledge());
    }

    #[tokio::test]
    async fn test_on_message_filters() {
        let (correlator, _repo) = setup().await;
        let ok_at = "2024-05-01T17:05:00Z";

        let mut bot = inbound("b1", "Today: x. Tomorrow: y z", ok_at);
        bot.is_bot = true;
        assert_eq!(correlator.on_message(&bot).await.unwrap(), Routed::FromBot);

        let mut elsewhere = inbound("e1", "Today: x. Tomorrow: y z", ok_at);
        elsewhere.channel_id = "C2".into();
        assert_eq!(correlator.on_message(&elsewhere).await.unwrap(), Routed::OtherChannel);

        let mut malformed = inbound("x1", "hi", ok_at);
        malformed.timestamp = None;
        assert_eq!(correlator.on_message(&malformed).await.unwrap(), Routed::Malformed);

        let mut unrelated = inbound("r1", "lol", ok_at);
        unrelated.reply_to = Some("some-other-message".into());
        assert_eq!(correlator.on_message(&unrelated).await.unwrap(), Routed::UnrelatedReply);
    }

    #[tokio::test]
    async fn test_on_message_dedupes() {
        let (correlator, _repo) = setup().await;
        let mut m = inbound("m1", "Today: fixed CI. Tomorrow: will write docs.", "2024-05-01T17:05:00Z");
        m.reply_to = Some("prompt-1".into());
        assert!(matches!(correlator.on_message(&m).await.unwrap(), Routed::Commitment(_)));
        assert_eq!(correlator.on_message(&m).await.unwrap(), Routed::Duplicate);
    }

    #[tokio::test]
    async fn test_follow_up_reply_resolves_commitment() {
        let (correlator, repo) = setup().await;
        let c = correlator
            .handle_message(
                "u1",
                "ada",
                "Today: fixed CI. Tomorrow: will write docs.",
                "m1",
                at("2024-05-01T17:05:00Z"),
            )
            .await
            .unwrap()
            .unwrap();
        repo.record_follow_up(c.id, at("2024-05-02T16:30:00Z"), Some("f-1".into()))
            .await
            .unwrap();

        // 窗口已关闭，走跟进路径
        let mut reply = inbound("m2", "yes, done ✅", "2024-05-02T16:45:00Z");
        reply.reply_to = Some("f-1".into());
        let routed = correlator.on_message(&reply).await.unwrap();
        assert_eq!(
            routed,
            Routed::FollowUpReply {
                commitment_id: c.id,
                resolution: Resolution::Completed
            }
        );
        let stored = repo.get_commitment(c.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommitmentStatus::Completed);

        let again = inbound("m3", "no wait", "2024-05-02T16:50:00Z");
        assert_eq!(correlator.on_message(&again).await.unwrap(), Routed::Ignored);
    }

    #[tokio::test]
    async fn test_follow_up_thread_reply_wins_over_open_window() {
        let (correlator, repo) = setup().await;
        // 前一天的承诺，跟进在今天的窗口打开前发出
        let previous = repo
            .upsert_commitment(&CommitmentDraft {
                user_id: "u1".into(),
                username: "ada".into(),
                cycle_date: NaiveDate::from_ymd_opt(2024, 4, 30).unwrap(),
                today_text: "fixed CI.".into(),
                tomorrow_text: "will write docs.".into(),
                raw_text: "Today: fixed CI. Tomorrow: will write docs.".into(),
                source_message_id: "m0".into(),
                extraction_mode: ExtractionMode::Pattern,
                received_at: at("2024-04-30T17:05:00Z"),
            })
            .await
            .unwrap();
        repo.record_follow_up(previous.id, at("2024-05-01T16:30:00Z"), Some("f-1".into()))
            .await
            .unwrap();

        let mut reply = inbound("m1", "yes, done ✅", "2024-05-01T17:10:00Z");
        reply.reply_to = Some("f-1".into());
        assert_eq!(
            correlator.on_message(&reply).await.unwrap(),
            Routed::FollowUpReply {
                commitment_id: previous.id,
                resolution: Resolution::Completed
            }
        );
        assert!(repo
            .commitments_for_date(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap())
            .await
            .unwrap()
            .is_empty());

        // 不在跟进线程里的消息仍然是今天的站会回复
        let standup = inbound("m2", "Today: wrote docs. Tomorrow: will ship v2.", "2024-05-01T17:20:00Z");
        let Routed::Commitment(c) = correlator.on_message(&standup).await.unwrap() else {
            panic!("expected a commitment");
        };
        assert_eq!(c.cycle_date, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
    }

    /// 可切换为写承诺失败的存储
    struct FlakyRepository {
        inner: SqliteRepository,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl CycleRepository for FlakyRepository {
        async fn load_config(&self) -> Result<Option<CycleConfig>, RepositoryError> {
            self.inner.load_config().await
        }
        async fn save_config(&self, config: &CycleConfig) -> Result<(), RepositoryError> {
            self.inner.save_config(config).await
        }
        async fn get_cycle(&self, date: NaiveDate) -> Result<Option<StandupCycle>, RepositoryError> {
            self.inner.get_cycle(date).await
        }
        async fn open_cycles(&self) -> Result<Vec<StandupCycle>, RepositoryError> {
            self.inner.open_cycles().await
        }
        async fn upsert_cycle(&self, cycle: &StandupCycle) -> Result<(), RepositoryError> {
            self.inner.upsert_cycle(cycle).await
        }
        async fn upsert_commitment(&self, draft: &CommitmentDraft) -> Result<Commitment, RepositoryError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(RepositoryError::Task("disk full".into()));
            }
            self.inner.upsert_commitment(draft).await
        }
        async fn get_commitment(&self, id: CommitmentId) -> Result<Option<Commitment>, RepositoryError> {
            self.inner.get_commitment(id).await
        }
        async fn commitment_for(
            &self,
            user_id: &str,
            date: NaiveDate,
        ) -> Result<Option<Commitment>, RepositoryError> {
            self.inner.commitment_for(user_id, date).await
        }
        async fn pending_commitments_before(
            &self,
            date: NaiveDate,
        ) -> Result<Vec<Commitment>, RepositoryError> {
            self.inner.pending_commitments_before(date).await
        }
        async fn commitments_for_date(&self, date: NaiveDate) -> Result<Vec<Commitment>, RepositoryError> {
            self.inner.commitments_for_date(date).await
        }
        async fn user_history(
            &self,
            user_id: &str,
            limit: usize,
        ) -> Result<Vec<Commitment>, RepositoryError> {
            self.inner.user_history(user_id, limit).await
        }
        async fn record_follow_up(
            &self,
            commitment_id: CommitmentId,
            sent_at: DateTime<Utc>,
            message_id: Option<String>,
        ) -> Result<bool, RepositoryError> {
            self.inner.record_follow_up(commitment_id, sent_at, message_id).await
        }
        async fn resolve_commitment_without_follow_up(
            &self,
            commitment_id: CommitmentId,
            status: CommitmentStatus,
        ) -> Result<bool, RepositoryError> {
            self.inner
                .resolve_commitment_without_follow_up(commitment_id, status)
                .await
        }
        async fn open_follow_up_for(
            &self,
            user_id: &str,
        ) -> Result<Option<FollowUpRecord>, RepositoryError> {
            self.inner.open_follow_up_for(user_id).await
        }
        async fn follow_up_for(
            &self,
            commitment_id: CommitmentId,
        ) -> Result<Option<FollowUpRecord>, RepositoryError> {
            self.inner.follow_up_for(commitment_id).await
        }
        async fn resolve_follow_up(
            &self,
            commitment_id: CommitmentId,
            response_text: &str,
            resolution: Resolution,
            responded_at: DateTime<Utc>,
        ) -> Result<bool, RepositoryError> {
            self.inner
                .resolve_follow_up(commitment_id, response_text, resolution, responded_at)
                .await
        }
        async fn is_message_processed(&self, message_id: &str) -> Result<bool, RepositoryError> {
            self.inner.is_message_processed(message_id).await
        }
        async fn mark_message_processed(
            &self,
            message_id: &str,
            at: DateTime<Utc>,
        ) -> Result<bool, RepositoryError> {
            self.inner.mark_message_processed(message_id, at).await
        }
    }

    #[tokio::test]
    async fn test_redelivery_after_failed_write_is_processed() {
        let inner = SqliteRepository::open_in_memory().unwrap();
        inner
            .save_config(&CycleConfig {
                channel_id: Some("C1".into()),
                ..CycleConfig::default()
            })
            .await
            .unwrap();
        let mut cycle = StandupCycle::scheduled(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        cycle.mark_sent(Some("prompt-1".into()), at("2024-05-01T17:00:00Z"), Duration::hours(3));
        inner.upsert_cycle(&cycle).await.unwrap();
        let repo = Arc::new(FlakyRepository {
            inner,
            fail_writes: AtomicBool::new(true),
        });
        let correlator =
            ResponseCorrelator::new(repo.clone(), Arc::new(FallbackExtractor::pattern_only()));

        let m = inbound("m1", "Today: fixed CI. Tomorrow: will write docs.", "2024-05-01T17:05:00Z");
        assert!(matches!(
            correlator.on_message(&m).await,
            Err(CycleError::RepositoryUnavailable(_))
        ));
        assert!(!repo.is_message_processed("m1").await.unwrap());

        repo.fail_writes.store(false, Ordering::SeqCst);
        assert!(matches!(correlator.on_message(&m).await.unwrap(), Routed::Commitment(_)));
        assert_eq!(correlator.on_message(&m).await.unwrap(), Routed::Duplicate);
    }
}
