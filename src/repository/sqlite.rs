//! SQLite 周期存储
//!
//! 单连接 + 互斥锁：所有读写串行执行（单写者），在 blocking 线程池里跑，不阻塞 tokio 工作线程。
//! 时间统一存为微秒精度的 RFC3339（UTC，定长，可按字符串排序）。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{CycleRepository, RepositoryError};
use crate::cycle::{
    Commitment, CommitmentDraft, CommitmentId, CommitmentStatus, CycleConfig, CycleStatus,
    FollowUpRecord, Resolution, StandupCycle,
};
use crate::extraction::ExtractionMode;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cycle_config (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  channel_id TEXT,
  standup_hour INTEGER NOT NULL,
  standup_minute INTEGER NOT NULL,
  timezone TEXT NOT NULL,
  follow_up_offset_minutes INTEGER NOT NULL,
  response_window_hours INTEGER NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS standup_cycles (
  cycle_date TEXT PRIMARY KEY,
  prompt_message_id TEXT,
  sent_at TEXT,
  window_closes_at TEXT,
  status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cycles_status ON standup_cycles(status);

CREATE TABLE IF NOT EXISTS commitments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id TEXT NOT NULL,
  username TEXT NOT NULL,
  cycle_date TEXT NOT NULL,
  today_text TEXT NOT NULL,
  tomorrow_text TEXT NOT NULL,
  raw_text TEXT NOT NULL,
  source_message_id TEXT NOT NULL,
  extraction_mode TEXT NOT NULL,
  status TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(user_id, cycle_date)
);
CREATE INDEX IF NOT EXISTS idx_commitments_status ON commitments(status, cycle_date);

CREATE TABLE IF NOT EXISTS follow_ups (
  commitment_id INTEGER PRIMARY KEY REFERENCES commitments(id),
  user_id TEXT NOT NULL,
  sent_at TEXT NOT NULL,
  message_id TEXT,
  response_text TEXT,
  resolved_status TEXT,
  responded_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_follow_ups_user ON follow_ups(user_id, sent_at);

CREATE TABLE IF NOT EXISTS processed_messages (
  message_id TEXT PRIMARY KEY,
  processed_at TEXT NOT NULL
);
"#;

const COMMITMENT_COLUMNS: &str = "id, user_id, username, cycle_date, today_text, tomorrow_text, raw_text, \
     source_message_id, extraction_mode, status, updated_at";

const FOLLOW_UP_COLUMNS: &str =
    "commitment_id, user_id, sent_at, message_id, response_text, resolved_status, responded_at";

/// SQLite 实现
#[derive(Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(RepositoryError::CreateDir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RepositoryError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!("Cycle repository initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| RepositoryError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| RepositoryError::Task(e.to_string()))?
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn corrupt(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(RepositoryError::Corrupt(msg)))
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(idx, format!("{raw}: {e}")))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => get_ts(row, idx).map(Some),
        None => Ok(None),
    }
}

fn get_parsed<T: std::str::FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| corrupt(idx, e))
}

fn cycle_from_row(row: &Row<'_>) -> rusqlite::Result<StandupCycle> {
    Ok(StandupCycle {
        cycle_date: row.get(0)?,
        prompt_message_id: row.get(1)?,
        sent_at: get_opt_ts(row, 2)?,
        window_closes_at: get_opt_ts(row, 3)?,
        status: get_parsed::<CycleStatus>(row, 4)?,
    })
}

fn commitment_from_row(row: &Row<'_>) -> rusqlite::Result<Commitment> {
    Ok(Commitment {
        id: row.get(0)?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        cycle_date: row.get(3)?,
        today_text: row.get(4)?,
        tomorrow_text: row.get(5)?,
        raw_text: row.get(6)?,
        source_message_id: row.get(7)?,
        extraction_mode: get_parsed::<ExtractionMode>(row, 8)?,
        status: get_parsed::<CommitmentStatus>(row, 9)?,
        updated_at: get_ts(row, 10)?,
    })
}

fn follow_up_from_row(row: &Row<'_>) -> rusqlite::Result<FollowUpRecord> {
    let resolved_status = match row.get::<_, Option<String>>(5)? {
        Some(raw) => Some(raw.parse::<Resolution>().map_err(|e| corrupt(5, e))?),
        None => None,
    };
    Ok(FollowUpRecord {
        commitment_id: row.get(0)?,
        user_id: row.get(1)?,
        sent_at: get_ts(row, 2)?,
        message_id: row.get(3)?,
        response_text: row.get(4)?,
        resolved_status,
        responded_at: get_opt_ts(row, 6)?,
    })
}

fn select_commitment(
    conn: &Connection,
    user_id: &str,
    date: NaiveDate,
) -> Result<Option<Commitment>, RepositoryError> {
    let sql = format!(
        "SELECT {COMMITMENT_COLUMNS} FROM commitments WHERE user_id = ?1 AND cycle_date = ?2"
    );
    Ok(conn
        .query_row(&sql, params![user_id, date], commitment_from_row)
        .optional()?)
}

fn select_commitments(
    conn: &Connection,
    where_clause: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Commitment>, RepositoryError> {
    let sql = format!("SELECT {COMMITMENT_COLUMNS} FROM commitments {where_clause}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, commitment_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[async_trait]
impl CycleRepository for SqliteRepository {
    async fn load_config(&self) -> Result<Option<CycleConfig>, RepositoryError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT channel_id, standup_hour, standup_minute, timezone, \
                     follow_up_offset_minutes, response_window_hours FROM cycle_config WHERE id = 1",
                    [],
                    |row| {
                        Ok(CycleConfig {
                            channel_id: row.get(0)?,
                            standup_hour: row.get(1)?,
                            standup_minute: row.get(2)?,
                            timezone: row.get(3)?,
                            follow_up_offset_minutes: row.get(4)?,
                            response_window_hours: row.get(5)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn save_config(&self, config: &CycleConfig) -> Result<(), RepositoryError> {
        let config = config.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO cycle_config (id, channel_id, standup_hour, standup_minute, timezone, \
                 follow_up_offset_minutes, response_window_hours, updated_at) \
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(id) DO UPDATE SET channel_id = excluded.channel_id, \
                 standup_hour = excluded.standup_hour, standup_minute = excluded.standup_minute, \
                 timezone = excluded.timezone, follow_up_offset_minutes = excluded.follow_up_offset_minutes, \
                 response_window_hours = excluded.response_window_hours, updated_at = excluded.updated_at",
                params![
                    config.channel_id,
                    config.standup_hour,
                    config.standup_minute,
                    config.timezone,
                    config.follow_up_offset_minutes,
                    config.response_window_hours,
                    ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_cycle(&self, date: NaiveDate) -> Result<Option<StandupCycle>, RepositoryError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT cycle_date, prompt_message_id, sent_at, window_closes_at, status \
                     FROM standup_cycles WHERE cycle_date = ?1",
                    params![date],
                    cycle_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn open_cycles(&self) -> Result<Vec<StandupCycle>, RepositoryError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT cycle_date, prompt_message_id, sent_at, window_closes_at, status \
                 FROM standup_cycles WHERE status != ?1 ORDER BY cycle_date ASC",
            )?;
            let rows = stmt.query_map(params![CycleStatus::WindowClosed.as_str()], cycle_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn upsert_cycle(&self, cycle: &StandupCycle) -> Result<(), RepositoryError> {
        let cycle = cycle.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO standup_cycles (cycle_date, prompt_message_id, sent_at, window_closes_at, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(cycle_date) DO UPDATE SET prompt_message_id = excluded.prompt_message_id, \
                 sent_at = excluded.sent_at, window_closes_at = excluded.window_closes_at, \
                 status = excluded.status",
                params![
                    cycle.cycle_date,
                    cycle.prompt_message_id,
                    cycle.sent_at.map(ts),
                    cycle.window_closes_at.map(ts),
                    cycle.status.as_str(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn upsert_commitment(&self, draft: &CommitmentDraft) -> Result<Commitment, RepositoryError> {
        let draft = draft.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO commitments (user_id, username, cycle_date, today_text, tomorrow_text, \
                 raw_text, source_message_id, extraction_mode, status, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(user_id, cycle_date) DO UPDATE SET username = excluded.username, \
                 today_text = excluded.today_text, tomorrow_text = excluded.tomorrow_text, \
                 raw_text = excluded.raw_text, source_message_id = excluded.source_message_id, \
                 extraction_mode = excluded.extraction_mode, updated_at = excluded.updated_at",
                params![
                    draft.user_id,
                    draft.username,
                    draft.cycle_date,
                    draft.today_text,
                    draft.tomorrow_text,
                    draft.raw_text,
                    draft.source_message_id,
                    draft.extraction_mode.as_str(),
                    CommitmentStatus::Pending.as_str(),
                    ts(draft.received_at),
                ],
            )?;
            select_commitment(conn, &draft.user_id, draft.cycle_date)?.ok_or_else(|| {
                RepositoryError::Corrupt(format!(
                    "commitment for {} on {} vanished after upsert",
                    draft.user_id, draft.cycle_date
                ))
            })
        })
        .await
    }

    async fn get_commitment(&self, id: CommitmentId) -> Result<Option<Commitment>, RepositoryError> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {COMMITMENT_COLUMNS} FROM commitments WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], commitment_from_row).optional()?)
        })
        .await
    }

    async fn commitment_for(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<Commitment>, RepositoryError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| select_commitment(conn, &user_id, date))
            .await
    }

    async fn pending_commitments_before(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<Commitment>, RepositoryError> {
        self.with_conn(move |conn| {
            select_commitments(
                conn,
                "WHERE status = ?1 AND cycle_date < ?2 ORDER BY cycle_date ASC, id ASC",
                params![CommitmentStatus::Pending.as_str(), date],
            )
        })
        .await
    }

    async fn commitments_for_date(&self, date: NaiveDate) -> Result<Vec<Commitment>, RepositoryError> {
        self.with_conn(move |conn| {
            select_commitments(conn, "WHERE cycle_date = ?1 ORDER BY id ASC", params![date])
        })
        .await
    }

    async fn user_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Commitment>, RepositoryError> {
        let user_id = user_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            select_commitments(
                conn,
                "WHERE user_id = ?1 ORDER BY cycle_date DESC LIMIT ?2",
                params![user_id, limit],
            )
        })
        .await
    }

    async fn record_follow_up(
        &self,
        commitment_id: CommitmentId,
        sent_at: DateTime<Utc>,
        message_id: Option<String>,
    ) -> Result<bool, RepositoryError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO follow_ups (commitment_id, user_id, sent_at, message_id) \
                 SELECT id, user_id, ?2, ?3 FROM commitments WHERE id = ?1",
                params![commitment_id, ts(sent_at), message_id],
            )?;
            if inserted == 1 {
                tx.execute(
                    "UPDATE commitments SET status = ?2 WHERE id = ?1 AND status = ?3",
                    params![
                        commitment_id,
                        CommitmentStatus::FollowedUp.as_str(),
                        CommitmentStatus::Pending.as_str(),
                    ],
                )?;
            }
            tx.commit()?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn resolve_commitment_without_follow_up(
        &self,
        commitment_id: CommitmentId,
        status: CommitmentStatus,
    ) -> Result<bool, RepositoryError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE commitments SET status = ?2 WHERE id = ?1 AND status = ?3",
                params![commitment_id, status.as_str(), CommitmentStatus::Pending.as_str()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn open_follow_up_for(
        &self,
        user_id: &str,
    ) -> Result<Option<FollowUpRecord>, RepositoryError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {FOLLOW_UP_COLUMNS} FROM follow_ups \
                 WHERE user_id = ?1 AND response_text IS NULL ORDER BY sent_at DESC LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![user_id], follow_up_from_row)
                .optional()?)
        })
        .await
    }

    async fn follow_up_for(
        &self,
        commitment_id: CommitmentId,
    ) -> Result<Option<FollowUpRecord>, RepositoryError> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {FOLLOW_UP_COLUMNS} FROM follow_ups WHERE commitment_id = ?1");
            Ok(conn
                .query_row(&sql, params![commitment_id], follow_up_from_row)
                .optional()?)
        })
        .await
    }

    async fn resolve_follow_up(
        &self,
        commitment_id: CommitmentId,
        response_text: &str,
        resolution: Resolution,
        responded_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let response_text = response_text.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE follow_ups SET response_text = ?2, resolved_status = ?3, responded_at = ?4 \
                 WHERE commitment_id = ?1 AND response_text IS NULL",
                params![commitment_id, response_text, resolution.as_str(), ts(responded_at)],
            )?;
            if updated == 1 {
                tx.execute(
                    "UPDATE commitments SET status = ?2 WHERE id = ?1",
                    params![commitment_id, CommitmentStatus::from(resolution).as_str()],
                )?;
            }
            tx.commit()?;
            Ok(updated == 1)
        })
        .await
    }

    async fn is_message_processed(&self, message_id: &str) -> Result<bool, RepositoryError> {
        let message_id = message_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM processed_messages WHERE message_id = ?1",
                    params![message_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })
        .await
    }

    async fn mark_message_processed(
        &self,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let message_id = message_id.to_string();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO processed_messages (message_id, processed_at) VALUES (?1, ?2)",
                params![message_id, ts(at)],
            )?;
            Ok(inserted == 1)
        })
        .await
    }
}
