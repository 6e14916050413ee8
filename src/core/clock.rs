//! 时钟与时区换算
//!
//! 调度器唯一的「现在几点」来源。业务判断（今天是哪天、站会时刻）都在配置时区下计算，
//! 存储统一用 UTC。

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::core::CycleError;

/// 时钟抽象：生产用系统时钟，测试用手动时钟
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动推进的时钟（测试与本地演练）
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|e| *e.into_inner())
    }
}

/// 解析 IANA 时区名（如 America/New_York）
pub fn parse_timezone(name: &str) -> Result<Tz, CycleError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| CycleError::UnknownTimezone(name.to_string()))
}

/// 解析时区，未知时退回 UTC；每个未知名称只告警一次
pub fn timezone_or_utc(name: &str) -> Tz {
    parse_timezone(name).unwrap_or_else(|_| {
        if first_sighting(name) {
            tracing::warn!("Unknown timezone '{}', defaulting to UTC", name);
        }
        Tz::UTC
    })
}

/// 该未知时区名是否第一次出现
fn first_sighting(name: &str) -> bool {
    static SEEN: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    let seen = SEEN.get_or_init(|| Mutex::new(HashSet::new()));
    match seen.lock() {
        Ok(mut seen) => seen.insert(name.to_string()),
        Err(_) => false,
    }
}

/// `now` 在时区 `tz` 下的日历日期
pub fn local_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// 某天本地 `hour:minute` 对应的 UTC 时刻
///
/// - 夏令时回拨导致时间重复：取较早的那个
/// - 夏令时前拨导致时间不存在：取间隙之后第一个有效分钟
pub fn local_instant(date: NaiveDate, hour: u32, minute: u32, tz: Tz) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), minute.min(59), 0).unwrap_or(NaiveTime::MIN);
    let mut local = date.and_time(time);
    // 间隙最长不超过几小时，按分钟向后探测
    for _ in 0..(24 * 60) {
        match tz.from_local_datetime(&local) {
            LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => local += Duration::minutes(1),
        }
    }
    Utc.from_utc_datetime(&date.and_time(time))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_local_date_crosses_midnight() {
        let tz = parse_timezone("America/New_York").unwrap();
        // 02:00 UTC 在纽约仍是前一天晚上
        let now = utc("2024-03-05T02:00:00Z");
        assert_eq!(local_date(now, tz), NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
    }

    #[test]
    fn test_local_instant_plain() {
        let tz = parse_timezone("Asia/Shanghai").unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        assert_eq!(local_instant(date, 17, 0, tz), utc("2024-06-01T09:00:00Z"));
    }

    #[test]
    fn test_local_instant_spring_forward_gap() {
        let tz = parse_timezone("America/New_York").unwrap();
        // 2024-03-10 02:30 不存在，落到 03:00 EDT
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(local_instant(date, 2, 30, tz), utc("2024-03-10T07:00:00Z"));
    }

    #[test]
    fn test_local_instant_fall_back_takes_earliest() {
        let tz = parse_timezone("America/New_York").unwrap();
        // 2024-11-03 01:30 出现两次，取 EDT 那次
        let date = NaiveDate::from_ymd_opt(2024, 11, 3).unwrap();
        assert_eq!(local_instant(date, 1, 30, tz), utc("2024-11-03T05:30:00Z"));
    }

    #[test]
    fn test_unknown_timezone() {
        assert!(parse_timezone("Mars/Olympus").is_err());
        assert_eq!(timezone_or_utc("Mars/Olympus"), Tz::UTC);
    }

    #[test]
    fn test_unknown_timezone_warns_once_per_name() {
        assert!(first_sighting("Atlantis/Capital"));
        assert!(!first_sighting("Atlantis/Capital"));
        assert!(first_sighting("Atlantis/Harbor"));
        assert_eq!(timezone_or_utc("Atlantis/Capital"), Tz::UTC);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(utc("2024-01-01T00:00:00Z"));
        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), utc("2024-01-01T01:30:00Z"));
    }
}
