//! 终端控制台：本地运行时的入站消息源与管理命令
//!
//! 每行输入要么是 `/命令`，要么是 `<user> <text>`（作为站会频道里的一条用户消息）。

use std::sync::Arc;

use chrono::NaiveDate;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::admin::AdminService;
use crate::core::{Clock, CycleError};
use crate::correlator::{ResponseCorrelator, Routed};
use crate::cycle::Commitment;
use crate::gateway::InboundMessage;
use crate::scheduler::{Scheduler, TickReport};

pub const HELP: &str = "\
Commands:
  <user> <text>            post a message as <user> in the standup channel
  /channel <id>            set the standup channel
  /time <HH:MM>            set the daily standup time
  /timezone <IANA name>    set the timezone (e.g. Europe/Berlin)
  /window <hours>          set the response window
  /config                  show the current configuration
  /pending [YYYY-MM-DD]    unresolved commitments for a day (default today)
  /list [YYYY-MM-DD]       all commitments for a day (default today)
  /history <user> [n]      a user's most recent commitments
  /standup                 send today's standup now
  /followups               send due follow-ups now
  /preview [YYYY-MM-DD]    show follow-ups that would go out, without sending
  /skip                    skip today's standup
  /tick                    run one scheduler tick now
  /help                    show this help
  /quit                    exit";

/// 一行控制台输入
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Say { user: String, text: String },
    SetChannel(String),
    SetTime { hour: u32, minute: u32 },
    SetTimezone(String),
    SetWindow(u32),
    ShowConfig,
    Pending(Option<NaiveDate>),
    List(Option<NaiveDate>),
    History { user: String, limit: usize },
    Standup,
    FollowUps,
    Preview(Option<NaiveDate>),
    Skip,
    Tick,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// 解析一行输入；空行返回 Ok(None)
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let Some(rest) = line.strip_prefix('/') else {
            let (user, text) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| "expected `<user> <text>`".to_string())?;
            return Ok(Some(ConsoleCommand::Say {
                user: user.to_string(),
                text: text.trim().to_string(),
            }));
        };

        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let arg = parts.next();
        let cmd = match name {
            "channel" => ConsoleCommand::SetChannel(required(arg, "channel id")?.to_string()),
            "time" => {
                let (hour, minute) = parse_time(required(arg, "HH:MM")?)?;
                ConsoleCommand::SetTime { hour, minute }
            }
            "timezone" | "tz" => ConsoleCommand::SetTimezone(required(arg, "timezone")?.to_string()),
            "window" => ConsoleCommand::SetWindow(
                required(arg, "hours")?
                    .parse()
                    .map_err(|_| "hours must be a number".to_string())?,
            ),
            "config" => ConsoleCommand::ShowConfig,
            "pending" => ConsoleCommand::Pending(arg.map(parse_date).transpose()?),
            "list" => ConsoleCommand::List(arg.map(parse_date).transpose()?),
            "history" => ConsoleCommand::History {
                user: required(arg, "user")?.to_string(),
                limit: match parts.next() {
                    Some(n) => n.parse().map_err(|_| "limit must be a number".to_string())?,
                    None => 10,
                },
            },
            "standup" => ConsoleCommand::Standup,
            "followups" => ConsoleCommand::FollowUps,
            "preview" => ConsoleCommand::Preview(arg.map(parse_date).transpose()?),
            "skip" => ConsoleCommand::Skip,
            "tick" => ConsoleCommand::Tick,
            "help" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => return Err(format!("unknown command /{other}, try /help")),
        };
        Ok(Some(cmd))
    }
}

fn required<'a>(arg: Option<&'a str>, what: &str) -> Result<&'a str, String> {
    arg.ok_or_else(|| format!("missing {what}"))
}

fn parse_time(s: &str) -> Result<(u32, u32), String> {
    let (h, m) = s.split_once(':').unwrap_or((s, "0"));
    let hour = h.parse().map_err(|_| format!("invalid hour: {h}"))?;
    let minute = m.parse().map_err(|_| format!("invalid minute: {m}"))?;
    Ok((hour, minute))
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("invalid date {s}: {e}"))
}

/// 控制台会话
pub struct Console {
    admin: Arc<AdminService>,
    correlator: Arc<ResponseCorrelator>,
    scheduler: Arc<Scheduler>,
    clock: Arc<dyn Clock>,
}

impl Console {
    pub fn new(
        admin: Arc<AdminService>,
        correlator: Arc<ResponseCorrelator>,
        scheduler: Arc<Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            admin,
            correlator,
            scheduler,
            clock,
        }
    }

    /// 读 stdin 直到 EOF、/quit 或 token 取消；返回 true 表示因 /quit 或 EOF 结束
    pub async fn run(&self, token: CancellationToken) -> bool {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("{HELP}");

        loop {
            let line = tokio::select! {
                _ = token.cancelled() => return false,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return true,
                Err(e) => {
                    tracing::warn!("Failed to read console input: {}", e);
                    return true;
                }
            };

            match ConsoleCommand::parse(&line) {
                Ok(None) => {}
                Ok(Some(ConsoleCommand::Quit)) => return true,
                Ok(Some(cmd)) => match self.execute(cmd).await {
                    Ok(out) => println!("{out}"),
                    Err(e) => println!("error: {e}"),
                },
                Err(e) => println!("error: {e}"),
            }
        }
    }

    /// 执行一条命令，返回要展示的文本
    pub async fn execute(&self, cmd: ConsoleCommand) -> Result<String, CycleError> {
        let out = match cmd {
            ConsoleCommand::Say { user, text } => {
                let config = self.admin.get_config().await?;
                let channel_id = config.channel_id.ok_or(CycleError::NoChannel)?;
                let message = InboundMessage {
                    user_id: user.clone(),
                    username: user,
                    channel_id,
                    text,
                    message_id: uuid::Uuid::new_v4().to_string(),
                    timestamp: Some(self.clock.now()),
                    is_bot: false,
                    reply_to: None,
                };
                describe_routed(&self.correlator.on_message(&message).await?)
            }
            ConsoleCommand::SetChannel(id) => format!("{:?}", self.admin.set_channel(&id).await?),
            ConsoleCommand::SetTime { hour, minute } => {
                format!("{:?}", self.admin.set_schedule(hour, minute).await?)
            }
            ConsoleCommand::SetTimezone(tz) => format!("{:?}", self.admin.set_timezone(&tz).await?),
            ConsoleCommand::SetWindow(hours) => {
                format!("{:?}", self.admin.set_response_window(hours).await?)
            }
            ConsoleCommand::ShowConfig => format!("{:?}", self.admin.get_config().await?),
            ConsoleCommand::Pending(date) => {
                let date = self.date_or_today(date).await?;
                describe_commitments(&self.admin.list_pending_commitments(date).await?)
            }
            ConsoleCommand::List(date) => {
                let date = self.date_or_today(date).await?;
                describe_commitments(&self.admin.list_commitments(date).await?)
            }
            ConsoleCommand::History { user, limit } => {
                describe_commitments(&self.admin.user_history(&user, limit).await?)
            }
            ConsoleCommand::Standup => describe_report(&self.admin.trigger_standup_now().await?),
            ConsoleCommand::FollowUps => describe_report(&self.admin.trigger_follow_ups_now().await?),
            ConsoleCommand::Preview(date) => {
                let previews = self.admin.preview_follow_ups(date).await?;
                if previews.is_empty() {
                    "no follow-ups due".to_string()
                } else {
                    previews
                        .iter()
                        .map(|p| format!("-> {} (commitment {})\n{}", p.commitment.user_id, p.commitment.id, p.text))
                        .collect::<Vec<_>>()
                        .join("\n\n")
                }
            }
            ConsoleCommand::Skip => format!("{:?}", self.admin.skip_today().await?),
            ConsoleCommand::Tick => describe_report(&self.scheduler.tick(self.clock.now()).await?),
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Quit => String::new(),
        };
        Ok(out)
    }

    async fn date_or_today(&self, date: Option<NaiveDate>) -> Result<NaiveDate, CycleError> {
        match date {
            Some(date) => Ok(date),
            None => Ok(self.admin.get_config().await?.today(self.clock.now())),
        }
    }
}

fn describe_routed(routed: &Routed) -> String {
    match routed {
        Routed::Commitment(c) => format!(
            "recorded ({}) today: {:?} / tomorrow: {:?}",
            c.extraction_mode, c.today_text, c.tomorrow_text
        ),
        Routed::FollowUpReply {
            commitment_id,
            resolution,
        } => format!("commitment {commitment_id} marked {resolution}"),
        other => format!("ignored ({other:?})"),
    }
}

fn describe_commitments(list: &[Commitment]) -> String {
    if list.is_empty() {
        return "no commitments".to_string();
    }
    list.iter()
        .map(|c| {
            format!(
                "#{} {} {} [{}] today: {:?} / tomorrow: {:?}",
                c.id, c.cycle_date, c.username, c.status, c.today_text, c.tomorrow_text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_report(report: &TickReport) -> String {
    if report.is_idle() {
        "nothing to do".to_string()
    } else {
        format!("{report:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_say() {
        assert_eq!(
            ConsoleCommand::parse("ada Today: x. Tomorrow: y").unwrap(),
            Some(ConsoleCommand::Say {
                user: "ada".into(),
                text: "Today: x. Tomorrow: y".into()
            })
        );
        assert!(ConsoleCommand::parse("ada").is_err());
        assert_eq!(ConsoleCommand::parse("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_admin_commands() {
        assert_eq!(
            ConsoleCommand::parse("/time 9:30").unwrap(),
            Some(ConsoleCommand::SetTime { hour: 9, minute: 30 })
        );
        assert_eq!(
            ConsoleCommand::parse("/history ada").unwrap(),
            Some(ConsoleCommand::History {
                user: "ada".into(),
                limit: 10
            })
        );
        assert_eq!(
            ConsoleCommand::parse("/preview 2024-05-02").unwrap(),
            Some(ConsoleCommand::Preview(NaiveDate::from_ymd_opt(2024, 5, 2)))
        );
        assert!(ConsoleCommand::parse("/window many").is_err());
        assert!(ConsoleCommand::parse("/frobnicate").is_err());
    }
}
