//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `STANDUP__*` 覆盖（双下划线表示嵌套，如 `STANDUP__CYCLE__STANDUP_HOUR=9`）。
//! 这里的 `[cycle]` 段只在首次启动时写入存储；之后以存储中的 CycleConfig 为准（管理命令修改的是存储）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::cycle::{
    CycleConfig, DEFAULT_FOLLOW_UP_OFFSET_MINUTES, DEFAULT_RESPONSE_WINDOW_HOURS,
    DEFAULT_STANDUP_HOUR, DEFAULT_STANDUP_MINUTE,
};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub cycle: CycleSection,
    #[serde(default)]
    pub extraction: ExtractionSection,
    #[serde(default)]
    pub llm: LlmSection,
}

/// [app] 段：数据库位置、tick 间隔
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// 工作区名（日志用）
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// 调度 tick 间隔（秒），分钟级精度即可
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            db_path: default_db_path(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

fn default_workspace() -> String {
    "default".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("standup.db")
}

fn default_tick_interval_secs() -> u64 {
    30
}

/// [cycle] 段：站会时间与窗口（首次启动的种子值）
#[derive(Debug, Clone, Deserialize)]
pub struct CycleSection {
    pub channel_id: Option<String>,
    #[serde(default = "default_standup_hour")]
    pub standup_hour: u32,
    #[serde(default = "default_standup_minute")]
    pub standup_minute: u32,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_follow_up_offset_minutes")]
    pub follow_up_offset_minutes: u32,
    #[serde(default = "default_response_window_hours")]
    pub response_window_hours: u32,
}

impl Default for CycleSection {
    fn default() -> Self {
        Self {
            channel_id: None,
            standup_hour: default_standup_hour(),
            standup_minute: default_standup_minute(),
            timezone: default_timezone(),
            follow_up_offset_minutes: default_follow_up_offset_minutes(),
            response_window_hours: default_response_window_hours(),
        }
    }
}

impl CycleSection {
    /// 转为持久化的 CycleConfig；未知时区退回 UTC
    pub fn to_cycle_config(&self) -> CycleConfig {
        let timezone = match crate::core::clock::parse_timezone(&self.timezone) {
            Ok(tz) => tz.name().to_string(),
            Err(_) => {
                tracing::warn!("Unknown timezone '{}', defaulting to UTC", self.timezone);
                "UTC".to_string()
            }
        };
        CycleConfig {
            channel_id: self.channel_id.clone().filter(|c| !c.trim().is_empty()),
            standup_hour: self.standup_hour,
            standup_minute: self.standup_minute,
            timezone,
            follow_up_offset_minutes: self.follow_up_offset_minutes,
            response_window_hours: self.response_window_hours,
        }
    }
}

fn default_standup_hour() -> u32 {
    DEFAULT_STANDUP_HOUR
}

fn default_standup_minute() -> u32 {
    DEFAULT_STANDUP_MINUTE
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_follow_up_offset_minutes() -> u32 {
    DEFAULT_FOLLOW_UP_OFFSET_MINUTES
}

fn default_response_window_hours() -> u32 {
    DEFAULT_RESPONSE_WINDOW_HOURS
}

/// [extraction] 段：模型抽取开关与超时
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionSection {
    #[serde(default)]
    pub model_enabled: bool,
    #[serde(default = "default_extraction_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExtractionSection {
    fn default() -> Self {
        Self {
            model_enabled: false,
            timeout_secs: default_extraction_timeout_secs(),
        }
    }
}

fn default_extraction_timeout_secs() -> u64 {
    8
}

/// [llm] 段：OpenAI 兼容端点
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读 OPENAI_API_KEY
    pub api_key: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: None,
            api_key: None,
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// 从 config 目录加载配置，环境变量 STANDUP__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 STANDUP__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("STANDUP")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
