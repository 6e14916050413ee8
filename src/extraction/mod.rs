//! 承诺抽取引擎
//!
//! 站会回复（自由文本）→ 结构化承诺 `{today, tomorrow}` 或 `Unparsed`。
//!
//! - **pattern**：确定性模式匹配，零外部依赖，永远可用
//! - **model**：调用 LLM 按固定指令返回 JSON，可能超时或输出格式错误
//! - **fallback**：带超时的装饰器，模型失败/超时/未启用时同步退回模式匹配，调用方永远拿到结果
//! - **classify**：跟进回复的三元分类（完成 / 未完成 / 不确定）

pub mod classify;
pub mod fallback;
pub mod model;
pub mod pattern;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cycle::Resolution;

pub use classify::classify_by_cues;
pub use fallback::FallbackExtractor;
pub use model::ModelExtractor;
pub use pattern::PatternExtractor;

/// 实际产出结果的策略（审计用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtractionMode {
    Pattern,
    Model,
    Unparsed,
}

impl ExtractionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMode::Pattern => "pattern",
            ExtractionMode::Model => "model",
            ExtractionMode::Unparsed => "unparsed",
        }
    }
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pattern" => Ok(ExtractionMode::Pattern),
            "model" => Ok(ExtractionMode::Model),
            "unparsed" => Ok(ExtractionMode::Unparsed),
            other => Err(format!("unknown extraction mode: {other}")),
        }
    }
}

/// 抽取出的两段文本（保留原文大小写）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredCommitment {
    pub today_text: String,
    pub tomorrow_text: String,
    /// 0.0 ~ 1.0
    pub confidence: f32,
    /// Pattern 或 Model
    pub mode: ExtractionMode,
}

/// 抽取结果：要么结构化，要么明确标记无法解析（原文保留）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Extraction {
    Structured(StructuredCommitment),
    Unparsed { raw_text: String },
}

impl Extraction {
    pub fn mode(&self) -> ExtractionMode {
        match self {
            Extraction::Structured(s) => s.mode,
            Extraction::Unparsed { .. } => ExtractionMode::Unparsed,
        }
    }

    /// 落库用的 (today_text, tomorrow_text)：Unparsed 时原文进 today，tomorrow 为空
    pub fn texts(&self) -> (&str, &str) {
        match self {
            Extraction::Structured(s) => (&s.today_text, &s.tomorrow_text),
            Extraction::Unparsed { raw_text } => (raw_text, ""),
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Extraction::Structured(_))
    }
}

/// 抽取层内部错误，不会越过 FallbackExtractor
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model call failed: {0}")]
    Model(String),

    #[error("Malformed model output: {0}")]
    MalformedOutput(String),
}

/// 抽取策略：模式匹配与模型两种实现
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    /// 策略名（日志用）
    fn name(&self) -> &'static str;

    /// 回复 → 承诺
    async fn extract(&self, text: &str) -> Result<Extraction, ExtractionError>;

    /// 跟进回复 → 完成情况
    async fn classify(&self, text: &str) -> Result<Resolution, ExtractionError>;
}
