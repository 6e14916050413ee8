//! 模型抽取：用固定指令让 LLM 返回严格 JSON
//!
//! 任何不合格输出（非 JSON、字段缺失、字段为 null/空串）都视为失败，由 FallbackExtractor 降级。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Extraction, ExtractionError, ExtractionMode, ExtractionStrategy, StructuredCommitment};
use crate::cycle::Resolution;
use crate::llm::{LlmClient, Message};

const EXTRACT_SYSTEM_PROMPT: &str = "You extract structured information from team standup messages. \
Respond with a single JSON object and nothing else.";

const EXTRACT_INSTRUCTION: &str = "Parse the standup message below and extract:
1. what the author worked on today
2. what the author commits to work on tomorrow

Respond exactly in this JSON form:
{\"today\": \"<today's work or null>\", \"tomorrow\": \"<tomorrow's commitment or null>\"}

Only extract clear statements. If something is vague, use null. Keep the author's wording.

Message:
";

const CLASSIFY_SYSTEM_PROMPT: &str = "You judge whether a teammate completed yesterday's commitment. \
Answer with exactly one word: completed, incomplete, or unknown.";

/// 模型抽取的置信度（模型不给分数，取固定值）
const MODEL_CONFIDENCE: f32 = 0.8;

#[derive(Debug, Deserialize)]
struct ModelReply {
    today: Option<String>,
    tomorrow: Option<String>,
}

/// LLM 抽取策略
pub struct ModelExtractor {
    llm: Arc<dyn LlmClient>,
}

impl ModelExtractor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ExtractionStrategy for ModelExtractor {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn extract(&self, text: &str) -> Result<Extraction, ExtractionError> {
        let messages = [
            Message::system(EXTRACT_SYSTEM_PROMPT),
            Message::user(format!("{EXTRACT_INSTRUCTION}\"{text}\"")),
        ];
        let raw = self
            .llm
            .complete(&messages)
            .await
            .map_err(ExtractionError::Model)?;
        let (today_text, tomorrow_text) = parse_model_reply(&raw)?;
        Ok(Extraction::Structured(StructuredCommitment {
            today_text,
            tomorrow_text,
            confidence: MODEL_CONFIDENCE,
            mode: ExtractionMode::Model,
        }))
    }

    async fn classify(&self, text: &str) -> Result<Resolution, ExtractionError> {
        let messages = [
            Message::system(CLASSIFY_SYSTEM_PROMPT),
            Message::user(format!("Reply: \"{text}\"")),
        ];
        let raw = self
            .llm
            .complete(&messages)
            .await
            .map_err(ExtractionError::Model)?;
        let word = raw
            .trim()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        word.parse::<Resolution>()
            .map_err(|_| ExtractionError::MalformedOutput(raw.clone()))
    }
}

/// 解析模型 JSON（容忍 ```json 代码块与前后多余文字）
pub(crate) fn parse_model_reply(raw: &str) -> Result<(String, String), ExtractionError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &raw[s..=e],
        _ => return Err(ExtractionError::MalformedOutput(raw.to_string())),
    };

    let reply: ModelReply = serde_json::from_str(json)
        .map_err(|e| ExtractionError::MalformedOutput(format!("{e}: {raw}")))?;

    let today = non_null(reply.today);
    let tomorrow = non_null(reply.tomorrow);
    match (today, tomorrow) {
        (Some(t), Some(m)) => Ok((t, m)),
        _ => Err(ExtractionError::MalformedOutput(format!(
            "missing today/tomorrow field: {raw}"
        ))),
    }
}

fn non_null(field: Option<String>) -> Option<String> {
    field
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
}
