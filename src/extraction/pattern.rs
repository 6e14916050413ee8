//! 确定性模式匹配抽取
//!
//! 1. 先找显式标记，按标记边界切分：
//!    - 今日：`today:` / `yesterday:` / `did:` / `worked on:`，以及 `today I worked on`、`today I`、行首的 `worked on`
//!    - 明日：`tomorrow:` / `will work on:` / `next:`，单词 tomorrow，以及 `plan to` / `will work on` / `going to`
//! 2. 没有标记时按第一个句子边界（句号、换行、but / however）切成两半，
//!    后半句带前瞻性提示词（will / plan / next / going to）才认定为明日计划
//! 3. 都不满足则 `Unparsed`，原文保留，绝不编造结构
//!
//! 匹配全部用大小写不敏感的正则直接作用于原文，输出保留原始大小写。

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use super::{Extraction, ExtractionError, ExtractionMode, ExtractionStrategy, StructuredCommitment};
use crate::cycle::Resolution;
use crate::extraction::classify_by_cues;

/// 少于该字符数的片段视为无意义
const MIN_SEGMENT_CHARS: usize = 3;

const CONFIDENCE_BOTH_MARKERS: f32 = 0.9;
const CONFIDENCE_TOMORROW_MARKER: f32 = 0.7;
const CONFIDENCE_SENTENCE_SPLIT: f32 = 0.5;

static TODAY_LABEL_RE: OnceLock<Regex> = OnceLock::new();
static TODAY_VERB_LABEL_RE: OnceLock<Regex> = OnceLock::new();
static TODAY_FIRST_PERSON_RE: OnceLock<Regex> = OnceLock::new();
static TODAY_LEAD_RE: OnceLock<Regex> = OnceLock::new();
static WORKED_ON_LEAD_RE: OnceLock<Regex> = OnceLock::new();
static TOMORROW_LABEL_RE: OnceLock<Regex> = OnceLock::new();
static TOMORROW_WORD_RE: OnceLock<Regex> = OnceLock::new();
static TOMORROW_CUE_RE: OnceLock<Regex> = OnceLock::new();
static BOUNDARY_RE: OnceLock<Regex> = OnceLock::new();
static FORWARD_CUE_RE: OnceLock<Regex> = OnceLock::new();
static TRAILING_CONJ_RE: OnceLock<Regex> = OnceLock::new();

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap())
}

/// 标记位置；keep_phrase 为 true 时标记本身属于明日片段（如 "plan to ..."）
#[derive(Debug, Clone, Copy)]
struct Marker {
    start: usize,
    end: usize,
    keep_phrase: bool,
}

/// 模式匹配抽取器（无状态）
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternExtractor;

impl PatternExtractor {
    pub fn new() -> Self {
        Self
    }

    /// 纯函数：文本 → 抽取结果
    pub fn extract(&self, text: &str) -> Extraction {
        // 找到标记就以标记为准，不再退回句子切分
        let structured = match split_at_markers(text) {
            MarkerSplit::Found(result) => result,
            MarkerSplit::Absent => split_at_sentence(text, 0),
        };
        match structured {
            Some((today, tomorrow, confidence)) => {
                tracing::debug!(confidence, "Pattern extraction succeeded");
                Extraction::Structured(StructuredCommitment {
                    today_text: today,
                    tomorrow_text: tomorrow,
                    confidence,
                    mode: ExtractionMode::Pattern,
                })
            }
            None => {
                tracing::debug!("Pattern extraction found no structure");
                Extraction::Unparsed {
                    raw_text: text.trim().to_string(),
                }
            }
        }
    }
}

#[async_trait]
impl ExtractionStrategy for PatternExtractor {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn extract(&self, text: &str) -> Result<Extraction, ExtractionError> {
        Ok(PatternExtractor::extract(self, text))
    }

    async fn classify(&self, text: &str) -> Result<Resolution, ExtractionError> {
        Ok(classify_by_cues(text))
    }
}

/// 按优先级找今日标记：带冒号的标签，其次 "today I ..."，最后是行首的 today / worked on
fn find_today_marker(text: &str) -> Option<Marker> {
    let candidates = [
        re(&TODAY_LABEL_RE, r"(?i)\b(?:today|yesterday)\s*:"),
        re(
            &TODAY_VERB_LABEL_RE,
            r"(?im)^[ \t]*(?:i[ \t]+)?(?:did|done|worked[ \t]+on|completed|finished|accomplished)[ \t]*:",
        ),
        re(
            &TODAY_FIRST_PERSON_RE,
            r"(?i)\b(?:today|yesterday)[ \t]+i[ \t]+(?:(?:worked[ \t]+on|did|completed|finished|accomplished)\b[ \t]*:?[ \t]*)?",
        ),
        re(&TODAY_LEAD_RE, r"(?im)^[ \t]*(?:today|yesterday)\b[ \t,]*"),
        re(&WORKED_ON_LEAD_RE, r"(?im)^[ \t]*(?:i[ \t]+)?worked[ \t]+on\b[ \t]*"),
    ];
    candidates
        .iter()
        .find_map(|r| r.find(text))
        .map(|m| Marker {
            start: m.start(),
            end: m.end(),
            keep_phrase: false,
        })
}

/// 在 `from` 之后找明日标记：显式 `tomorrow:` 优先，其次单词 tomorrow，最后是 plan to 等短语
fn find_tomorrow_marker(text: &str, from: usize) -> Option<Marker> {
    let rest = &text[from..];
    let label = re(
        &TOMORROW_LABEL_RE,
        r"(?i)\b(?:tomorrow|will[ \t]+(?:work[ \t]+on|do)|plan(?:ned|s)?|next(?:[ \t]+up)?|to-?do)\s*:",
    );
    let word = re(&TOMORROW_WORD_RE, r"(?i)\btomorrow\b[ \t,]*");
    let cue = re(
        &TOMORROW_CUE_RE,
        r"(?i)\b(?:plan(?:ning)?\s+to|will\s+work\s+on|going\s+to)\b",
    );

    let explicit = label.find(rest).or_else(|| word.find(rest)).map(|m| Marker {
        start: from + m.start(),
        end: from + m.end(),
        keep_phrase: false,
    });
    explicit.or_else(|| {
        cue.find(rest).map(|m| Marker {
            start: from + m.start(),
            end: from + m.end(),
            keep_phrase: true,
        })
    })
}

type Split = Option<(String, String, f32)>;

enum MarkerSplit {
    /// 文本里有标记；结果可能仍是 None（片段太短）
    Found(Split),
    Absent,
}

fn split_at_markers(text: &str) -> MarkerSplit {
    let today = find_today_marker(text);
    let search_from = today.map(|m| m.end).unwrap_or(0);
    let tomorrow = find_tomorrow_marker(text, search_from);

    match (today, tomorrow) {
        (Some(t), Some(m)) => {
            let today_seg = clean(&text[t.end..m.start]);
            let tomorrow_seg = tomorrow_segment(text, m);
            MarkerSplit::Found(meaningful(today_seg, tomorrow_seg, CONFIDENCE_BOTH_MARKERS))
        }
        (None, Some(m)) => {
            let before = &text[..m.start];
            // 句中的 "going to" 之类只有落在子句边界之后才算标记
            if m.keep_phrase && !ends_clause(before) {
                return MarkerSplit::Absent;
            }
            MarkerSplit::Found(meaningful(
                clean(before),
                tomorrow_segment(text, m),
                CONFIDENCE_TOMORROW_MARKER,
            ))
        }
        (Some(t), None) => MarkerSplit::Found(split_at_sentence(text, t.end)),
        (None, None) => MarkerSplit::Absent,
    }
}

fn tomorrow_segment(text: &str, m: Marker) -> String {
    if m.keep_phrase {
        clean(&text[m.start..])
    } else {
        clean(&text[m.end..])
    }
}

/// 从 `from` 起按第一个句子边界切分；后半句必须带前瞻性提示词
fn split_at_sentence(text: &str, from: usize) -> Split {
    let body = &text[from..];
    let boundary = re(
        &BOUNDARY_RE,
        r"(?i)\.[ \t]+|\.?[ \t]*(?:\r?\n)+|[,;]?[ \t]+(?:but|however)\b,?[ \t]*",
    );
    let forward = re(
        &FORWARD_CUE_RE,
        r"(?i)(?:\b(?:will|plan(?:ning)?|next|going\s+to|gonna|tomorrow)\b|'ll\b)",
    );

    for m in boundary.find_iter(body) {
        let keeps_period = m.as_str().starts_with('.');
        let first_end = if keeps_period { m.start() + 1 } else { m.start() };
        let first = clean(&body[..first_end]);
        let second = clean(&body[m.end()..]);
        if second.is_empty() {
            continue;
        }
        if !forward.is_match(&second) {
            return None;
        }
        return meaningful(first, second, CONFIDENCE_SENTENCE_SPLIT);
    }
    None
}

fn meaningful(today: String, tomorrow: String, confidence: f32) -> Split {
    if today.chars().count() < MIN_SEGMENT_CHARS || tomorrow.chars().count() < MIN_SEGMENT_CHARS {
        return None;
    }
    Some((today, tomorrow, confidence))
}

fn ends_clause(before: &str) -> bool {
    let trimmed = before.trim_end();
    if trimmed.ends_with(['.', ',', ';', '!', '\n']) {
        return true;
    }
    re(&TRAILING_CONJ_RE, r"(?i)\s(?:and|then)$").is_match(trimmed)
}

/// 去掉片段首尾空白、分隔标点与悬挂的连词；句末句号保留
fn clean(segment: &str) -> String {
    let trimmed = segment
        .trim()
        .trim_start_matches([',', ';', ':', '-'])
        .trim_end_matches([',', ';', ':', '-'])
        .trim();
    let conj = re(&TRAILING_CONJ_RE, r"(?i)\s(?:and|then)$");
    conj.replace(trimmed, "")
        .trim_end_matches([',', ';', ':', '-'])
        .trim()
        .to_string()
}
