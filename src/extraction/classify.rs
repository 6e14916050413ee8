//! 跟进回复分类：完成 / 未完成 / 不确定
//!
//! 否定提示优先于肯定提示（"not done" 同时含 done 与 not done，应判为未完成）。
//! 单独的 no / nope / nah 只有作为整条回复的开头答语时才算否定，"no blockers" 之类不算。

use std::sync::OnceLock;

use regex::Regex;

use crate::cycle::Resolution;

static NEGATIVE_RE: OnceLock<Regex> = OnceLock::new();
static AFFIRMATIVE_RE: OnceLock<Regex> = OnceLock::new();
static BARE_NO_RE: OnceLock<Regex> = OnceLock::new();

fn negative() -> &'static Regex {
    NEGATIVE_RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:\b(?:not\s+(?:yet|done|finished|completed|really)|didn'?t|did\s+not|haven'?t|have\s+not|couldn'?t|could\s+not|wasn'?t\s+able|blocked|stuck|incomplete|unfinished|partially|still\s+working)\b|❌|👎)",
        )
        .unwrap()
    })
}

/// 开头的独立否定答语："No", "nope.", "Nah, didn't get to it"
fn bare_no() -> &'static Regex {
    BARE_NO_RE.get_or_init(|| Regex::new(r"(?i)^\s*(?:no|nope|nah)\s*(?:[[:punct:]]|$)").unwrap())
}

fn affirmative() -> &'static Regex {
    AFFIRMATIVE_RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:\b(?:yes|yep|yeah|yup|done|did\s+it|finished|completed?|shipped|merged|nailed\s+it)\b|✅|✔|👍)",
        )
        .unwrap()
    })
}

/// 按关键词把回复归为三类；两类提示都没有时为 Unknown
pub fn classify_by_cues(text: &str) -> Resolution {
    if negative().is_match(text) || bare_no().is_match(text) {
        Resolution::Incomplete
    } else if affirmative().is_match(text) {
        Resolution::Completed
    } else {
        Resolution::Unknown
    }
}
