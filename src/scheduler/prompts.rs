//! 出站消息文案

use chrono::NaiveDate;

use crate::cycle::Commitment;

/// 每日站会提问
pub fn standup_prompt(date: NaiveDate) -> String {
    format!(
        "🌅 Daily Standup Time! ({date})\n\
         Time to share your progress and plans with the team!\n\n\
         📝 What did you work on today?\n\
         🚀 What will you work on tomorrow?\n\n\
         💬 Reply to this message with your standup update, e.g.\n\
         \"Today: fixed the login bug. Tomorrow: will write tests.\""
    )
}

/// 针对单条承诺的跟进
pub fn follow_up_prompt(commitment: &Commitment) -> String {
    let who = if commitment.username.trim().is_empty() {
        commitment.user_id.as_str()
    } else {
        commitment.username.as_str()
    };
    format!(
        "📋 Accountability Check-in\n\
         Hey @{who}! Let's check in on your commitment from {date}.\n\n\
         🎯 \"{pledge}\"\n\n\
         ❓ Did you get this done? Reply with ✅ if done, or let us know your progress!",
        date = commitment.cycle_date,
        pledge = commitment.tomorrow_text.trim(),
    )
}
