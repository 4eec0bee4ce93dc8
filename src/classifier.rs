//! Priority classifier: keyword heuristic run once at ingestion.
//!
//! Email classifies on its subject line; platforms without a subject
//! classify on message content. First matching tier wins.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::Priority;

pub const URGENT_KEYWORDS: [&str; 4] = ["urgent", "asap", "emergency", "important"];
pub const FOLLOW_UP_KEYWORDS: [&str; 4] = ["follow up", "followup", "reminder", "update"];

static URGENT: LazyLock<Regex> = LazyLock::new(|| keyword_regex(&URGENT_KEYWORDS));
static FOLLOW_UP: LazyLock<Regex> = LazyLock::new(|| keyword_regex(&FOLLOW_UP_KEYWORDS));

/// Case-insensitive substring alternation over escaped keywords.
fn keyword_regex(keywords: &[&str]) -> Regex {
    let alternation = keywords
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("(?i)(?:{alternation})")).expect("escaped keyword alternation is valid")
}

/// Assign a priority tier from a subject (or content) line.
///
/// `counterpart` is the other party of the conversation. No tier depends
/// on it today.
pub fn classify(subject_or_content: &str, _counterpart: &str) -> Priority {
    if URGENT.is_match(subject_or_content) {
        Priority::Urgent
    } else if FOLLOW_UP.is_match(subject_or_content) {
        Priority::FollowUp
    } else {
        Priority::Low
    }
}
