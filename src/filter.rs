//! Filter/query engine: one pure predicate over the held message list.
//!
//! A `FilterSpec` is replaced wholesale on every edit; `apply` never
//! mutates or reorders its input.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CanonicalMessage, Platform, Priority};

/// Active platform tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "tab", content = "platform")]
pub enum PlatformTab {
    #[default]
    All,
    Only(Platform),
}

/// Read-state constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadState {
    #[default]
    Any,
    ReadOnly,
    UnreadOnly,
}

/// Inclusive date range. Only constrains when both bounds are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    fn contains(&self, at: DateTime<Utc>) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => at >= start && at <= end,
            // A half-open range imposes no constraint.
            _ => true,
        }
    }
}

/// Immutable filter selection. `Default` constrains nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    pub tab: PlatformTab,
    pub search_text: String,
    pub platforms: HashSet<Platform>,
    pub priorities: HashSet<Priority>,
    pub read_state: ReadState,
    pub date_range: DateRange,
    pub labels: HashSet<String>,
}

impl FilterSpec {
    pub fn with_tab(self, tab: PlatformTab) -> Self {
        Self { tab, ..self }
    }

    pub fn with_search(self, search_text: impl Into<String>) -> Self {
        Self {
            search_text: search_text.into(),
            ..self
        }
    }

    pub fn with_platforms(self, platforms: impl IntoIterator<Item = Platform>) -> Self {
        Self {
            platforms: platforms.into_iter().collect(),
            ..self
        }
    }

    pub fn with_priorities(self, priorities: impl IntoIterator<Item = Priority>) -> Self {
        Self {
            priorities: priorities.into_iter().collect(),
            ..self
        }
    }

    pub fn with_read_state(self, read_state: ReadState) -> Self {
        Self { read_state, ..self }
    }

    pub fn with_date_range(self, date_range: DateRange) -> Self {
        Self { date_range, ..self }
    }

    pub fn with_labels<S: Into<String>>(self, labels: impl IntoIterator<Item = S>) -> Self {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Whether a single message passes every predicate.
    pub fn matches(&self, msg: &CanonicalMessage) -> bool {
        self.matches_tab(msg)
            && self.matches_search(msg)
            && (self.platforms.is_empty() || self.platforms.contains(&msg.platform))
            && (self.priorities.is_empty() || self.priorities.contains(&msg.priority))
            && self.matches_read_state(msg)
            && self.date_range.contains(msg.timestamp)
            && self.matches_labels(msg)
    }

    fn matches_tab(&self, msg: &CanonicalMessage) -> bool {
        match self.tab {
            PlatformTab::All => true,
            PlatformTab::Only(platform) => msg.platform == platform,
        }
    }

    fn matches_search(&self, msg: &CanonicalMessage) -> bool {
        if self.search_text.is_empty() {
            return true;
        }
        let needle = self.search_text.to_lowercase();
        msg.content.to_lowercase().contains(&needle) || msg.sender.to_lowercase().contains(&needle)
    }

    fn matches_read_state(&self, msg: &CanonicalMessage) -> bool {
        match self.read_state {
            ReadState::Any => true,
            ReadState::ReadOnly => msg.read,
            ReadState::UnreadOnly => !msg.read,
        }
    }

    fn matches_labels(&self, msg: &CanonicalMessage) -> bool {
        self.labels.is_empty() || msg.labels.iter().any(|l| self.labels.contains(l))
    }
}

/// Return the messages that pass `spec`, in input order.
pub fn apply(messages: &[CanonicalMessage], spec: &FilterSpec) -> Vec<CanonicalMessage> {
    messages.iter().filter(|m| spec.matches(m)).cloned().collect()
}
