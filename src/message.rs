//! Transcript message model shared by every stage of the engine.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Content turn typed by the learner.
    UserTurn,
    /// Content turn produced by the tutoring agent.
    AgentTurn,
    SystemEvent,
    /// Structured result card (marks, feedback, ...).
    Card,
}

impl MessageKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::UserTurn => "user",
            Self::AgentTurn => "agent",
            Self::SystemEvent => "system",
            Self::Card => "card",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    /// Markscheme rows, rendered in their explicit `order`.
    Markscheme,
    Result,
    #[default]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardPayload {
    #[serde(default)]
    pub card_kind: CardKind,
    /// Logical subject the card describes, e.g. a question id.
    pub subject: String,
    #[serde(default)]
    pub sub_index: u32,
    #[serde(default)]
    pub group_key: Option<String>,
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl CardPayload {
    pub fn new(card_kind: CardKind, subject: impl Into<String>, sub_index: u32) -> Self {
        Self {
            card_kind,
            subject: subject.into(),
            sub_index,
            group_key: None,
            order: None,
            data: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn in_group(mut self, group_key: impl Into<String>, order: Option<i64>) -> Self {
        self.group_key = Some(group_key.into());
        self.order = order;
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Identity used to update a card in place instead of appending it again.
    /// Cards of different kinds or groups never share an identity.
    pub fn identity(&self) -> CardIdentity<'_> {
        CardIdentity {
            kind: self.card_kind,
            group: self.group_key.as_deref(),
            subject: &self.subject,
            sub_index: self.sub_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CardIdentity<'a> {
    pub kind: CardKind,
    pub group: Option<&'a str>,
    pub subject: &'a str,
    pub sub_index: u32,
}

impl std::fmt::Display for CardIdentity<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(group) = self.group {
            write!(f, "{group}/")?;
        }
        write!(f, "{}#{}", self.subject, self.sub_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Upstream id. Filled with a derived surrogate during classification when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub kind: MessageKind,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub card: Option<CardPayload>,
    /// System-event name, e.g. `question_changed`.
    #[serde(default)]
    pub event: Option<String>,
    /// Card group an "updated" system notice refers to.
    #[serde(default)]
    pub notice_for: Option<String>,
    #[serde(default)]
    pub source_sequence: usize,
}

impl Message {
    fn new(kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            text: text.into(),
            card: None,
            event: None,
            notice_for: None,
            source_sequence: 0,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageKind::UserTurn, text)
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(MessageKind::AgentTurn, text)
    }

    pub fn system(event: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            ..Self::new(MessageKind::SystemEvent, text)
        }
    }

    pub fn card(payload: CardPayload) -> Self {
        Self {
            card: Some(payload),
            ..Self::new(MessageKind::Card, "")
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn notice_for(mut self, group_key: impl Into<String>) -> Self {
        self.notice_for = Some(group_key.into());
        self
    }

    /// Stable key for caching and identity checks. Empty before classification
    /// when the upstream message carried no id.
    pub fn key(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Group this message renders in: a card's `group_key`, or the group an
    /// update notice refers to.
    pub fn group_key(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Card => self.card.as_ref().and_then(|c| c.group_key.as_deref()),
            MessageKind::SystemEvent => self.notice_for.as_deref(),
            _ => None,
        }
    }

    /// Fill in a deterministic surrogate id if upstream did not provide one.
    pub fn ensure_id(&mut self, position: usize, prefix_chars: usize) {
        if self.id.as_deref().map_or(true, str::is_empty) {
            self.id = Some(surrogate_id(self.kind, position, &self.text, prefix_chars));
        }
    }
}

/// Derive an id from transcript position and a text prefix.
///
/// Weak identity: two identical short messages at the same position of
/// different transcripts collide. Upstream ids should be preferred.
pub fn surrogate_id(kind: MessageKind, position: usize, text: &str, prefix_chars: usize) -> String {
    let prefix: String = text.chars().take(prefix_chars).collect();
    format!("{}-{position}-{}", kind.label(), prefix.trim())
}

/// Text that should be spoken for a turn, or `None` if nothing is narratable.
///
/// Fenced code blocks are dropped and whitespace is collapsed.
pub fn narratable_text(text: &str) -> Option<String> {
    let mut in_fence = false;
    let mut words: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence {
            words.extend(line.split_whitespace());
        }
    }

    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}
