//! Classifier: splits newly appended transcript messages into delivery lanes.
//!
//! Upstream delivers the whole transcript on every update; the classifier
//! diffs it against a processed-count cursor and routes only the new tail.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::config::ClassifierConfig;
use crate::message::{Message, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptLane {
    User,
    System,
}

impl std::fmt::Display for InterruptLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::System => write!(f, "system"),
        }
    }
}

/// One new message and the lane it was routed to, in transcript order.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Shown at once, never narrated.
    Immediate(Message),
    /// Flushes pending work before it is shown.
    Interrupt { lane: InterruptLane, message: Message },
    /// Waits in the delivery queue for a paced reveal.
    Sequenced(Message),
}

impl Routed {
    pub fn message(&self) -> &Message {
        match self {
            Self::Immediate(m) | Self::Sequenced(m) => m,
            Self::Interrupt { message, .. } => message,
        }
    }
}

pub struct Classifier {
    cursor: usize,
    thread_id: Option<String>,
    interrupt_events: HashSet<String>,
    id_prefix_chars: usize,
}

impl Classifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            cursor: 0,
            thread_id: None,
            interrupt_events: config.interrupt_events.iter().cloned().collect(),
            id_prefix_chars: config.id_prefix_chars,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    /// Record the thread of an incoming update. Returns true when it differs
    /// from the previous thread, in which case the cursor has been rewound and
    /// the caller must tear down everything derived from the old thread.
    pub fn observe_thread(&mut self, thread_id: &str) -> bool {
        match self.thread_id.as_deref() {
            Some(current) if current == thread_id => false,
            previous => {
                let changed = previous.is_some();
                if changed {
                    info!("Thread changed: {} → {thread_id}", previous.unwrap_or_default());
                }
                self.thread_id = Some(thread_id.to_string());
                self.cursor = 0;
                changed
            }
        }
    }

    /// Route every message appended since the last call and advance the cursor.
    pub fn classify(&mut self, transcript: &[Message]) -> Vec<Routed> {
        if transcript.len() < self.cursor {
            warn!(
                "Transcript shrank from {} to {} messages without a thread change; ignoring",
                self.cursor,
                transcript.len()
            );
            self.cursor = transcript.len();
            return Vec::new();
        }

        let routed: Vec<Routed> = transcript[self.cursor..]
            .iter()
            .enumerate()
            .map(|(offset, original)| {
                let position = self.cursor + offset;
                let mut message = original.clone();
                message.source_sequence = position;
                message.ensure_id(position, self.id_prefix_chars);
                self.route(message)
            })
            .collect();

        if !routed.is_empty() {
            debug!(
                "Classified {} new message(s) at {}..{}",
                routed.len(),
                self.cursor,
                transcript.len()
            );
        }
        self.cursor = transcript.len();
        routed
    }

    fn route(&self, message: Message) -> Routed {
        match message.kind {
            MessageKind::AgentTurn => Routed::Sequenced(message),
            MessageKind::UserTurn => Routed::Interrupt {
                lane: InterruptLane::User,
                message,
            },
            MessageKind::SystemEvent if self.is_interrupt_event(&message) => Routed::Interrupt {
                lane: InterruptLane::System,
                message,
            },
            MessageKind::SystemEvent | MessageKind::Card => Routed::Immediate(message),
        }
    }

    fn is_interrupt_event(&self, message: &Message) -> bool {
        message
            .event
            .as_deref()
            .is_some_and(|name| self.interrupt_events.contains(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CardKind, CardPayload};

    fn classifier() -> Classifier {
        Classifier::new(&ClassifierConfig::default())
    }

    #[test]
    fn routes_each_kind_to_its_lane() {
        let mut c = classifier();
        c.observe_thread("t1");
        let transcript = vec![
            Message::agent("Welcome back"),
            Message::card(CardPayload::new(CardKind::Result, "q1", 0)),
            Message::system("card_updated", "Marks updated"),
            Message::system("question_changed", "Next question"),
            Message::user("ok"),
        ];

        let routed = c.classify(&transcript);
        assert!(matches!(routed[0], Routed::Sequenced(_)));
        assert!(matches!(routed[1], Routed::Immediate(_)));
        assert!(matches!(routed[2], Routed::Immediate(_)));
        assert!(matches!(
            routed[3],
            Routed::Interrupt { lane: InterruptLane::System, .. }
        ));
        assert!(matches!(
            routed[4],
            Routed::Interrupt { lane: InterruptLane::User, .. }
        ));
        assert_eq!(c.cursor(), 5);
    }

    #[test]
    fn only_new_tail_is_classified() {
        let mut c = classifier();
        c.observe_thread("t1");
        let mut transcript = vec![Message::agent("one"), Message::agent("two")];
        assert_eq!(c.classify(&transcript).len(), 2);
        assert!(c.classify(&transcript).is_empty());

        transcript.push(Message::agent("three"));
        let routed = c.classify(&transcript);
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].message().text, "three");
        assert_eq!(routed[0].message().source_sequence, 2);
    }

    #[test]
    fn missing_ids_get_stable_surrogates() {
        let transcript = vec![Message::agent("Same words"), Message::agent("x").with_id("up-1")];

        let mut first = classifier();
        first.observe_thread("t1");
        let a = first.classify(&transcript);

        let mut second = classifier();
        second.observe_thread("t1");
        let b = second.classify(&transcript);

        assert_eq!(a[0].message().key(), b[0].message().key());
        assert_eq!(a[0].message().key(), "agent-0-Same words");
        assert_eq!(a[1].message().key(), "up-1");
    }

    #[test]
    fn thread_change_rewinds_cursor() {
        let mut c = classifier();
        assert!(!c.observe_thread("t1"));
        c.classify(&[Message::agent("a"), Message::agent("b")]);
        assert!(!c.observe_thread("t1"));
        assert_eq!(c.cursor(), 2);

        assert!(c.observe_thread("t2"));
        assert_eq!(c.cursor(), 0);
        assert_eq!(c.thread_id(), Some("t2"));
    }

    #[test]
    fn shrinking_transcript_is_ignored() {
        let mut c = classifier();
        c.observe_thread("t1");
        c.classify(&[Message::agent("a"), Message::agent("b")]);
        assert!(c.classify(&[Message::agent("a")]).is_empty());
        assert_eq!(c.cursor(), 1);
    }
}
