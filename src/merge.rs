//! Transcript merge layer for structured cards.
//!
//! Cards describing the same subject (a re-graded answer, a revised
//! markscheme entry) update the visible copy in place. Before rendering,
//! consecutive cards sharing a group key collapse into one unit.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::message::{CardIdentity, CardKind, Message, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended,
    Updated,
    Unchanged,
}

fn card_identity(message: &Message) -> Option<CardIdentity<'_>> {
    if message.kind != MessageKind::Card {
        return None;
    }
    message.card.as_ref().map(|c| c.identity())
}

/// Copy payload and text from `newer` if they differ. Position and id stay.
fn refresh(existing: &mut Message, newer: &Message) -> bool {
    if existing.card == newer.card && existing.text == newer.text {
        return false;
    }
    existing.card = newer.card.clone();
    existing.text = newer.text.clone();
    true
}

/// Append a card to the visible transcript, or update the card already
/// showing the same subject.
pub fn upsert_card(visible: &mut Vec<Message>, card: Message) -> MergeOutcome {
    let Some(identity) = card_identity(&card) else {
        visible.push(card);
        return MergeOutcome::Appended;
    };

    match visible
        .iter_mut()
        .find(|m| card_identity(m) == Some(identity))
    {
        Some(existing) => {
            if refresh(existing, &card) {
                debug!("Card {identity} updated in place");
                MergeOutcome::Updated
            } else {
                MergeOutcome::Unchanged
            }
        }
        None => {
            visible.push(card);
            MergeOutcome::Appended
        }
    }
}

/// Bring visible cards up to date with the newest upstream card of the
/// same identity. Returns how many were updated.
pub fn reconcile_cards(visible: &mut [Message], upstream: &[Message]) -> usize {
    let mut latest: HashMap<CardIdentity<'_>, &Message> = HashMap::new();
    for message in upstream {
        if let Some(identity) = card_identity(message) {
            latest.insert(identity, message);
        }
    }
    if latest.is_empty() {
        return 0;
    }

    let mut updated = 0;
    for existing in visible.iter_mut() {
        let newer = card_identity(existing).and_then(|identity| latest.get(&identity).copied());
        if let Some(newer) = newer {
            if refresh(existing, newer) {
                updated += 1;
            }
        }
    }
    updated
}

#[derive(Debug, Serialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum RenderUnit<'a> {
    Single {
        message: &'a Message,
    },
    Group {
        key: &'a str,
        members: Vec<&'a Message>,
        /// "Updated" system notices for this group, rendered after the cards.
        notices: Vec<&'a Message>,
    },
}

/// Collapse runs of consecutive messages sharing a group key.
///
/// Markscheme members are ordered by their `order` field (missing order
/// sorts last, ties keep arrival order). A run containing no cards is left
/// as individual messages.
pub fn group_for_render(visible: &[Message]) -> Vec<RenderUnit<'_>> {
    let mut units = Vec::new();
    let mut i = 0;

    while i < visible.len() {
        let Some(key) = visible[i].group_key() else {
            units.push(RenderUnit::Single {
                message: &visible[i],
            });
            i += 1;
            continue;
        };

        let mut end = i + 1;
        while end < visible.len() && visible[end].group_key() == Some(key) {
            end += 1;
        }
        let run = &visible[i..end];
        i = end;

        let (mut members, notices): (Vec<&Message>, Vec<&Message>) =
            run.iter().partition(|m| m.kind == MessageKind::Card);

        if members.is_empty() {
            units.extend(notices.into_iter().map(|message| RenderUnit::Single { message }));
            continue;
        }

        let markscheme = members.iter().all(|m| {
            m.card
                .as_ref()
                .is_some_and(|c| c.card_kind == CardKind::Markscheme)
        });
        if markscheme {
            members.sort_by_key(|m| {
                let order = m.card.as_ref().and_then(|c| c.order);
                (order.is_none(), order)
            });
        }

        units.push(RenderUnit::Group {
            key,
            members,
            notices,
        });
    }

    units
}
