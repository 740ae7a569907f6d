//! Delivery queue: sequenced messages waiting for their paced reveal.

use std::collections::VecDeque;

use crate::message::Message;

/// FIFO buffer. Never reordered; only a flush empties it wholesale.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    items: VecDeque<Message>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&mut self, batch: impl IntoIterator<Item = Message>) {
        self.items.extend(batch);
    }

    pub fn pop_front(&mut self) -> Option<Message> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&Message> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove everything, preserving queue order.
    pub fn drain_all(&mut self) -> Vec<Message> {
        self.items.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_across_batches() {
        let mut queue = DeliveryQueue::new();
        queue.push_batch([Message::agent("a"), Message::agent("b")]);
        queue.push_batch([Message::agent("c")]);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.front().map(|m| m.text.as_str()), Some("a"));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop_front())
            .map(|m| m.text)
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_keeps_order_and_empties() {
        let mut queue = DeliveryQueue::new();
        queue.push_batch([Message::agent("1"), Message::agent("2")]);

        let drained: Vec<String> = queue.drain_all().into_iter().map(|m| m.text).collect();
        assert_eq!(drained, ["1", "2"]);
        assert!(queue.is_empty());
    }
}
