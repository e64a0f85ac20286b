//! Per-agent outbound queue ordered by descending priority, FIFO within a priority.

use embassy_time::Instant;
use std::collections::VecDeque;

use super::types::{Message, MessageId};

/// A message waiting for (re)transmission together with its delivery history.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    /// Ack timeouts this message has gone through so far.
    pub retries: u32,
    /// When the message entered the queue first; delivery latency is measured from here.
    pub first_enqueued_at: Instant,
}

impl QueuedMessage {
    pub fn new(message: Message, now: Instant) -> Self {
        Self {
            message,
            retries: 0,
            first_enqueued_at: now,
        }
    }

    pub fn id(&self) -> &MessageId {
        self.message.id()
    }
}

#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedMessage>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert after every entry of equal or higher priority.
    pub fn enqueue(&mut self, entry: QueuedMessage) {
        let weight = entry.message.priority().weight();
        let at = self.entries.partition_point(|e| e.message.priority().weight() >= weight);
        self.entries.insert(at, entry);
    }

    pub fn peek_highest(&self) -> Option<&QueuedMessage> {
        self.entries.front()
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<QueuedMessage> {
        let index = self.entries.iter().position(|e| e.id() == id)?;
        self.entries.remove(index)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.iter().any(|e| e.id() == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::types::Priority;
    use crate::simulation::types::test_support::message;

    fn push(queue: &mut OutboundQueue, id: &str, priority: Priority) {
        queue.enqueue(QueuedMessage::new(message(id, "A1", priority), Instant::from_ticks(0)));
    }

    fn order(queue: &OutboundQueue) -> Vec<&str> {
        queue.iter().map(|e| e.id().as_str()).collect()
    }

    #[test]
    fn higher_priority_goes_first_and_ties_keep_arrival_order() {
        let mut q = OutboundQueue::new();
        push(&mut q, "low-1", Priority::Low);
        push(&mut q, "high-1", Priority::High);
        push(&mut q, "medium-1", Priority::Medium);
        push(&mut q, "high-2", Priority::High);
        push(&mut q, "critical-1", Priority::Critical);
        push(&mut q, "low-2", Priority::Low);

        assert_eq!(order(&q), vec!["critical-1", "high-1", "high-2", "medium-1", "low-1", "low-2"]);
        assert_eq!(q.peek_highest().unwrap().id().as_str(), "critical-1");
    }

    #[test]
    fn requeued_message_goes_behind_its_peers() {
        let mut q = OutboundQueue::new();
        push(&mut q, "h-1", Priority::High);
        push(&mut q, "h-2", Priority::High);
        let head = q.remove(&MessageId::new("h-1")).unwrap();
        q.enqueue(head);
        assert_eq!(order(&q), vec!["h-2", "h-1"]);
    }

    #[test]
    fn remove_missing_id_is_none() {
        let mut q = OutboundQueue::new();
        push(&mut q, "a", Priority::Low);
        assert!(q.remove(&MessageId::new("b")).is_none());
        assert!(q.contains(&MessageId::new("a")));
        assert_eq!(q.len(), 1);
    }
}
