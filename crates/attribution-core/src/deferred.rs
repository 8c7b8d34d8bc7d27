//! Bounded per-context trigger queue.
//!
//! A queue exists for a context only while that context is live: the
//! coordinator opens it on context creation and drains it on flush. A
//! trigger offered for a key without an open queue comes straight back as
//! [`EnqueueOutcome::Immediate`], so the common no-context path never
//! touches the queue's storage.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::context::ContextKey;
use crate::ids::FrameId;
use crate::registration::AttributionTrigger;

/// A trigger with its reserved arrival sequence, not yet routed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTrigger {
    pub trigger: AttributionTrigger,
    pub frame_id: FrameId,
    pub arrival_sequence: u64,
}

/// A trigger held until its context flushes.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredTrigger {
    pub trigger: AttributionTrigger,
    pub frame_id: FrameId,
    pub arrival_sequence: u64,
    pub context_key: ContextKey,
    pub enqueued_at: Instant,
}

impl DeferredTrigger {
    /// How long the trigger has been held as of `now`.
    #[must_use]
    pub fn delay(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

/// Result of offering a trigger to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// No live context; deliver now.
    Immediate(PendingTrigger),
    Deferred { arrival_sequence: u64 },
    /// The context already holds the maximum; the trigger is discarded.
    Dropped(PendingTrigger),
}

#[derive(Debug)]
pub struct DeferredTriggerQueue {
    max_per_context: usize,
    queues: HashMap<ContextKey, Vec<DeferredTrigger>>,
    next_sequence: u64,
}

impl DeferredTriggerQueue {
    #[must_use]
    pub fn new(max_per_context: usize) -> Self {
        Self {
            max_per_context,
            queues: HashMap::new(),
            next_sequence: 1,
        }
    }

    #[must_use]
    pub const fn max_per_context(&self) -> usize {
        self.max_per_context
    }

    /// Reserve the next arrival sequence.
    ///
    /// Header flows reserve at data time so delivery follows call order even
    /// when their parses finish out of order.
    pub fn reserve_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Start accepting triggers for a live context.
    pub fn open(&mut self, key: ContextKey) {
        self.queues.entry(key).or_default();
    }

    #[must_use]
    pub fn is_open(&self, key: &ContextKey) -> bool {
        self.queues.contains_key(key)
    }

    pub fn enqueue(
        &mut self,
        key: Option<ContextKey>,
        pending: PendingTrigger,
        now: Instant,
    ) -> EnqueueOutcome {
        let Some(key) = key else {
            return EnqueueOutcome::Immediate(pending);
        };
        let Some(queue) = self.queues.get_mut(&key) else {
            return EnqueueOutcome::Immediate(pending);
        };
        if queue.len() >= self.max_per_context {
            return EnqueueOutcome::Dropped(pending);
        }
        let arrival_sequence = pending.arrival_sequence;
        queue.push(DeferredTrigger {
            trigger: pending.trigger,
            frame_id: pending.frame_id,
            arrival_sequence,
            context_key: key,
            enqueued_at: now,
        });
        EnqueueOutcome::Deferred { arrival_sequence }
    }

    /// Remove the context's queue and return its entries in arrival order.
    pub fn drain(&mut self, key: &ContextKey) -> Vec<DeferredTrigger> {
        let mut drained = self.queues.remove(key).unwrap_or_default();
        drained.sort_by_key(|entry| entry.arrival_sequence);
        drained
    }

    #[must_use]
    pub fn len(&self, key: &ContextKey) -> usize {
        self.queues.get(key).map_or(0, Vec::len)
    }

    /// Triggers held across every context.
    #[must_use]
    pub fn total(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn open_contexts(&self) -> usize {
        self.queues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AttributionSrcToken;
    use crate::origin::SuitableOrigin;
    use crate::registration::TriggerRegistration;

    fn pending(sequence: u64) -> PendingTrigger {
        PendingTrigger {
            trigger: AttributionTrigger {
                registration: TriggerRegistration::from_map(serde_json::Map::new()),
                destination_origin: SuitableOrigin::parse("https://shop.test").unwrap(),
                reporting_origin: SuitableOrigin::parse("https://ads.test").unwrap(),
                is_within_fenced_frame: false,
                processed_after_timeout: false,
            },
            frame_id: FrameId::new(1, 1),
            arrival_sequence: sequence,
        }
    }

    fn key() -> ContextKey {
        ContextKey::Token(AttributionSrcToken::new())
    }

    #[test]
    fn no_context_is_immediate() {
        let mut queue = DeferredTriggerQueue::new(30);
        let now = Instant::now();
        assert!(matches!(
            queue.enqueue(None, pending(1), now),
            EnqueueOutcome::Immediate(_)
        ));
        assert!(matches!(
            queue.enqueue(Some(key()), pending(2), now),
            EnqueueOutcome::Immediate(_)
        ));
        assert_eq!(queue.total(), 0);
    }

    #[test]
    fn open_context_defers_until_full() {
        let mut queue = DeferredTriggerQueue::new(2);
        let key = key();
        let now = Instant::now();
        queue.open(key);
        assert_eq!(
            queue.enqueue(Some(key), pending(1), now),
            EnqueueOutcome::Deferred {
                arrival_sequence: 1
            }
        );
        queue.enqueue(Some(key), pending(2), now);
        let third = queue.enqueue(Some(key), pending(3), now);
        assert!(
            matches!(third, EnqueueOutcome::Dropped(ref t) if t.arrival_sequence == 3),
            "{third:?}"
        );
        assert_eq!(queue.len(&key), 2);
    }

    #[test]
    fn drain_orders_by_sequence_and_closes() {
        let mut queue = DeferredTriggerQueue::new(30);
        let key = key();
        let now = Instant::now();
        queue.open(key);
        for sequence in [5, 2, 9, 3] {
            queue.enqueue(Some(key), pending(sequence), now);
        }
        let drained: Vec<u64> = queue
            .drain(&key)
            .iter()
            .map(|entry| entry.arrival_sequence)
            .collect();
        assert_eq!(drained, vec![2, 3, 5, 9]);
        assert!(!queue.is_open(&key));
        assert!(queue.drain(&key).is_empty());
    }

    #[test]
    fn reserved_sequences_increase() {
        let mut queue = DeferredTriggerQueue::new(1);
        let a = queue.reserve_sequence();
        let b = queue.reserve_sequence();
        assert!(b > a);
    }

    #[test]
    fn contexts_are_isolated() {
        let mut queue = DeferredTriggerQueue::new(1);
        let (a, b) = (key(), key());
        let now = Instant::now();
        queue.open(a);
        queue.open(b);
        queue.enqueue(Some(a), pending(1), now);
        assert!(matches!(
            queue.enqueue(Some(b), pending(2), now),
            EnqueueOutcome::Deferred { .. }
        ));
        assert_eq!(queue.total(), 2);
        assert_eq!(queue.open_contexts(), 2);
    }
}
