//! Property-based tests for the deferred trigger queue.
//!
//! Covers the per-context bound, arrival ordering on drain, and isolation
//! between contexts.

use proptest::prelude::*;
use tokio::time::Instant;

use attribution_core::context::ContextKey;
use attribution_core::deferred::{DeferredTriggerQueue, EnqueueOutcome, PendingTrigger};
use attribution_core::ids::{FrameId, NavigationId};
use attribution_core::origin::SuitableOrigin;
use attribution_core::registration::{AttributionTrigger, TriggerRegistration};

// =============================================================================
// Strategies
// =============================================================================

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

/// A context index in 0..4 paired with each trigger.
fn arb_offers() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(0u8..4, 0..120)
}

fn key(index: u8) -> ContextKey {
    ContextKey::Navigation(NavigationId::new(i64::from(index)))
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn queue_never_exceeds_bound(max in 1usize..40, offers in arb_offers()) {
        let mut queue = DeferredTriggerQueue::new(max);
        let now = Instant::now();
        for index in 0..4 {
            queue.open(key(index));
        }
        let mut deferred = [0usize; 4];
        let mut dropped = [0usize; 4];
        for index in offers {
            let sequence = queue.reserve_sequence();
            match queue.enqueue(Some(key(index)), pending(sequence), now) {
                EnqueueOutcome::Deferred { .. } => deferred[usize::from(index)] += 1,
                EnqueueOutcome::Dropped(_) => dropped[usize::from(index)] += 1,
                EnqueueOutcome::Immediate(_) => prop_assert!(false, "open context returned immediate"),
            }
        }
        for index in 0..4u8 {
            let slot = usize::from(index);
            prop_assert!(queue.len(&key(index)) <= max);
            prop_assert_eq!(queue.len(&key(index)), deferred[slot]);
            if dropped[slot] > 0 {
                prop_assert_eq!(deferred[slot], max);
            }
        }
    }

    #[test]
    fn drain_returns_arrival_order_once(offers in arb_offers()) {
        let mut queue = DeferredTriggerQueue::new(usize::MAX);
        let now = Instant::now();
        for index in 0..4 {
            queue.open(key(index));
        }
        for index in &offers {
            let sequence = queue.reserve_sequence();
            queue.enqueue(Some(key(*index)), pending(sequence), now);
        }
        let mut total = 0;
        for index in 0..4 {
            let drained = queue.drain(&key(index));
            total += drained.len();
            prop_assert!(drained.windows(2).all(|w| w[0].arrival_sequence < w[1].arrival_sequence));
            prop_assert!(drained.iter().all(|entry| entry.context_key == key(index)));
            prop_assert!(queue.drain(&key(index)).is_empty());
        }
        prop_assert_eq!(total, offers.len());
        prop_assert_eq!(queue.total(), 0);
    }

    #[test]
    fn closed_contexts_are_immediate(offers in arb_offers()) {
        let mut queue = DeferredTriggerQueue::new(30);
        let now = Instant::now();
        queue.open(key(0));
        for index in offers {
            let sequence = queue.reserve_sequence();
            let outcome = queue.enqueue(Some(key(index)), pending(sequence), now);
            if index != 0 {
                prop_assert!(matches!(outcome, EnqueueOutcome::Immediate(_)));
            }
        }
        prop_assert_eq!(queue.open_contexts(), 1);
    }
}
