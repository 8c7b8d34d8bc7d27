#![no_main]

use attribution_core::context::{ContextKey, ContextTable, EvictionReason, LegKey, LegTie};
use attribution_core::deferred::{DeferredTriggerQueue, EnqueueOutcome, PendingTrigger};
use attribution_core::ids::{BackgroundRegistrationId, FrameId, NavigationId};
use attribution_core::origin::SuitableOrigin;
use attribution_core::registration::{AttributionTrigger, TriggerRegistration};
use libfuzzer_sys::fuzz_target;
use tokio::time::Instant;

const MAX_DEFERRED: usize = 6;

fn key(slot: u8) -> ContextKey {
    ContextKey::Navigation(NavigationId::new(i64::from(slot % 4)))
}

fuzz_target!(|data: &[u8]| {
    let destination = SuitableOrigin::parse("https://shop.test").unwrap();
    let reporter = SuitableOrigin::parse("https://ads.test").unwrap();
    let mut table = ContextTable::new(8);
    let mut queue = DeferredTriggerQueue::new(MAX_DEFERRED);
    let now = Instant::now();

    for chunk in data.chunks(3) {
        let [op_tag, slot, arg] = chunk else {
            continue;
        };
        let key = key(*slot);

        match op_tag % 8 {
            0 => {
                if table.create(key, now).is_some() {
                    queue.open(key);
                }
            }
            1 => {
                if let Some(ctx) = table.get_mut(&key) {
                    ctx.announce_background(u32::from(arg % 4));
                }
            }
            2 => {
                if let Some(ctx) = table.get_mut(&key) {
                    let leg = LegKey::Background(BackgroundRegistrationId::new(u64::from(arg % 6)));
                    ctx.start_leg(leg, LegTie::Pending);
                }
            }
            3 => {
                if let Some(ctx) = table.get_mut(&key) {
                    let leg = LegKey::Background(BackgroundRegistrationId::new(u64::from(arg % 6)));
                    ctx.complete_leg(leg);
                }
            }
            4 => {
                if let Some(ctx) = table.get_mut(&key) {
                    if arg % 2 == 0 {
                        ctx.begin_parse();
                    } else {
                        ctx.finish_parse();
                    }
                }
            }
            5 => {
                let arrival_sequence = queue.reserve_sequence();
                let pending = PendingTrigger {
                    trigger: AttributionTrigger {
                        registration: TriggerRegistration::from_map(serde_json::Map::new()),
                        destination_origin: destination.clone(),
                        reporting_origin: reporter.clone(),
                        is_within_fenced_frame: false,
                        processed_after_timeout: false,
                    },
                    frame_id: FrameId::new(1, i32::from(*arg)),
                    arrival_sequence,
                };
                let live = table.contains(&key).then_some(key);
                match queue.enqueue(live, pending, now) {
                    EnqueueOutcome::Immediate(_) => assert!(!table.contains(&key)),
                    EnqueueOutcome::Deferred { .. } => assert!(table.contains(&key)),
                    EnqueueOutcome::Dropped(_) => assert_eq!(queue.len(&key), MAX_DEFERRED),
                }
            }
            6 => {
                let complete = table.get(&key).is_some_and(|ctx| ctx.is_complete());
                if complete {
                    let drained = queue.drain(&key);
                    assert!(
                        drained
                            .windows(2)
                            .all(|w| w[0].arrival_sequence < w[1].arrival_sequence)
                    );
                    assert!(drained.iter().all(|entry| entry.context_key == key));
                    assert!(table.remove(&key, EvictionReason::Flushed).is_some());
                }
            }
            _ => {
                if table.remove(&key, EvictionReason::TimedOut).is_some() {
                    let drained = queue.drain(&key);
                    assert!(drained.len() <= MAX_DEFERRED);
                    assert!(!queue.is_open(&key));
                }
            }
        }

        // Invariants
        assert_eq!(queue.open_contexts(), table.len());
        for ctx in table.iter() {
            assert!(queue.len(&ctx.key()) <= MAX_DEFERRED);
            assert_eq!(ctx.is_complete(), ctx.pending() == 0);
            assert!(ctx.completed_legs() <= ctx.expected_legs());
        }
    }
});
