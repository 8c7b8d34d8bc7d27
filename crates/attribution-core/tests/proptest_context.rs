//! Property-based tests for context pending accounting.

use proptest::prelude::*;
use tokio::time::Instant;

use attribution_core::context::{
    ContextKey, ContextTable, EvictionReason, LegKey, LegStart, LegTie,
    NavigationRegistrationContext,
};
use attribution_core::ids::{AttributionSrcToken, BackgroundRegistrationId};

#[derive(Debug, Clone)]
enum Step {
    WillStart(u32),
    StartBackground(u64),
    CompleteBackground(u64),
    BeginParse,
    FinishParse,
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        1 => (0u32..5).prop_map(Step::WillStart),
        4 => (1u64..8).prop_map(Step::StartBackground),
        4 => (1u64..8).prop_map(Step::CompleteBackground),
        2 => Just(Step::BeginParse),
        2 => Just(Step::FinishParse),
    ]
}

/// Straightforward model of the pending formula.
#[derive(Debug, Default)]
struct Model {
    expected: Option<u32>,
    started: std::collections::BTreeSet<u64>,
    completed: std::collections::BTreeSet<u64>,
    parses: u32,
}

impl Model {
    fn pending(&self) -> u32 {
        let started = u32::try_from(self.started.len()).unwrap();
        let completed = u32::try_from(self.completed.len()).unwrap();
        let unclaimed = self.expected.unwrap_or(0).saturating_sub(started);
        (started - completed) + unclaimed + self.parses
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn pending_matches_model(steps in prop::collection::vec(arb_step(), 0..60)) {
        let mut ctx = NavigationRegistrationContext::new(
            ContextKey::Token(AttributionSrcToken::new()),
            1,
            Instant::now(),
        );
        let mut model = Model::default();

        for step in steps {
            match step {
                Step::WillStart(n) => {
                    let accepted = ctx.announce_background(n);
                    prop_assert_eq!(accepted, model.expected.is_none());
                    if accepted {
                        model.expected = Some(n);
                    }
                }
                Step::StartBackground(id) => {
                    let leg = LegKey::Background(BackgroundRegistrationId::new(id));
                    let start = ctx.start_leg(leg, LegTie::Pending);
                    if model.started.insert(id) {
                        prop_assert!(matches!(start, LegStart::Added { .. }), "{:?}", start);
                    } else {
                        prop_assert_eq!(start, LegStart::AlreadyKnown);
                    }
                }
                Step::CompleteBackground(id) => {
                    let leg = LegKey::Background(BackgroundRegistrationId::new(id));
                    let completed = ctx.complete_leg(leg);
                    let expected = model.started.contains(&id) && model.completed.insert(id);
                    prop_assert_eq!(completed, expected);
                }
                Step::BeginParse => {
                    ctx.begin_parse();
                    model.parses += 1;
                }
                Step::FinishParse => {
                    ctx.finish_parse();
                    model.parses = model.parses.saturating_sub(1);
                }
            }
            prop_assert_eq!(ctx.pending(), model.pending());
            prop_assert_eq!(ctx.is_complete(), model.pending() == 0);
            prop_assert!(ctx.completed_legs() <= ctx.expected_legs());
        }
    }

    #[test]
    fn eviction_memory_holds_latest_reasons(
        capacity in 1usize..8,
        evictions in prop::collection::vec(0u8..3, 1..30),
    ) {
        let mut table = ContextTable::new(capacity);
        let now = Instant::now();
        let mut tokens = Vec::new();
        for reason in &evictions {
            let token = AttributionSrcToken::new();
            let key = ContextKey::Token(token);
            prop_assert!(table.create(key, now).is_some());
            let reason = match reason {
                0 => EvictionReason::Flushed,
                1 => EvictionReason::TimedOut,
                _ => EvictionReason::Ineligible,
            };
            prop_assert!(table.remove(&key, reason).is_some());
            tokens.push((token, reason));
        }
        prop_assert!(table.is_empty());
        let remembered = tokens
            .iter()
            .filter(|(token, _)| table.eviction_reason(token).is_some())
            .count();
        prop_assert_eq!(remembered, capacity.min(tokens.len()));
        let (last, reason) = tokens[tokens.len() - 1];
        prop_assert_eq!(table.eviction_reason(&last), Some(reason));
    }
}
