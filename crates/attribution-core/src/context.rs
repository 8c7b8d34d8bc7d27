//! Navigation registration contexts.
//!
//! A context tracks every outstanding registration leg of one navigation
//! family (or one beacon-tied navigation) so deferred triggers are released
//! only once nothing that could still register a source is in flight.
//!
//! # Accounting
//!
//! ```text
//! pending = outstanding legs
//!         + expected background legs not yet started
//!         + parses in flight
//! ```
//!
//! `will_start(n)` records `n` expected background legs; background legs
//! claim that estimate before adding to it. Parse completion and leg
//! completion are independent and both gate the flush. Contexts live in a
//! keyed [`ContextTable`]; every mutation is a plain method returning what
//! changed, and the coordinator turns those results into outcome records.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::ids::{
    AttributionSrcToken, BackgroundRegistrationId, BeaconId, ChannelId, FrameId, NavigationId,
};
use crate::origin::SuitableOrigin;

/// Key of a live context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKey {
    /// Navigation family correlated by token.
    Token(AttributionSrcToken),
    /// Beacon-only family correlated by navigation id.
    Navigation(NavigationId),
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(token) => write!(f, "token-{token}"),
            Self::Navigation(id) => id.fmt(f),
        }
    }
}

/// One registration leg of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegKey {
    /// The navigation's own redirect/response chain.
    Foreground,
    NavigationChannel(ChannelId),
    Background(BackgroundRegistrationId),
    Beacon(BeaconId),
}

impl LegKey {
    /// Background and beacon legs get tie outcomes; the others do not.
    #[must_use]
    pub const fn is_tieable(self) -> bool {
        matches!(self, Self::Background(_) | Self::Beacon(_))
    }
}

impl fmt::Display for LegKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Foreground => f.write_str("foreground"),
            Self::NavigationChannel(id) => id.fmt(f),
            Self::Background(id) => id.fmt(f),
            Self::Beacon(id) => id.fmt(f),
        }
    }
}

/// Whether a leg has been tied to its navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegTie {
    NotApplicable,
    /// Started before its navigation was bound.
    Pending,
    Immediately,
    WithDelay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStatus {
    Outstanding,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LegState {
    status: LegStatus,
    tie: LegTie,
}

/// Why a context left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Flushed,
    TimedOut,
    Ineligible,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flushed => f.write_str("flushed"),
            Self::TimedOut => f.write_str("timed_out"),
            Self::Ineligible => f.write_str("ineligible"),
        }
    }
}

/// Navigation metadata bound by `notify_navigation_registration_started`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationBinding {
    pub navigation_id: NavigationId,
    /// Origin of the page that initiated the navigation.
    pub source_origin: SuitableOrigin,
    pub is_within_fenced_frame: bool,
    pub frame_id: FrameId,
}

/// Result of starting a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegStart {
    /// New leg; `claimed_estimate` is true when it consumed a will-start slot.
    Added { claimed_estimate: bool },
    AlreadyKnown,
}

/// Per-family bookkeeping; see the module docs for the pending formula.
#[derive(Debug, Clone)]
pub struct NavigationRegistrationContext {
    key: ContextKey,
    epoch: u64,
    created_at: Instant,
    expected_background: u32,
    claimed_background: u32,
    will_start_seen: bool,
    legs: BTreeMap<LegKey, LegState>,
    completed_legs: u32,
    in_flight_parses: u32,
    binding: Option<NavigationBinding>,
    eligible: bool,
}

impl NavigationRegistrationContext {
    #[must_use]
    pub fn new(key: ContextKey, epoch: u64, created_at: Instant) -> Self {
        Self {
            key,
            epoch,
            created_at,
            expected_background: 0,
            claimed_background: 0,
            will_start_seen: false,
            legs: BTreeMap::new(),
            completed_legs: 0,
            in_flight_parses: 0,
            binding: None,
            eligible: true,
        }
    }

    #[must_use]
    pub const fn key(&self) -> ContextKey {
        self.key
    }

    /// Distinguishes successive contexts that reuse a key.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub const fn will_start_seen(&self) -> bool {
        self.will_start_seen
    }

    #[must_use]
    pub const fn binding(&self) -> Option<&NavigationBinding> {
        self.binding.as_ref()
    }

    /// Origin the navigation lands on, once bound.
    #[must_use]
    pub fn destination_origin(&self) -> Option<&SuitableOrigin> {
        self.binding.as_ref().map(|binding| &binding.source_origin)
    }

    #[must_use]
    pub const fn is_eligible(&self) -> bool {
        self.eligible
    }

    /// Record the will-start estimate. Returns false if one was already recorded.
    pub fn announce_background(&mut self, expected_legs: u32) -> bool {
        if self.will_start_seen {
            return false;
        }
        self.will_start_seen = true;
        self.expected_background = expected_legs;
        true
    }

    /// Bind navigation metadata and tie every pending leg.
    ///
    /// Returns the legs that became tied, or `None` if already bound.
    pub fn bind(&mut self, binding: NavigationBinding) -> Option<Vec<LegKey>> {
        if self.binding.is_some() {
            return None;
        }
        self.binding = Some(binding);
        let mut tied = Vec::new();
        for (leg, state) in &mut self.legs {
            if state.tie == LegTie::Pending {
                state.tie = LegTie::WithDelay;
                tied.push(*leg);
            }
        }
        Some(tied)
    }

    pub fn start_leg(&mut self, leg: LegKey, tie: LegTie) -> LegStart {
        if self.legs.contains_key(&leg) {
            return LegStart::AlreadyKnown;
        }
        let mut claimed_estimate = false;
        if matches!(leg, LegKey::Background(_)) {
            claimed_estimate = self.claimed_background < self.expected_background;
            self.claimed_background = self.claimed_background.saturating_add(1);
        }
        self.legs.insert(
            leg,
            LegState {
                status: LegStatus::Outstanding,
                tie,
            },
        );
        LegStart::Added { claimed_estimate }
    }

    /// Tie a tieable leg based on the current binding.
    #[must_use]
    pub fn initial_tie(&self, leg: LegKey) -> LegTie {
        if !leg.is_tieable() {
            LegTie::NotApplicable
        } else if self.binding.is_some() || matches!(self.key, ContextKey::Navigation(_)) {
            LegTie::Immediately
        } else {
            LegTie::Pending
        }
    }

    /// Returns false if the leg is unknown or already completed.
    pub fn complete_leg(&mut self, leg: LegKey) -> bool {
        match self.legs.get_mut(&leg) {
            Some(state) if state.status == LegStatus::Outstanding => {
                state.status = LegStatus::Completed;
                self.completed_legs = self.completed_legs.saturating_add(1);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn leg_status(&self, leg: LegKey) -> Option<LegStatus> {
        self.legs.get(&leg).map(|state| state.status)
    }

    #[must_use]
    pub fn leg_tie(&self, leg: LegKey) -> Option<LegTie> {
        self.legs.get(&leg).map(|state| state.tie)
    }

    pub fn begin_parse(&mut self) {
        self.in_flight_parses = self.in_flight_parses.saturating_add(1);
    }

    pub fn finish_parse(&mut self) {
        self.in_flight_parses = self.in_flight_parses.saturating_sub(1);
    }

    #[must_use]
    pub const fn in_flight_parses(&self) -> u32 {
        self.in_flight_parses
    }

    #[must_use]
    pub fn outstanding_legs(&self) -> u32 {
        self.legs
            .values()
            .filter(|state| state.status == LegStatus::Outstanding)
            .count() as u32
    }

    /// Legs that have started but not completed.
    #[must_use]
    pub fn outstanding(&self) -> Vec<LegKey> {
        self.legs
            .iter()
            .filter(|(_, state)| state.status == LegStatus::Outstanding)
            .map(|(leg, _)| *leg)
            .collect()
    }

    #[must_use]
    pub const fn unclaimed_expected(&self) -> u32 {
        self.expected_background.saturating_sub(self.claimed_background)
    }

    /// Saturates, so a huge will-start estimate can never wrap to zero.
    #[must_use]
    pub fn pending(&self) -> u32 {
        self.outstanding_legs()
            .saturating_add(self.unclaimed_expected())
            .saturating_add(self.in_flight_parses)
    }

    /// Natural completion: nothing outstanding, expected, or parsing.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.pending() == 0
    }

    /// Every leg this context expects to see, started or not.
    #[must_use]
    pub fn expected_legs(&self) -> u32 {
        let non_background = self
            .legs
            .keys()
            .filter(|leg| !matches!(leg, LegKey::Background(_)))
            .count() as u32;
        non_background.saturating_add(self.expected_background.max(self.claimed_background))
    }

    #[must_use]
    pub const fn completed_legs(&self) -> u32 {
        self.completed_legs
    }

    pub fn mark_ineligible(&mut self) {
        self.eligible = false;
    }

    /// Tieable legs still waiting for their navigation.
    #[must_use]
    pub fn pending_ties(&self) -> Vec<LegKey> {
        self.legs
            .iter()
            .filter(|(_, state)| state.tie == LegTie::Pending)
            .map(|(leg, _)| *leg)
            .collect()
    }

    #[must_use]
    pub fn snapshot(&self, now: Instant, queued_triggers: usize) -> ContextSnapshot {
        ContextSnapshot {
            key: self.key,
            pending: self.pending(),
            expected_legs: self.expected_legs(),
            completed_legs: self.completed_legs,
            in_flight_parses: self.in_flight_parses,
            queued_triggers,
            age: now.saturating_duration_since(self.created_at),
            eligible: self.eligible,
            bound: self.binding.is_some(),
        }
    }
}

/// Serializable view of one live context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub key: ContextKey,
    pub pending: u32,
    pub expected_legs: u32,
    pub completed_legs: u32,
    pub in_flight_parses: u32,
    pub queued_triggers: usize,
    pub age: Duration,
    pub eligible: bool,
    pub bound: bool,
}

/// Keyed arena of live contexts plus a bounded memory of evicted tokens.
#[derive(Debug)]
pub struct ContextTable {
    contexts: HashMap<ContextKey, NavigationRegistrationContext>,
    navigation_index: HashMap<NavigationId, ContextKey>,
    evicted: LruCache<AttributionSrcToken, EvictionReason>,
    next_epoch: u64,
}

impl ContextTable {
    #[must_use]
    pub fn new(eviction_memory: usize) -> Self {
        let capacity = NonZeroUsize::new(eviction_memory).unwrap_or(NonZeroUsize::MIN);
        Self {
            contexts: HashMap::new(),
            navigation_index: HashMap::new(),
            evicted: LruCache::new(capacity),
            next_epoch: 1,
        }
    }

    /// Create a context for `key`. Returns `None` if one is already live.
    pub fn create(
        &mut self,
        key: ContextKey,
        now: Instant,
    ) -> Option<&mut NavigationRegistrationContext> {
        if self.contexts.contains_key(&key) {
            return None;
        }
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        if let ContextKey::Token(token) = key {
            self.evicted.pop(&token);
        }
        if let ContextKey::Navigation(navigation_id) = key {
            self.index_navigation(navigation_id, key);
        }
        Some(
            self.contexts
                .entry(key)
                .or_insert_with(|| NavigationRegistrationContext::new(key, epoch, now)),
        )
    }

    #[must_use]
    pub fn contains(&self, key: &ContextKey) -> bool {
        self.contexts.contains_key(key)
    }

    #[must_use]
    pub fn get(&self, key: &ContextKey) -> Option<&NavigationRegistrationContext> {
        self.contexts.get(key)
    }

    pub fn get_mut(&mut self, key: &ContextKey) -> Option<&mut NavigationRegistrationContext> {
        self.contexts.get_mut(key)
    }

    /// Route a navigation id to a context. The first context to claim an id keeps it.
    pub fn index_navigation(&mut self, navigation_id: NavigationId, key: ContextKey) -> bool {
        match self.navigation_index.get(&navigation_id) {
            Some(existing) if self.contexts.contains_key(existing) => *existing == key,
            _ => {
                self.navigation_index.insert(navigation_id, key);
                true
            }
        }
    }

    #[must_use]
    pub fn by_navigation(&self, navigation_id: NavigationId) -> Option<ContextKey> {
        self.navigation_index
            .get(&navigation_id)
            .copied()
            .filter(|key| self.contexts.contains_key(key))
    }

    /// Remove a context and remember why, for token-keyed families.
    pub fn remove(
        &mut self,
        key: &ContextKey,
        reason: EvictionReason,
    ) -> Option<NavigationRegistrationContext> {
        let context = self.contexts.remove(key)?;
        self.navigation_index.retain(|_, indexed| indexed != key);
        if let ContextKey::Token(token) = key {
            self.evicted.put(*token, reason);
        }
        Some(context)
    }

    #[must_use]
    pub fn eviction_reason(&self, token: &AttributionSrcToken) -> Option<EvictionReason> {
        self.evicted.peek(token).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NavigationRegistrationContext> {
        self.contexts.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(navigation_id: i64) -> NavigationBinding {
        NavigationBinding {
            navigation_id: NavigationId::new(navigation_id),
            source_origin: SuitableOrigin::parse("https://source.test").unwrap(),
            is_within_fenced_frame: false,
            frame_id: FrameId::new(1, 1),
        }
    }

    fn token_context() -> NavigationRegistrationContext {
        NavigationRegistrationContext::new(
            ContextKey::Token(AttributionSrcToken::new()),
            1,
            Instant::now(),
        )
    }

    #[test]
    fn will_start_estimate_counts_as_pending() {
        let mut ctx = token_context();
        assert!(ctx.is_complete());
        assert!(ctx.announce_background(2));
        assert_eq!(ctx.pending(), 2);
        assert!(!ctx.announce_background(5), "second estimate is ignored");
        assert_eq!(ctx.expected_legs(), 2);
    }

    #[test]
    fn huge_estimate_saturates_instead_of_wrapping() {
        let mut ctx = token_context();
        assert!(ctx.announce_background(u32::MAX));
        ctx.start_leg(LegKey::Foreground, LegTie::NotApplicable);
        ctx.begin_parse();
        assert_eq!(ctx.pending(), u32::MAX);
        assert_eq!(ctx.expected_legs(), u32::MAX);
        assert!(!ctx.is_complete());
        let snapshot = ctx.snapshot(Instant::now(), 0);
        assert_eq!(snapshot.pending, u32::MAX);
    }

    #[test]
    fn background_legs_claim_estimate_before_adding() {
        let mut ctx = token_context();
        ctx.announce_background(1);
        let bg1 = LegKey::Background(BackgroundRegistrationId::new(1));
        let bg2 = LegKey::Background(BackgroundRegistrationId::new(2));

        assert_eq!(
            ctx.start_leg(bg1, LegTie::Pending),
            LegStart::Added {
                claimed_estimate: true
            }
        );
        assert_eq!(ctx.pending(), 1);
        assert_eq!(
            ctx.start_leg(bg2, LegTie::Pending),
            LegStart::Added {
                claimed_estimate: false
            }
        );
        assert_eq!(ctx.pending(), 2);
        assert_eq!(ctx.start_leg(bg2, LegTie::Pending), LegStart::AlreadyKnown);
        assert_eq!(ctx.pending(), 2);
        assert_eq!(ctx.expected_legs(), 2);
    }

    #[test]
    fn parse_and_leg_completion_both_gate() {
        let mut ctx = token_context();
        ctx.start_leg(LegKey::Foreground, LegTie::NotApplicable);
        ctx.begin_parse();
        assert!(ctx.complete_leg(LegKey::Foreground));
        assert!(!ctx.is_complete(), "parse still in flight");
        ctx.finish_parse();
        assert!(ctx.is_complete());
        assert!(!ctx.complete_leg(LegKey::Foreground), "already completed");
        assert_eq!(ctx.completed_legs(), 1);
    }

    #[test]
    fn binding_ties_pending_legs_once() {
        let mut ctx = token_context();
        let bg = LegKey::Background(BackgroundRegistrationId::new(3));
        let tie = ctx.initial_tie(bg);
        assert_eq!(tie, LegTie::Pending);
        ctx.start_leg(bg, tie);

        let tied = ctx.bind(binding(1)).unwrap();
        assert_eq!(tied, vec![bg]);
        assert_eq!(ctx.leg_tie(bg), Some(LegTie::WithDelay));
        assert!(ctx.bind(binding(2)).is_none(), "rebinding is refused");
        assert_eq!(ctx.binding().unwrap().navigation_id, NavigationId::new(1));

        let later = LegKey::Background(BackgroundRegistrationId::new(4));
        assert_eq!(ctx.initial_tie(later), LegTie::Immediately);
    }

    #[test]
    fn beacon_keyed_contexts_tie_immediately() {
        let ctx = NavigationRegistrationContext::new(
            ContextKey::Navigation(NavigationId::new(5)),
            1,
            Instant::now(),
        );
        assert_eq!(
            ctx.initial_tie(LegKey::Beacon(BeaconId::new(1))),
            LegTie::Immediately
        );
        assert_eq!(
            ctx.initial_tie(LegKey::Foreground),
            LegTie::NotApplicable
        );
    }

    #[test]
    fn table_remembers_token_evictions() {
        let mut table = ContextTable::new(2);
        let token = AttributionSrcToken::new();
        let key = ContextKey::Token(token);
        let now = Instant::now();

        let epoch = table.create(key, now).unwrap().epoch();
        assert!(table.create(key, now).is_none());
        assert!(table.index_navigation(NavigationId::new(9), key));
        assert_eq!(table.by_navigation(NavigationId::new(9)), Some(key));

        table.remove(&key, EvictionReason::TimedOut).unwrap();
        assert_eq!(table.eviction_reason(&token), Some(EvictionReason::TimedOut));
        assert_eq!(table.by_navigation(NavigationId::new(9)), None);

        let recreated = table.create(key, now).unwrap().epoch();
        assert!(recreated > epoch);
        assert_eq!(table.eviction_reason(&token), None);
    }

    #[test]
    fn first_context_keeps_navigation_index() {
        let mut table = ContextTable::new(4);
        let now = Instant::now();
        let nav = NavigationId::new(3);
        let beacon_key = ContextKey::Navigation(nav);
        let token_key = ContextKey::Token(AttributionSrcToken::new());
        table.create(beacon_key, now);
        table.create(token_key, now);

        assert!(!table.index_navigation(nav, token_key));
        assert_eq!(table.by_navigation(nav), Some(beacon_key));

        table.remove(&beacon_key, EvictionReason::Flushed);
        assert!(table.index_navigation(nav, token_key));
        assert_eq!(table.by_navigation(nav), Some(token_key));
    }

    #[test]
    fn eviction_memory_is_bounded() {
        let mut table = ContextTable::new(1);
        let now = Instant::now();
        let first = AttributionSrcToken::new();
        let second = AttributionSrcToken::new();
        for token in [first, second] {
            let key = ContextKey::Token(token);
            table.create(key, now);
            table.remove(&key, EvictionReason::Ineligible);
        }
        assert_eq!(table.eviction_reason(&first), None);
        assert_eq!(
            table.eviction_reason(&second),
            Some(EvictionReason::Ineligible)
        );
    }

    #[test]
    fn snapshot_reports_accounting() {
        let mut ctx = token_context();
        ctx.announce_background(2);
        ctx.start_leg(LegKey::Foreground, LegTie::NotApplicable);
        ctx.bind(binding(4));
        let snap = ctx.snapshot(ctx.created_at() + Duration::from_millis(10), 3);
        assert_eq!(snap.pending, 3);
        assert_eq!(snap.expected_legs, 3);
        assert_eq!(snap.queued_triggers, 3);
        assert_eq!(snap.age, Duration::from_millis(10));
        assert!(snap.bound);
        assert!(snap.eligible);
    }
}
