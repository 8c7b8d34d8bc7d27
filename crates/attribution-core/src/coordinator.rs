//! Registration coordinator.
//!
//! [`Coordinator`] is the synchronous core of the event loop. Every public
//! method handles one inbound call to completion, and the two internal event
//! streams it produces (timer fires and parse completions) come back
//! through [`Coordinator::on_timer_fired`] and
//! [`Coordinator::on_parse_completed`]. The async shell lives in
//! [`crate::service`].
//!
//! Routing rules in brief:
//!
//! - sources are delivered as soon as they are parsed
//! - triggers go through the [`DeferredTriggerQueue`] of the context they
//!   resolve to, or straight to the sink when none is live
//! - a context flushes when its pending count reaches zero, when its timer
//!   fires, or when its navigation turns out to be ineligible

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::channel::{BufferedSource, ChannelKind, ChannelRegistry, RegistrationChannel};
use crate::config::CoordinatorConfig;
use crate::context::{
    ContextKey, ContextSnapshot, ContextTable, EvictionReason, LegKey, LegStart, LegStatus,
    LegTie, NavigationBinding, NavigationRegistrationContext,
};
use crate::coordinator_span;
use crate::deferred::{DeferredTriggerQueue, EnqueueOutcome, PendingTrigger};
use crate::error::{ParseError, RegistrationError};
use crate::ids::{
    AttributionSrcToken, BackgroundRegistrationId, BeaconId, ChannelId, FrameId, NavigationId,
};
use crate::origin::SuitableOrigin;
use crate::parser::{
    JsonRegistrationParser, ParsedRegistration, RegistrationHeaders, RegistrationParser,
    parse_headers,
};
use crate::registration::{
    AttributionSource, AttributionTrigger, OsRegistration, RegistrationContext,
    RegistrationEligibility, RegistrationKind, SourceRegistration, SourceType,
    TriggerRegistration,
};
use crate::sink::AttributionSink;
use crate::telemetry::{
    Diagnostic, NavigationDataHostStatus, OutcomeRecord, OutcomeSink, OutcomeSubject, OutcomeTag,
    UnexpectedRegistration,
};
use crate::timeout::{TimeoutScheduler, TimerFired};

// =============================================================================
// Event plumbing
// =============================================================================

/// Where a parsed registration ends up.
#[derive(Debug, Clone)]
struct DeliveryTarget {
    context_origin: SuitableOrigin,
    is_within_fenced_frame: bool,
    frame_id: FrameId,
    source_type: SourceType,
    correlation: Option<ContextKey>,
    last_navigation_id: Option<NavigationId>,
}

impl DeliveryTarget {
    fn navigation(binding: &NavigationBinding, key: ContextKey) -> Self {
        Self {
            context_origin: binding.source_origin.clone(),
            is_within_fenced_frame: binding.is_within_fenced_frame,
            frame_id: binding.frame_id,
            source_type: SourceType::Navigation,
            correlation: Some(key),
            last_navigation_id: Some(binding.navigation_id),
        }
    }

    /// `None` while a navigation-tied channel is unbound.
    fn from_channel(channel: &RegistrationChannel) -> Option<Self> {
        let page = channel.context()?;
        Some(Self {
            context_origin: page.context_origin.clone(),
            is_within_fenced_frame: page.is_within_fenced_frame,
            frame_id: page.frame_id,
            source_type: channel.kind().source_type(),
            correlation: channel.correlation(),
            last_navigation_id: page.last_navigation_id,
        })
    }

    fn trigger(
        &self,
        registration: TriggerRegistration,
        reporting_origin: SuitableOrigin,
        arrival_sequence: u64,
    ) -> PendingTrigger {
        PendingTrigger {
            trigger: AttributionTrigger {
                registration,
                destination_origin: self.context_origin.clone(),
                reporting_origin,
                is_within_fenced_frame: self.is_within_fenced_frame,
                processed_after_timeout: false,
            },
            frame_id: self.frame_id,
            arrival_sequence,
        }
    }
}

#[derive(Debug)]
struct ParseJob {
    /// Context whose pending count this parse holds, with its epoch.
    capture: Option<(ContextKey, u64)>,
    /// Channel and leg of a background or beacon flow.
    leg: Option<(ChannelId, LegKey)>,
    target: DeliveryTarget,
    reporting_origin: SuitableOrigin,
    arrival_sequence: u64,
}

/// Parsed data from a leg still waiting for its navigation.
#[derive(Debug)]
enum HeldPayload {
    Source {
        registration: SourceRegistration,
        reporting_origin: SuitableOrigin,
    },
    Os {
        kind: RegistrationKind,
        urls: Vec<Url>,
    },
    Trigger(PendingTrigger),
}

#[derive(Debug)]
struct HeldRegistration {
    leg: LegKey,
    arrival_sequence: u64,
    target: DeliveryTarget,
    payload: HeldPayload,
}

/// A finished header parse on its way back to the event loop.
#[derive(Debug)]
pub struct ParseCompletion {
    job: ParseJob,
    result: Result<Option<ParsedRegistration>, ParseError>,
}

/// Receivers for the events a [`Coordinator`] generates for itself.
#[derive(Debug)]
pub struct CoordinatorEvents {
    pub timers: mpsc::Receiver<TimerFired>,
    pub parses: mpsc::Receiver<ParseCompletion>,
}

/// Serializable view of the coordinator's live state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorSnapshot {
    pub contexts: Vec<ContextSnapshot>,
    pub open_channels: usize,
    pub in_flight_parses: usize,
    pub queued_triggers: usize,
    /// Parsed registrations held for legs not yet tied to a navigation.
    pub held_registrations: usize,
    pub armed_timers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushCause {
    Completed,
    TimedOut,
    Ineligible,
}

impl FlushCause {
    const fn eviction_reason(self) -> EvictionReason {
        match self {
            Self::Completed => EvictionReason::Flushed,
            Self::TimedOut => EvictionReason::TimedOut,
            Self::Ineligible => EvictionReason::Ineligible,
        }
    }
}

/// Upper bound on per-index outcome records for expected legs that never
/// arrived.
const MAX_EXPECTED_LEG_RECORDS: u32 = 1024;

const fn never_tied(reason: EvictionReason) -> OutcomeTag {
    match reason {
        EvictionReason::TimedOut => OutcomeTag::NeverTiedTimeout,
        EvictionReason::Flushed | EvictionReason::Ineligible => OutcomeTag::NeverTiedIneligible,
    }
}

const fn leg_subject(leg: LegKey) -> Option<OutcomeSubject> {
    match leg {
        LegKey::Background(id) => Some(OutcomeSubject::BackgroundLeg { id }),
        LegKey::Beacon(id) => Some(OutcomeSubject::BeaconLeg { id }),
        LegKey::Foreground | LegKey::NavigationChannel(_) => None,
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct Coordinator {
    config: CoordinatorConfig,
    channels: ChannelRegistry,
    contexts: ContextTable,
    queue: DeferredTriggerQueue,
    timers: TimeoutScheduler,
    parser: Arc<dyn RegistrationParser>,
    parse_tx: mpsc::Sender<ParseCompletion>,
    parses_in_flight: usize,
    held: HashMap<ContextKey, Vec<HeldRegistration>>,
    sink: Arc<dyn AttributionSink>,
    outcomes: Arc<dyn OutcomeSink>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("contexts", &self.contexts.len())
            .field("channels", &self.channels.len())
            .field("queued_triggers", &self.queue.total())
            .field("parses_in_flight", &self.parses_in_flight)
            .field("held_contexts", &self.held.len())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Build a coordinator with the JSON parser.
    ///
    /// Timers and parse jobs are spawned onto the ambient tokio runtime, so
    /// the notification methods must run inside one.
    #[must_use]
    pub fn new(
        config: CoordinatorConfig,
        sink: Arc<dyn AttributionSink>,
        outcomes: Arc<dyn OutcomeSink>,
    ) -> (Self, CoordinatorEvents) {
        let capacity = config.event_queue_capacity.max(1);
        let (timer_tx, timer_rx) = mpsc::channel(capacity);
        let (parse_tx, parse_rx) = mpsc::channel(capacity);
        let coordinator = Self {
            channels: ChannelRegistry::new(config.eviction_memory),
            contexts: ContextTable::new(config.eviction_memory),
            queue: DeferredTriggerQueue::new(config.max_deferred_per_context),
            timers: TimeoutScheduler::new(config.deferral_timeout(), timer_tx),
            parser: Arc::new(JsonRegistrationParser),
            parse_tx,
            parses_in_flight: 0,
            held: HashMap::new(),
            sink,
            outcomes,
            config,
        };
        let events = CoordinatorEvents {
            timers: timer_rx,
            parses: parse_rx,
        };
        (coordinator, events)
    }

    pub fn set_parser(&mut self, parser: Arc<dyn RegistrationParser>) {
        self.parser = parser;
    }

    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    #[must_use]
    pub const fn parses_in_flight(&self) -> usize {
        self.parses_in_flight
    }

    #[must_use]
    pub fn context(&self, key: &ContextKey) -> Option<&NavigationRegistrationContext> {
        self.contexts.get(key)
    }

    #[must_use]
    pub fn channel(&self, id: ChannelId) -> Option<&RegistrationChannel> {
        self.channels.get(id)
    }

    #[must_use]
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let now = Instant::now();
        let mut contexts: Vec<ContextSnapshot> = self
            .contexts
            .iter()
            .map(|ctx| ctx.snapshot(now, self.queue.len(&ctx.key())))
            .collect();
        contexts.sort_by_key(|snapshot| snapshot.key);
        CoordinatorSnapshot {
            contexts,
            open_channels: self.channels.open_count(),
            in_flight_parses: self.parses_in_flight,
            queued_triggers: self.queue.total(),
            held_registrations: self.held.values().map(Vec::len).sum(),
            armed_timers: self.timers.armed(),
        }
    }

    /// Stop every timer. Queued triggers stay undelivered.
    pub fn shutdown(&mut self) {
        self.timers.cancel_all();
        info!(
            contexts = self.contexts.len(),
            queued_triggers = self.queue.total(),
            held_registrations = self.held.values().map(Vec::len).sum::<usize>(),
            "coordinator stopped"
        );
    }

    // -------------------------------------------------------------------------
    // Channel registration
    // -------------------------------------------------------------------------

    pub fn register_data_host(
        &mut self,
        context: RegistrationContext,
        eligibility: RegistrationEligibility,
    ) -> ChannelId {
        let channel = self.channels.register_direct(context, eligibility);
        debug!(channel_id = %channel, %eligibility, "data host registered");
        channel
    }

    /// Register the navigation-tied channel for `token`.
    ///
    /// A second registration for the same token fails without touching the
    /// existing channel or context.
    pub fn register_navigation_data_host(
        &mut self,
        token: AttributionSrcToken,
    ) -> Result<ChannelId, RegistrationError> {
        let channel = match self.channels.register_navigation(token) {
            Ok(channel) => channel,
            Err(err) => {
                warn!(token = %token, "navigation data host already registered");
                self.outcomes.diagnostic(err.clone().into());
                return Err(err);
            }
        };
        let key = ContextKey::Token(token);
        self.ensure_context(key);
        let binding = self.contexts.get_mut(&key).and_then(|ctx| {
            ctx.start_leg(LegKey::NavigationChannel(channel), LegTie::NotApplicable);
            ctx.binding().cloned()
        });
        if let Some(binding) = binding {
            // Navigation already started; nothing to buffer.
            if let Some(entry) = self.channels.get_mut(channel) {
                entry.bind_context(page_for(&binding));
            }
        }
        debug!(token = %token, channel_id = %channel, "navigation data host registered");
        Ok(channel)
    }

    // -------------------------------------------------------------------------
    // Navigation notifications
    // -------------------------------------------------------------------------

    pub fn notify_navigation_with_background_registrations_will_start(
        &mut self,
        token: AttributionSrcToken,
        expected_legs: u32,
    ) {
        let key = ContextKey::Token(token);
        self.ensure_context(key);
        let announced = self
            .contexts
            .get_mut(&key)
            .is_some_and(|ctx| ctx.announce_background(expected_legs));
        if !announced {
            debug!(token = %token, "duplicate will-start ignored");
            self.unexpected(token, UnexpectedRegistration::RegistrationAlreadyExists);
            return;
        }
        debug!(token = %token, expected_legs, "background registrations will start");
        self.maybe_flush(key);
    }

    pub fn notify_navigation_registration_started(
        &mut self,
        token: AttributionSrcToken,
        binding: NavigationBinding,
    ) {
        let key = ContextKey::Token(token);
        let span = coordinator_span!(
            "navigation_started",
            token = %token,
            navigation_id = %binding.navigation_id
        );
        let _guard = span.enter();

        self.ensure_context(key);
        let Some(ctx) = self.contexts.get_mut(&key) else {
            return;
        };
        if ctx.leg_status(LegKey::Foreground).is_some() {
            debug!("navigation registration already started");
            self.unexpected(token, UnexpectedRegistration::RegistrationAlreadyExists);
            return;
        }
        ctx.start_leg(LegKey::Foreground, LegTie::NotApplicable);
        let tied = ctx.bind(binding.clone()).unwrap_or_default();
        if !self.contexts.index_navigation(binding.navigation_id, key) {
            debug!("navigation id already routed to another context");
        }
        for leg in tied {
            debug!(leg = %leg, "leg tied to navigation");
            self.record_leg(leg, key, OutcomeTag::TiedWithDelay);
        }
        self.release_held(key);

        let status = self.bind_navigation_channel(token, key, &binding);
        debug!(status = ?status, "navigation data host status");
        self.outcomes
            .diagnostic(Diagnostic::NavigationDataHost { token, status });
    }

    /// Returns false when the navigation leg is not active.
    pub fn notify_navigation_registration_data(
        &mut self,
        token: AttributionSrcToken,
        headers: RegistrationHeaders,
        reporting_url: &Url,
    ) -> bool {
        let key = ContextKey::Token(token);
        let target = self.contexts.get(&key).and_then(|ctx| {
            if ctx.leg_status(LegKey::Foreground) != Some(LegStatus::Outstanding) {
                return None;
            }
            ctx.binding()
                .map(|binding| (DeliveryTarget::navigation(binding, key), ctx.epoch()))
        });
        let Some((target, epoch)) = target else {
            debug!(token = %token, "navigation data without an active registration");
            self.unexpected(
                token,
                UnexpectedRegistration::RegistrationMissingUponReceivingData,
            );
            return false;
        };
        self.dispatch_parse(
            headers,
            RegistrationEligibility::SourceOnly,
            reporting_url,
            Some((key, epoch)),
            None,
            target,
        );
        true
    }

    pub fn notify_navigation_registration_completed(&mut self, token: AttributionSrcToken) {
        let key = ContextKey::Token(token);
        let Some(ctx) = self.contexts.get_mut(&key) else {
            debug!(token = %token, "navigation completed without a context");
            return;
        };
        if ctx.leg_status(LegKey::Foreground).is_none() {
            ctx.mark_ineligible();
            warn!(token = %token, "navigation completed before registering; context ineligible");
            self.flush(key, FlushCause::Ineligible);
            return;
        }
        ctx.complete_leg(LegKey::Foreground);
        self.maybe_flush(key);
    }

    // -------------------------------------------------------------------------
    // Background notifications
    // -------------------------------------------------------------------------

    /// Returns false for a duplicate id or a leg that can never be tied.
    pub fn notify_background_registration_started(
        &mut self,
        id: BackgroundRegistrationId,
        context: RegistrationContext,
        eligibility: RegistrationEligibility,
        token: Option<AttributionSrcToken>,
    ) -> bool {
        let Some(channel) = self
            .channels
            .register_background(id, context, eligibility, token)
        else {
            warn!(background_id = %id, "background registration already started");
            return false;
        };
        let Some(token) = token else {
            debug!(background_id = %id, channel_id = %channel, "event background registration started");
            return true;
        };

        let key = ContextKey::Token(token);
        let leg = LegKey::Background(id);
        if !self.contexts.contains(&key) {
            match self.contexts.eviction_reason(&token) {
                Some(reason @ (EvictionReason::TimedOut | EvictionReason::Ineligible)) => {
                    warn!(
                        background_id = %id,
                        token = %token,
                        reason = %reason,
                        "background registration started after its context was evicted"
                    );
                    self.reject_leg(channel, leg, key, reason);
                    return false;
                }
                Some(EvictionReason::Flushed) | None => {
                    self.create_context(key);
                }
            }
        }
        self.start_tieable_leg(key, leg);
        debug!(background_id = %id, token = %token, "background registration started");
        true
    }

    /// Returns false when the registration is unknown or can never be tied.
    pub fn notify_background_registration_data(
        &mut self,
        id: BackgroundRegistrationId,
        headers: RegistrationHeaders,
        reporting_url: &Url,
    ) -> bool {
        let Some(channel) = self.channels.background_channel(id) else {
            debug!(background_id = %id, "data for unknown background registration");
            return false;
        };
        self.channel_header_data(channel, headers, reporting_url)
    }

    pub fn notify_background_registration_completed(&mut self, id: BackgroundRegistrationId) {
        match self.channels.background_channel(id) {
            Some(channel) => self.finish_channel_leg(channel),
            None => debug!(background_id = %id, "completion for unknown background registration"),
        }
    }

    // -------------------------------------------------------------------------
    // Fenced-frame beacons
    // -------------------------------------------------------------------------

    pub fn notify_fenced_frame_reporting_beacon_started(
        &mut self,
        id: BeaconId,
        navigation_id: Option<NavigationId>,
        context: RegistrationContext,
    ) {
        let Some(channel) = self.channels.register_beacon(id, navigation_id, context) else {
            warn!(beacon_id = %id, "beacon already started");
            return;
        };
        let Some(navigation_id) = navigation_id else {
            debug!(beacon_id = %id, "event beacon started");
            return;
        };
        let key = match self.contexts.by_navigation(navigation_id) {
            Some(key) => key,
            None => {
                let key = ContextKey::Navigation(navigation_id);
                self.ensure_context(key);
                key
            }
        };
        if let Some(entry) = self.channels.get_mut(channel) {
            entry.set_correlation(key);
        }
        self.start_tieable_leg(key, LegKey::Beacon(id));
        debug!(beacon_id = %id, navigation_id = %navigation_id, context = %key, "navigation beacon started");
    }

    /// `is_final` completes the beacon's leg after the data is taken.
    pub fn notify_fenced_frame_reporting_beacon_data(
        &mut self,
        id: BeaconId,
        headers: RegistrationHeaders,
        reporting_url: &Url,
        is_final: bool,
    ) -> bool {
        let Some(channel) = self.channels.beacon_channel(id) else {
            debug!(beacon_id = %id, "data for unknown beacon");
            return false;
        };
        let accepted = self.channel_header_data(channel, headers, reporting_url);
        if is_final {
            self.finish_channel_leg(channel);
        }
        accepted
    }

    // -------------------------------------------------------------------------
    // Channel data events
    // -------------------------------------------------------------------------

    pub fn source_data_available(
        &mut self,
        channel: ChannelId,
        reporting_origin: SuitableOrigin,
        registration: SourceRegistration,
    ) -> Result<(), RegistrationError> {
        self.admit(channel, RegistrationKind::Source)?;
        let Some(entry) = self.channels.get_mut(channel) else {
            return Err(RegistrationError::UnknownChannel { channel });
        };
        entry.note_registration();
        match DeliveryTarget::from_channel(entry) {
            Some(target) => {
                self.deliver_source(&target, registration, reporting_origin);
                Ok(())
            }
            None => self.buffer_source(
                channel,
                BufferedSource::Web {
                    registration,
                    reporting_origin,
                },
            ),
        }
    }

    pub fn trigger_data_available(
        &mut self,
        channel: ChannelId,
        reporting_origin: SuitableOrigin,
        registration: TriggerRegistration,
    ) -> Result<(), RegistrationError> {
        self.admit(channel, RegistrationKind::Trigger)?;
        let Some(entry) = self.channels.get_mut(channel) else {
            return Err(RegistrationError::UnknownChannel { channel });
        };
        entry.note_registration();
        let Some(target) = DeliveryTarget::from_channel(entry) else {
            return Err(RegistrationError::EligibilityViolation {
                channel,
                registration: RegistrationKind::Trigger,
            });
        };
        let arrival_sequence = self.queue.reserve_sequence();
        let key = self.trigger_context(target.correlation, target.last_navigation_id);
        self.route_trigger(
            key,
            target.trigger(registration, reporting_origin, arrival_sequence),
        );
        Ok(())
    }

    pub fn os_source_data_available(
        &mut self,
        channel: ChannelId,
        registration_urls: Vec<Url>,
    ) -> Result<(), RegistrationError> {
        self.os_data_available(channel, RegistrationKind::Source, registration_urls)
    }

    pub fn os_trigger_data_available(
        &mut self,
        channel: ChannelId,
        registration_urls: Vec<Url>,
    ) -> Result<(), RegistrationError> {
        self.os_data_available(channel, RegistrationKind::Trigger, registration_urls)
    }

    fn os_data_available(
        &mut self,
        channel: ChannelId,
        kind: RegistrationKind,
        registration_urls: Vec<Url>,
    ) -> Result<(), RegistrationError> {
        self.admit(channel, kind)?;
        let Some(entry) = self.channels.get_mut(channel) else {
            return Err(RegistrationError::UnknownChannel { channel });
        };
        entry.note_registration();
        match DeliveryTarget::from_channel(entry) {
            Some(target) => {
                self.deliver_os(&target, kind, registration_urls);
                Ok(())
            }
            None => self.buffer_source(channel, BufferedSource::Os(registration_urls)),
        }
    }

    /// Close a channel. Never waits on in-flight parses.
    pub fn disconnect(&mut self, channel: ChannelId) {
        let Some(entry) = self.channels.get(channel) else {
            return;
        };
        match entry.kind() {
            ChannelKind::Direct => {
                if entry.registrations_seen() == 0 {
                    self.outcomes.record(OutcomeRecord::new(
                        OutcomeTag::Immediate,
                        OutcomeSubject::Channel { channel },
                    ));
                }
                self.finish_channel_leg(channel);
            }
            ChannelKind::NavigationTied { token }
                if entry.context().is_none() && entry.buffered_len() > 0 =>
            {
                debug!(
                    token = %token,
                    channel_id = %channel,
                    buffered = entry.buffered_len(),
                    "navigation data host disconnected with buffered sources"
                );
                if let Some(entry) = self.channels.get_mut(channel) {
                    entry.close();
                }
            }
            ChannelKind::NavigationTied { .. }
            | ChannelKind::BackgroundTied { .. }
            | ChannelKind::BeaconTied { .. } => self.finish_channel_leg(channel),
        }
    }

    // -------------------------------------------------------------------------
    // Internal events
    // -------------------------------------------------------------------------

    pub fn on_timer_fired(&mut self, fired: TimerFired) {
        if !self.timers.take_fired(&fired) {
            return;
        }
        let live = self
            .contexts
            .get(&fired.key)
            .is_some_and(|ctx| ctx.epoch() == fired.epoch);
        if live {
            self.flush(fired.key, FlushCause::TimedOut);
        }
    }

    pub fn on_parse_completed(&mut self, completion: ParseCompletion) {
        self.parses_in_flight = self.parses_in_flight.saturating_sub(1);
        let ParseCompletion { job, result } = completion;

        let owner = match job.capture {
            Some((key, epoch)) => match self.contexts.get(&key) {
                Some(ctx) if ctx.epoch() == epoch => Some(key),
                // A successor under the same key takes the result without
                // counting it.
                Some(_) => None,
                None => {
                    debug!(context = %key, "parse finished after its context was evicted; discarded");
                    return;
                }
            },
            None => None,
        };

        // Data from a leg that was refused a tie while parsing is dropped.
        let rejected = job
            .leg
            .and_then(|(channel, _)| self.channels.get(channel))
            .and_then(RegistrationChannel::rejection);
        // A leg still waiting for its navigation keeps its data until the tie
        // is decided.
        let hold = match (owner, job.leg) {
            (Some(key), Some((_, leg)))
                if self.contexts.get(&key).and_then(|ctx| ctx.leg_tie(leg))
                    == Some(LegTie::Pending) =>
            {
                Some((key, leg))
            }
            _ => None,
        };

        match result {
            Ok(Some(_)) if rejected.is_some() => {
                debug!(reporting_origin = %job.reporting_origin, "parsed data for never-tied leg dropped");
            }
            Ok(Some(parsed)) => match hold {
                Some((key, leg)) => self.hold_parsed(key, leg, job, parsed),
                None => self.deliver_parsed(job, parsed),
            },
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, reporting_origin = %job.reporting_origin, "registration dropped");
                self.outcomes.diagnostic(RegistrationError::Parse(err).into());
            }
        }

        if let Some(key) = owner {
            if let Some(ctx) = self.contexts.get_mut(&key) {
                ctx.finish_parse();
            }
            self.maybe_flush(key);
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn create_context(&mut self, key: ContextKey) {
        let Some(epoch) = self
            .contexts
            .create(key, Instant::now())
            .map(|ctx| ctx.epoch())
        else {
            return;
        };
        self.queue.open(key);
        self.timers.arm(key, epoch);
        debug!(context = %key, epoch, "context created");
    }

    fn ensure_context(&mut self, key: ContextKey) {
        if !self.contexts.contains(&key) {
            self.create_context(key);
        }
    }

    fn unexpected(&self, token: AttributionSrcToken, kind: UnexpectedRegistration) {
        self.outcomes
            .diagnostic(Diagnostic::Unexpected { token, kind });
    }

    fn record_leg(&self, leg: LegKey, key: ContextKey, tag: OutcomeTag) {
        if let Some(subject) = leg_subject(leg) {
            self.outcomes
                .record(OutcomeRecord::new(tag, subject).in_context(key));
        }
    }

    fn start_tieable_leg(&mut self, key: ContextKey, leg: LegKey) {
        let Some(ctx) = self.contexts.get_mut(&key) else {
            return;
        };
        let tie = ctx.initial_tie(leg);
        let added = matches!(ctx.start_leg(leg, tie), LegStart::Added { .. });
        if added && tie == LegTie::Immediately {
            self.record_leg(leg, key, OutcomeTag::TiedImmediately);
        }
    }

    fn reject_leg(
        &mut self,
        channel: ChannelId,
        leg: LegKey,
        key: ContextKey,
        reason: EvictionReason,
    ) {
        if let Some(entry) = self.channels.get_mut(channel) {
            entry.reject(reason);
        }
        self.record_leg(leg, key, never_tied(reason));
    }

    /// Eligibility gate for channel events. Violations close the channel.
    fn admit(&mut self, channel: ChannelId, kind: RegistrationKind) -> Result<(), RegistrationError> {
        let Err(err) = self.channels.check(channel, kind) else {
            return Ok(());
        };
        if matches!(err, RegistrationError::EligibilityViolation { .. }) {
            warn!(channel_id = %channel, registration = %kind, "eligibility violation; closing channel");
            if let Some(entry) = self.channels.get_mut(channel) {
                entry.take_buffered();
            }
            self.finish_channel_leg(channel);
        } else {
            debug!(channel_id = %channel, "event for closed or unknown channel");
        }
        self.outcomes.diagnostic(err.clone().into());
        Err(err)
    }

    fn buffer_source(
        &mut self,
        channel: ChannelId,
        source: BufferedSource,
    ) -> Result<(), RegistrationError> {
        let limit = self.config.max_deferred_per_context;
        let Some(entry) = self.channels.get_mut(channel) else {
            return Err(RegistrationError::UnknownChannel { channel });
        };
        let context = entry
            .correlation()
            .ok_or(RegistrationError::UnknownChannel { channel })?;
        if entry.buffer(source, limit).is_ok() {
            debug!(channel_id = %channel, context = %context, "source buffered until navigation starts");
            return Ok(());
        }
        let err = RegistrationError::CapacityExceeded { context, limit };
        warn!(channel_id = %channel, context = %context, limit, "source buffer full; registration dropped");
        self.outcomes.diagnostic(err.clone().into());
        Err(err)
    }

    /// Attach navigation metadata to the token's data host and release its buffer.
    fn bind_navigation_channel(
        &mut self,
        token: AttributionSrcToken,
        key: ContextKey,
        binding: &NavigationBinding,
    ) -> NavigationDataHostStatus {
        let Some(channel) = self.channels.navigation_channel(token) else {
            return if self.channels.is_retired(token) {
                NavigationDataHostStatus::Processed
            } else {
                NavigationDataHostStatus::NotFound
            };
        };
        let Some(entry) = self.channels.get_mut(channel) else {
            return NavigationDataHostStatus::NotFound;
        };
        entry.bind_context(page_for(binding));
        let buffered = entry.take_buffered();
        let still_open = entry.is_open();
        let Some(target) = DeliveryTarget::from_channel(entry) else {
            return NavigationDataHostStatus::Registered;
        };

        debug!(channel_id = %channel, released = buffered.len(), "releasing buffered sources");
        for source in buffered {
            match source {
                BufferedSource::Web {
                    registration,
                    reporting_origin,
                } => self.deliver_source(&target, registration, reporting_origin),
                BufferedSource::Os(urls) => {
                    self.deliver_os(&target, RegistrationKind::Source, urls);
                }
            }
        }
        if !still_open {
            self.channels.remove(channel);
            if let Some(ctx) = self.contexts.get_mut(&key) {
                ctx.complete_leg(LegKey::NavigationChannel(channel));
            }
            self.maybe_flush(key);
        }
        NavigationDataHostStatus::Registered
    }

    /// Shared path for header-carrying channels (background and beacon).
    fn channel_header_data(
        &mut self,
        channel: ChannelId,
        headers: RegistrationHeaders,
        reporting_url: &Url,
    ) -> bool {
        let Some(entry) = self.channels.get_mut(channel) else {
            return false;
        };
        if let Some(reason) = entry.rejection() {
            debug!(channel_id = %channel, reason = %reason, "data rejected for never-tied leg");
            return false;
        }
        let Some(target) = DeliveryTarget::from_channel(entry) else {
            return false;
        };
        entry.note_registration();
        let eligibility = entry.eligibility();
        let leg = entry.leg();

        let capture = match (leg, target.correlation) {
            (Some(leg), Some(key)) => self
                .contexts
                .get(&key)
                .filter(|ctx| ctx.leg_status(leg) == Some(LegStatus::Outstanding))
                .map(|ctx| (key, ctx.epoch())),
            _ => None,
        };
        let origin_leg = leg.map(|leg| (channel, leg));
        self.dispatch_parse(headers, eligibility, reporting_url, capture, origin_leg, target);
        true
    }

    /// Spawn a parse job. Its arrival sequence is reserved now.
    fn dispatch_parse(
        &mut self,
        headers: RegistrationHeaders,
        eligibility: RegistrationEligibility,
        reporting_url: &Url,
        capture: Option<(ContextKey, u64)>,
        leg: Option<(ChannelId, LegKey)>,
        target: DeliveryTarget,
    ) {
        let Some(reporting_origin) = SuitableOrigin::create(reporting_url) else {
            warn!(reporting_url = %reporting_url, "untrustworthy reporting origin; registration dropped");
            let err = ParseError::UntrustworthyReportingOrigin(reporting_url.to_string());
            self.outcomes
                .diagnostic(RegistrationError::Parse(err).into());
            return;
        };
        if headers.is_empty() {
            return;
        }

        let arrival_sequence = self.queue.reserve_sequence();
        if let Some((key, _)) = capture {
            if let Some(ctx) = self.contexts.get_mut(&key) {
                ctx.begin_parse();
            }
        }
        self.parses_in_flight += 1;

        let job = ParseJob {
            capture,
            leg,
            target,
            reporting_origin,
            arrival_sequence,
        };
        let parser = Arc::clone(&self.parser);
        let tx = self.parse_tx.clone();
        tokio::spawn(async move {
            let result = parse_headers(parser.as_ref(), &headers, eligibility);
            let _ = tx.send(ParseCompletion { job, result }).await;
        });
    }

    fn deliver_parsed(&mut self, job: ParseJob, parsed: ParsedRegistration) {
        let ParseJob {
            target,
            reporting_origin,
            arrival_sequence,
            ..
        } = job;
        match parsed {
            ParsedRegistration::Source(registration) => {
                self.deliver_source(&target, registration, reporting_origin);
            }
            ParsedRegistration::Trigger(registration) => {
                let key = self.trigger_context(target.correlation, target.last_navigation_id);
                self.route_trigger(
                    key,
                    target.trigger(registration, reporting_origin, arrival_sequence),
                );
            }
            ParsedRegistration::OsSource(urls) => {
                self.deliver_os(&target, RegistrationKind::Source, urls);
            }
            ParsedRegistration::OsTrigger(urls) => {
                self.deliver_os(&target, RegistrationKind::Trigger, urls);
            }
        }
    }

    /// Keep a parsed registration until its leg ties or is refused.
    fn hold_parsed(
        &mut self,
        key: ContextKey,
        leg: LegKey,
        job: ParseJob,
        parsed: ParsedRegistration,
    ) {
        let limit = self.config.max_deferred_per_context;
        let held = self.held.entry(key).or_default();
        if held.iter().filter(|entry| entry.leg == leg).count() >= limit {
            warn!(context = %key, leg = %leg, limit, "held registrations full; registration dropped");
            if matches!(parsed, ParsedRegistration::Trigger(_)) {
                self.outcomes.record(
                    OutcomeRecord::new(
                        OutcomeTag::Dropped,
                        OutcomeSubject::Trigger {
                            sequence: job.arrival_sequence,
                        },
                    )
                    .in_context(key),
                );
            }
            self.outcomes
                .diagnostic(RegistrationError::CapacityExceeded { context: key, limit }.into());
            return;
        }

        let ParseJob {
            target,
            reporting_origin,
            arrival_sequence,
            ..
        } = job;
        let payload = match parsed {
            ParsedRegistration::Source(registration) => HeldPayload::Source {
                registration,
                reporting_origin,
            },
            ParsedRegistration::Trigger(registration) => {
                HeldPayload::Trigger(target.trigger(registration, reporting_origin, arrival_sequence))
            }
            ParsedRegistration::OsSource(urls) => HeldPayload::Os {
                kind: RegistrationKind::Source,
                urls,
            },
            ParsedRegistration::OsTrigger(urls) => HeldPayload::Os {
                kind: RegistrationKind::Trigger,
                urls,
            },
        };
        debug!(context = %key, leg = %leg, sequence = arrival_sequence, "registration held until navigation tie");
        held.push(HeldRegistration {
            leg,
            arrival_sequence,
            target,
            payload,
        });
    }

    /// Deliver everything held for `key` in arrival order.
    ///
    /// Triggers go through the context's queue, which must still be open.
    fn release_held(&mut self, key: ContextKey) {
        let Some(mut held) = self.held.remove(&key) else {
            return;
        };
        held.sort_by_key(|entry| entry.arrival_sequence);
        debug!(context = %key, released = held.len(), "releasing registrations held for navigation tie");
        for entry in held {
            match entry.payload {
                HeldPayload::Source {
                    registration,
                    reporting_origin,
                } => self.deliver_source(&entry.target, registration, reporting_origin),
                HeldPayload::Os { kind, urls } => self.deliver_os(&entry.target, kind, urls),
                HeldPayload::Trigger(pending) => self.route_trigger(Some(key), pending),
            }
        }
    }

    fn discard_held(&mut self, key: ContextKey) {
        let Some(held) = self.held.remove(&key) else {
            return;
        };
        warn!(context = %key, dropped = held.len(), "registrations from never-tied legs dropped");
        for entry in held {
            if let HeldPayload::Trigger(pending) = entry.payload {
                self.outcomes.record(
                    OutcomeRecord::new(
                        OutcomeTag::Dropped,
                        OutcomeSubject::Trigger {
                            sequence: pending.arrival_sequence,
                        },
                    )
                    .in_context(key),
                );
            }
        }
    }

    fn deliver_source(
        &self,
        target: &DeliveryTarget,
        registration: SourceRegistration,
        reporting_origin: SuitableOrigin,
    ) {
        debug!(
            reporting_origin = %reporting_origin,
            source_type = ?target.source_type,
            "source delivered"
        );
        self.sink.handle_source(
            AttributionSource {
                registration,
                source_type: target.source_type,
                source_origin: target.context_origin.clone(),
                reporting_origin,
                is_within_fenced_frame: target.is_within_fenced_frame,
            },
            target.frame_id,
        );
    }

    fn deliver_os(&self, target: &DeliveryTarget, kind: RegistrationKind, urls: Vec<Url>) {
        if !self.config.os_registrations_enabled {
            debug!(registration = %kind, "OS registrations disabled; dropped");
            return;
        }
        self.sink.handle_os_registration(OsRegistration {
            registration_urls: urls,
            kind,
            top_level_origin: target.context_origin.clone(),
            is_within_fenced_frame: target.is_within_fenced_frame,
            frame_id: target.frame_id,
        });
    }

    /// Context a trigger waits on: explicit correlation first, then the
    /// frame's last navigation.
    fn trigger_context(
        &self,
        correlation: Option<ContextKey>,
        last_navigation_id: Option<NavigationId>,
    ) -> Option<ContextKey> {
        correlation
            .filter(|key| self.contexts.contains(key))
            .or_else(|| last_navigation_id.and_then(|id| self.contexts.by_navigation(id)))
    }

    fn route_trigger(&mut self, key: Option<ContextKey>, pending: PendingTrigger) {
        let sequence = pending.arrival_sequence;
        let mut record = OutcomeRecord::new(
            OutcomeTag::Immediate,
            OutcomeSubject::Trigger { sequence },
        );
        record.context = key;
        match self.queue.enqueue(key, pending, Instant::now()) {
            EnqueueOutcome::Immediate(pending) => {
                debug!(sequence, "trigger delivered immediately");
                self.sink.handle_trigger(pending.trigger, pending.frame_id);
            }
            EnqueueOutcome::Deferred { .. } => {
                debug!(sequence, context = ?key, "trigger deferred");
                record.tag = OutcomeTag::Deferred;
            }
            EnqueueOutcome::Dropped(_) => {
                let limit = self.queue.max_per_context();
                warn!(sequence, context = ?key, limit, "deferred queue full; trigger dropped");
                record.tag = OutcomeTag::Dropped;
                if let Some(context) = key {
                    self.outcomes
                        .diagnostic(RegistrationError::CapacityExceeded { context, limit }.into());
                }
            }
        }
        self.outcomes.record(record);
    }

    fn maybe_flush(&mut self, key: ContextKey) {
        if self
            .contexts
            .get(&key)
            .is_some_and(NavigationRegistrationContext::is_complete)
        {
            self.flush(key, FlushCause::Completed);
        }
    }

    fn flush(&mut self, key: ContextKey, cause: FlushCause) {
        let reason = cause.eviction_reason();
        let Some(context) = self.contexts.remove(&key, reason) else {
            return;
        };
        self.timers.cancel(&key);
        let now = Instant::now();
        let span = coordinator_span!("flush", context = %key, reason = %reason);
        let _guard = span.enter();

        let tie_tag = match cause {
            FlushCause::Completed if context.will_start_seen() => OutcomeTag::TiedWithDelay,
            FlushCause::Completed | FlushCause::Ineligible => OutcomeTag::NeverTiedIneligible,
            FlushCause::TimedOut => OutcomeTag::NeverTiedTimeout,
        };
        for leg in context.pending_ties() {
            if tie_tag != OutcomeTag::TiedWithDelay {
                if let Some(channel) = self.channels.channel_for_leg(leg) {
                    if let Some(entry) = self.channels.get_mut(channel) {
                        entry.reject(reason);
                    }
                }
            }
            self.record_leg(leg, key, tie_tag);
        }

        if cause != FlushCause::Completed {
            let tag = never_tied(reason);
            let unclaimed = context.unclaimed_expected();
            for index in 0..unclaimed.min(MAX_EXPECTED_LEG_RECORDS) {
                self.outcomes.record(
                    OutcomeRecord::new(tag, OutcomeSubject::ExpectedLeg { index }).in_context(key),
                );
            }
            if unclaimed > MAX_EXPECTED_LEG_RECORDS {
                warn!(
                    unclaimed,
                    recorded = MAX_EXPECTED_LEG_RECORDS,
                    "expected legs beyond the record limit not recorded"
                );
            }
            self.close_unbound_navigation_channels(&context);
        }
        if cause == FlushCause::TimedOut {
            let waited = now.saturating_duration_since(context.created_at());
            warn!(
                pending = context.pending(),
                completed_legs = context.completed_legs(),
                expected_legs = context.expected_legs(),
                "context timed out"
            );
            self.outcomes
                .diagnostic(RegistrationError::Timeout { context: key, waited }.into());
        }

        // Held triggers join the queue before it drains.
        if tie_tag == OutcomeTag::TiedWithDelay {
            self.release_held(key);
        } else {
            self.discard_held(key);
        }

        let processed_after_timeout = cause == FlushCause::TimedOut;
        let released = self.queue.drain(&key);
        let count = released.len();
        for deferred in released {
            let delay = deferred.delay(now);
            let sequence = deferred.arrival_sequence;
            let mut trigger = deferred.trigger;
            trigger.processed_after_timeout = processed_after_timeout;
            self.sink.handle_trigger(trigger, deferred.frame_id);
            self.outcomes.record(
                OutcomeRecord::new(OutcomeTag::TiedWithDelay, OutcomeSubject::Trigger { sequence })
                    .in_context(key)
                    .released(delay, processed_after_timeout),
            );
        }
        debug!(released = count, "context flushed");
    }

    fn close_unbound_navigation_channels(&mut self, context: &NavigationRegistrationContext) {
        for leg in context.outstanding() {
            let LegKey::NavigationChannel(channel) = leg else {
                continue;
            };
            let unbound = self
                .channels
                .get(channel)
                .is_some_and(|entry| entry.context().is_none());
            if !unbound {
                continue;
            }
            if let Some(entry) = self.channels.remove(channel) {
                if entry.buffered_len() > 0 {
                    warn!(
                        channel_id = %channel,
                        dropped = entry.buffered_len(),
                        "buffered sources dropped with their context"
                    );
                }
            }
        }
    }

    /// Remove a channel and complete its context leg.
    fn finish_channel_leg(&mut self, channel: ChannelId) {
        let Some(entry) = self.channels.remove(channel) else {
            return;
        };
        let (Some(leg), Some(key)) = (entry.leg(), entry.correlation()) else {
            return;
        };
        let completed = self
            .contexts
            .get_mut(&key)
            .is_some_and(|ctx| ctx.complete_leg(leg));
        if completed {
            self.maybe_flush(key);
        }
    }
}

fn page_for(binding: &NavigationBinding) -> RegistrationContext {
    RegistrationContext::new(binding.source_origin.clone(), binding.frame_id)
        .within_fenced_frame(binding.is_within_fenced_frame)
        .with_last_navigation(binding.navigation_id)
}
