//! Registration channel registry.
//!
//! A channel is the handle one registration flow talks through. The registry
//! owns every open channel, issues [`ChannelId`]s, enforces per-channel
//! eligibility and keeps the secondary indices (navigation token,
//! background id, beacon id) used to find a flow's channel. Channels never
//! own contexts; they only carry the correlation key that names one.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::Serialize;
use url::Url;

use crate::context::{ContextKey, EvictionReason, LegKey};
use crate::error::RegistrationError;
use crate::ids::{AttributionSrcToken, BackgroundRegistrationId, BeaconId, ChannelId, NavigationId};
use crate::origin::SuitableOrigin;
use crate::registration::{
    RegistrationContext, RegistrationEligibility, RegistrationKind, SourceRegistration, SourceType,
};

/// The four flow kinds, each carrying its correlation identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ChannelKind {
    /// Same-document registration.
    Direct,
    NavigationTied {
        token: AttributionSrcToken,
    },
    BackgroundTied {
        id: BackgroundRegistrationId,
        token: Option<AttributionSrcToken>,
    },
    BeaconTied {
        id: BeaconId,
        navigation_id: Option<NavigationId>,
    },
}

impl ChannelKind {
    #[must_use]
    pub const fn source_type(&self) -> SourceType {
        match self {
            Self::NavigationTied { .. }
            | Self::BackgroundTied { token: Some(_), .. }
            | Self::BeaconTied {
                navigation_id: Some(_),
                ..
            } => SourceType::Navigation,
            Self::Direct
            | Self::BackgroundTied { token: None, .. }
            | Self::BeaconTied {
                navigation_id: None,
                ..
            } => SourceType::Event,
        }
    }

    /// The context leg this channel represents, if any.
    #[must_use]
    pub const fn leg(&self, channel: ChannelId) -> Option<LegKey> {
        match self {
            Self::Direct => None,
            Self::NavigationTied { .. } => Some(LegKey::NavigationChannel(channel)),
            Self::BackgroundTied { id, token: Some(_) } => Some(LegKey::Background(*id)),
            Self::BackgroundTied { token: None, .. } => None,
            Self::BeaconTied { id, .. } => Some(LegKey::Beacon(*id)),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::NavigationTied { .. } => "navigation_tied",
            Self::BackgroundTied { .. } => "background_tied",
            Self::BeaconTied { .. } => "beacon_tied",
        }
    }
}

/// A source held on a navigation-tied channel until its navigation binds.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferedSource {
    Web {
        registration: SourceRegistration,
        reporting_origin: SuitableOrigin,
    },
    Os(Vec<Url>),
}

/// One open registration flow.
#[derive(Debug, Clone)]
pub struct RegistrationChannel {
    id: ChannelId,
    kind: ChannelKind,
    eligibility: RegistrationEligibility,
    /// Page-side metadata; `None` for a navigation-tied channel until bound.
    context: Option<RegistrationContext>,
    correlation: Option<ContextKey>,
    open: bool,
    registrations_seen: u32,
    rejection: Option<EvictionReason>,
    buffered: Vec<BufferedSource>,
}

impl RegistrationChannel {
    fn new(
        id: ChannelId,
        kind: ChannelKind,
        eligibility: RegistrationEligibility,
        context: Option<RegistrationContext>,
        correlation: Option<ContextKey>,
    ) -> Self {
        Self {
            id,
            kind,
            eligibility,
            context,
            correlation,
            open: true,
            registrations_seen: 0,
            rejection: None,
            buffered: Vec::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        self.kind
    }

    #[must_use]
    pub const fn eligibility(&self) -> RegistrationEligibility {
        self.eligibility
    }

    #[must_use]
    pub const fn context(&self) -> Option<&RegistrationContext> {
        self.context.as_ref()
    }

    #[must_use]
    pub const fn correlation(&self) -> Option<ContextKey> {
        self.correlation
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    #[must_use]
    pub const fn registrations_seen(&self) -> u32 {
        self.registrations_seen
    }

    /// Set when the flow's leg can never be tied; its data is refused.
    #[must_use]
    pub const fn rejection(&self) -> Option<EvictionReason> {
        self.rejection
    }

    #[must_use]
    pub const fn leg(&self) -> Option<LegKey> {
        self.kind.leg(self.id)
    }

    pub fn note_registration(&mut self) {
        self.registrations_seen += 1;
    }

    pub fn bind_context(&mut self, context: RegistrationContext) {
        self.context = Some(context);
    }

    pub fn set_correlation(&mut self, key: ContextKey) {
        self.correlation = Some(key);
    }

    pub fn reject(&mut self, reason: EvictionReason) {
        self.rejection = Some(reason);
    }

    /// Stop accepting events while keeping buffered sources.
    pub fn close(&mut self) {
        self.open = false;
    }

    /// Buffer a source; returns it back if the buffer is full.
    pub fn buffer(&mut self, source: BufferedSource, limit: usize) -> Result<(), BufferedSource> {
        if self.buffered.len() >= limit {
            return Err(source);
        }
        self.buffered.push(source);
        Ok(())
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn take_buffered(&mut self) -> Vec<BufferedSource> {
        std::mem::take(&mut self.buffered)
    }
}

/// Owner of every registered channel.
#[derive(Debug)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelId, RegistrationChannel>,
    navigation: HashMap<AttributionSrcToken, ChannelId>,
    retired_navigation: LruCache<AttributionSrcToken, ()>,
    background: HashMap<BackgroundRegistrationId, ChannelId>,
    beacons: HashMap<BeaconId, ChannelId>,
    next_id: u64,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new(retired_memory: usize) -> Self {
        let capacity = NonZeroUsize::new(retired_memory).unwrap_or(NonZeroUsize::MIN);
        Self {
            channels: HashMap::new(),
            navigation: HashMap::new(),
            retired_navigation: LruCache::new(capacity),
            background: HashMap::new(),
            beacons: HashMap::new(),
            next_id: 1,
        }
    }

    fn allocate(&mut self) -> ChannelId {
        let id = ChannelId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert(&mut self, channel: RegistrationChannel) -> ChannelId {
        let id = channel.id;
        self.channels.insert(id, channel);
        id
    }

    pub fn register_direct(
        &mut self,
        context: RegistrationContext,
        eligibility: RegistrationEligibility,
    ) -> ChannelId {
        let id = self.allocate();
        self.insert(RegistrationChannel::new(
            id,
            ChannelKind::Direct,
            eligibility,
            Some(context),
            None,
        ))
    }

    /// At most one navigation-tied channel per token, ever (within retired memory).
    pub fn register_navigation(
        &mut self,
        token: AttributionSrcToken,
    ) -> Result<ChannelId, RegistrationError> {
        if self.navigation.contains_key(&token) || self.retired_navigation.contains(&token) {
            return Err(RegistrationError::DuplicateRegistration { token });
        }
        let id = self.allocate();
        self.navigation.insert(token, id);
        Ok(self.insert(RegistrationChannel::new(
            id,
            ChannelKind::NavigationTied { token },
            RegistrationEligibility::SourceOnly,
            None,
            Some(ContextKey::Token(token)),
        )))
    }

    /// Returns `None` if the background id is already registered.
    pub fn register_background(
        &mut self,
        id: BackgroundRegistrationId,
        context: RegistrationContext,
        eligibility: RegistrationEligibility,
        token: Option<AttributionSrcToken>,
    ) -> Option<ChannelId> {
        if self.background.contains_key(&id) {
            return None;
        }
        let channel = self.allocate();
        self.background.insert(id, channel);
        Some(self.insert(RegistrationChannel::new(
            channel,
            ChannelKind::BackgroundTied { id, token },
            eligibility,
            Some(context),
            token.map(ContextKey::Token),
        )))
    }

    /// Beacons only register sources. Returns `None` for a duplicate id.
    pub fn register_beacon(
        &mut self,
        id: BeaconId,
        navigation_id: Option<NavigationId>,
        context: RegistrationContext,
    ) -> Option<ChannelId> {
        if self.beacons.contains_key(&id) {
            return None;
        }
        let channel = self.allocate();
        self.beacons.insert(id, channel);
        Some(self.insert(RegistrationChannel::new(
            channel,
            ChannelKind::BeaconTied { id, navigation_id },
            RegistrationEligibility::SourceOnly,
            Some(context),
            None,
        )))
    }

    /// Check that `id` is open and may carry `kind`.
    pub fn check(&self, id: ChannelId, kind: RegistrationKind) -> Result<(), RegistrationError> {
        let channel = self
            .channels
            .get(&id)
            .filter(|channel| channel.open)
            .ok_or(RegistrationError::UnknownChannel { channel: id })?;
        if channel.eligibility.allows(kind) {
            Ok(())
        } else {
            Err(RegistrationError::EligibilityViolation {
                channel: id,
                registration: kind,
            })
        }
    }

    #[must_use]
    pub fn get(&self, id: ChannelId) -> Option<&RegistrationChannel> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut RegistrationChannel> {
        self.channels.get_mut(&id)
    }

    /// Remove a channel and its index entries.
    pub fn remove(&mut self, id: ChannelId) -> Option<RegistrationChannel> {
        let channel = self.channels.remove(&id)?;
        match channel.kind {
            ChannelKind::Direct => {}
            ChannelKind::NavigationTied { token } => {
                self.navigation.remove(&token);
                self.retired_navigation.put(token, ());
            }
            ChannelKind::BackgroundTied { id, .. } => {
                self.background.remove(&id);
            }
            ChannelKind::BeaconTied { id, .. } => {
                self.beacons.remove(&id);
            }
        }
        Some(channel)
    }

    #[must_use]
    pub fn navigation_channel(&self, token: AttributionSrcToken) -> Option<ChannelId> {
        self.navigation.get(&token).copied()
    }

    /// True if `token` had a navigation-tied channel that is gone now.
    #[must_use]
    pub fn is_retired(&self, token: AttributionSrcToken) -> bool {
        self.retired_navigation.contains(&token)
    }

    #[must_use]
    pub fn background_channel(&self, id: BackgroundRegistrationId) -> Option<ChannelId> {
        self.background.get(&id).copied()
    }

    #[must_use]
    pub fn beacon_channel(&self, id: BeaconId) -> Option<ChannelId> {
        self.beacons.get(&id).copied()
    }

    /// Channel backing a context leg, if it is still registered.
    #[must_use]
    pub fn channel_for_leg(&self, leg: LegKey) -> Option<ChannelId> {
        match leg {
            LegKey::Foreground => None,
            LegKey::NavigationChannel(id) => self.channels.contains_key(&id).then_some(id),
            LegKey::Background(id) => self.background_channel(id),
            LegKey::Beacon(id) => self.beacon_channel(id),
        }
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.channels.values().filter(|channel| channel.open).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::FrameId;

    fn context() -> RegistrationContext {
        RegistrationContext::new(
            SuitableOrigin::parse("https://page.test").unwrap(),
            FrameId::new(1, 2),
        )
    }

    #[test]
    fn direct_channels_always_register() {
        let mut registry = ChannelRegistry::new(8);
        let a = registry.register_direct(context(), RegistrationEligibility::SourceOnly);
        let b = registry.register_direct(context(), RegistrationEligibility::SourceOnly);
        assert_ne!(a, b);
        assert_eq!(registry.open_count(), 2);
        assert_eq!(registry.get(a).unwrap().kind(), ChannelKind::Direct);
    }

    #[test]
    fn navigation_channel_is_unique_per_token() {
        let mut registry = ChannelRegistry::new(8);
        let token = AttributionSrcToken::new();
        let first = registry.register_navigation(token).unwrap();
        assert_eq!(
            registry.register_navigation(token),
            Err(RegistrationError::DuplicateRegistration { token })
        );
        assert!(registry.get(first).unwrap().is_open());
        assert_eq!(registry.navigation_channel(token), Some(first));

        registry.remove(first);
        assert!(registry.is_retired(token));
        assert!(
            registry.register_navigation(token).is_err(),
            "retired tokens stay refused"
        );
    }

    #[test]
    fn check_enforces_eligibility() {
        let mut registry = ChannelRegistry::new(8);
        let id = registry.register_direct(context(), RegistrationEligibility::TriggerOnly);
        assert!(registry.check(id, RegistrationKind::Trigger).is_ok());
        assert_eq!(
            registry.check(id, RegistrationKind::Source),
            Err(RegistrationError::EligibilityViolation {
                channel: id,
                registration: RegistrationKind::Source,
            })
        );
    }

    #[test]
    fn closed_or_missing_channels_are_unknown() {
        let mut registry = ChannelRegistry::new(8);
        let id = registry.register_direct(context(), RegistrationEligibility::SourceOrTrigger);
        registry.get_mut(id).unwrap().close();
        assert_eq!(
            registry.check(id, RegistrationKind::Source),
            Err(RegistrationError::UnknownChannel { channel: id })
        );
        let ghost = ChannelId::new(999);
        assert_eq!(
            registry.check(ghost, RegistrationKind::Source),
            Err(RegistrationError::UnknownChannel { channel: ghost })
        );
    }

    #[test]
    fn source_type_follows_kind() {
        let token = AttributionSrcToken::new();
        assert_eq!(ChannelKind::Direct.source_type(), SourceType::Event);
        assert_eq!(
            ChannelKind::NavigationTied { token }.source_type(),
            SourceType::Navigation
        );
        assert_eq!(
            ChannelKind::BackgroundTied {
                id: BackgroundRegistrationId::new(1),
                token: None
            }
            .source_type(),
            SourceType::Event
        );
        assert_eq!(
            ChannelKind::BeaconTied {
                id: BeaconId::new(1),
                navigation_id: Some(NavigationId::new(2))
            }
            .source_type(),
            SourceType::Navigation
        );
    }

    #[test]
    fn background_and_beacon_indices() {
        let mut registry = ChannelRegistry::new(8);
        let bg = BackgroundRegistrationId::new(4);
        let token = AttributionSrcToken::new();
        let channel = registry
            .register_background(bg, context(), RegistrationEligibility::TriggerOnly, Some(token))
            .unwrap();
        assert!(
            registry
                .register_background(bg, context(), RegistrationEligibility::TriggerOnly, None)
                .is_none()
        );
        assert_eq!(registry.background_channel(bg), Some(channel));
        assert_eq!(
            registry.channel_for_leg(LegKey::Background(bg)),
            Some(channel)
        );
        assert_eq!(
            registry.get(channel).unwrap().correlation(),
            Some(ContextKey::Token(token))
        );

        let beacon = registry
            .register_beacon(BeaconId::new(1), None, context())
            .unwrap();
        assert_eq!(
            registry.get(beacon).unwrap().eligibility(),
            RegistrationEligibility::SourceOnly
        );

        registry.remove(channel);
        assert_eq!(registry.background_channel(bg), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn buffer_is_bounded() {
        let mut registry = ChannelRegistry::new(8);
        let id = registry
            .register_navigation(AttributionSrcToken::new())
            .unwrap();
        let channel = registry.get_mut(id).unwrap();
        let source = BufferedSource::Os(vec![Url::parse("https://os.test").unwrap()]);
        assert!(channel.buffer(source.clone(), 1).is_ok());
        assert_eq!(channel.buffer(source.clone(), 1), Err(source));
        assert_eq!(channel.take_buffered().len(), 1);
        assert_eq!(channel.buffered_len(), 0);
    }
}
