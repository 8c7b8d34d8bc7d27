//! Registration payloads and the resolved values handed to the attribution sink.
//!
//! Payloads are opaque to the coordinator: it only reads routing metadata
//! (reporting origin, destination context, frame identity, fenced-frame
//! flag) and never looks inside the JSON bodies.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::ids::{FrameId, NavigationId};
use crate::origin::SuitableOrigin;

/// Which registration kinds a channel may carry, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationEligibility {
    SourceOnly,
    TriggerOnly,
    SourceOrTrigger,
}

impl RegistrationEligibility {
    #[must_use]
    pub const fn allows(self, kind: RegistrationKind) -> bool {
        matches!(
            (self, kind),
            (Self::SourceOrTrigger, _)
                | (Self::SourceOnly, RegistrationKind::Source)
                | (Self::TriggerOnly, RegistrationKind::Trigger)
        )
    }
}

impl fmt::Display for RegistrationEligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SourceOnly => "source_only",
            Self::TriggerOnly => "trigger_only",
            Self::SourceOrTrigger => "source_or_trigger",
        };
        f.write_str(s)
    }
}

/// Source or trigger, independent of web vs OS delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationKind {
    Source,
    Trigger,
}

impl fmt::Display for RegistrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Trigger => f.write_str("trigger"),
        }
    }
}

/// How a source was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Tied to a navigation (foreground, navigation channel, token-tied background, beacon with navigation id).
    Navigation,
    Event,
}

/// Parsed source registration body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRegistration(Map<String, Value>);

impl SourceRegistration {
    #[must_use]
    pub const fn from_map(body: Map<String, Value>) -> Self {
        Self(body)
    }

    #[must_use]
    pub const fn body(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Parsed trigger registration body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerRegistration(Map<String, Value>);

impl TriggerRegistration {
    #[must_use]
    pub const fn from_map(body: Map<String, Value>) -> Self {
        Self(body)
    }

    #[must_use]
    pub const fn body(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Where a registration came from: the page side of a channel or leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationContext {
    /// Origin of the registering page (source origin / trigger destination).
    pub context_origin: SuitableOrigin,
    pub is_within_fenced_frame: bool,
    pub frame_id: FrameId,
    /// Navigation most recently committed in the registering frame.
    pub last_navigation_id: Option<NavigationId>,
}

impl RegistrationContext {
    #[must_use]
    pub fn new(context_origin: SuitableOrigin, frame_id: FrameId) -> Self {
        Self {
            context_origin,
            is_within_fenced_frame: false,
            frame_id,
            last_navigation_id: None,
        }
    }

    #[must_use]
    pub const fn within_fenced_frame(mut self, fenced: bool) -> Self {
        self.is_within_fenced_frame = fenced;
        self
    }

    #[must_use]
    pub const fn with_last_navigation(mut self, navigation_id: NavigationId) -> Self {
        self.last_navigation_id = Some(navigation_id);
        self
    }
}

/// A source ready for the attribution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionSource {
    pub registration: SourceRegistration,
    pub source_type: SourceType,
    pub source_origin: SuitableOrigin,
    pub reporting_origin: SuitableOrigin,
    pub is_within_fenced_frame: bool,
}

/// A trigger ready for the attribution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionTrigger {
    pub registration: TriggerRegistration,
    pub destination_origin: SuitableOrigin,
    pub reporting_origin: SuitableOrigin,
    pub is_within_fenced_frame: bool,
    /// Set when the trigger was released by a context timeout.
    pub processed_after_timeout: bool,
}

/// An OS-level registration, delivered without deferral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsRegistration {
    pub registration_urls: Vec<Url>,
    pub kind: RegistrationKind,
    pub top_level_origin: SuitableOrigin,
    pub is_within_fenced_frame: bool,
    pub frame_id: FrameId,
}
