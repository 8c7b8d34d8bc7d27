//! Outcome telemetry.
//!
//! The coordinator reports one [`OutcomeRecord`] per routing decision and a
//! [`Diagnostic`] for every unexpected event or scoped failure. Storage is
//! someone else's problem; [`OutcomeLog`] is the in-memory sink used by
//! tests and the CLI.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::context::ContextKey;
use crate::error::RegistrationError;
use crate::ids::{AttributionSrcToken, BackgroundRegistrationId, BeaconId, ChannelId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeTag {
    Immediate,
    Deferred,
    Dropped,
    TiedImmediately,
    TiedWithDelay,
    NeverTiedTimeout,
    NeverTiedIneligible,
}

impl OutcomeTag {
    pub const ALL: [Self; 7] = [
        Self::Immediate,
        Self::Deferred,
        Self::Dropped,
        Self::TiedImmediately,
        Self::TiedWithDelay,
        Self::NeverTiedTimeout,
        Self::NeverTiedIneligible,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Deferred => "deferred",
            Self::Dropped => "dropped",
            Self::TiedImmediately => "tied_immediately",
            Self::TiedWithDelay => "tied_with_delay",
            Self::NeverTiedTimeout => "never_tied_timeout",
            Self::NeverTiedIneligible => "never_tied_ineligible",
        }
    }
}

impl fmt::Display for OutcomeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an outcome record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "subject")]
pub enum OutcomeSubject {
    Trigger { sequence: u64 },
    Channel { channel: ChannelId },
    BackgroundLeg { id: BackgroundRegistrationId },
    BeaconLeg { id: BeaconId },
    /// A will-start slot no background leg ever claimed.
    ExpectedLeg { index: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeRecord {
    pub tag: OutcomeTag,
    pub subject: OutcomeSubject,
    pub context: Option<ContextKey>,
    pub processed_after_timeout: bool,
    /// Time a released trigger spent deferred.
    pub delay: Option<Duration>,
}

impl OutcomeRecord {
    #[must_use]
    pub const fn new(tag: OutcomeTag, subject: OutcomeSubject) -> Self {
        Self {
            tag,
            subject,
            context: None,
            processed_after_timeout: false,
            delay: None,
        }
    }

    #[must_use]
    pub const fn in_context(mut self, key: ContextKey) -> Self {
        self.context = Some(key);
        self
    }

    #[must_use]
    pub const fn released(mut self, delay: Duration, processed_after_timeout: bool) -> Self {
        self.delay = Some(delay);
        self.processed_after_timeout = processed_after_timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnexpectedRegistration {
    RegistrationAlreadyExists,
    RegistrationMissingUponReceivingData,
}

/// Navigation data host state observed when its navigation starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationDataHostStatus {
    Registered,
    NotFound,
    /// Registered earlier and already released.
    Processed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "diagnostic")]
pub enum Diagnostic {
    Unexpected {
        token: AttributionSrcToken,
        kind: UnexpectedRegistration,
    },
    NavigationDataHost {
        token: AttributionSrcToken,
        status: NavigationDataHostStatus,
    },
    Failure {
        #[serde(serialize_with = "serialize_display")]
        error: RegistrationError,
    },
}

impl From<RegistrationError> for Diagnostic {
    fn from(error: RegistrationError) -> Self {
        Self::Failure { error }
    }
}

fn serialize_display<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: fmt::Display,
{
    serializer.collect_str(value)
}

/// Receiver of outcome telemetry.
pub trait OutcomeSink: Send + Sync + 'static {
    fn record(&self, record: OutcomeRecord);

    fn diagnostic(&self, _diagnostic: Diagnostic) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutcomeSink;

impl OutcomeSink for NullOutcomeSink {
    fn record(&self, _record: OutcomeRecord) {}
}

#[derive(Debug, Default)]
struct OutcomeLogInner {
    records: Vec<OutcomeRecord>,
    diagnostics: Vec<Diagnostic>,
}

/// In-memory outcome sink.
#[derive(Debug, Default)]
pub struct OutcomeLog {
    inner: Mutex<OutcomeLogInner>,
}

impl OutcomeLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<OutcomeRecord> {
        self.inner.lock().records.clone()
    }

    #[must_use]
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.inner.lock().diagnostics.clone()
    }

    #[must_use]
    pub fn count(&self, tag: OutcomeTag) -> usize {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|record| record.tag == tag)
            .count()
    }

    /// Per-tag counts, including zeroes.
    #[must_use]
    pub fn counts(&self) -> BTreeMap<OutcomeTag, usize> {
        let inner = self.inner.lock();
        let mut counts: BTreeMap<OutcomeTag, usize> =
            OutcomeTag::ALL.iter().map(|tag| (*tag, 0)).collect();
        for record in &inner.records {
            *counts.entry(record.tag).or_default() += 1;
        }
        counts
    }

    #[must_use]
    pub fn records_for(&self, subject: OutcomeSubject) -> Vec<OutcomeRecord> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|record| record.subject == subject)
            .cloned()
            .collect()
    }
}

impl OutcomeSink for OutcomeLog {
    fn record(&self, record: OutcomeRecord) {
        self.inner.lock().records.push(record);
    }

    fn diagnostic(&self, diagnostic: Diagnostic) {
        self.inner.lock().diagnostics.push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_include_every_tag() {
        let log = OutcomeLog::new();
        log.record(OutcomeRecord::new(
            OutcomeTag::Immediate,
            OutcomeSubject::Trigger { sequence: 1 },
        ));
        log.record(OutcomeRecord::new(
            OutcomeTag::Immediate,
            OutcomeSubject::Trigger { sequence: 2 },
        ));
        let counts = log.counts();
        assert_eq!(counts.len(), 7);
        assert_eq!(counts[&OutcomeTag::Immediate], 2);
        assert_eq!(counts[&OutcomeTag::Dropped], 0);
        assert_eq!(log.count(OutcomeTag::Immediate), 2);
    }

    #[test]
    fn records_for_filters_by_subject() {
        let log = OutcomeLog::new();
        let subject = OutcomeSubject::Trigger { sequence: 4 };
        log.record(OutcomeRecord::new(OutcomeTag::Deferred, subject));
        log.record(
            OutcomeRecord::new(OutcomeTag::TiedWithDelay, subject)
                .released(Duration::from_secs(5), true),
        );
        log.record(OutcomeRecord::new(
            OutcomeTag::Immediate,
            OutcomeSubject::Trigger { sequence: 5 },
        ));
        let records = log.records_for(subject);
        assert_eq!(records.len(), 2);
        assert!(records[1].processed_after_timeout);
        assert_eq!(records[1].delay, Some(Duration::from_secs(5)));
    }

    #[test]
    fn diagnostics_serialize_errors_as_text() {
        let diagnostic = Diagnostic::from(RegistrationError::UnknownChannel {
            channel: ChannelId::new(3),
        });
        let json = serde_json::to_value(&diagnostic).unwrap();
        assert_eq!(json["diagnostic"], "failure");
        assert_eq!(json["error"], "channel channel-3 is closed or unknown");
    }

    #[test]
    fn tag_display_matches_serde() {
        for tag in OutcomeTag::ALL {
            let json = serde_json::to_string(&tag).unwrap();
            assert_eq!(json, format!("\"{tag}\""));
        }
    }
}
