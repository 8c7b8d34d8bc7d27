//! Outbound interface to the attribution engine.

use parking_lot::Mutex;
use serde::Serialize;

use crate::ids::FrameId;
use crate::registration::{AttributionSource, AttributionTrigger, OsRegistration};

/// Consumer of resolved registrations.
///
/// Called from the coordinator's event loop; implementations should hand
/// work off rather than block.
pub trait AttributionSink: Send + Sync + 'static {
    fn handle_source(&self, source: AttributionSource, frame_id: FrameId);

    fn handle_trigger(&self, trigger: AttributionTrigger, frame_id: FrameId);

    fn handle_os_registration(&self, registration: OsRegistration);
}

/// One call observed by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "delivery")]
pub enum Delivery {
    Source {
        source: AttributionSource,
        frame_id: FrameId,
    },
    Trigger {
        trigger: AttributionTrigger,
        frame_id: FrameId,
    },
    Os {
        registration: OsRegistration,
    },
}

/// Sink that keeps every delivery in call order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    #[must_use]
    pub fn sources(&self) -> Vec<AttributionSource> {
        self.deliveries
            .lock()
            .iter()
            .filter_map(|delivery| match delivery {
                Delivery::Source { source, .. } => Some(source.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn triggers(&self) -> Vec<AttributionTrigger> {
        self.deliveries
            .lock()
            .iter()
            .filter_map(|delivery| match delivery {
                Delivery::Trigger { trigger, .. } => Some(trigger.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn os_registrations(&self) -> Vec<OsRegistration> {
        self.deliveries
            .lock()
            .iter()
            .filter_map(|delivery| match delivery {
                Delivery::Os { registration } => Some(registration.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.deliveries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deliveries.lock().is_empty()
    }
}

impl AttributionSink for RecordingSink {
    fn handle_source(&self, source: AttributionSource, frame_id: FrameId) {
        self.deliveries
            .lock()
            .push(Delivery::Source { source, frame_id });
    }

    fn handle_trigger(&self, trigger: AttributionTrigger, frame_id: FrameId) {
        self.deliveries
            .lock()
            .push(Delivery::Trigger { trigger, frame_id });
    }

    fn handle_os_registration(&self, registration: OsRegistration) {
        self.deliveries.lock().push(Delivery::Os { registration });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::SuitableOrigin;
    use crate::registration::{RegistrationKind, SourceRegistration, SourceType};

    #[test]
    fn recording_sink_keeps_call_order() {
        let sink = RecordingSink::new();
        let origin = SuitableOrigin::parse("https://a.test").unwrap();
        sink.handle_os_registration(OsRegistration {
            registration_urls: vec![url::Url::parse("https://os.test/r").unwrap()],
            kind: RegistrationKind::Source,
            top_level_origin: origin.clone(),
            is_within_fenced_frame: false,
            frame_id: FrameId::new(1, 1),
        });
        sink.handle_source(
            AttributionSource {
                registration: SourceRegistration::from_map(serde_json::Map::new()),
                source_type: SourceType::Event,
                source_origin: origin.clone(),
                reporting_origin: origin,
                is_within_fenced_frame: false,
            },
            FrameId::new(1, 2),
        );
        let deliveries = sink.deliveries();
        assert_eq!(deliveries.len(), 2);
        assert!(matches!(deliveries[0], Delivery::Os { .. }));
        assert_eq!(sink.sources().len(), 1);
        assert!(sink.triggers().is_empty());
        assert_eq!(sink.os_registrations().len(), 1);
    }
}
