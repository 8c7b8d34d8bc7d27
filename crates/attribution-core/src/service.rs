//! Async front end for the coordinator.
//!
//! [`CoordinatorService::spawn`] moves a [`Coordinator`] onto its own task.
//! That task is the only place coordinator state is touched; callers talk to
//! it through a cloneable [`CoordinatorHandle`]. Timer fires and parse
//! completions are polled ahead of new commands so internal events are never
//! starved by a busy caller.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::config::CoordinatorConfig;
use crate::context::NavigationBinding;
use crate::coordinator::{Coordinator, CoordinatorEvents, CoordinatorSnapshot};
use crate::error::{Error, RegistrationError, Result};
use crate::ids::{
    AttributionSrcToken, BackgroundIdAllocator, BackgroundRegistrationId, BeaconId, ChannelId,
    NavigationId,
};
use crate::origin::SuitableOrigin;
use crate::parser::{RegistrationHeaders, RegistrationParser};
use crate::registration::{
    RegistrationContext, RegistrationEligibility, SourceRegistration, TriggerRegistration,
};
use crate::sink::AttributionSink;
use crate::telemetry::OutcomeSink;

type Reply<T> = oneshot::Sender<T>;

/// One inbound call, carried to the event loop.
enum Command {
    RegisterDataHost {
        context: RegistrationContext,
        eligibility: RegistrationEligibility,
        reply: Reply<ChannelId>,
    },
    RegisterNavigationDataHost {
        token: AttributionSrcToken,
        reply: Reply<std::result::Result<ChannelId, RegistrationError>>,
    },
    BackgroundWillStart {
        token: AttributionSrcToken,
        expected_legs: u32,
        reply: Reply<()>,
    },
    NavigationStarted {
        token: AttributionSrcToken,
        binding: NavigationBinding,
        reply: Reply<()>,
    },
    NavigationData {
        token: AttributionSrcToken,
        headers: RegistrationHeaders,
        reporting_url: Url,
        reply: Reply<bool>,
    },
    NavigationCompleted {
        token: AttributionSrcToken,
        reply: Reply<()>,
    },
    BackgroundStarted {
        id: BackgroundRegistrationId,
        context: RegistrationContext,
        eligibility: RegistrationEligibility,
        token: Option<AttributionSrcToken>,
        reply: Reply<bool>,
    },
    BackgroundData {
        id: BackgroundRegistrationId,
        headers: RegistrationHeaders,
        reporting_url: Url,
        reply: Reply<bool>,
    },
    /// `reply` is absent when sent from a drop path.
    BackgroundCompleted {
        id: BackgroundRegistrationId,
        reply: Option<Reply<()>>,
    },
    BeaconStarted {
        id: BeaconId,
        navigation_id: Option<NavigationId>,
        context: RegistrationContext,
        reply: Reply<()>,
    },
    BeaconData {
        id: BeaconId,
        headers: RegistrationHeaders,
        reporting_url: Url,
        is_final: bool,
        reply: Reply<bool>,
    },
    SourceData {
        channel: ChannelId,
        reporting_origin: SuitableOrigin,
        registration: SourceRegistration,
        reply: Reply<std::result::Result<(), RegistrationError>>,
    },
    TriggerData {
        channel: ChannelId,
        reporting_origin: SuitableOrigin,
        registration: TriggerRegistration,
        reply: Reply<std::result::Result<(), RegistrationError>>,
    },
    OsSourceData {
        channel: ChannelId,
        registration_urls: Vec<Url>,
        reply: Reply<std::result::Result<(), RegistrationError>>,
    },
    OsTriggerData {
        channel: ChannelId,
        registration_urls: Vec<Url>,
        reply: Reply<std::result::Result<(), RegistrationError>>,
    },
    Disconnect {
        channel: ChannelId,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<CoordinatorSnapshot>,
    },
    /// Resolves once no parse is in flight.
    Idle {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Cloneable handle to a running coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    background_ids: Arc<BackgroundIdAllocator>,
}

impl CoordinatorHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| Error::ServiceStopped)?;
        rx.await.map_err(|_| Error::ServiceStopped)
    }

    /// Fresh id for a background registration on this coordinator.
    #[must_use]
    pub fn allocate_background_id(&self) -> BackgroundRegistrationId {
        self.background_ids.allocate()
    }

    pub async fn register_data_host(
        &self,
        context: RegistrationContext,
        eligibility: RegistrationEligibility,
    ) -> Result<ChannelId> {
        self.request(|reply| Command::RegisterDataHost {
            context,
            eligibility,
            reply,
        })
        .await
    }

    pub async fn register_navigation_data_host(
        &self,
        token: AttributionSrcToken,
    ) -> Result<ChannelId> {
        Ok(self
            .request(|reply| Command::RegisterNavigationDataHost { token, reply })
            .await??)
    }

    pub async fn notify_navigation_with_background_registrations_will_start(
        &self,
        token: AttributionSrcToken,
        expected_legs: u32,
    ) -> Result<()> {
        self.request(|reply| Command::BackgroundWillStart {
            token,
            expected_legs,
            reply,
        })
        .await
    }

    pub async fn notify_navigation_registration_started(
        &self,
        token: AttributionSrcToken,
        binding: NavigationBinding,
    ) -> Result<()> {
        self.request(|reply| Command::NavigationStarted {
            token,
            binding,
            reply,
        })
        .await
    }

    pub async fn notify_navigation_registration_data(
        &self,
        token: AttributionSrcToken,
        headers: RegistrationHeaders,
        reporting_url: Url,
    ) -> Result<bool> {
        self.request(|reply| Command::NavigationData {
            token,
            headers,
            reporting_url,
            reply,
        })
        .await
    }

    pub async fn notify_navigation_registration_completed(
        &self,
        token: AttributionSrcToken,
    ) -> Result<()> {
        self.request(|reply| Command::NavigationCompleted { token, reply })
            .await
    }

    pub async fn notify_background_registration_started(
        &self,
        id: BackgroundRegistrationId,
        context: RegistrationContext,
        eligibility: RegistrationEligibility,
        token: Option<AttributionSrcToken>,
    ) -> Result<bool> {
        self.request(|reply| Command::BackgroundStarted {
            id,
            context,
            eligibility,
            token,
            reply,
        })
        .await
    }

    pub async fn notify_background_registration_data(
        &self,
        id: BackgroundRegistrationId,
        headers: RegistrationHeaders,
        reporting_url: Url,
    ) -> Result<bool> {
        self.request(|reply| Command::BackgroundData {
            id,
            headers,
            reporting_url,
            reply,
        })
        .await
    }

    pub async fn notify_background_registration_completed(
        &self,
        id: BackgroundRegistrationId,
    ) -> Result<()> {
        self.request(|reply| Command::BackgroundCompleted {
            id,
            reply: Some(reply),
        })
        .await
    }

    /// Non-blocking completion for drop paths. Returns false if the command
    /// could not be queued.
    pub fn try_notify_background_registration_completed(
        &self,
        id: BackgroundRegistrationId,
    ) -> bool {
        self.commands
            .try_send(Command::BackgroundCompleted { id, reply: None })
            .is_ok()
    }

    pub async fn notify_fenced_frame_reporting_beacon_started(
        &self,
        id: BeaconId,
        navigation_id: Option<NavigationId>,
        context: RegistrationContext,
    ) -> Result<()> {
        self.request(|reply| Command::BeaconStarted {
            id,
            navigation_id,
            context,
            reply,
        })
        .await
    }

    pub async fn notify_fenced_frame_reporting_beacon_data(
        &self,
        id: BeaconId,
        headers: RegistrationHeaders,
        reporting_url: Url,
        is_final: bool,
    ) -> Result<bool> {
        self.request(|reply| Command::BeaconData {
            id,
            headers,
            reporting_url,
            is_final,
            reply,
        })
        .await
    }

    pub async fn source_data_available(
        &self,
        channel: ChannelId,
        reporting_origin: SuitableOrigin,
        registration: SourceRegistration,
    ) -> Result<()> {
        Ok(self
            .request(|reply| Command::SourceData {
                channel,
                reporting_origin,
                registration,
                reply,
            })
            .await??)
    }

    pub async fn trigger_data_available(
        &self,
        channel: ChannelId,
        reporting_origin: SuitableOrigin,
        registration: TriggerRegistration,
    ) -> Result<()> {
        Ok(self
            .request(|reply| Command::TriggerData {
                channel,
                reporting_origin,
                registration,
                reply,
            })
            .await??)
    }

    pub async fn os_source_data_available(
        &self,
        channel: ChannelId,
        registration_urls: Vec<Url>,
    ) -> Result<()> {
        Ok(self
            .request(|reply| Command::OsSourceData {
                channel,
                registration_urls,
                reply,
            })
            .await??)
    }

    pub async fn os_trigger_data_available(
        &self,
        channel: ChannelId,
        registration_urls: Vec<Url>,
    ) -> Result<()> {
        Ok(self
            .request(|reply| Command::OsTriggerData {
                channel,
                registration_urls,
                reply,
            })
            .await??)
    }

    pub async fn disconnect(&self, channel: ChannelId) -> Result<()> {
        self.request(|reply| Command::Disconnect { channel, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<CoordinatorSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Wait until every dispatched parse has been applied.
    pub async fn idle(&self) -> Result<()> {
        self.request(|reply| Command::Idle { reply }).await
    }

    /// Stop the event loop. Later requests fail with [`Error::ServiceStopped`].
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Builder for the coordinator task.
pub struct CoordinatorService {
    config: CoordinatorConfig,
    sink: Arc<dyn AttributionSink>,
    outcomes: Arc<dyn OutcomeSink>,
    parser: Option<Arc<dyn RegistrationParser>>,
}

impl CoordinatorService {
    #[must_use]
    pub fn new(
        config: CoordinatorConfig,
        sink: Arc<dyn AttributionSink>,
        outcomes: Arc<dyn OutcomeSink>,
    ) -> Self {
        Self {
            config,
            sink,
            outcomes,
            parser: None,
        }
    }

    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn RegistrationParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Spawn the event loop on the current runtime.
    #[must_use]
    pub fn spawn(self) -> (CoordinatorHandle, CoordinatorTask) {
        let capacity = self.config.event_queue_capacity.max(1);
        let (mut coordinator, events) = Coordinator::new(self.config, self.sink, self.outcomes);
        if let Some(parser) = self.parser {
            coordinator.set_parser(parser);
        }
        let (commands, rx) = mpsc::channel(capacity);
        let join = tokio::spawn(run(coordinator, events, rx));
        let handle = CoordinatorHandle {
            commands,
            background_ids: Arc::new(BackgroundIdAllocator::new()),
        };
        (handle, CoordinatorTask { join })
    }
}

/// The spawned event loop.
#[derive(Debug)]
pub struct CoordinatorTask {
    join: JoinHandle<()>,
}

impl CoordinatorTask {
    /// Wait for the loop to exit.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

async fn run(
    mut coordinator: Coordinator,
    mut events: CoordinatorEvents,
    mut commands: mpsc::Receiver<Command>,
) {
    info!(
        deferral_timeout_ms = coordinator.config().deferral_timeout_ms,
        max_deferred = coordinator.config().max_deferred_per_context,
        "coordinator started"
    );
    let mut idle_waiters: Vec<Reply<()>> = Vec::new();
    let mut shutdown_reply = None;

    loop {
        tokio::select! {
            biased;
            Some(fired) = events.timers.recv() => coordinator.on_timer_fired(fired),
            Some(completion) = events.parses.recv() => coordinator.on_parse_completed(completion),
            command = commands.recv() => match command {
                Some(Command::Shutdown { reply }) => {
                    shutdown_reply = Some(reply);
                    break;
                }
                Some(Command::Idle { reply }) => idle_waiters.push(reply),
                Some(command) => apply(&mut coordinator, command),
                None => {
                    debug!("all coordinator handles dropped");
                    break;
                }
            },
        }
        if coordinator.parses_in_flight() == 0 {
            for waiter in idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    coordinator.shutdown();
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
}

fn apply(coordinator: &mut Coordinator, command: Command) {
    match command {
        Command::RegisterDataHost {
            context,
            eligibility,
            reply,
        } => {
            let _ = reply.send(coordinator.register_data_host(context, eligibility));
        }
        Command::RegisterNavigationDataHost { token, reply } => {
            let _ = reply.send(coordinator.register_navigation_data_host(token));
        }
        Command::BackgroundWillStart {
            token,
            expected_legs,
            reply,
        } => {
            coordinator
                .notify_navigation_with_background_registrations_will_start(token, expected_legs);
            let _ = reply.send(());
        }
        Command::NavigationStarted {
            token,
            binding,
            reply,
        } => {
            coordinator.notify_navigation_registration_started(token, binding);
            let _ = reply.send(());
        }
        Command::NavigationData {
            token,
            headers,
            reporting_url,
            reply,
        } => {
            let _ = reply.send(coordinator.notify_navigation_registration_data(
                token,
                headers,
                &reporting_url,
            ));
        }
        Command::NavigationCompleted { token, reply } => {
            coordinator.notify_navigation_registration_completed(token);
            let _ = reply.send(());
        }
        Command::BackgroundStarted {
            id,
            context,
            eligibility,
            token,
            reply,
        } => {
            let _ = reply.send(coordinator.notify_background_registration_started(
                id,
                context,
                eligibility,
                token,
            ));
        }
        Command::BackgroundData {
            id,
            headers,
            reporting_url,
            reply,
        } => {
            let _ = reply.send(coordinator.notify_background_registration_data(
                id,
                headers,
                &reporting_url,
            ));
        }
        Command::BackgroundCompleted { id, reply } => {
            coordinator.notify_background_registration_completed(id);
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
        }
        Command::BeaconStarted {
            id,
            navigation_id,
            context,
            reply,
        } => {
            coordinator.notify_fenced_frame_reporting_beacon_started(id, navigation_id, context);
            let _ = reply.send(());
        }
        Command::BeaconData {
            id,
            headers,
            reporting_url,
            is_final,
            reply,
        } => {
            let _ = reply.send(coordinator.notify_fenced_frame_reporting_beacon_data(
                id,
                headers,
                &reporting_url,
                is_final,
            ));
        }
        Command::SourceData {
            channel,
            reporting_origin,
            registration,
            reply,
        } => {
            let _ = reply.send(coordinator.source_data_available(
                channel,
                reporting_origin,
                registration,
            ));
        }
        Command::TriggerData {
            channel,
            reporting_origin,
            registration,
            reply,
        } => {
            let _ = reply.send(coordinator.trigger_data_available(
                channel,
                reporting_origin,
                registration,
            ));
        }
        Command::OsSourceData {
            channel,
            registration_urls,
            reply,
        } => {
            let _ = reply.send(coordinator.os_source_data_available(channel, registration_urls));
        }
        Command::OsTriggerData {
            channel,
            registration_urls,
            reply,
        } => {
            let _ = reply.send(coordinator.os_trigger_data_available(channel, registration_urls));
        }
        Command::Disconnect { channel, reply } => {
            coordinator.disconnect(channel);
            let _ = reply.send(());
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(coordinator.snapshot());
        }
        // Handled by the loop.
        Command::Idle { reply } | Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::FrameId;
    use crate::sink::RecordingSink;
    use crate::telemetry::{OutcomeLog, OutcomeTag};

    fn spawn() -> (CoordinatorHandle, CoordinatorTask, Arc<RecordingSink>, Arc<OutcomeLog>) {
        let sink = Arc::new(RecordingSink::new());
        let log = Arc::new(OutcomeLog::new());
        let (handle, task) =
            CoordinatorService::new(CoordinatorConfig::default(), sink.clone(), log.clone())
                .spawn();
        (handle, task, sink, log)
    }

    fn binding() -> NavigationBinding {
        NavigationBinding {
            navigation_id: NavigationId::new(1),
            source_origin: SuitableOrigin::parse("https://publisher.test").unwrap(),
            is_within_fenced_frame: false,
            frame_id: FrameId::new(1, 1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_flow_through_handle() {
        let (handle, task, sink, _log) = spawn();
        let token = AttributionSrcToken::new();
        handle
            .notify_navigation_registration_started(token, binding())
            .await
            .unwrap();
        let accepted = handle
            .notify_navigation_registration_data(
                token,
                RegistrationHeaders::default()
                    .with_source(r#"{"destination":"https://shop.test"}"#),
                Url::parse("https://reporter.test/r").unwrap(),
            )
            .await
            .unwrap();
        assert!(accepted);
        handle
            .notify_navigation_registration_completed(token)
            .await
            .unwrap();
        handle.idle().await.unwrap();

        assert_eq!(sink.sources().len(), 1);
        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.contexts.is_empty());
        assert_eq!(snapshot.in_flight_parses, 0);

        handle.shutdown().await.unwrap();
        task.join().await;
        assert!(matches!(
            handle.snapshot().await,
            Err(Error::ServiceStopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_navigation_host_surfaces_registration_error() {
        let (handle, _task, _sink, _log) = spawn();
        let token = AttributionSrcToken::new();
        handle.register_navigation_data_host(token).await.unwrap();
        let err = handle
            .register_navigation_data_host(token)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registration(RegistrationError::DuplicateRegistration { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn drop_path_completion_is_applied() {
        let (handle, _task, _sink, log) = spawn();
        let token = AttributionSrcToken::new();
        let id = handle.allocate_background_id();
        let page = RegistrationContext::new(
            SuitableOrigin::parse("https://publisher.test").unwrap(),
            FrameId::new(1, 1),
        );
        handle
            .notify_navigation_registration_started(token, binding())
            .await
            .unwrap();
        assert!(
            handle
                .notify_background_registration_started(
                    id,
                    page,
                    RegistrationEligibility::SourceOrTrigger,
                    Some(token),
                )
                .await
                .unwrap()
        );
        assert_eq!(log.count(OutcomeTag::TiedImmediately), 1);

        assert!(handle.try_notify_background_registration_completed(id));
        handle
            .notify_navigation_registration_completed(token)
            .await
            .unwrap();
        assert!(handle.snapshot().await.unwrap().contexts.is_empty());
    }
}
