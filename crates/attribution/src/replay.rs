//! Scenario trace replay.
//!
//! A trace is a TOML file of `[[step]]` tables. Each step names an operation
//! in `op`; tokens, channels, background registrations and beacons are
//! referred to by symbolic aliases that the replayer maps to fresh ids.
//!
//! ```toml
//! [[step]]
//! op = "will_start"
//! token = "nav"
//! expected_legs = 1
//!
//! [[step]]
//! op = "advance"
//! ms = 5000
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use attribution_core::context::NavigationBinding;
use attribution_core::ids::{
    AttributionSrcToken, BackgroundRegistrationId, BeaconId, ChannelId, FrameId, NavigationId,
};
use attribution_core::origin::SuitableOrigin;
use attribution_core::parser::RegistrationHeaders;
use attribution_core::registration::{
    RegistrationContext, RegistrationEligibility, SourceRegistration, TriggerRegistration,
};
use attribution_core::sink::{Delivery, RecordingSink};
use attribution_core::telemetry::{Diagnostic, OutcomeLog, OutcomeTag};
use attribution_core::{
    CoordinatorConfig, CoordinatorHandle, CoordinatorService, CoordinatorSnapshot, Error,
};

// =============================================================================
// Trace format
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct Trace {
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

impl Trace {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading trace {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing trace {}", path.display()))
    }
}

/// Page-side metadata shared by channel-creating steps.
#[derive(Debug, Clone, Deserialize)]
pub struct Page {
    pub origin: String,
    #[serde(default)]
    pub fenced: bool,
    pub last_navigation: Option<i64>,
}

/// Registration response headers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Headers {
    pub source: Option<String>,
    pub trigger: Option<String>,
    pub os_source: Option<String>,
    pub os_trigger: Option<String>,
}

impl Headers {
    fn to_registration_headers(&self) -> RegistrationHeaders {
        RegistrationHeaders {
            register_source: self.source.clone(),
            register_trigger: self.trigger.clone(),
            register_os_source: self.os_source.clone(),
            register_os_trigger: self.os_trigger.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    RegisterDataHost {
        channel: String,
        eligibility: RegistrationEligibility,
        #[serde(flatten)]
        page: Page,
    },
    RegisterNavigationDataHost {
        channel: String,
        token: String,
    },
    WillStart {
        token: String,
        expected_legs: u32,
    },
    NavigationStarted {
        token: String,
        navigation_id: i64,
        origin: String,
        #[serde(default)]
        fenced: bool,
    },
    NavigationData {
        token: String,
        reporting_url: String,
        #[serde(flatten)]
        headers: Headers,
    },
    NavigationCompleted {
        token: String,
    },
    BackgroundStarted {
        id: String,
        token: Option<String>,
        eligibility: RegistrationEligibility,
        #[serde(flatten)]
        page: Page,
    },
    BackgroundData {
        id: String,
        reporting_url: String,
        #[serde(flatten)]
        headers: Headers,
    },
    BackgroundCompleted {
        id: String,
    },
    BeaconStarted {
        id: String,
        navigation_id: Option<i64>,
        #[serde(flatten)]
        page: Page,
    },
    BeaconData {
        id: String,
        reporting_url: String,
        #[serde(default)]
        is_final: bool,
        #[serde(flatten)]
        headers: Headers,
    },
    Source {
        channel: String,
        reporting_origin: String,
        body: String,
    },
    Trigger {
        channel: String,
        reporting_origin: String,
        body: String,
    },
    OsSource {
        channel: String,
        urls: Vec<String>,
    },
    OsTrigger {
        channel: String,
        urls: Vec<String>,
    },
    Disconnect {
        channel: String,
    },
    /// Move the paused clock forward.
    Advance {
        ms: u64,
    },
    /// Wait for in-flight parses.
    Settle,
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub steps: usize,
    pub deliveries: Vec<Delivery>,
    pub outcomes: BTreeMap<OutcomeTag, usize>,
    pub diagnostics: Vec<Diagnostic>,
    pub snapshot: CoordinatorSnapshot,
}

impl ReplayReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "replayed {} steps", self.steps);
        let _ = writeln!(out, "deliveries: {}", self.deliveries.len());
        for delivery in &self.deliveries {
            match delivery {
                Delivery::Source { source, frame_id } => {
                    let _ = writeln!(
                        out,
                        "  source  {} -> {} ({:?}, frame {frame_id})",
                        source.reporting_origin, source.source_origin, source.source_type
                    );
                }
                Delivery::Trigger { trigger, frame_id } => {
                    let _ = writeln!(
                        out,
                        "  trigger {} -> {} (after_timeout={}, frame {frame_id})",
                        trigger.reporting_origin,
                        trigger.destination_origin,
                        trigger.processed_after_timeout
                    );
                }
                Delivery::Os { registration } => {
                    let _ = writeln!(
                        out,
                        "  os      {} {} url(s) on {}",
                        registration.kind,
                        registration.registration_urls.len(),
                        registration.top_level_origin
                    );
                }
            }
        }
        let _ = writeln!(out, "outcomes:");
        for (tag, count) in &self.outcomes {
            let _ = writeln!(out, "  {tag}: {count}");
        }
        let _ = writeln!(out, "diagnostics: {}", self.diagnostics.len());
        let _ = writeln!(
            out,
            "live contexts: {}, open channels: {}, queued triggers: {}",
            self.snapshot.contexts.len(),
            self.snapshot.open_channels,
            self.snapshot.queued_triggers
        );
        out
    }
}

// =============================================================================
// Replayer
// =============================================================================

/// Replay `trace` on a fresh paused-clock runtime.
pub fn run(config: CoordinatorConfig, trace: &Trace) -> Result<ReplayReport> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .context("building replay runtime")?;
    runtime.block_on(replay(config, trace))
}

async fn replay(config: CoordinatorConfig, trace: &Trace) -> Result<ReplayReport> {
    let sink = Arc::new(RecordingSink::new());
    let log = Arc::new(OutcomeLog::new());
    let (handle, task) = CoordinatorService::new(config, sink.clone(), log.clone()).spawn();

    let mut replayer = Replayer::new(handle.clone());
    for (index, step) in trace.steps.iter().enumerate() {
        replayer
            .apply(step)
            .await
            .with_context(|| format!("step {} ({step:?})", index + 1))?;
    }
    replayer.settle().await?;

    let snapshot = handle.snapshot().await?;
    handle.shutdown().await?;
    task.join().await;

    Ok(ReplayReport {
        steps: trace.steps.len(),
        deliveries: sink.deliveries(),
        outcomes: log.counts(),
        diagnostics: log.diagnostics(),
        snapshot,
    })
}

struct Replayer {
    handle: CoordinatorHandle,
    tokens: HashMap<String, AttributionSrcToken>,
    channels: HashMap<String, ChannelId>,
    backgrounds: HashMap<String, BackgroundRegistrationId>,
    beacons: HashMap<String, BeaconId>,
    next_beacon: u64,
}

impl Replayer {
    fn new(handle: CoordinatorHandle) -> Self {
        Self {
            handle,
            tokens: HashMap::new(),
            channels: HashMap::new(),
            backgrounds: HashMap::new(),
            beacons: HashMap::new(),
            next_beacon: 1,
        }
    }

    fn token(&mut self, alias: &str) -> AttributionSrcToken {
        *self.tokens.entry(alias.to_string()).or_default()
    }

    fn channel(&self, alias: &str) -> Result<ChannelId> {
        self.channels
            .get(alias)
            .copied()
            .ok_or_else(|| anyhow!("unknown channel alias {alias:?}"))
    }

    fn background(&self, alias: &str) -> Result<BackgroundRegistrationId> {
        self.backgrounds
            .get(alias)
            .copied()
            .ok_or_else(|| anyhow!("unknown background alias {alias:?}"))
    }

    fn beacon(&self, alias: &str) -> Result<BeaconId> {
        self.beacons
            .get(alias)
            .copied()
            .ok_or_else(|| anyhow!("unknown beacon alias {alias:?}"))
    }

    async fn settle(&self) -> Result<()> {
        tokio::task::yield_now().await;
        self.handle.idle().await?;
        Ok(())
    }

    async fn apply(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::RegisterDataHost {
                channel,
                eligibility,
                page,
            } => {
                let id = self
                    .handle
                    .register_data_host(page_context(page)?, *eligibility)
                    .await?;
                self.channels.insert(channel.clone(), id);
            }
            Step::RegisterNavigationDataHost { channel, token } => {
                let token = self.token(token);
                match self.handle.register_navigation_data_host(token).await {
                    Ok(id) => {
                        self.channels.insert(channel.clone(), id);
                    }
                    Err(err) => tolerate(err)?,
                }
            }
            Step::WillStart {
                token,
                expected_legs,
            } => {
                let token = self.token(token);
                self.handle
                    .notify_navigation_with_background_registrations_will_start(
                        token,
                        *expected_legs,
                    )
                    .await?;
            }
            Step::NavigationStarted {
                token,
                navigation_id,
                origin,
                fenced,
            } => {
                let token = self.token(token);
                let binding = NavigationBinding {
                    navigation_id: NavigationId::new(*navigation_id),
                    source_origin: suitable(origin)?,
                    is_within_fenced_frame: *fenced,
                    frame_id: main_frame(),
                };
                self.handle
                    .notify_navigation_registration_started(token, binding)
                    .await?;
            }
            Step::NavigationData {
                token,
                reporting_url,
                headers,
            } => {
                let token = self.token(token);
                let accepted = self
                    .handle
                    .notify_navigation_registration_data(
                        token,
                        headers.to_registration_headers(),
                        parse_url(reporting_url)?,
                    )
                    .await?;
                debug!(accepted, "navigation data replayed");
            }
            Step::NavigationCompleted { token } => {
                let token = self.token(token);
                self.handle
                    .notify_navigation_registration_completed(token)
                    .await?;
            }
            Step::BackgroundStarted {
                id,
                token,
                eligibility,
                page,
            } => {
                let background = self.handle.allocate_background_id();
                self.backgrounds.insert(id.clone(), background);
                let token = token.as_deref().map(|alias| self.token(alias));
                let accepted = self
                    .handle
                    .notify_background_registration_started(
                        background,
                        page_context(page)?,
                        *eligibility,
                        token,
                    )
                    .await?;
                debug!(accepted, background_id = %background, "background start replayed");
            }
            Step::BackgroundData {
                id,
                reporting_url,
                headers,
            } => {
                let background = self.background(id)?;
                self.handle
                    .notify_background_registration_data(
                        background,
                        headers.to_registration_headers(),
                        parse_url(reporting_url)?,
                    )
                    .await?;
            }
            Step::BackgroundCompleted { id } => {
                let background = self.background(id)?;
                self.handle
                    .notify_background_registration_completed(background)
                    .await?;
            }
            Step::BeaconStarted {
                id,
                navigation_id,
                page,
            } => {
                let beacon = BeaconId::new(self.next_beacon);
                self.next_beacon += 1;
                self.beacons.insert(id.clone(), beacon);
                self.handle
                    .notify_fenced_frame_reporting_beacon_started(
                        beacon,
                        navigation_id.map(NavigationId::new),
                        page_context(page)?,
                    )
                    .await?;
            }
            Step::BeaconData {
                id,
                reporting_url,
                is_final,
                headers,
            } => {
                let beacon = self.beacon(id)?;
                self.handle
                    .notify_fenced_frame_reporting_beacon_data(
                        beacon,
                        headers.to_registration_headers(),
                        parse_url(reporting_url)?,
                        *is_final,
                    )
                    .await?;
            }
            Step::Source {
                channel,
                reporting_origin,
                body,
            } => {
                let channel = self.channel(channel)?;
                let registration = SourceRegistration::from_map(json_object(body)?);
                if let Err(err) = self
                    .handle
                    .source_data_available(channel, suitable(reporting_origin)?, registration)
                    .await
                {
                    tolerate(err)?;
                }
            }
            Step::Trigger {
                channel,
                reporting_origin,
                body,
            } => {
                let channel = self.channel(channel)?;
                let registration = TriggerRegistration::from_map(json_object(body)?);
                if let Err(err) = self
                    .handle
                    .trigger_data_available(channel, suitable(reporting_origin)?, registration)
                    .await
                {
                    tolerate(err)?;
                }
            }
            Step::OsSource { channel, urls } => {
                let channel = self.channel(channel)?;
                let urls = urls.iter().map(|url| parse_url(url)).collect::<Result<_>>()?;
                if let Err(err) = self.handle.os_source_data_available(channel, urls).await {
                    tolerate(err)?;
                }
            }
            Step::OsTrigger { channel, urls } => {
                let channel = self.channel(channel)?;
                let urls = urls.iter().map(|url| parse_url(url)).collect::<Result<_>>()?;
                if let Err(err) = self.handle.os_trigger_data_available(channel, urls).await {
                    tolerate(err)?;
                }
            }
            Step::Disconnect { channel } => {
                let channel = self.channel(channel)?;
                self.handle.disconnect(channel).await?;
            }
            Step::Advance { ms } => {
                self.settle().await?;
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                self.settle().await?;
            }
            Step::Settle => self.settle().await?,
        }
        Ok(())
    }
}

/// Registration failures are part of the replayed behaviour; anything else aborts.
fn tolerate(err: Error) -> Result<()> {
    match err {
        Error::Registration(err) => {
            debug!(error = %err, "registration rejected during replay");
            Ok(())
        }
        other => Err(other.into()),
    }
}

const fn main_frame() -> FrameId {
    FrameId::new(1, 1)
}

fn suitable(origin: &str) -> Result<SuitableOrigin> {
    SuitableOrigin::parse(origin).with_context(|| format!("origin {origin:?}"))
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).with_context(|| format!("url {url:?}"))
}

fn page_context(page: &Page) -> Result<RegistrationContext> {
    let mut context = RegistrationContext::new(suitable(&page.origin)?, main_frame())
        .within_fenced_frame(page.fenced);
    if let Some(navigation_id) = page.last_navigation {
        context = context.with_last_navigation(NavigationId::new(navigation_id));
    }
    Ok(context)
}

fn json_object(body: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_str(body).with_context(|| format!("registration body {body:?}"))? {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("registration body must be a JSON object"),
    }
}
