//! Background keep-alive registrations.
//!
//! A keep-alive request outlives the page that issued it. The helper turns
//! its redirect chain into background registration calls and makes sure the
//! registration is completed even if the request is torn down mid-flight.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::Result;
use crate::ids::{AttributionSrcToken, BackgroundRegistrationId};
use crate::parser::RegistrationHeaders;
use crate::registration::{RegistrationContext, RegistrationEligibility};
use crate::service::CoordinatorHandle;

/// Attribution eligibility declared on the request itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestEligibility {
    /// Not an attribution request.
    Empty,
    Unset,
    Trigger,
    EventSource,
    NavigationSource,
    EventSourceOrTrigger,
}

impl RequestEligibility {
    /// `None` for requests that never register.
    #[must_use]
    pub const fn registration_eligibility(self) -> Option<RegistrationEligibility> {
        match self {
            Self::Empty => None,
            Self::Unset | Self::Trigger => Some(RegistrationEligibility::TriggerOnly),
            Self::EventSource | Self::NavigationSource => Some(RegistrationEligibility::SourceOnly),
            Self::EventSourceOrTrigger => Some(RegistrationEligibility::SourceOrTrigger),
        }
    }
}

/// Drives one keep-alive request's registrations through a coordinator.
#[derive(Debug)]
pub struct KeepAliveRegistrationHelper {
    handle: CoordinatorHandle,
    id: BackgroundRegistrationId,
    reporting_url: Url,
    finished: bool,
}

impl KeepAliveRegistrationHelper {
    /// Start a background registration for the request.
    ///
    /// Returns `Ok(None)` when the request carries no attribution
    /// eligibility or the coordinator refused the registration.
    pub async fn create(
        handle: CoordinatorHandle,
        eligibility: RequestEligibility,
        context: RegistrationContext,
        token: Option<AttributionSrcToken>,
        reporting_url: Url,
    ) -> Result<Option<Self>> {
        let Some(eligibility) = eligibility.registration_eligibility() else {
            return Ok(None);
        };
        let id = handle.allocate_background_id();
        let started = handle
            .notify_background_registration_started(id, context, eligibility, token)
            .await?;
        if !started {
            debug!(background_id = %id, "keep-alive registration refused");
        }
        // A refused start still holds a channel; keep the helper so it gets completed.
        Ok(Some(Self {
            handle,
            id,
            reporting_url,
            finished: false,
        }))
    }

    #[must_use]
    pub const fn id(&self) -> BackgroundRegistrationId {
        self.id
    }

    #[must_use]
    pub const fn reporting_url(&self) -> &Url {
        &self.reporting_url
    }

    /// Send the current hop's headers, then follow the redirect.
    pub async fn on_receive_redirect(
        &mut self,
        headers: RegistrationHeaders,
        redirect_url: Url,
    ) -> Result<bool> {
        let accepted = self.send(headers).await?;
        self.reporting_url = redirect_url;
        Ok(accepted)
    }

    /// Send the final response's headers and complete the registration.
    pub async fn on_receive_response(mut self, headers: RegistrationHeaders) -> Result<bool> {
        let accepted = self.send(headers).await?;
        self.finished = true;
        self.handle
            .notify_background_registration_completed(self.id)
            .await?;
        Ok(accepted)
    }

    async fn send(&self, headers: RegistrationHeaders) -> Result<bool> {
        if headers.is_empty() {
            return Ok(false);
        }
        self.handle
            .notify_background_registration_data(self.id, headers, self.reporting_url.clone())
            .await
    }
}

/// Completes the leg of a helper dropped mid-flight.
///
/// When the command queue is full the completion is sent from a task on the
/// current runtime. Outside a runtime it is lost and the leg only ends when
/// its context times out.
impl Drop for KeepAliveRegistrationHelper {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let id = self.id;
        if self.handle.try_notify_background_registration_completed(id) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(background_id = %id, "could not complete dropped keep-alive registration");
            return;
        };
        debug!(background_id = %id, "command queue full; completing dropped registration from a task");
        let handle = self.handle.clone();
        runtime.spawn(async move {
            if let Err(err) = handle.notify_background_registration_completed(id).await {
                warn!(background_id = %id, error = %err, "could not complete dropped keep-alive registration");
            }
        });
    }
}
