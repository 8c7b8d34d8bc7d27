//! Potentially-trustworthy origins.
//!
//! Attribution registrations are only honoured for secure contexts: the
//! reporting origin of every header-based registration and the context
//! origin of every channel must be `https`/`wss`, or plain `http`/`ws`
//! served from a loopback host.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::{Host, Origin, Url};

use crate::error::OriginError;

/// An origin that has passed the potentially-trustworthy check.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SuitableOrigin(Origin);

impl SuitableOrigin {
    /// Returns `None` when the URL's origin is opaque or not trustworthy.
    #[must_use]
    pub fn create(url: &Url) -> Option<Self> {
        let origin = url.origin();
        is_potentially_trustworthy(&origin).then_some(Self(origin))
    }

    /// Parse and validate a URL or origin string.
    pub fn parse(input: &str) -> Result<Self, OriginError> {
        let url = Url::parse(input).map_err(|err| OriginError::InvalidUrl {
            input: input.to_string(),
            reason: err.to_string(),
        })?;
        Self::create(&url).ok_or_else(|| OriginError::Untrustworthy(input.to_string()))
    }

    #[must_use]
    pub fn as_origin(&self) -> &Origin {
        &self.0
    }

    /// `scheme://host[:port]` form.
    #[must_use]
    pub fn ascii_serialization(&self) -> String {
        self.0.ascii_serialization()
    }
}

fn is_potentially_trustworthy(origin: &Origin) -> bool {
    match origin {
        Origin::Opaque(_) => false,
        Origin::Tuple(scheme, host, _) => match scheme.as_str() {
            "https" | "wss" => true,
            "http" | "ws" => is_loopback(host),
            _ => false,
        },
    }
}

fn is_loopback(host: &Host<String>) -> bool {
    match host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.');
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Host::Ipv4(addr) => addr.is_loopback(),
        Host::Ipv6(addr) => addr.is_loopback(),
    }
}

impl fmt::Display for SuitableOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ascii_serialization())
    }
}

impl FromStr for SuitableOrigin {
    type Err = OriginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SuitableOrigin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.ascii_serialization())
    }
}

impl<'de> Deserialize<'de> for SuitableOrigin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
