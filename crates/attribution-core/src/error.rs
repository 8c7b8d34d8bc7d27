//! Error types for attribution-core

use std::fmt::Write;
use std::time::Duration;

use thiserror::Error;

use crate::context::ContextKey;
use crate::ids::{AttributionSrcToken, ChannelId};
use crate::logging::LogError;
use crate::registration::RegistrationKind;

/// Actionable guidance for an error surfaced at the CLI boundary
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<String>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);
        for command in &self.commands {
            let _ = writeln!(output, "    $ {command}");
        }
        for alt in &self.alternatives {
            let _ = writeln!(output, "  - {alt}");
        }
        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for attribution-core
#[derive(Error, Debug)]
pub enum Error {
    /// Per-registration failures
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Logging setup errors
    #[error("Logging error: {0}")]
    Log(#[from] LogError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The coordinator event loop is no longer running
    #[error("coordinator service stopped")]
    ServiceStopped,
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Log(LogError::InvalidLevel(level)) => Some(
                Remediation::new(format!("Unknown log level '{level}'."))
                    .alternative("Use one of: trace, debug, info, warn, error."),
            ),
            Self::ServiceStopped => Some(
                Remediation::new("The coordinator task exited before the request completed.")
                    .alternative("Check earlier log lines for the shutdown cause."),
            ),
            _ => None,
        }
    }
}

/// Failures scoped to a single registration, channel, or context.
///
/// None of these abort the coordinator; each one is logged, recorded in
/// telemetry, and confined to the flow that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Malformed payload; the registration is dropped but its leg still completes.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// A channel sent a registration kind it was not created for.
    #[error("channel {channel} is not eligible for {registration} registrations")]
    EligibilityViolation {
        channel: ChannelId,
        registration: RegistrationKind,
    },

    /// A second navigation-tied channel for the same token.
    #[error("a navigation data host is already registered for token {token}")]
    DuplicateRegistration { token: AttributionSrcToken },

    /// The deferred queue (or source buffer) for an active context is full.
    #[error("context {context} already holds {limit} deferred registrations")]
    CapacityExceeded { context: ContextKey, limit: usize },

    /// A context exceeded its wait budget and was force-flushed.
    #[error("context {context} timed out after {waited:?}")]
    Timeout { context: ContextKey, waited: Duration },

    /// The channel was never registered or has already been closed.
    #[error("channel {channel} is closed or unknown")]
    UnknownChannel { channel: ChannelId },
}

/// Payload and header parsing failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("registration must be a JSON object")]
    NotAnObject,

    #[error("source registration is missing a destination")]
    MissingDestination,

    #[error("invalid OS registration header: {0}")]
    InvalidOsRegistration(String),

    #[error("response carries both source and trigger registration headers")]
    SourceAndTriggerHeaders,

    #[error("response carries both web and OS {0} registration headers")]
    WebAndOsHeaders(RegistrationKind),

    #[error("reporting origin {0} is not potentially trustworthy")]
    UntrustworthyReportingOrigin(String),
}

/// Origin validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OriginError {
    #[error("invalid URL {input}: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("origin {0} is not potentially trustworthy")]
    Untrustworthy(String),
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command(format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path, or omit it to use defaults."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command(format!("ls -l \"{path}\"")),
            Self::ParseError(_) => Remediation::new("Config parse failed. Fix the TOML syntax.")
                .command("attrib config --defaults")
                .alternative("Compare against the default configuration printed above."),
            Self::SerializeFailed(_) => {
                Remediation::new("Config could not be serialized back to TOML.")
            }
            Self::ValidationError(msg) => Remediation::new(format!("Invalid config value: {msg}"))
                .alternative("Timeouts, queue bounds and capacities must be non-zero."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_carry_remediation() {
        let errors = vec![
            Error::Config(ConfigError::FileNotFound("attrib.toml".to_string())),
            Error::Config(ConfigError::ReadFailed(
                "attrib.toml".to_string(),
                "denied".to_string(),
            )),
            Error::Config(ConfigError::ParseError("bad".to_string())),
            Error::Config(ConfigError::SerializeFailed("bad".to_string())),
            Error::Config(ConfigError::ValidationError("zero".to_string())),
            Error::Log(LogError::InvalidLevel("loud".to_string())),
            Error::ServiceStopped,
        ];

        for error in errors {
            let remediation = error.remediation().expect("missing remediation");
            assert!(!remediation.summary.is_empty(), "{error}");
            assert!(remediation.render_plain().starts_with("To fix:"));
        }
    }

    #[test]
    fn registration_errors_have_no_remediation() {
        let err = Error::from(RegistrationError::UnknownChannel {
            channel: ChannelId::new(7),
        });
        assert!(err.remediation().is_none());
        assert_eq!(
            err.to_string(),
            "Registration error: channel channel-7 is closed or unknown"
        );
    }

    #[test]
    fn parse_error_converts_into_registration_error() {
        let err: RegistrationError = ParseError::MissingDestination.into();
        assert_eq!(err, RegistrationError::Parse(ParseError::MissingDestination));
        assert!(err.to_string().contains("destination"));
    }

    #[test]
    fn eligibility_violation_display_names_kind() {
        let err = RegistrationError::EligibilityViolation {
            channel: ChannelId::new(3),
            registration: RegistrationKind::Source,
        };
        assert_eq!(
            err.to_string(),
            "channel channel-3 is not eligible for source registrations"
        );
    }
}
