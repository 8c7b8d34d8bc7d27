//! Registration header selection and payload parsing.
//!
//! Header-based flows (navigation redirects, background keep-alive requests,
//! fenced-frame beacons) hand the coordinator raw response headers. The
//! flow's eligibility decides which headers are considered, and a
//! [`RegistrationParser`] turns the selected header into a typed payload.
//! Parsing runs as its own task so a slow parser never stalls the event loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::ParseError;
use crate::registration::{
    RegistrationEligibility, RegistrationKind, SourceRegistration, TriggerRegistration,
};

pub const REGISTER_SOURCE_HEADER: &str = "Attribution-Reporting-Register-Source";
pub const REGISTER_TRIGGER_HEADER: &str = "Attribution-Reporting-Register-Trigger";
pub const REGISTER_OS_SOURCE_HEADER: &str = "Attribution-Reporting-Register-OS-Source";
pub const REGISTER_OS_TRIGGER_HEADER: &str = "Attribution-Reporting-Register-OS-Trigger";

/// Attribution registration headers from one response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationHeaders {
    pub register_source: Option<String>,
    pub register_trigger: Option<String>,
    pub register_os_source: Option<String>,
    pub register_os_trigger: Option<String>,
}

impl RegistrationHeaders {
    /// Collect the registration headers from arbitrary `(name, value)` pairs.
    ///
    /// Header names match case-insensitively; unrelated headers are ignored.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut headers = Self::default();
        for (name, value) in pairs {
            let slot = if name.eq_ignore_ascii_case(REGISTER_SOURCE_HEADER) {
                &mut headers.register_source
            } else if name.eq_ignore_ascii_case(REGISTER_TRIGGER_HEADER) {
                &mut headers.register_trigger
            } else if name.eq_ignore_ascii_case(REGISTER_OS_SOURCE_HEADER) {
                &mut headers.register_os_source
            } else if name.eq_ignore_ascii_case(REGISTER_OS_TRIGGER_HEADER) {
                &mut headers.register_os_trigger
            } else {
                continue;
            };
            *slot = Some(value.to_string());
        }
        headers
    }

    #[must_use]
    pub fn with_source(mut self, json: impl Into<String>) -> Self {
        self.register_source = Some(json.into());
        self
    }

    #[must_use]
    pub fn with_trigger(mut self, json: impl Into<String>) -> Self {
        self.register_trigger = Some(json.into());
        self
    }

    #[must_use]
    pub fn with_os_source(mut self, header: impl Into<String>) -> Self {
        self.register_os_source = Some(header.into());
        self
    }

    #[must_use]
    pub fn with_os_trigger(mut self, header: impl Into<String>) -> Self {
        self.register_os_trigger = Some(header.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.register_source.is_none()
            && self.register_trigger.is_none()
            && self.register_os_source.is_none()
            && self.register_os_trigger.is_none()
    }
}

/// The single header chosen for parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedHeader<'a> {
    Source(&'a str),
    Trigger(&'a str),
    OsSource(&'a str),
    OsTrigger(&'a str),
}

/// Pick the header this flow should parse.
///
/// Headers the eligibility excludes are ignored. A response may register at
/// most one thing: both a source-side and a trigger-side header, or a web
/// and an OS header of the same kind, fail the whole response.
pub fn select_header(
    headers: &RegistrationHeaders,
    eligibility: RegistrationEligibility,
) -> Result<Option<SelectedHeader<'_>>, ParseError> {
    let (web_source, os_source) = if eligibility.allows(RegistrationKind::Source) {
        (
            headers.register_source.as_deref(),
            headers.register_os_source.as_deref(),
        )
    } else {
        (None, None)
    };
    let (web_trigger, os_trigger) = if eligibility.allows(RegistrationKind::Trigger) {
        (
            headers.register_trigger.as_deref(),
            headers.register_os_trigger.as_deref(),
        )
    } else {
        (None, None)
    };

    let has_source = web_source.is_some() || os_source.is_some();
    let has_trigger = web_trigger.is_some() || os_trigger.is_some();
    if has_source && has_trigger {
        return Err(ParseError::SourceAndTriggerHeaders);
    }

    match (web_source, os_source, web_trigger, os_trigger) {
        (Some(_), Some(_), _, _) => Err(ParseError::WebAndOsHeaders(RegistrationKind::Source)),
        (_, _, Some(_), Some(_)) => Err(ParseError::WebAndOsHeaders(RegistrationKind::Trigger)),
        (Some(json), None, _, _) => Ok(Some(SelectedHeader::Source(json))),
        (None, Some(header), _, _) => Ok(Some(SelectedHeader::OsSource(header))),
        (_, _, Some(json), None) => Ok(Some(SelectedHeader::Trigger(json))),
        (_, _, None, Some(header)) => Ok(Some(SelectedHeader::OsTrigger(header))),
        (None, None, None, None) => Ok(None),
    }
}

/// Outcome of parsing one response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRegistration {
    Source(SourceRegistration),
    Trigger(TriggerRegistration),
    OsSource(Vec<Url>),
    OsTrigger(Vec<Url>),
}

impl ParsedRegistration {
    #[must_use]
    pub const fn kind(&self) -> RegistrationKind {
        match self {
            Self::Source(_) | Self::OsSource(_) => RegistrationKind::Source,
            Self::Trigger(_) | Self::OsTrigger(_) => RegistrationKind::Trigger,
        }
    }
}

/// Turns registration header values into typed payloads.
pub trait RegistrationParser: Send + Sync + 'static {
    fn parse_source(&self, json: &str) -> Result<SourceRegistration, ParseError>;

    fn parse_trigger(&self, json: &str) -> Result<TriggerRegistration, ParseError>;

    fn parse_os(&self, header: &str) -> Result<Vec<Url>, ParseError> {
        parse_os_header(header)
    }
}

/// Select and parse in one step.
pub fn parse_headers(
    parser: &dyn RegistrationParser,
    headers: &RegistrationHeaders,
    eligibility: RegistrationEligibility,
) -> Result<Option<ParsedRegistration>, ParseError> {
    let Some(selected) = select_header(headers, eligibility)? else {
        return Ok(None);
    };
    let parsed = match selected {
        SelectedHeader::Source(json) => ParsedRegistration::Source(parser.parse_source(json)?),
        SelectedHeader::Trigger(json) => ParsedRegistration::Trigger(parser.parse_trigger(json)?),
        SelectedHeader::OsSource(header) => ParsedRegistration::OsSource(parser.parse_os(header)?),
        SelectedHeader::OsTrigger(header) => {
            ParsedRegistration::OsTrigger(parser.parse_os(header)?)
        }
    };
    Ok(Some(parsed))
}

/// Default parser: structural JSON checks only.
///
/// Sources must be JSON objects with a `destination`; triggers must be JSON
/// objects. Field-level validation belongs to the attribution engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRegistrationParser;

impl JsonRegistrationParser {
    fn parse_object(json: &str) -> Result<serde_json::Map<String, Value>, ParseError> {
        match serde_json::from_str::<Value>(json) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ParseError::NotAnObject),
            Err(err) => Err(ParseError::InvalidJson(err.to_string())),
        }
    }
}

impl RegistrationParser for JsonRegistrationParser {
    fn parse_source(&self, json: &str) -> Result<SourceRegistration, ParseError> {
        let body = Self::parse_object(json)?;
        match body.get("destination") {
            Some(Value::String(_) | Value::Array(_)) => Ok(SourceRegistration::from_map(body)),
            _ => Err(ParseError::MissingDestination),
        }
    }

    fn parse_trigger(&self, json: &str) -> Result<TriggerRegistration, ParseError> {
        Self::parse_object(json).map(TriggerRegistration::from_map)
    }
}

/// Parse an OS registration header: a list of quoted URL strings.
///
/// `"https://a.test/x", "https://b.test/y";debug-reporting`
pub fn parse_os_header(header: &str) -> Result<Vec<Url>, ParseError> {
    let mut urls = Vec::new();
    for item in header.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let quoted = item
            .strip_prefix('"')
            .and_then(|rest| rest.split_once('"'))
            .map(|(inner, _params)| inner)
            .ok_or_else(|| ParseError::InvalidOsRegistration(item.to_string()))?;
        let url = Url::parse(quoted)
            .map_err(|err| ParseError::InvalidOsRegistration(format!("{quoted}: {err}")))?;
        urls.push(url);
    }
    if urls.is_empty() {
        return Err(ParseError::InvalidOsRegistration("empty list".to_string()));
    }
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE_JSON: &str = r#"{"destination":"https://d.test"}"#;
    const TRIGGER_JSON: &str = r#"{"event_trigger_data":[]}"#;

    #[test]
    fn from_pairs_matches_case_insensitively() {
        let headers = RegistrationHeaders::from_pairs([
            ("attribution-reporting-register-source", SOURCE_JSON),
            ("Content-Type", "text/html"),
            ("ATTRIBUTION-REPORTING-REGISTER-OS-TRIGGER", "\"https://o.test\""),
        ]);
        assert_eq!(headers.register_source.as_deref(), Some(SOURCE_JSON));
        assert_eq!(
            headers.register_os_trigger.as_deref(),
            Some("\"https://o.test\"")
        );
        assert!(headers.register_trigger.is_none());
    }

    #[test]
    fn source_only_ignores_trigger_header() {
        let headers = RegistrationHeaders::default()
            .with_source(SOURCE_JSON)
            .with_trigger(TRIGGER_JSON);
        let selected = select_header(&headers, RegistrationEligibility::SourceOnly).unwrap();
        assert_eq!(selected, Some(SelectedHeader::Source(SOURCE_JSON)));
    }

    #[test]
    fn trigger_only_ignores_source_header() {
        let headers = RegistrationHeaders::default()
            .with_source(SOURCE_JSON)
            .with_trigger(TRIGGER_JSON);
        let selected = select_header(&headers, RegistrationEligibility::TriggerOnly).unwrap();
        assert_eq!(selected, Some(SelectedHeader::Trigger(TRIGGER_JSON)));
    }

    #[test]
    fn source_or_trigger_rejects_both() {
        let headers = RegistrationHeaders::default()
            .with_source(SOURCE_JSON)
            .with_trigger(TRIGGER_JSON);
        assert_eq!(
            select_header(&headers, RegistrationEligibility::SourceOrTrigger),
            Err(ParseError::SourceAndTriggerHeaders)
        );
    }

    #[test]
    fn web_and_os_of_same_kind_is_an_error() {
        let headers = RegistrationHeaders::default()
            .with_source(SOURCE_JSON)
            .with_os_source("\"https://o.test\"");
        assert_eq!(
            select_header(&headers, RegistrationEligibility::SourceOnly),
            Err(ParseError::WebAndOsHeaders(RegistrationKind::Source))
        );
    }

    #[test]
    fn empty_headers_select_nothing() {
        let headers = RegistrationHeaders::default();
        assert!(headers.is_empty());
        assert_eq!(
            parse_headers(
                &JsonRegistrationParser,
                &headers,
                RegistrationEligibility::SourceOrTrigger
            ),
            Ok(None)
        );
    }

    #[test]
    fn json_parser_requires_destination() {
        let parser = JsonRegistrationParser;
        assert!(parser.parse_source(SOURCE_JSON).is_ok());
        assert!(
            parser
                .parse_source(r#"{"destination":["https://a.test","https://b.test"]}"#)
                .is_ok()
        );
        assert_eq!(
            parser.parse_source(r#"{"source_event_id":"1"}"#),
            Err(ParseError::MissingDestination)
        );
        assert_eq!(parser.parse_source("[]"), Err(ParseError::NotAnObject));
        assert!(matches!(
            parser.parse_source("{"),
            Err(ParseError::InvalidJson(_))
        ));
    }

    #[test]
    fn json_parser_accepts_any_trigger_object() {
        let parser = JsonRegistrationParser;
        let trigger = parser.parse_trigger("{}").unwrap();
        assert!(trigger.body().is_empty());
        assert_eq!(parser.parse_trigger("1"), Err(ParseError::NotAnObject));
    }

    #[test]
    fn os_header_parses_quoted_urls_with_params() {
        let urls =
            parse_os_header(r#""https://a.test/x", "https://b.test/y";debug-reporting"#).unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[1].as_str(), "https://b.test/y");
    }

    #[test]
    fn os_header_rejects_tokens_and_empty_lists() {
        assert!(parse_os_header("https://a.test").is_err());
        assert!(parse_os_header(" , ").is_err());
        assert!(parse_os_header(r#""not a url""#).is_err());
    }

    #[test]
    fn parse_headers_dispatches_os_trigger() {
        let headers = RegistrationHeaders::default().with_os_trigger(r#""https://o.test/t""#);
        let parsed = parse_headers(
            &JsonRegistrationParser,
            &headers,
            RegistrationEligibility::TriggerOnly,
        )
        .unwrap()
        .unwrap();
        assert_eq!(parsed.kind(), RegistrationKind::Trigger);
        assert!(matches!(parsed, ParsedRegistration::OsTrigger(urls) if urls.len() == 1));
    }
}
