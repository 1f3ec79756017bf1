//! Canonical process identifiers and the OGC process document shapes.
//!
//! Every process federated through the gateway is addressed as
//! `{provider}:{bare_id}`; the provider half names a configured upstream and
//! the bare half is whatever id the upstream itself uses.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static ID_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[A-Za-z0-9_-]+$").expect("invalid id segment regex"));

/// Returns whether `s` is usable as either half of a canonical process id.
pub fn is_valid_segment(s: &str) -> bool {
    ID_SEGMENT.is_match(s)
}

/// Cheap probe for a `provider:` prefix. Returns the provider half without
/// validating the remainder; use [`ProcessId::parse`] for the full check.
pub fn provider_prefix(s: &str) -> Option<&str> {
    let (provider, bare) = s.split_once(':')?;
    if provider.is_empty() || bare.is_empty() {
        return None;
    }
    Some(provider)
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProcessIdError {
    #[error("{0} is not a prefixed process id")]
    MissingPrefix(String),
    #[error("{0} is not a valid process id segment")]
    InvalidSegment(String),
}

/// A fully qualified process id: provider name plus the provider-local id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessId {
    provider: String,
    bare: String,
}

impl ProcessId {
    pub fn new(provider: &str, bare: &str) -> Result<Self, ProcessIdError> {
        for segment in [provider, bare] {
            if !is_valid_segment(segment) {
                return Err(ProcessIdError::InvalidSegment(segment.to_owned()));
            }
        }
        Ok(Self {
            provider: provider.to_owned(),
            bare: bare.to_owned(),
        })
    }

    /// Split on the first colon; both halves must be valid segments.
    pub fn parse(s: &str) -> Result<Self, ProcessIdError> {
        let (provider, bare) = s
            .split_once(':')
            .ok_or_else(|| ProcessIdError::MissingPrefix(s.to_owned()))?;
        Self::new(provider, bare)
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn bare(&self) -> &str {
        &self.bare
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.bare)
    }
}

impl FromStr for ProcessId {
    type Err = ProcessIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ProcessId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ProcessId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Link relations used in gateway documents.
pub mod rel {
    pub const SELF: &str = "self";
    pub const STATUS: &str = "status";
    pub const NEXT: &str = "next";
    pub const PREV: &str = "prev";
    pub const RESULTS: &str = "http://www.opengis.net/def/rel/ogc/1.0/results";
}

pub mod media_type {
    pub const JSON: &str = "application/json";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    pub rel: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Link {
    pub fn new(href: impl Into<String>, rel: &str) -> Self {
        Self {
            href: href.into(),
            rel: rel.to_owned(),
            media_type: None,
            title: None,
        }
    }

    pub fn json(href: impl Into<String>, rel: &str) -> Self {
        Self::new(href, rel).with_type(media_type::JSON)
    }

    pub fn with_type(mut self, media_type: &str) -> Self {
        self.media_type = Some(media_type.to_owned());
        self
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_owned());
        self
    }
}

/// Summary entry of `/processes`. Unknown upstream fields are preserved so a
/// pipelined document survives serialization unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: String,
    #[serde(default)]
    pub job_control_options: Vec<String>,
    #[serde(default)]
    pub output_transmission: Vec<String>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProcessSummary {
    /// The canonical id, assuming the document went through the pipeline.
    pub fn process_id(&self) -> Result<ProcessId, ProcessIdError> {
        ProcessId::parse(&self.id)
    }
}

/// Full process description: summary fields plus the input/output schemas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    #[serde(flatten)]
    pub summary: ProcessSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<serde_json::Value>>,
}

impl ProcessDescriptor {
    /// Descriptor with only summary-level information, used when an upstream
    /// exposes a process in its list but its description endpoint is broken.
    pub fn from_summary(summary: ProcessSummary) -> Self {
        Self {
            summary,
            inputs: None,
            outputs: None,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessList {
    pub processes: Vec<ProcessSummary>,
    pub links: Vec<Link>,
}
