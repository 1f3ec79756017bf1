//! The canonical job status document served on every job route.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::Link;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid job status")]
pub struct ParseJobStatusError(pub String);

/// Lifecycle states of a job. The last three are terminal: once reached, a
/// job never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Accepted,
    Running,
    Successful,
    Failed,
    Dismissed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Successful | JobStatus::Failed | JobStatus::Dismissed
        )
    }
}

impl FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(JobStatus::Accepted),
            "running" => Ok(JobStatus::Running),
            "successful" => Ok(JobStatus::Successful),
            "failed" => Ok(JobStatus::Failed),
            "dismissed" => Ok(JobStatus::Dismissed),
            invalid => Err(ParseJobStatusError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            JobStatus::Accepted => "accepted",
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Dismissed => "dismissed",
        };
        write!(f, "{s}")
    }
}

/// OGC StatusInfo document. `job_id` always carries the gateway-minted id;
/// upstream job ids never appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    #[serde(rename = "processID")]
    pub process_id: String,
    pub r#type: String,
    #[serde(rename = "jobID")]
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl StatusInfo {
    pub fn new(
        process_id: impl Into<String>,
        job_id: impl Into<String>,
        status: JobStatus,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            r#type: "process".to_owned(),
            job_id: job_id.into(),
            status,
            message: None,
            created,
            started: None,
            finished: None,
            updated: None,
            progress: None,
            links: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Equality that disregards the volatile `updated` stamp, used to decide
    /// whether a freshly derived snapshot is news at all.
    pub fn same_observation(&self, other: &StatusInfo) -> bool {
        let mut left = self.clone();
        let mut right = other.clone();
        left.updated = None;
        right.updated = None;
        left == right
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Accepted.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Successful.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Dismissed.is_terminal());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            JobStatus::Accepted,
            JobStatus::Running,
            JobStatus::Successful,
            JobStatus::Failed,
            JobStatus::Dismissed,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<JobStatus>().is_err());
    }

    #[test]
    fn serializes_with_ogc_field_names() {
        let created = "2024-05-01T12:00:00Z".parse().unwrap();
        let info = StatusInfo::new("ms1:square", "0190a0aa", JobStatus::Running, created)
            .with_progress(40);

        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["processID"], json!("ms1:square"));
        assert_eq!(value["jobID"], json!("0190a0aa"));
        assert_eq!(value["type"], json!("process"));
        assert_eq!(value["status"], json!("running"));
        assert_eq!(value["progress"], json!(40));
        assert!(value.get("message").is_none());
        assert!(value.get("finished").is_none());
    }

    #[test]
    fn same_observation_ignores_updated() {
        let created = Utc::now();
        let a = StatusInfo::new("ms1:square", "j", JobStatus::Running, created);
        let mut b = a.clone();
        b.updated = Some(Utc::now());
        assert!(a.same_observation(&b));

        let c = a.clone().with_progress(10);
        assert!(!a.same_observation(&c));
    }
}
