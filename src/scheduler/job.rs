//! Job payloads and the records the pool publishes about them.
//!
//! This module defines the data that flows through the queue store:
//!
//! - `Job`: the `{"class": ..., "args": [...]}` payload popped from a queue
//! - `WorkerIdentity`: the `host:pid-index:queue` handle of one worker
//! - `WorkingOnRecord`: what a worker is currently executing
//! - `FailureRecord`: an entry appended to the shared failure list
//! - `Classification`: the exception/error/backtrace extracted from the
//!   diagnostic output of a failed job

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Exception name recorded when a failed job's diagnostics are not structured.
pub const UNCLASSIFIED_EXCEPTION: &str = "UnclassifiedRunnerError";

/// A unit of work popped from a queue.
///
/// Fields other than `class` and `args` are kept in `extra` so a payload
/// re-embedded in a failure record is identical to the one that was popped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Identifier of the executable unit under the scripts root.
    #[serde(rename = "class")]
    pub target: String,
    /// Positional arguments passed to the executable unit.
    pub args: Vec<Value>,
    /// Unrecognized payload fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    /// Creates a job for `target` with the given arguments.
    pub fn new(target: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            target: target.into(),
            args,
            extra: Map::new(),
        }
    }

    /// Parses a raw queue entry.
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Serializes the job into its wire format.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Error returned when a worker identity string is malformed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid worker identity '{0}': expected host:pid-index:queue")]
pub struct InvalidIdentity(pub String);

/// Identity of one worker instance for the lifetime of the process.
///
/// Rendered as `host:pid-index:queue`, which is the only handle the queue
/// store ever sees.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    pub host: String,
    pub process_id: u32,
    pub worker_index: usize,
    pub queue: String,
}

impl WorkerIdentity {
    pub fn new(
        host: impl Into<String>,
        process_id: u32,
        worker_index: usize,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            process_id,
            worker_index,
            queue: queue.into(),
        }
    }

    /// Identity for a worker of the current process on this host.
    pub fn local(worker_index: usize, queue: impl Into<String>) -> Self {
        Self::new(local_hostname(), std::process::id(), worker_index, queue)
    }
}

/// Returns the host name of this machine, or `"localhost"` if it cannot be read.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.host, self.process_id, self.worker_index, self.queue
        )
    }
}

impl FromStr for WorkerIdentity {
    type Err = InvalidIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidIdentity(s.to_string());

        let (host, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (process, queue) = rest.split_once(':').ok_or_else(invalid)?;
        let (pid, index) = process.split_once('-').ok_or_else(invalid)?;

        if host.is_empty() || queue.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            process_id: pid.parse().map_err(|_| invalid())?,
            worker_index: index.parse().map_err(|_| invalid())?,
            queue: queue.to_string(),
        })
    }
}

impl Serialize for WorkerIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WorkerIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Published while a worker holds a claimed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingOnRecord {
    pub queue: String,
    /// When the job was claimed.
    pub run_at: DateTime<Utc>,
    pub payload: Job,
}

impl WorkingOnRecord {
    pub fn new(queue: impl Into<String>, payload: Job) -> Self {
        Self {
            queue: queue.into(),
            run_at: Utc::now(),
            payload,
        }
    }
}

/// Exception, error and backtrace describing why a job failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub exception: Value,
    pub error: Value,
    pub backtrace: Value,
}

impl Classification {
    /// Generic classification carrying the raw diagnostic text.
    pub fn unclassified(diagnostics: &str) -> Self {
        Self {
            exception: Value::String(UNCLASSIFIED_EXCEPTION.to_string()),
            error: Value::String(diagnostics.to_string()),
            backtrace: Value::Null,
        }
    }

    /// Classification with an explicit exception name and message.
    pub fn named(exception: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            exception: Value::String(exception.into()),
            error: Value::String(error.into()),
            backtrace: Value::Null,
        }
    }

    /// Classifies the diagnostic text a failed job emitted.
    ///
    /// The whole text is tried as JSON first, then its last non-empty line.
    /// A JSON object is recognized when it has a string `exception` or any
    /// `error` field; anything else yields [`Classification::unclassified`].
    pub fn from_diagnostics(diagnostics: &str) -> Self {
        let trimmed = diagnostics.trim();
        let last_line = trimmed.lines().rev().find(|l| !l.trim().is_empty());

        std::iter::once(trimmed)
            .chain(last_line.filter(|l| *l != trimmed))
            .find_map(|candidate| Self::from_json(candidate, diagnostics))
            .unwrap_or_else(|| Self::unclassified(diagnostics))
    }

    fn from_json(candidate: &str, raw: &str) -> Option<Self> {
        let Value::Object(mut fields) = serde_json::from_str::<Value>(candidate.trim()).ok()?
        else {
            return None;
        };

        let named = fields.get("exception").is_some_and(Value::is_string);
        if !named && !fields.contains_key("error") {
            return None;
        }

        Some(Self {
            exception: fields
                .remove("exception")
                .unwrap_or_else(|| Value::String(UNCLASSIFIED_EXCEPTION.to_string())),
            error: fields
                .remove("error")
                .unwrap_or_else(|| Value::String(raw.to_string())),
            backtrace: fields.remove("backtrace").unwrap_or(Value::Null),
        })
    }
}

/// An entry in the shared failure list. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub failed_at: DateTime<Utc>,
    pub payload: Job,
    pub exception: Value,
    pub error: Value,
    pub backtrace: Value,
    pub worker: WorkerIdentity,
    pub queue: String,
}

impl FailureRecord {
    /// Builds a failure record for `payload`, failed now by `worker`.
    pub fn new(payload: Job, worker: &WorkerIdentity, classification: Classification) -> Self {
        Self {
            failed_at: Utc::now(),
            payload,
            exception: classification.exception,
            error: classification.error,
            backtrace: classification.backtrace,
            worker: worker.clone(),
            queue: worker.queue.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_parses_wire_format() {
        let job = Job::from_payload(r#"{"class":"Mailer","args":[1,"two",{"three":3}]}"#)
            .expect("payload should parse");

        assert_eq!(job.target, "Mailer");
        assert_eq!(job.args, vec![json!(1), json!("two"), json!({"three": 3})]);
        assert!(job.extra.is_empty());
    }

    #[test]
    fn test_job_preserves_unknown_fields() {
        let raw = r#"{"class":"Mailer","args":[],"enqueued_at":1700000000,"meta":{"id":"x"}}"#;
        let job = Job::from_payload(raw).expect("payload should parse");

        assert_eq!(job.extra.get("enqueued_at"), Some(&json!(1700000000)));

        let reparsed: Value =
            serde_json::from_str(&job.to_payload().expect("serialize")).expect("json");
        let original: Value = serde_json::from_str(raw).expect("json");
        assert_eq!(reparsed, original);
    }

    #[test]
    fn test_job_keeps_integers_wider_than_u64() {
        let raw = r#"{"class":"A","args":[123456789012345678901234567890,18446744073709551616]}"#;
        let job = Job::from_payload(raw).expect("payload should parse");

        assert_eq!(job.args[0].to_string(), "123456789012345678901234567890");
        assert_eq!(job.args[1].to_string(), "18446744073709551616");
        assert_eq!(job.to_payload().expect("serialize"), raw);

        let worker = WorkerIdentity::new("box", 1, 0, "default");
        let record = FailureRecord::new(job.clone(), &worker, Classification::from_diagnostics(""));
        let serialized = serde_json::to_string(&record).expect("serialize");
        assert!(serialized.contains("[123456789012345678901234567890,18446744073709551616]"));

        let parsed: FailureRecord = serde_json::from_str(&serialized).expect("deserialize");
        assert_eq!(parsed.payload, job);
    }

    #[test]
    fn test_job_rejects_malformed_payloads() {
        assert!(Job::from_payload("not json").is_err());
        assert!(Job::from_payload(r#"{"args":[]}"#).is_err());
        assert!(Job::from_payload(r#"{"class":"A"}"#).is_err());
        assert!(Job::from_payload(r#"{"class":"A","args":"nope"}"#).is_err());
        assert!(Job::from_payload(r#"[1,2]"#).is_err());
    }

    #[test]
    fn test_worker_identity_display_and_parse() {
        let id = WorkerIdentity::new("box", 4242, 3, "mail:high");
        assert_eq!(id.to_string(), "box:4242-3:mail:high");

        let parsed: WorkerIdentity = "box:4242-3:mail:high".parse().expect("should parse");
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_worker_identity_rejects_garbage() {
        assert!("".parse::<WorkerIdentity>().is_err());
        assert!("box".parse::<WorkerIdentity>().is_err());
        assert!("box:12:queue".parse::<WorkerIdentity>().is_err());
        assert!("box:x-1:queue".parse::<WorkerIdentity>().is_err());
        assert!("box:1-1:".parse::<WorkerIdentity>().is_err());
    }

    #[test]
    fn test_local_identity_uses_current_pid() {
        let id = WorkerIdentity::local(0, "default");
        assert_eq!(id.process_id, std::process::id());
        assert!(!id.host.is_empty());
    }

    #[test]
    fn test_classify_structured_diagnostics() {
        let c = Classification::from_diagnostics(
            r#"{"exception":"E","error":"msg","backtrace":["l1"]}"#,
        );

        assert_eq!(c.exception, json!("E"));
        assert_eq!(c.error, json!("msg"));
        assert_eq!(c.backtrace, json!(["l1"]));
    }

    #[test]
    fn test_classify_unstructured_diagnostics() {
        let c = Classification::from_diagnostics("not json");

        assert_eq!(c.exception, json!(UNCLASSIFIED_EXCEPTION));
        assert_eq!(c.error, json!("not json"));
        assert_eq!(c.backtrace, Value::Null);
    }

    #[test]
    fn test_classify_uses_last_line_after_log_output() {
        let text = "starting\nconnecting to smtp\n{\"exception\":\"Timeout\",\"error\":\"smtp\"}\n";
        let c = Classification::from_diagnostics(text);

        assert_eq!(c.exception, json!("Timeout"));
        assert_eq!(c.error, json!("smtp"));
        assert_eq!(c.backtrace, Value::Null);
    }

    #[test]
    fn test_classify_json_without_known_fields_is_unclassified() {
        let c = Classification::from_diagnostics(r#"{"level":"warn"}"#);
        assert_eq!(c.exception, json!(UNCLASSIFIED_EXCEPTION));
        assert_eq!(c.error, json!(r#"{"level":"warn"}"#));

        let c = Classification::from_diagnostics("[1,2,3]");
        assert_eq!(c.exception, json!(UNCLASSIFIED_EXCEPTION));

        let c = Classification::from_diagnostics(r#"{"exception":42}"#);
        assert_eq!(c.exception, json!(UNCLASSIFIED_EXCEPTION));
        assert_eq!(c.error, json!(r#"{"exception":42}"#));
    }

    #[test]
    fn test_classify_partial_fields_fill_defaults() {
        let c = Classification::from_diagnostics(r#"{"error":"boom"}"#);
        assert_eq!(c.exception, json!(UNCLASSIFIED_EXCEPTION));
        assert_eq!(c.error, json!("boom"));
    }

    #[test]
    fn test_failure_record_roundtrip_keeps_payload() {
        let mut job = Job::new("Report", vec![json!(7), json!(null)]);
        job.extra.insert("id".to_string(), json!("abc"));
        let worker = WorkerIdentity::new("box", 1, 0, "reports");

        let record = FailureRecord::new(
            job.clone(),
            &worker,
            Classification::from_diagnostics(r#"{"exception":"E","error":"msg","backtrace":["l1"]}"#),
        );

        let serialized = serde_json::to_string(&record).expect("serialize");
        let parsed: FailureRecord = serde_json::from_str(&serialized).expect("deserialize");

        assert_eq!(parsed, record);
        assert_eq!(parsed.payload, job);
        assert_eq!(parsed.queue, "reports");

        let value: Value = serde_json::from_str(&serialized).expect("json");
        assert_eq!(value["worker"], json!("box:1-0:reports"));
        assert_eq!(value["payload"]["class"], json!("Report"));
        assert_eq!(value["payload"]["id"], json!("abc"));
    }
}
