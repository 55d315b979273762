//! Repositories over the ledger tables
//!
//! Identifiers are stored as hyphenated UUID text, timestamps as RFC 3339
//! with microseconds (so lexical order is chronological) and JSON documents
//! as text.

pub mod task;
pub mod workflow_run;

pub use task::{TaskRepository, TaskRow};
pub use workflow_run::{WorkflowRunRepository, WorkflowRunRow};

use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(table: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::corrupt(table, format!("bad timestamp '{}': {}", raw, e)))
}

pub(crate) fn parse_optional_timestamp(
    table: &str,
    raw: Option<&str>,
) -> Result<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_timestamp(table, raw)).transpose()
}

pub(crate) fn parse_uuid(table: &str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::corrupt(table, format!("bad id '{}': {}", raw, e)))
}
