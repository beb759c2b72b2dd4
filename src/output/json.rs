use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ReportEntry;
use crate::error::Result;

#[derive(Serialize)]
struct JsonReport<'a> {
    generated_at: DateTime<Utc>,
    tool: &'static str,
    version: &'static str,
    pass: bool,
    packages: &'a [ReportEntry],
}

/// Render report entries as a JSON document.
pub fn render(entries: &[ReportEntry]) -> Result<String> {
    let report = JsonReport {
        generated_at: Utc::now(),
        tool: "dockhand",
        version: env!("CARGO_PKG_VERSION"),
        pass: entries.iter().all(ReportEntry::passed),
        packages: entries,
    };
    let json = serde_json::to_string_pretty(&report)?;
    Ok(json)
}
