pub mod console;
pub mod json;

use serde::{Deserialize, Serialize};

use crate::domain::{ProvenanceMismatch, ProvenanceResult, RequirementsVerdict};
use crate::error::Result;

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Console,
    Json,
}

impl OutputFormat {
    pub fn from_str_lenient(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "console" | "text" => Some(Self::Console),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// One verified package with its gating outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub result: ProvenanceResult,
    pub verdict: RequirementsVerdict,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mismatches: Vec<ProvenanceMismatch>,
}

impl ReportEntry {
    pub fn passed(&self) -> bool {
        self.verdict.pass && self.mismatches.is_empty()
    }
}

/// Render report entries into the specified format.
pub fn render(entries: &[ReportEntry], format: OutputFormat, verbose: bool) -> Result<String> {
    match format {
        OutputFormat::Console => Ok(console::render(entries, verbose)),
        OutputFormat::Json => json::render(entries),
    }
}
