use super::ReportEntry;
use crate::domain::{ProvenanceResult, ProvenanceStatus, TrustedPublisher};

/// Render report entries as human-readable console output.
pub fn render(entries: &[ReportEntry], verbose: bool) -> String {
    let mut output = String::new();

    if entries.is_empty() {
        output.push_str("\n  No packages verified.\n\n");
        return output;
    }

    for entry in entries {
        output.push('\n');
        render_result(&mut output, &entry.result, verbose);

        for violation in &entry.verdict.violations {
            output.push_str(&format!("  requirement: {}\n", violation));
        }
        for mismatch in &entry.mismatches {
            output.push_str(&format!("  mismatch: {}\n", mismatch));
        }
    }

    let failed = entries.iter().filter(|e| !e.passed()).count();
    let status = if failed == 0 { "PASS" } else { "FAIL" };
    output.push_str(&format!(
        "\n  Result: {} ({} package(s), {} failed)\n\n",
        status,
        entries.len(),
        failed
    ));

    output
}

fn render_result(output: &mut String, result: &ProvenanceResult, verbose: bool) {
    let pkg = &result.package;
    output.push_str(&format!(
        "  Package: {}@{} ({})\n",
        pkg.name, pkg.version, pkg.ecosystem
    ));
    output.push_str(&format!("  Status:  {}\n", result.status));

    match result.status {
        ProvenanceStatus::Verified => {
            output.push_str("  ✓✓ provenance verified cryptographically\n");
            if result.attestation_count > 0 {
                output.push_str(&format!(
                    "  Attestations: {} checked\n",
                    result.attestation_count
                ));
            }
            render_publisher(output, result.trusted_publisher.as_ref());
        }
        ProvenanceStatus::Attestations => {
            output.push_str(&format!(
                "  ✓ {} attestation(s) found, not verified\n",
                result.attestation_count
            ));
            render_publisher(output, result.trusted_publisher.as_ref());
        }
        ProvenanceStatus::Signatures => {
            output.push_str("  ✓ registry signatures only (older provenance format)\n");
        }
        ProvenanceStatus::TrustedPublisher => {
            output.push_str("  ✓ published through a trusted publisher\n");
            render_publisher(output, result.trusted_publisher.as_ref());
        }
        ProvenanceStatus::None => {
            output.push_str("  ⚠  no provenance information available\n");
        }
        ProvenanceStatus::Error => {
            output.push_str(&format!(
                "  ✗ error: {}\n",
                result.error_message.as_deref().unwrap_or("-")
            ));
        }
        ProvenanceStatus::Unknown => {
            output.push_str(&format!(
                "  ? unknown: {}\n",
                result.error_message.as_deref().unwrap_or("-")
            ));
        }
    }

    if let Some(repo) = &result.repository_uri {
        output.push_str(&format!("  Repository: {}\n", repo));
    }

    if verbose && !result.details.is_empty() {
        output.push_str("  Details:\n");
        for (key, value) in &result.details {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            output.push_str(&format!("    {}: {}\n", key, value));
        }
    }
}

fn render_publisher(output: &mut String, publisher: Option<&TrustedPublisher>) {
    let Some(publisher) = publisher else {
        return;
    };
    if publisher.repository.is_empty() {
        output.push_str(&format!("  Publisher: {}\n", publisher.kind));
    } else {
        output.push_str(&format!(
            "  Publisher: {} ({})\n",
            publisher.kind, publisher.repository
        ));
    }
    if let Some(workflow) = &publisher.workflow {
        output.push_str(&format!("  Workflow: {}\n", workflow));
    }
}
