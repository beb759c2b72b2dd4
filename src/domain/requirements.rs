use serde::{Deserialize, Serialize};

use super::{ProvenanceResult, ProvenanceStatus};

/// Final pass/fail decision for one result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementsVerdict {
    pub pass: bool,
    pub status: ProvenanceStatus,
    pub violations: Vec<String>,
}

/// Which provenance a package must carry before it may be built.
///
/// Loaded from the `[requirements]` table of `.dockhand.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRequirements {
    #[serde(default)]
    pub require_attestations: bool,
    #[serde(default)]
    pub require_trusted_publisher: bool,
    #[serde(default)]
    pub require_signatures: bool,
    /// Accept packages without any provenance (warn, don't fail).
    #[serde(default = "default_allow_none")]
    pub allow_none: bool,
    /// Only `VERIFIED` and `ATTESTATIONS` pass.
    #[serde(default)]
    pub strict: bool,
}

fn default_allow_none() -> bool {
    true
}

impl Default for ProvenanceRequirements {
    fn default() -> Self {
        Self {
            require_attestations: false,
            require_trusted_publisher: false,
            require_signatures: false,
            allow_none: true,
            strict: false,
        }
    }
}

impl ProvenanceRequirements {
    /// Evaluate a result against these requirements and produce a verdict.
    pub fn evaluate(&self, result: &ProvenanceResult) -> RequirementsVerdict {
        let mut violations = Vec::new();

        if self.require_attestations && !result.has_attestations {
            violations.push("attestations are required but none were found".to_string());
        }
        if self.require_trusted_publisher && result.trusted_publisher.is_none() {
            violations.push("a trusted publisher is required but none was identified".to_string());
        }
        if self.require_signatures && !result.has_signatures {
            violations.push("registry signatures are required but none were found".to_string());
        }
        if !self.allow_none && result.status == ProvenanceStatus::None {
            violations.push("package has no provenance information".to_string());
        }
        if self.strict
            && !matches!(
                result.status,
                ProvenanceStatus::Verified | ProvenanceStatus::Attestations
            )
        {
            violations.push(format!(
                "strict mode requires VERIFIED or ATTESTATIONS, got {}",
                result.status
            ));
        }

        RequirementsVerdict {
            pass: violations.is_empty(),
            status: result.status,
            violations,
        }
    }
}
