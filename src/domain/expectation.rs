use serde::{Deserialize, Serialize};

use super::{ProvenanceResult, TrustedPublisher};

/// Provenance a package is declared to carry, e.g. by a server manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedProvenance {
    /// Expected source repository, matched by containment.
    pub repository_uri: Option<String>,
    pub attestations: Option<ExpectedAttestations>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedAttestations {
    pub available: bool,
    pub publisher: Option<ExpectedPublisher>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedPublisher {
    pub kind: Option<String>,
    pub repository: Option<String>,
    pub workflow: Option<String>,
}

/// One disagreement between declared and observed provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProvenanceMismatch {
    MissingAttestations,
    PublisherKind { expected: String, actual: String },
    PublisherRepository { expected: String, actual: String },
    PublisherWorkflow { expected: String, actual: String },
    RepositoryUri { expected: String, actual: String },
}

impl std::fmt::Display for ProvenanceMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingAttestations => write!(
                f,
                "attestations were declared available, but none were found in the registry"
            ),
            Self::PublisherKind { expected, actual } => {
                write!(f, "expected publisher kind '{expected}', got '{actual}'")
            }
            Self::PublisherRepository { expected, actual } => write!(
                f,
                "expected publisher repository '{expected}', got '{actual}'"
            ),
            Self::PublisherWorkflow { expected, actual } => {
                write!(f, "expected publisher workflow '{expected}', got '{actual}'")
            }
            Self::RepositoryUri { expected, actual } => {
                write!(f, "expected repository '{expected}', found '{actual}'")
            }
        }
    }
}

impl ExpectedPublisher {
    /// Kind compares case-insensitively; workflow compares by file name, so
    /// `release.yml` matches `.github/workflows/release.yml`.
    fn check(&self, actual: &TrustedPublisher, mismatches: &mut Vec<ProvenanceMismatch>) {
        if let Some(expected) = non_empty(&self.kind) {
            if !expected.eq_ignore_ascii_case(&actual.kind) {
                mismatches.push(ProvenanceMismatch::PublisherKind {
                    expected: expected.to_string(),
                    actual: actual.kind.clone(),
                });
            }
        }

        if let Some(expected) = non_empty(&self.repository) {
            if expected != actual.repository {
                mismatches.push(ProvenanceMismatch::PublisherRepository {
                    expected: expected.to_string(),
                    actual: actual.repository.clone(),
                });
            }
        }

        if let Some(expected) = non_empty(&self.workflow) {
            let found = actual.workflow.as_deref().unwrap_or_default();
            if workflow_file(expected) != workflow_file(found) {
                mismatches.push(ProvenanceMismatch::PublisherWorkflow {
                    expected: expected.to_string(),
                    actual: found.to_string(),
                });
            }
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn workflow_file(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl ExpectedProvenance {
    /// Compare a verification result against these expectations.
    pub fn check(&self, result: &ProvenanceResult) -> Vec<ProvenanceMismatch> {
        let mut mismatches = Vec::new();

        if let Some(attestations) = self.attestations.as_ref().filter(|a| a.available) {
            if !result.has_attestations {
                mismatches.push(ProvenanceMismatch::MissingAttestations);
            } else if let (Some(expected), Some(actual)) = (
                attestations.publisher.as_ref(),
                result.trusted_publisher.as_ref(),
            ) {
                expected.check(actual, &mut mismatches);
            }
        }

        if let (Some(expected), Some(actual)) = (
            self.repository_uri.as_deref().filter(|r| !r.is_empty()),
            result.repository_uri.as_deref().filter(|r| !r.is_empty()),
        ) {
            if !actual.contains(expected) {
                mismatches.push(ProvenanceMismatch::RepositoryUri {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        mismatches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Ecosystem, PackageIdentifier, ProvenanceStatus};
    use pretty_assertions::assert_eq;

    fn verified_result(repo: &str) -> ProvenanceResult {
        let mut result = ProvenanceResult::new(
            PackageIdentifier::new(Ecosystem::Pypi, "mcp-clickhouse", "0.1.5"),
            ProvenanceStatus::Verified,
        );
        result.has_attestations = true;
        result.attestation_count = 1;
        result.trusted_publisher = Some(TrustedPublisher {
            kind: "GitHub".into(),
            repository: repo.into(),
            ..Default::default()
        });
        result.repository_uri = Some(format!("git+https://github.com/{repo}.git"));
        result
    }

    fn expecting(repo: &str) -> ExpectedProvenance {
        ExpectedProvenance {
            repository_uri: Some(format!("github.com/{repo}")),
            attestations: Some(ExpectedAttestations {
                available: true,
                publisher: Some(ExpectedPublisher {
                    kind: Some("GitHub".into()),
                    repository: Some(repo.into()),
                    workflow: None,
                }),
            }),
        }
    }

    #[test]
    fn matching_expectations_produce_no_mismatch() {
        let mismatches = expecting("ClickHouse/mcp-clickhouse")
            .check(&verified_result("ClickHouse/mcp-clickhouse"));
        assert!(mismatches.is_empty());
    }

    #[test]
    fn publisher_and_repository_mismatch_reported() {
        let mismatches = expecting("ClickHouse/mcp-clickhouse").check(&verified_result("evil/fork"));
        assert_eq!(
            mismatches,
            vec![
                ProvenanceMismatch::PublisherRepository {
                    expected: "ClickHouse/mcp-clickhouse".into(),
                    actual: "evil/fork".into(),
                },
                ProvenanceMismatch::RepositoryUri {
                    expected: "github.com/ClickHouse/mcp-clickhouse".into(),
                    actual: "git+https://github.com/evil/fork.git".into(),
                },
            ]
        );
    }

    #[test]
    fn missing_attestations_reported() {
        let mut result = verified_result("ClickHouse/mcp-clickhouse");
        result.has_attestations = false;
        result.status = ProvenanceStatus::None;
        let mismatches = expecting("ClickHouse/mcp-clickhouse").check(&result);
        assert_eq!(mismatches, vec![ProvenanceMismatch::MissingAttestations]);
    }

    #[test]
    fn publisher_kind_and_workflow_are_checked() {
        let mut result = verified_result("ClickHouse/mcp-clickhouse");
        if let Some(publisher) = result.trusted_publisher.as_mut() {
            publisher.workflow = Some(".github/workflows/release.yml".into());
        }

        let mut expected = expecting("ClickHouse/mcp-clickhouse");
        if let Some(publisher) = expected
            .attestations
            .as_mut()
            .and_then(|a| a.publisher.as_mut())
        {
            publisher.kind = Some("github".into());
            publisher.workflow = Some("release.yml".into());
        }
        assert!(expected.check(&result).is_empty());

        if let Some(publisher) = expected
            .attestations
            .as_mut()
            .and_then(|a| a.publisher.as_mut())
        {
            publisher.kind = Some("GitLab".into());
            publisher.workflow = Some("publish.yml".into());
        }
        assert_eq!(
            expected.check(&result),
            vec![
                ProvenanceMismatch::PublisherKind {
                    expected: "GitLab".into(),
                    actual: "GitHub".into(),
                },
                ProvenanceMismatch::PublisherWorkflow {
                    expected: "publish.yml".into(),
                    actual: ".github/workflows/release.yml".into(),
                },
            ]
        );
    }

    #[test]
    fn expected_workflow_without_observed_workflow_is_a_mismatch() {
        let mut expected = expecting("ClickHouse/mcp-clickhouse");
        if let Some(publisher) = expected
            .attestations
            .as_mut()
            .and_then(|a| a.publisher.as_mut())
        {
            publisher.workflow = Some("release.yml".into());
        }
        let mismatches = expected.check(&verified_result("ClickHouse/mcp-clickhouse"));
        assert_eq!(
            mismatches,
            vec![ProvenanceMismatch::PublisherWorkflow {
                expected: "release.yml".into(),
                actual: String::new(),
            }]
        );
    }
}
