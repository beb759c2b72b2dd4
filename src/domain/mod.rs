//! Provenance domain model.
//!
//! Every ecosystem verifier consumes a `PackageIdentifier` and produces a
//! `ProvenanceResult`. The service and the CLI only ever see these types,
//! which keeps registry-specific parsing out of reporting and gating.

pub mod expectation;
pub mod requirements;

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ProvenanceError, Result};

pub use expectation::{ExpectedAttestations, ExpectedProvenance, ExpectedPublisher, ProvenanceMismatch};
pub use requirements::{ProvenanceRequirements, RequirementsVerdict};

/// Package ecosystem a verifier can handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Npm,
    Pypi,
    /// Reserved: no Go verifier exists yet, so Go packages report `UNKNOWN`.
    Go,
}

impl Ecosystem {
    pub const ALL: [Ecosystem; 3] = [Self::Npm, Self::Pypi, Self::Go];

    /// Accepts both registry names and the launcher names used in server
    /// manifests (`npx`, `uvx`).
    pub fn from_str_lenient(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "npm" | "npx" => Some(Self::Npm),
            "pypi" | "uvx" | "pip" => Some(Self::Pypi),
            "go" => Some(Self::Go),
            _ => None,
        }
    }
}

impl std::fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Npm => write!(f, "npm"),
            Self::Pypi => write!(f, "pypi"),
            Self::Go => write!(f, "go"),
        }
    }
}

/// Identity of one published package version. The version is always an
/// exact version, never a range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageIdentifier {
    pub ecosystem: Ecosystem,
    pub name: String,
    pub version: String,
}

impl PackageIdentifier {
    pub fn new(ecosystem: Ecosystem, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            ecosystem,
            name: name.into(),
            version: version.into(),
        }
    }

    /// Check that name and version are present and that the version is an
    /// exact version rather than a range.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| ProvenanceError::InvalidPackage {
            input: self.to_string(),
            message: message.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("package name is empty"));
        }
        if self.version.trim().is_empty() {
            return Err(invalid("version is empty"));
        }

        match self.ecosystem {
            Ecosystem::Npm => {
                semver::Version::parse(&self.version)
                    .map_err(|e| invalid(&format!("not an exact semver version: {e}")))?;
            }
            Ecosystem::Pypi | Ecosystem::Go => {
                if self
                    .version
                    .chars()
                    .any(|c| matches!(c, '<' | '>' | '=' | '~' | '^' | '*' | ',' | ' ' | '!'))
                {
                    return Err(invalid("version ranges are not supported"));
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Display for PackageIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.ecosystem, self.name, self.version)
    }
}

/// Parses `ecosystem:name@version`, e.g. `npm:@scope/pkg@1.2.3` or
/// `uvx:mcp-clickhouse@0.1.5`.
impl FromStr for PackageIdentifier {
    type Err = ProvenanceError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |message: &str| ProvenanceError::InvalidPackage {
            input: s.to_string(),
            message: message.to_string(),
        };

        let (eco, rest) = s
            .split_once(':')
            .ok_or_else(|| invalid("expected ecosystem:name@version"))?;
        let ecosystem =
            Ecosystem::from_str_lenient(eco).ok_or_else(|| invalid("unknown ecosystem"))?;
        // Scoped npm names start with '@', so the version separator is the last one.
        let (name, version) = rest
            .rsplit_once('@')
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| invalid("missing @version"))?;

        let pkg = Self::new(ecosystem, name, version);
        pkg.validate()?;
        Ok(pkg)
    }
}

/// Outcome of one verification attempt. Exactly one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvenanceStatus {
    /// A signed attestation verified against the trust root and policy.
    Verified,
    /// Attestation material exists but could not be confirmed.
    Attestations,
    /// Only legacy registry signatures exist.
    Signatures,
    /// An ecosystem-level trusted publisher marker is present.
    TrustedPublisher,
    /// No provenance material at all.
    None,
    /// No verifier is registered for the ecosystem.
    Unknown,
    /// The verification attempt itself failed.
    Error,
}

impl std::fmt::Display for ProvenanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Verified => "VERIFIED",
            Self::Attestations => "ATTESTATIONS",
            Self::Signatures => "SIGNATURES",
            Self::TrustedPublisher => "TRUSTED_PUBLISHER",
            Self::None => "NONE",
            Self::Unknown => "UNKNOWN",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Who produced an artifact: CI platform, repository and workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustedPublisher {
    /// Issuer class, e.g. "GitHub", "GitLab", or "Verified" when only the
    /// certificate policy match is known.
    pub kind: String,
    /// `owner/repo`
    pub repository: String,
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub claims: BTreeMap<String, serde_json::Value>,
}

/// Result of verifying one package. Built fresh for every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceResult {
    pub package: PackageIdentifier,
    pub status: ProvenanceStatus,
    pub has_attestations: bool,
    pub attestation_count: usize,
    pub has_signatures: bool,
    pub trusted_publisher: Option<TrustedPublisher>,
    pub repository_uri: Option<String>,
    pub error_message: Option<String>,
    /// Diagnostics only. Never consulted when deciding `status`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl ProvenanceResult {
    pub fn new(package: PackageIdentifier, status: ProvenanceStatus) -> Self {
        Self {
            package,
            status,
            has_attestations: false,
            attestation_count: 0,
            has_signatures: false,
            trusted_publisher: None,
            repository_uri: None,
            error_message: None,
            details: BTreeMap::new(),
        }
    }

    /// `ERROR` result. An empty message is replaced so the result always
    /// explains itself.
    pub fn failed(package: PackageIdentifier, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = "verification failed".to_string();
        }
        Self {
            error_message: Some(message),
            ..Self::new(package, ProvenanceStatus::Error)
        }
    }

    /// `UNKNOWN` result for an ecosystem without a registered verifier.
    pub fn unknown(package: PackageIdentifier) -> Self {
        let message = format!("no verifier registered for ecosystem {}", package.ecosystem);
        Self {
            error_message: Some(message),
            ..Self::new(package, ProvenanceStatus::Unknown)
        }
    }

    pub fn insert_detail(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.details.insert(key.into(), value.into());
    }
}

/// An ecosystem-specific provenance verifier.
#[async_trait]
pub trait ProvenanceVerifier: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Self-declared capability, checked at registration time.
    fn supports_ecosystem(&self, ecosystem: Ecosystem) -> bool;

    /// Verify one package. `Err` is reserved for transport, decode and
    /// caller errors; missing or unverifiable provenance is a status.
    async fn verify(
        &self,
        pkg: &PackageIdentifier,
        cancel: &CancellationToken,
    ) -> Result<ProvenanceResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scoped_npm_identifier() {
        let pkg: PackageIdentifier = "npx:@upstash/context7-mcp@1.0.14".parse().unwrap();
        assert_eq!(pkg.ecosystem, Ecosystem::Npm);
        assert_eq!(pkg.name, "@upstash/context7-mcp");
        assert_eq!(pkg.version, "1.0.14");
        assert_eq!(pkg.to_string(), "npm:@upstash/context7-mcp@1.0.14");
    }

    #[test]
    fn parses_pypi_identifier_with_launcher_name() {
        let pkg: PackageIdentifier = "uvx:mcp-clickhouse@0.1.5".parse().unwrap();
        assert_eq!(pkg.ecosystem, Ecosystem::Pypi);
        assert_eq!(pkg.name, "mcp-clickhouse");
    }

    #[test]
    fn rejects_version_ranges() {
        assert!("npm:express@^4.0.0".parse::<PackageIdentifier>().is_err());
        assert!("pypi:requests@>=2.0".parse::<PackageIdentifier>().is_err());
    }

    #[test]
    fn rejects_missing_parts() {
        assert!("express@4.0.0".parse::<PackageIdentifier>().is_err());
        assert!("npm:express".parse::<PackageIdentifier>().is_err());
        assert!("npm:@4.0.0".parse::<PackageIdentifier>().is_err());
        assert!("cargo:serde@1.0.0".parse::<PackageIdentifier>().is_err());
    }

    #[test]
    fn failed_result_always_has_message() {
        let pkg = PackageIdentifier::new(Ecosystem::Npm, "x", "1.0.0");
        let result = ProvenanceResult::failed(pkg, "  ");
        assert_eq!(result.status, ProvenanceStatus::Error);
        assert!(!result.error_message.unwrap().trim().is_empty());
    }

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&ProvenanceStatus::TrustedPublisher).unwrap();
        assert_eq!(json, "\"TRUSTED_PUBLISHER\"");
        assert_eq!(ProvenanceStatus::TrustedPublisher.to_string(), "TRUSTED_PUBLISHER");
    }
}
