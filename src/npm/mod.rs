//! npm provenance verification.
//!
//! The registry document for a package lists every version. A version's
//! `dist` block may carry:
//!
//! - `attestations`: Sigstore bundles, inline or behind `attestations.url`
//!   (the registry's `/-/npm/v1/attestations/{name}@{version}` endpoint);
//! - `signatures`: legacy ECDSA registry signatures, detect-only.
//!
//! Attestations are bound to the tarball by its SHA-512 digest.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    Ecosystem, PackageIdentifier, ProvenanceResult, ProvenanceStatus, ProvenanceVerifier,
    TrustedPublisher,
};
use crate::error::{ProvenanceError, Result};
use crate::sigstore::{
    extract_publisher_info, merge_publisher, publisher_from_slsa, AttestationVerifier,
    BundleDocument, DigestAlgorithm, IdentityPolicy,
};
use crate::transport::{null_as_default, Transport};

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.npmjs.org";

const SLSA_PROVENANCE_PREFIX: &str = "https://slsa.dev/provenance/";

/// Any GitHub repository; npm does not declare which one in advance.
const GITHUB_SUBJECT_PATTERN: &str = r"^https://github\.com/";

#[derive(Debug, Clone, Deserialize)]
pub struct PackageMetadata {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub versions: HashMap<String, VersionMetadata>,
    #[serde(default)]
    pub repository: Option<Repository>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionMetadata {
    #[serde(default, deserialize_with = "null_as_default")]
    pub version: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub dist: Dist,
    #[serde(default)]
    pub repository: Option<Repository>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dist {
    #[serde(default, deserialize_with = "null_as_default")]
    pub tarball: String,
    #[serde(default)]
    pub shasum: Option<String>,
    /// Subresource-integrity string, e.g. `sha512-<base64>`.
    #[serde(default)]
    pub integrity: Option<String>,
    #[serde(default)]
    pub attestations: Option<Value>,
    #[serde(default)]
    pub signatures: Option<Value>,
}

/// `repository` is either a bare URL string or `{type, url, directory}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Repository {
    Url(String),
    Detailed {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        directory: Option<String>,
    },
}

impl Repository {
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Url(url) => Some(url.as_str()),
            Self::Detailed { url, .. } => url.as_deref(),
        }
        .filter(|u| !u.trim().is_empty())
    }
}

/// One bundle listed by the attestations endpoint.
#[derive(Debug, Clone)]
struct ListedBundle {
    predicate_type: Option<String>,
    bundle: Value,
}

enum AttestationOutcome {
    Verified(TrustedPublisher),
    Unverified { reason: String, bundles: usize },
}

impl AttestationOutcome {
    fn unverified(reason: impl Into<String>, bundles: usize) -> Self {
        Self::Unverified {
            reason: reason.into(),
            bundles,
        }
    }
}

pub struct NpmVerifier {
    transport: Arc<dyn Transport>,
    bundles: Arc<dyn AttestationVerifier>,
    registry_url: String,
}

impl NpmVerifier {
    pub fn new(transport: Arc<dyn Transport>, bundles: Arc<dyn AttestationVerifier>) -> Self {
        Self {
            transport,
            bundles,
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
        }
    }

    pub fn with_registry_url(mut self, url: impl Into<String>) -> Self {
        self.registry_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Registry document URL. Scoped names keep their `@` and encode the `/`.
    pub fn metadata_url(&self, name: &str) -> String {
        format!("{}/{}", self.registry_url, name.replace('/', "%2f"))
    }

    async fn fetch_metadata(&self, name: &str, cancel: &CancellationToken) -> Result<PackageMetadata> {
        let url = self.metadata_url(name);
        let body = self
            .transport
            .get(&url, Some("application/json"), cancel)
            .await?;
        serde_json::from_slice(&body)
            .map_err(|e| ProvenanceError::decode(format!("npm metadata for {name}"), e))
    }

    async fn verify_attestations(
        &self,
        attestations: &Value,
        dist: &Dist,
        cancel: &CancellationToken,
    ) -> Result<AttestationOutcome> {
        let listed = match attestations.get("url").and_then(Value::as_str) {
            Some(url) => {
                let body = self.transport.get(url, Some("application/json"), cancel).await?;
                match serde_json::from_slice::<Value>(&body) {
                    Ok(document) => collect_bundles(document),
                    Err(e) => {
                        return Ok(AttestationOutcome::unverified(
                            format!("attestation response is not valid JSON: {e}"),
                            0,
                        ))
                    }
                }
            }
            None => collect_bundles(attestations.clone()),
        };

        let count = listed.len();
        let Some(chosen) = choose_bundle(listed) else {
            return Ok(AttestationOutcome::unverified(
                "no Sigstore bundle found in attestation data",
                0,
            ));
        };

        if dist.tarball.is_empty() {
            return Ok(AttestationOutcome::unverified("version has no tarball URL", count));
        }
        let digest = self
            .transport
            .digest(&dist.tarball, DigestAlgorithm::Sha512, cancel)
            .await?;

        if let Some(expected) = dist.integrity.as_deref().and_then(sha512_integrity) {
            if expected != digest {
                return Ok(AttestationOutcome::unverified(
                    "downloaded tarball does not match the registry integrity digest",
                    count,
                ));
            }
        }

        let policy = IdentityPolicy::github_actions(GITHUB_SUBJECT_PATTERN)
            .map_err(|e| ProvenanceError::Config(format!("invalid identity pattern: {e}")))?;
        let bundle_bytes = serde_json::to_vec(&chosen.bundle)?;

        tracing::debug!(
            predicate_type = chosen.predicate_type.as_deref().unwrap_or("-"),
            bundles = count,
            "verifying npm attestation"
        );

        match self
            .bundles
            .verify_bundle(&bundle_bytes, DigestAlgorithm::Sha512, &digest, &policy)
        {
            Ok(verification) => {
                let declared = BundleDocument::parse(&bundle_bytes)
                    .and_then(|doc| doc.statement())
                    .ok()
                    .and_then(|statement| publisher_from_slsa(&statement));
                Ok(AttestationOutcome::Verified(merge_publisher(
                    declared,
                    extract_publisher_info(&verification),
                )))
            }
            Err(e) => Ok(AttestationOutcome::unverified(e.to_string(), count)),
        }
    }
}

/// Bundles from an attestations endpoint document, or a single inline bundle.
fn collect_bundles(document: Value) -> Vec<ListedBundle> {
    if let Some(entries) = document.get("attestations").and_then(Value::as_array) {
        return entries
            .iter()
            .filter_map(|entry| {
                Some(ListedBundle {
                    predicate_type: entry
                        .get("predicateType")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    bundle: entry.get("bundle")?.clone(),
                })
            })
            .collect();
    }
    if document.get("mediaType").is_some() {
        return vec![ListedBundle {
            predicate_type: None,
            bundle: document,
        }];
    }
    Vec::new()
}

/// SLSA provenance first; the publish attestation only proves the registry saw it.
fn choose_bundle(mut listed: Vec<ListedBundle>) -> Option<ListedBundle> {
    let slsa = listed.iter().position(|b| {
        b.predicate_type
            .as_deref()
            .is_some_and(|t| t.starts_with(SLSA_PROVENANCE_PREFIX))
    });
    match slsa {
        Some(index) => Some(listed.swap_remove(index)),
        None if listed.is_empty() => None,
        None => Some(listed.swap_remove(0)),
    }
}

/// Raw digest from an SRI string such as `sha512-<base64>`.
fn sha512_integrity(integrity: &str) -> Option<Vec<u8>> {
    integrity
        .split_whitespace()
        .find_map(|entry| entry.strip_prefix("sha512-"))
        .and_then(|b64| BASE64_STANDARD.decode(b64).ok())
}

#[async_trait]
impl ProvenanceVerifier for NpmVerifier {
    fn name(&self) -> &'static str {
        "npm"
    }

    fn supports_ecosystem(&self, ecosystem: Ecosystem) -> bool {
        ecosystem == Ecosystem::Npm
    }

    async fn verify(
        &self,
        pkg: &PackageIdentifier,
        cancel: &CancellationToken,
    ) -> Result<ProvenanceResult> {
        if pkg.ecosystem != Ecosystem::Npm {
            return Err(ProvenanceError::UnsupportedEcosystem {
                verifier: self.name(),
                ecosystem: pkg.ecosystem,
            });
        }

        let metadata = self.fetch_metadata(&pkg.name, cancel).await?;
        let version = metadata
            .versions
            .get(&pkg.version)
            .ok_or_else(|| ProvenanceError::VersionNotFound {
                package: pkg.name.clone(),
                version: pkg.version.clone(),
            })?;

        let mut result = ProvenanceResult::new(pkg.clone(), ProvenanceStatus::None);

        if let Some(signatures) = version.dist.signatures.as_ref().filter(|s| !s.is_null()) {
            result.has_signatures = true;
            result.status = ProvenanceStatus::Signatures;
            result.insert_detail("signatures", signatures.clone());
        }

        if let Some(attestations) = version.dist.attestations.as_ref().filter(|a| !a.is_null()) {
            result.has_attestations = true;
            match self
                .verify_attestations(attestations, &version.dist, cancel)
                .await?
            {
                AttestationOutcome::Verified(publisher) => {
                    result.status = ProvenanceStatus::Verified;
                    result.attestation_count = 1;
                    result.trusted_publisher = Some(publisher);
                }
                AttestationOutcome::Unverified { reason, bundles } => {
                    tracing::warn!(package = %pkg, error = %reason, "npm attestation not verified");
                    result.status = ProvenanceStatus::Attestations;
                    result.attestation_count = bundles;
                    result.error_message = Some(format!("attestation verification failed: {reason}"));
                    result.insert_detail("verification_error", reason);
                }
            }
        }

        result.repository_uri = version
            .repository
            .as_ref()
            .and_then(Repository::url)
            .or_else(|| metadata.repository.as_ref().and_then(Repository::url))
            .map(str::to_string);

        tracing::info!(package = %pkg, status = %result.status, "npm provenance checked");
        Ok(result)
    }
}
