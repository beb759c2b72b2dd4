//! Signature-bundle verification shared by every ecosystem verifier.
//!
//! An ecosystem verifier hands over the raw bundle bytes, the digest of the
//! artifact it downloaded (or was told about) and an identity policy. The
//! verifier answers with the certificate identity that signed the bundle, or
//! with a `BundleError` naming the check that failed:
//!
//! ```text
//! parse --> subject digest --> tlog inclusion proof --> SCT --> chain + signature --> identity policy
//! ```
//!
//! Bundles with a sha256 subject go through the Sigstore engine; sha512-only
//! statements and `intoto` log entries go through [`intoto`].
//!
//! Nothing in here knows about npm or PyPI.

pub mod bundle;
pub mod intoto;
pub mod publisher;
pub mod verifier;

use regex::Regex;
use sha2::Digest;
use thiserror::Error;

pub use bundle::{BundleDocument, InTotoStatement, Subject};
pub use publisher::{
    extract_publisher_info, merge_publisher, normalize_repository_uri, publisher_from_slsa,
    VERIFIED_KIND,
};
pub use verifier::SigstoreBundleVerifier;

/// OIDC issuer of GitHub Actions workload identity tokens.
pub const GITHUB_ACTIONS_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// OIDC issuer of gitlab.com CI job tokens.
pub const GITLAB_ISSUER: &str = "https://gitlab.com";

/// Hash algorithm the artifact digest was computed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// Name as used in in-toto subject digest maps.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn hasher(&self) -> ArtifactHasher {
        match self {
            Self::Sha256 => ArtifactHasher::Sha256(sha2::Sha256::new()),
            Self::Sha512 => ArtifactHasher::Sha512(sha2::Sha512::new()),
        }
    }
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental hasher used while streaming artifact downloads.
pub enum ArtifactHasher {
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

impl ArtifactHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Why a bundle was rejected. Each variant names one failed check.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BundleError {
    #[error("malformed bundle: {0}")]
    Malformed(String),

    #[error("artifact {algorithm} digest {expected} does not match any attestation subject")]
    DigestMismatch {
        algorithm: DigestAlgorithm,
        expected: String,
    },

    #[error("bundle has no transparency log inclusion proof")]
    MissingTransparencyLog,

    #[error("signing certificate carries no signed certificate timestamp")]
    MissingCertificateTimestamp,

    #[error("bundle rejected by trust root: {0}")]
    Untrusted(String),

    #[error("certificate identity policy mismatch: {0}")]
    PolicyMismatch(String),
}

/// Identity facts established by a successful verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleVerification {
    /// Certificate SAN, e.g. the GitHub workflow URI.
    pub identity: Option<String>,
    /// OIDC issuer recorded in the certificate.
    pub issuer: Option<String>,
    /// Transparency log integration time (unix seconds).
    pub integrated_time: Option<i64>,
}

/// Constraints on the signing certificate's identity.
#[derive(Debug, Clone, Default)]
pub struct IdentityPolicy {
    pub issuer: Option<String>,
    pub subject: Option<Regex>,
}

impl IdentityPolicy {
    /// No identity constraint; the trust-root checks still apply.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_subject_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.subject = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// Issuer must be GitHub Actions and the SAN must match `subject_pattern`.
    pub fn github_actions(subject_pattern: &str) -> Result<Self, regex::Error> {
        Self::any()
            .with_issuer(GITHUB_ACTIONS_ISSUER)
            .with_subject_pattern(subject_pattern)
    }

    pub fn is_unconstrained(&self) -> bool {
        self.issuer.is_none() && self.subject.is_none()
    }

    /// Check the identity a verification engine extracted from the certificate.
    pub fn check(&self, issuer: Option<&str>, identity: Option<&str>) -> Result<(), BundleError> {
        if let Some(expected) = &self.issuer {
            match issuer {
                Some(actual) if actual == expected => {}
                Some(actual) => {
                    return Err(BundleError::PolicyMismatch(format!(
                        "issuer '{actual}' does not match required issuer '{expected}'"
                    )))
                }
                None => {
                    return Err(BundleError::PolicyMismatch(format!(
                        "certificate has no issuer, required '{expected}'"
                    )))
                }
            }
        }

        if let Some(pattern) = &self.subject {
            match identity {
                Some(actual) if pattern.is_match(actual) => {}
                Some(actual) => {
                    return Err(BundleError::PolicyMismatch(format!(
                        "identity '{actual}' does not match pattern '{}'",
                        pattern.as_str()
                    )))
                }
                None => {
                    return Err(BundleError::PolicyMismatch(format!(
                        "certificate has no identity, required pattern '{}'",
                        pattern.as_str()
                    )))
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Display for IdentityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "issuer={} subject={}",
            self.issuer.as_deref().unwrap_or("*"),
            self.subject.as_ref().map(|r| r.as_str()).unwrap_or("*")
        )
    }
}

/// Verifies one signed attestation bundle against one artifact digest.
///
/// Implementations must be safe to share across concurrent verifications.
pub trait AttestationVerifier: Send + Sync {
    fn verify_bundle(
        &self,
        bundle: &[u8],
        algorithm: DigestAlgorithm,
        digest: &[u8],
        policy: &IdentityPolicy,
    ) -> Result<BundleVerification, BundleError>;
}
