use std::path::Path;

use sigstore_verify::trust_root::{TrustedRoot, SIGSTORE_PRODUCTION_TRUSTED_ROOT};
use sigstore_verify::types::{Bundle, Sha256Hash};
use sigstore_verify::{verify, VerificationPolicy, VerificationResult};

use super::bundle::{has_embedded_sct, BundleDocument};
use super::intoto::{has_intoto_entries, verify_intoto_bundle};
use super::{AttestationVerifier, BundleError, BundleVerification, DigestAlgorithm, IdentityPolicy};
use crate::config::SigstoreConfig;
use crate::error::{ProvenanceError, Result};

/// Verifies bundles against the Sigstore public-good trust root (Fulcio CA,
/// Rekor and CT log keys) or a trusted root loaded from disk.
pub struct SigstoreBundleVerifier {
    trusted_root: TrustedRoot,
}

impl SigstoreBundleVerifier {
    /// Current production trust root, fetched and verified over TUF.
    #[cfg(feature = "tuf")]
    pub async fn production() -> Result<Self> {
        let trusted_root = TrustedRoot::production().await.map_err(|e| {
            ProvenanceError::TrustRoot(format!("failed to fetch production trusted root: {e}"))
        })?;
        Ok(Self { trusted_root })
    }

    /// Without TUF support the production root is the one bundled with the
    /// verification library.
    #[cfg(not(feature = "tuf"))]
    pub async fn production() -> Result<Self> {
        Self::embedded()
    }

    /// Production trust root bundled with the verification library. Needs no
    /// network but goes stale when Sigstore rotates keys.
    pub fn embedded() -> Result<Self> {
        let trusted_root = TrustedRoot::from_json(SIGSTORE_PRODUCTION_TRUSTED_ROOT).map_err(|e| {
            ProvenanceError::TrustRoot(format!("failed to load bundled trusted root: {e}"))
        })?;
        Ok(Self { trusted_root })
    }

    /// Trusted root JSON (`trusted_root.json` format) from disk.
    pub fn from_trusted_root_file(path: &Path) -> Result<Self> {
        let trusted_root = TrustedRoot::from_file(path).map_err(|e| {
            ProvenanceError::TrustRoot(format!(
                "failed to load trusted root from {}: {e}",
                path.display()
            ))
        })?;
        Ok(Self { trusted_root })
    }

    /// A configured file wins, then `offline`, then the production root.
    pub async fn from_config(config: &SigstoreConfig) -> Result<Self> {
        match &config.trusted_root {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading trusted root from file");
                Self::from_trusted_root_file(path)
            }
            None if config.offline => {
                tracing::debug!("using bundled trusted root");
                Self::embedded()
            }
            None => Self::production().await,
        }
    }

    /// Run the Sigstore engine, which binds the artifact by its sha256.
    fn verify_with_engine(
        &self,
        bundle: &Bundle,
        sha256_hex: &str,
        policy: &IdentityPolicy,
    ) -> std::result::Result<BundleVerification, BundleError> {
        let artifact = Sha256Hash::from_hex(sha256_hex)
            .map_err(|e| BundleError::Malformed(format!("invalid sha256 subject digest: {e}")))?;

        let mut engine_policy = VerificationPolicy::default();
        if let Some(issuer) = &policy.issuer {
            engine_policy = engine_policy.require_issuer(issuer.clone());
        }

        let outcome: VerificationResult = verify(artifact, bundle, &engine_policy, &self.trusted_root)
            .map_err(|e| BundleError::Untrusted(e.to_string()))?;
        if !outcome.success {
            return Err(BundleError::Untrusted("verification did not succeed".to_string()));
        }

        Ok(BundleVerification {
            identity: outcome.identity,
            issuer: outcome.issuer,
            integrated_time: outcome.integrated_time,
        })
    }
}

impl AttestationVerifier for SigstoreBundleVerifier {
    fn verify_bundle(
        &self,
        bundle: &[u8],
        algorithm: DigestAlgorithm,
        digest: &[u8],
        policy: &IdentityPolicy,
    ) -> std::result::Result<BundleVerification, BundleError> {
        let document = BundleDocument::parse(bundle)?;
        let statement = document.statement()?;

        let expected = hex::encode(digest);
        let subject = statement
            .subject_for(algorithm, &expected)
            .ok_or_else(|| BundleError::DigestMismatch {
                algorithm,
                expected: expected.clone(),
            })?;

        if !document.has_inclusion_proof() {
            return Err(BundleError::MissingTransparencyLog);
        }
        if !has_embedded_sct(&document.leaf_certificate()?)? {
            return Err(BundleError::MissingCertificateTimestamp);
        }

        let json = std::str::from_utf8(bundle)
            .map_err(|e| BundleError::Malformed(format!("bundle is not UTF-8: {e}")))?;
        let parsed = Bundle::from_json(json).map_err(|e| BundleError::Malformed(e.to_string()))?;

        // The engine binds the matched subject through its sha256 digest.
        let verified = match subject.digest.get(DigestAlgorithm::Sha256.as_str()) {
            Some(sha256) if !has_intoto_entries(&parsed) => {
                self.verify_with_engine(&parsed, sha256, policy)?
            }
            _ => verify_intoto_bundle(&parsed, &self.trusted_root)?,
        };

        policy.check(verified.issuer.as_deref(), verified.identity.as_deref())?;

        tracing::debug!(
            identity = ?verified.identity,
            issuer = ?verified.issuer,
            "bundle verified"
        );

        Ok(verified)
    }
}
