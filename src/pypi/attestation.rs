//! PEP 740 attestation objects as Sigstore bundles.
//!
//! PyPI serves attestations as
//!
//! ```json
//! {
//!   "version": 1,
//!   "verification_material": {
//!     "certificate": "<base64(DER)>",
//!     "transparency_entries": [{ ... }]
//!   },
//!   "envelope": {
//!     "statement": "<base64(in-toto JSON)>",
//!     "signature": "<base64(sig)>"
//!   }
//! }
//! ```
//!
//! The transparency entries already use the bundle v0.3 JSON shape, so the
//! conversion only re-nests fields.

use serde_json::{json, Value};

use crate::sigstore::bundle::IN_TOTO_PAYLOAD_TYPE;
use crate::sigstore::BundleError;

const BUNDLE_V03_MEDIA_TYPE: &str = "application/vnd.dev.sigstore.bundle.v0.3+json";

/// Serialized bundle for one attestation. Objects that already are bundles
/// (carry a `mediaType`) pass through unchanged.
pub fn to_sigstore_bundle(attestation: &Value) -> Result<Vec<u8>, BundleError> {
    if attestation.get("mediaType").is_some() {
        return serde_json::to_vec(attestation).map_err(|e| BundleError::Malformed(e.to_string()));
    }

    let missing = |field: &str| BundleError::Malformed(format!("attestation is missing '{field}'"));

    let envelope = attestation.get("envelope").ok_or_else(|| missing("envelope"))?;
    let material = attestation
        .get("verification_material")
        .ok_or_else(|| missing("verification_material"))?;

    let statement = envelope
        .get("statement")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("envelope.statement"))?;
    let signature = envelope
        .get("signature")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("envelope.signature"))?;
    let certificate = material
        .get("certificate")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("verification_material.certificate"))?;
    let tlog_entries = material
        .get("transparency_entries")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let bundle = json!({
        "mediaType": BUNDLE_V03_MEDIA_TYPE,
        "verificationMaterial": {
            "certificate": { "rawBytes": certificate },
            "tlogEntries": tlog_entries,
            "timestampVerificationData": {}
        },
        "dsseEnvelope": {
            "payload": statement,
            "payloadType": IN_TOTO_PAYLOAD_TYPE,
            "signatures": [{ "sig": signature }]
        }
    });
    serde_json::to_vec(&bundle).map_err(|e| BundleError::Malformed(e.to_string()))
}

#[cfg(test)]
pub(crate) mod testing {
    use base64::prelude::BASE64_STANDARD;
    use base64::Engine as _;
    use serde_json::{json, Value};

    use crate::sigstore::{testing, DigestAlgorithm};

    /// PEP 740 attestation over a file with the given sha256 digest.
    pub fn pep740(digest: &[u8], signature: &str) -> Value {
        let statement = testing::statement(DigestAlgorithm::Sha256, &hex::encode(digest), json!({}));
        json!({
            "version": 1,
            "verification_material": {
                "certificate": "dGVzdA==",
                "transparency_entries": [{
                    "logIndex": "42",
                    "inclusionProof": { "logIndex": "42", "rootHash": "AAAA", "treeSize": "43", "hashes": [] }
                }]
            },
            "envelope": {
                "statement": BASE64_STANDARD.encode(statement.to_string()),
                "signature": signature
            }
        })
    }
}
