//! Serde model of a Sigstore bundle and the in-toto statement it signs.
//!
//! Only the fields the structural checks need are modelled; everything
//! else is left to the verification engine, which re-parses the raw bytes.

use std::collections::BTreeMap;

use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use der::Decode;
use serde::Deserialize;
use x509_cert::Certificate;

use super::{BundleError, DigestAlgorithm};

pub const IN_TOTO_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";

/// X.509 extension carrying embedded signed certificate timestamps (RFC 6962).
const SCT_LIST_OID: &str = "1.3.6.1.4.1.11129.2.4.2";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDocument {
    #[serde(default)]
    pub media_type: String,
    pub verification_material: VerificationMaterial,
    #[serde(default)]
    pub dsse_envelope: Option<DsseEnvelope>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMaterial {
    #[serde(default)]
    pub certificate: Option<RawBytes>,
    #[serde(default)]
    pub x509_certificate_chain: Option<CertificateChain>,
    #[serde(default)]
    pub tlog_entries: Vec<TlogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBytes {
    pub raw_bytes: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CertificateChain {
    #[serde(default)]
    pub certificates: Vec<RawBytes>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlogEntry {
    #[serde(default)]
    pub log_index: Option<serde_json::Value>,
    #[serde(default)]
    pub inclusion_proof: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DsseEnvelope {
    pub payload: String,
    pub payload_type: String,
    #[serde(default)]
    pub signatures: Vec<EnvelopeSignature>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeSignature {
    pub sig: String,
    #[serde(default)]
    pub keyid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InTotoStatement {
    #[serde(rename = "_type")]
    pub statement_type: String,
    #[serde(default)]
    pub subject: Vec<Subject>,
    #[serde(default)]
    pub predicate_type: String,
    #[serde(default)]
    pub predicate: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subject {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub digest: BTreeMap<String, String>,
}

impl BundleDocument {
    pub fn parse(bytes: &[u8]) -> Result<Self, BundleError> {
        serde_json::from_slice(bytes).map_err(|e| BundleError::Malformed(e.to_string()))
    }

    /// Decode the in-toto statement carried in the DSSE envelope.
    pub fn statement(&self) -> Result<InTotoStatement, BundleError> {
        let envelope = self
            .dsse_envelope
            .as_ref()
            .ok_or_else(|| BundleError::Malformed("bundle has no DSSE envelope".to_string()))?;
        if envelope.payload_type != IN_TOTO_PAYLOAD_TYPE {
            return Err(BundleError::Malformed(format!(
                "unexpected payload type '{}'",
                envelope.payload_type
            )));
        }
        let payload = BASE64_STANDARD
            .decode(&envelope.payload)
            .map_err(|e| BundleError::Malformed(format!("payload is not base64: {e}")))?;
        serde_json::from_slice(&payload)
            .map_err(|e| BundleError::Malformed(format!("payload is not an in-toto statement: {e}")))
    }

    pub fn has_inclusion_proof(&self) -> bool {
        self.verification_material
            .tlog_entries
            .iter()
            .any(|entry| entry.inclusion_proof.as_ref().is_some_and(|p| !p.is_null()))
    }

    /// DER bytes of the leaf signing certificate.
    pub fn leaf_certificate(&self) -> Result<Vec<u8>, BundleError> {
        let material = &self.verification_material;
        let raw = material
            .certificate
            .as_ref()
            .or_else(|| {
                material
                    .x509_certificate_chain
                    .as_ref()
                    .and_then(|chain| chain.certificates.first())
            })
            .ok_or_else(|| BundleError::Malformed("bundle has no signing certificate".to_string()))?;
        BASE64_STANDARD
            .decode(&raw.raw_bytes)
            .map_err(|e| BundleError::Malformed(format!("certificate is not base64: {e}")))
    }
}

impl InTotoStatement {
    /// First subject whose `algorithm` digest equals `expected_hex`.
    pub fn subject_for(&self, algorithm: DigestAlgorithm, expected_hex: &str) -> Option<&Subject> {
        self.subject.iter().find(|subject| {
            subject
                .digest
                .get(algorithm.as_str())
                .is_some_and(|d| d.eq_ignore_ascii_case(expected_hex))
        })
    }
}

/// Whether the certificate embeds a signed certificate timestamp list.
pub fn has_embedded_sct(certificate_der: &[u8]) -> Result<bool, BundleError> {
    let cert = Certificate::from_der(certificate_der)
        .map_err(|e| BundleError::Malformed(format!("failed to parse certificate: {e}")))?;
    Ok(cert
        .tbs_certificate
        .extensions
        .as_ref()
        .is_some_and(|exts| exts.iter().any(|ext| ext.extn_id.to_string() == SCT_LIST_OID)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigstore::testing;
    use serde_json::json;

    #[test]
    fn statement_subject_matches_by_algorithm() {
        let digest = DigestAlgorithm::Sha512.digest(b"tarball");
        let bundle = testing::bundle(DigestAlgorithm::Sha512, &digest, testing::VALID_SIGNATURE);
        let document = BundleDocument::parse(bundle.to_string().as_bytes()).unwrap();
        let statement = document.statement().unwrap();

        assert!(statement
            .subject_for(DigestAlgorithm::Sha512, &hex::encode(&digest))
            .is_some());
        assert!(statement
            .subject_for(DigestAlgorithm::Sha256, &hex::encode(&digest))
            .is_none());
        assert!(document.has_inclusion_proof());
        assert_eq!(document.leaf_certificate().unwrap(), b"test");
    }

    #[test]
    fn missing_envelope_is_malformed() {
        let bundle = json!({
            "mediaType": "application/vnd.dev.sigstore.bundle.v0.3+json",
            "verificationMaterial": { "tlogEntries": [] },
            "messageSignature": {}
        });
        let document = BundleDocument::parse(bundle.to_string().as_bytes()).unwrap();
        assert!(matches!(document.statement(), Err(BundleError::Malformed(_))));
        assert!(!document.has_inclusion_proof());
        assert!(document.leaf_certificate().is_err());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            BundleDocument::parse(b"not json"),
            Err(BundleError::Malformed(_))
        ));
    }

    #[test]
    fn tlog_entry_without_proof_does_not_count() {
        let mut bundle = testing::bundle(DigestAlgorithm::Sha256, b"d", testing::VALID_SIGNATURE);
        bundle["verificationMaterial"]["tlogEntries"] = json!([{ "logIndex": "1" }]);
        let document = BundleDocument::parse(bundle.to_string().as_bytes()).unwrap();
        assert!(!document.has_inclusion_proof());
    }

    #[test]
    fn non_der_certificate_is_rejected() {
        assert!(has_embedded_sct(b"test").is_err());
    }

    #[test]
    fn fulcio_leaf_carries_an_sct_list() {
        let document = BundleDocument::parse(testing::NPM_BUNDLE.as_bytes()).unwrap();
        let leaf = document.leaf_certificate().unwrap();
        assert!(has_embedded_sct(&leaf).unwrap());
    }

    #[test]
    fn plain_code_signing_leaf_has_no_sct_list() {
        let leaf = sigstore_verify::types::DerCertificate::from_pem(testing::LEAF_WITHOUT_SCT_PEM).unwrap();
        assert!(!has_embedded_sct(leaf.as_bytes()).unwrap());
    }
}
