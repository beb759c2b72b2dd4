//! Verification of DSSE in-toto bundles the engine cannot bind.
//!
//! The engine hashes artifacts with sha256 only, and it accepts `intoto`
//! v0.0.2 log entries only alongside an RFC 3161 timestamp. npm provenance
//! hits both: its statement subjects carry a sha512 digest and its log
//! entries are `intoto` v0.0.2 with an inclusion promise. Bundles of that
//! shape go through here instead, with the same checks the engine applies:
//!
//! ```text
//! structure + Merkle inclusion --> checkpoint + SET --> integrated time
//!   --> Fulcio chain (code signing) --> embedded SCT --> DSSE signature
//!   --> log entry records this envelope
//! ```

use std::time::Duration;

use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use const_oid::db::rfc5912::ID_KP_CODE_SIGNING;
use const_oid::db::rfc6962::CT_PRECERT_SCTS;
use der::{Decode, Encode};
use rustls_pki_types::{CertificateDer, UnixTime};
use serde::Serialize;
use sigstore_verify::bundle::{validate_bundle_with_options, ValidationOptions};
use sigstore_verify::crypto::{self, parse_certificate_info, verify_signature_auto, CertificateInfo, Checkpoint, SigningScheme};
use sigstore_verify::rekor::RekorEntryBody;
use sigstore_verify::trust_root::TrustedRoot;
use sigstore_verify::types::bundle::{InclusionPromise, InclusionProof, VerificationMaterialContent};
use sigstore_verify::types::{pae, Bundle, DsseEnvelope, SignatureBytes, SignatureContent, TransparencyLogEntry};
use webpki::{anchor_from_trusted_cert, EndEntityCert, KeyUsage, ALL_VERIFICATION_ALGS};
use x509_cert::ext::pkix::sct::{HashAlgorithm, SignatureAlgorithm, Version};
use x509_cert::ext::pkix::{SignedCertificateTimestamp, SignedCertificateTimestampList};
use x509_cert::Certificate;

use super::{BundleError, BundleVerification};

/// Tolerance for integration times slightly ahead of the local clock.
const CLOCK_SKEW_SECS: i64 = 60;

/// Whether any log entry is of the `intoto` kind.
pub fn has_intoto_entries(bundle: &Bundle) -> bool {
    bundle
        .verification_material
        .tlog_entries
        .iter()
        .any(|entry| entry.kind_version.kind == "intoto")
}

/// Verify a DSSE bundle against `trusted_root`. Matching the artifact digest
/// against the statement subjects is the caller's job.
pub fn verify_intoto_bundle(
    bundle: &Bundle,
    trusted_root: &TrustedRoot,
) -> Result<BundleVerification, BundleError> {
    let options = ValidationOptions {
        require_inclusion_proof: true,
        require_timestamp: false,
    };
    validate_bundle_with_options(bundle, &options).map_err(untrusted)?;

    let envelope = match &bundle.content {
        SignatureContent::DsseEnvelope(envelope) => envelope,
        _ => return Err(BundleError::Malformed("bundle has no DSSE envelope".to_string())),
    };

    let (leaf, chain) = certificate_chain(&bundle.verification_material.content)?;
    let info = parse_certificate_info(&leaf)
        .map_err(|e| BundleError::Malformed(format!("failed to parse signing certificate: {e}")))?;

    let integrated_time = verify_tlog_entries(bundle, trusted_root, &info)?;
    verify_certificate_chain(&leaf, &chain, integrated_time, trusted_root)?;
    verify_embedded_sct(&leaf, chain.first().map(Vec::as_slice), trusted_root)?;
    verify_envelope_signature(envelope, &info)?;
    for entry in &bundle.verification_material.tlog_entries {
        verify_entry_records_envelope(entry, envelope, &leaf)?;
    }

    Ok(BundleVerification {
        identity: info.identity,
        issuer: info.issuer,
        integrated_time: Some(integrated_time),
    })
}

fn untrusted(message: impl std::fmt::Display) -> BundleError {
    BundleError::Untrusted(message.to_string())
}

/// Leaf certificate DER followed by any intermediates shipped in the bundle.
fn certificate_chain(
    material: &VerificationMaterialContent,
) -> Result<(Vec<u8>, Vec<Vec<u8>>), BundleError> {
    match material {
        VerificationMaterialContent::Certificate(cert) => {
            Ok((cert.raw_bytes.as_bytes().to_vec(), Vec::new()))
        }
        VerificationMaterialContent::X509CertificateChain { certificates } => {
            let (leaf, rest) = certificates
                .split_first()
                .ok_or_else(|| BundleError::Malformed("certificate chain is empty".to_string()))?;
            let rest = rest.iter().map(|c| c.raw_bytes.as_bytes().to_vec()).collect();
            Ok((leaf.raw_bytes.as_bytes().to_vec(), rest))
        }
        VerificationMaterialContent::PublicKey { .. } => Err(untrusted(
            "bundle is signed with a bare public key, not a Fulcio certificate",
        )),
    }
}

/// Check every entry's checkpoint and signed entry timestamp, and return the
/// earliest signed integration time, which becomes the validation time.
fn verify_tlog_entries(
    bundle: &Bundle,
    trusted_root: &TrustedRoot,
    info: &CertificateInfo,
) -> Result<i64, BundleError> {
    let now = chrono::Utc::now().timestamp();
    let mut earliest: Option<i64> = None;

    for entry in &bundle.verification_material.tlog_entries {
        if let Some(proof) = &entry.inclusion_proof {
            verify_checkpoint(proof, trusted_root)?;
        }
        let Some(promise) = &entry.inclusion_promise else {
            continue;
        };
        verify_signed_entry_timestamp(entry, promise, trusted_root)?;

        let time = entry.integrated_time;
        if time <= 0 {
            continue;
        }
        if time > now + CLOCK_SKEW_SECS {
            return Err(untrusted(format!("integrated time {time} is in the future")));
        }
        if time < info.not_before || time > info.not_after {
            return Err(untrusted(format!(
                "integrated time {time} is outside the certificate validity window {}..{}",
                info.not_before, info.not_after
            )));
        }
        earliest = Some(earliest.map_or(time, |t| t.min(time)));
    }

    earliest.ok_or_else(|| untrusted("no log entry carries a signed integration time"))
}

fn verify_checkpoint(proof: &InclusionProof, trusted_root: &TrustedRoot) -> Result<(), BundleError> {
    let checkpoint = Checkpoint::from_text(&proof.checkpoint.envelope)
        .map_err(|e| untrusted(format!("invalid checkpoint: {e}")))?;
    if checkpoint.root_hash.as_bytes() != proof.root_hash.as_bytes() {
        return Err(untrusted("checkpoint root hash does not match the inclusion proof"));
    }

    let keys = trusted_root
        .rekor_keys_with_hints()
        .map_err(|e| untrusted(format!("trusted root has unusable log keys: {e}")))?;
    let (signature, key) = checkpoint
        .signatures
        .iter()
        .find_map(|sig| {
            keys.iter()
                .find(|(hint, _)| *hint == sig.key_id)
                .map(|(_, key)| (sig, key))
        })
        .ok_or_else(|| untrusted("checkpoint is not signed by a trusted log"))?;

    verify_signature_auto(key, &signature.signature, checkpoint.signed_data())
        .map_err(|e| untrusted(format!("checkpoint signature verification failed: {e}")))
}

/// Fields in canonical (sorted) order, so compact JSON is the signed form.
#[derive(Serialize)]
struct SignedEntryPayload {
    body: String,
    #[serde(rename = "integratedTime")]
    integrated_time: i64,
    #[serde(rename = "logID")]
    log_id: String,
    #[serde(rename = "logIndex")]
    log_index: i64,
}

fn verify_signed_entry_timestamp(
    entry: &TransparencyLogEntry,
    promise: &InclusionPromise,
    trusted_root: &TrustedRoot,
) -> Result<(), BundleError> {
    let key = trusted_root
        .rekor_key_for_log(&entry.log_id.key_id)
        .map_err(|_| untrusted(format!("unknown transparency log {}", entry.log_id.key_id)))?;

    let log_id = BASE64_STANDARD
        .decode(entry.log_id.key_id.as_str())
        .map_err(|e| BundleError::Malformed(format!("log id is not base64: {e}")))?;
    let log_index = entry
        .log_index
        .as_u64()
        .and_then(|i| i64::try_from(i).ok())
        .ok_or_else(|| BundleError::Malformed(format!("invalid log index {}", entry.log_index)))?;

    let payload = SignedEntryPayload {
        body: entry.canonicalized_body.to_base64(),
        integrated_time: entry.integrated_time,
        log_id: hex::encode(log_id),
        log_index,
    };
    let message = serde_json::to_vec(&payload)
        .map_err(|e| BundleError::Malformed(format!("failed to encode log entry: {e}")))?;
    let signature = SignatureBytes::new(promise.signed_entry_timestamp.as_bytes().to_vec());

    verify_signature_auto(&key, &signature, &message)
        .map_err(|e| untrusted(format!("signed entry timestamp verification failed: {e}")))
}

/// The leaf must chain to a Fulcio CA and allow code signing at `at`.
fn verify_certificate_chain(
    leaf: &[u8],
    intermediates: &[Vec<u8>],
    at: i64,
    trusted_root: &TrustedRoot,
) -> Result<(), BundleError> {
    let fulcio = trusted_root
        .fulcio_certs()
        .map_err(|e| untrusted(format!("trusted root has unusable Fulcio certificates: {e}")))?;
    let anchors: Vec<_> = fulcio
        .iter()
        .filter_map(|cert| anchor_from_trusted_cert(cert).map(|a| a.to_owned()).ok())
        .collect();
    if anchors.is_empty() {
        return Err(untrusted("trusted root has no Fulcio certificate authority"));
    }

    let intermediates: Vec<CertificateDer<'static>> = intermediates
        .iter()
        .map(|der| CertificateDer::from(der.clone()))
        .collect();
    let leaf = CertificateDer::from(leaf);
    let end_entity = EndEntityCert::try_from(&leaf)
        .map_err(|e| BundleError::Malformed(format!("failed to parse signing certificate: {e}")))?;
    let seconds = u64::try_from(at).map_err(|_| untrusted(format!("invalid validation time {at}")))?;

    end_entity
        .verify_for_usage(
            ALL_VERIFICATION_ALGS,
            &anchors,
            &intermediates,
            UnixTime::since_unix_epoch(Duration::from_secs(seconds)),
            KeyUsage::required(ID_KP_CODE_SIGNING.as_bytes()),
            None,
            None,
        )
        .map(|_| ())
        .map_err(|e| untrusted(format!("certificate chain validation failed: {e}")))
}

/// At least one SCT embedded in the leaf must be signed by a trusted CT log.
fn verify_embedded_sct(
    leaf: &[u8],
    issuer: Option<&[u8]>,
    trusted_root: &TrustedRoot,
) -> Result<(), BundleError> {
    let cert = Certificate::from_der(leaf)
        .map_err(|e| BundleError::Malformed(format!("failed to parse signing certificate: {e}")))?;
    let list = match cert.tbs_certificate.get::<SignedCertificateTimestampList>() {
        Ok(Some((_, list))) => list,
        _ => return Err(BundleError::MissingCertificateTimestamp),
    };
    let serialized = list
        .parse_timestamps()
        .map_err(|e| BundleError::Malformed(format!("failed to parse SCT list: {e:?}")))?;

    let issuer_key_hash = crypto::sha256(&issuer_spki(&cert, issuer, trusted_root)?);
    let log_keys = trusted_root
        .ctfe_keys_with_ids()
        .map_err(|e| untrusted(format!("trusted root has unusable CT log keys: {e}")))?;

    let mut last_error = untrusted("no embedded SCT is from a trusted CT log");
    for sct in &serialized {
        let sct = sct
            .parse_timestamp()
            .map_err(|e| BundleError::Malformed(format!("failed to parse SCT: {e:?}")))?;
        let Some((_, key)) = log_keys
            .iter()
            .find(|(id, _)| id.as_slice() == sct.log_id.key_id.as_slice())
        else {
            continue;
        };

        let scheme = sct_signing_scheme(&sct)?;
        let signed = sct_signed_data(&cert, &sct, issuer_key_hash.as_bytes())?;
        let signature = SignatureBytes::from_bytes(sct.signature.signature.as_slice());
        match crypto::verify_signature(key, &signed, &signature, scheme) {
            Ok(()) => return Ok(()),
            Err(e) => last_error = untrusted(format!("SCT signature verification failed: {e}")),
        }
    }
    Err(last_error)
}

/// DER SubjectPublicKeyInfo of the leaf's issuer: the next certificate in
/// the bundle chain, else the Fulcio CA whose subject names it.
fn issuer_spki(
    cert: &Certificate,
    issuer: Option<&[u8]>,
    trusted_root: &TrustedRoot,
) -> Result<Vec<u8>, BundleError> {
    let issuer_cert = match issuer {
        Some(der) => Certificate::from_der(der)
            .map_err(|e| BundleError::Malformed(format!("failed to parse issuer certificate: {e}")))?,
        None => trusted_root
            .fulcio_certs()
            .map_err(|e| untrusted(format!("trusted root has unusable Fulcio certificates: {e}")))?
            .iter()
            .filter_map(|der| Certificate::from_der(&der[..]).ok())
            .find(|ca| ca.tbs_certificate.subject == cert.tbs_certificate.issuer)
            .ok_or_else(|| untrusted("issuer of the signing certificate is not a trusted Fulcio CA"))?,
    };
    issuer_cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| BundleError::Malformed(format!("failed to encode issuer key: {e}")))
}

fn sct_signing_scheme(sct: &SignedCertificateTimestamp) -> Result<SigningScheme, BundleError> {
    let algorithm = &sct.signature.algorithm;
    match (&algorithm.signature, &algorithm.hash) {
        (SignatureAlgorithm::Ecdsa, HashAlgorithm::Sha256) => Ok(SigningScheme::EcdsaP256Sha256),
        (SignatureAlgorithm::Ecdsa, HashAlgorithm::Sha384) => Ok(SigningScheme::EcdsaP384Sha384),
        (SignatureAlgorithm::Rsa, HashAlgorithm::Sha256) => Ok(SigningScheme::RsaPkcs1Sha256),
        (SignatureAlgorithm::Rsa, HashAlgorithm::Sha384) => Ok(SigningScheme::RsaPkcs1Sha384),
        (SignatureAlgorithm::Rsa, HashAlgorithm::Sha512) => Ok(SigningScheme::RsaPkcs1Sha512),
        (signature, hash) => Err(untrusted(format!(
            "unsupported SCT signature algorithm {signature:?} with {hash:?}"
        ))),
    }
}

/// RFC 6962 `digitally-signed` input for a precertificate entry: the leaf's
/// TBS certificate with the SCT list extension removed.
fn sct_signed_data(
    cert: &Certificate,
    sct: &SignedCertificateTimestamp,
    issuer_key_hash: &[u8],
) -> Result<Vec<u8>, BundleError> {
    let mut tbs = cert.tbs_certificate.clone();
    tbs.extensions = tbs.extensions.map(|exts| {
        exts.into_iter()
            .filter(|ext| ext.extn_id != CT_PRECERT_SCTS)
            .collect()
    });
    let tbs = tbs
        .to_der()
        .map_err(|e| BundleError::Malformed(format!("failed to encode precertificate: {e}")))?;
    let extensions = sct.extensions.as_slice();

    let tbs_len = u32::try_from(tbs.len())
        .ok()
        .filter(|len| *len < 1 << 24)
        .ok_or_else(|| BundleError::Malformed("precertificate is too large".to_string()))?;
    let extensions_len = u16::try_from(extensions.len())
        .map_err(|_| BundleError::Malformed("SCT extensions are too large".to_string()))?;

    let version = match sct.version {
        Version::V1 => 0u8,
    };
    let mut data = Vec::with_capacity(tbs.len() + extensions.len() + 48);
    data.push(version);
    // signature_type = certificate_timestamp
    data.push(0);
    data.extend_from_slice(&sct.timestamp.to_be_bytes());
    // entry_type = precert_entry
    data.extend_from_slice(&1u16.to_be_bytes());
    data.extend_from_slice(issuer_key_hash);
    data.extend_from_slice(&tbs_len.to_be_bytes()[1..]);
    data.extend_from_slice(&tbs);
    data.extend_from_slice(&extensions_len.to_be_bytes());
    data.extend_from_slice(extensions);
    Ok(data)
}

fn verify_envelope_signature(
    envelope: &DsseEnvelope,
    info: &CertificateInfo,
) -> Result<(), BundleError> {
    let message = pae(&envelope.payload_type, envelope.payload.as_bytes());
    let signed = envelope.signatures.iter().any(|sig| {
        crypto::verify_signature(&info.public_key, &message, &sig.sig, info.signing_scheme).is_ok()
    });
    if signed {
        Ok(())
    } else {
        Err(untrusted("DSSE signature verification failed"))
    }
}

/// The log entry must record this envelope's payload and signatures, or
/// the inclusion proof says nothing about it.
fn verify_entry_records_envelope(
    entry: &TransparencyLogEntry,
    envelope: &DsseEnvelope,
    leaf: &[u8],
) -> Result<(), BundleError> {
    let kind = &entry.kind_version;
    let body = RekorEntryBody::from_base64_json(
        &entry.canonicalized_body.to_base64(),
        &kind.kind,
        &kind.version,
    )
    .map_err(|e| BundleError::Malformed(format!("failed to parse log entry body: {e}")))?;
    let payload_hash = crypto::sha256(envelope.payload.as_bytes());

    let recorded = match &body {
        // Payload and signatures are base64 encoded twice in intoto entries.
        RekorEntryBody::IntotoV002(body) => {
            let logged = &body.spec.content.envelope;
            let payload = BASE64_STANDARD
                .decode(logged.payload.as_bytes())
                .map_err(|e| BundleError::Malformed(format!("logged payload is not base64: {e}")))?;
            payload == envelope.payload.as_bytes()
                && envelope.signatures.iter().any(|sig| {
                    logged.signatures.iter().any(|l| {
                        BASE64_STANDARD
                            .decode(l.sig.as_bytes())
                            .is_ok_and(|decoded| decoded == sig.sig.as_bytes())
                    })
                })
        }
        RekorEntryBody::DsseV001(body) => {
            let spec = &body.spec;
            spec.payload_hash.value.eq_ignore_ascii_case(&payload_hash.to_hex())
                && spec.signatures.len() == envelope.signatures.len()
                && envelope.signatures.iter().all(|sig| {
                    spec.signatures.iter().any(|l| {
                        l.signature.as_bytes() == sig.sig.as_bytes()
                            && l.to_certificate().is_ok_and(|cert| cert.as_bytes() == leaf)
                    })
                })
        }
        RekorEntryBody::DsseV002(body) => {
            let data = &body.spec.dsse_v002;
            data.payload_hash.digest.as_slice() == payload_hash.as_bytes().as_slice()
                && envelope.signatures.iter().all(|sig| {
                    data.signatures.iter().any(|l| {
                        l.content.as_bytes() == sig.sig.as_bytes()
                            && l.verifier.x509_certificate.raw_bytes.as_bytes() == leaf
                    })
                })
        }
        _ => {
            return Err(untrusted(format!(
                "log entry of kind {} {} does not record a DSSE envelope",
                kind.kind, kind.version
            )))
        }
    };

    if recorded {
        Ok(())
    } else {
        Err(untrusted("log entry does not record the bundle's DSSE envelope"))
    }
}
