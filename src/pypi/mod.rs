//! PyPI provenance verification (PEP 740).
//!
//! The Simple API (PEP 691 JSON) lists every distribution file of a project.
//! Files uploaded with attestations carry a `provenance` URL pointing at a
//! provenance object:
//!
//! ```json
//! { "version": 1,
//!   "attestation_bundles": [
//!     { "publisher": { "kind": "GitHub", "repository": "o/r", "workflow": "release.yml" },
//!       "attestations": [ { ...PEP 740 attestation... } ] } ] }
//! ```
//!
//! Each candidate file is verified on its own; a failure on one file never
//! aborts the others.

pub mod attestation;
pub mod filename;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    Ecosystem, PackageIdentifier, ProvenanceResult, ProvenanceStatus, ProvenanceVerifier,
    TrustedPublisher,
};
use crate::error::{ProvenanceError, Result};
use crate::sigstore::{
    extract_publisher_info, merge_publisher, AttestationVerifier, DigestAlgorithm, IdentityPolicy,
    GITHUB_ACTIONS_ISSUER, GITLAB_ISSUER,
};
use crate::transport::{null_as_default, Transport, PYPI_SIMPLE_JSON};

pub use filename::{filename_version, normalize_project_name, VersionMatching};

pub const DEFAULT_SIMPLE_URL: &str = "https://pypi.org/simple";

#[derive(Debug, Clone, Deserialize)]
pub struct SimpleMetadata {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub files: Vec<SimpleFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimpleFile {
    pub filename: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub hashes: HashMap<String, String>,
    /// URL of the provenance object, when the file was uploaded with attestations.
    #[serde(default)]
    pub provenance: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvenanceObject {
    #[serde(default, deserialize_with = "null_as_default")]
    pub version: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attestation_bundles: Vec<AttestationBundle>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttestationBundle {
    #[serde(default, deserialize_with = "null_as_default")]
    pub publisher: Publisher,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attestations: Vec<Value>,
}

/// Trusted publisher as declared by PyPI.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Publisher {
    #[serde(default, deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub claims: BTreeMap<String, Value>,
}

impl Publisher {
    fn repository(&self) -> Option<&str> {
        self.repository.as_deref().filter(|r| !r.trim().is_empty())
    }

    /// Identity policy for this publisher. Unknown kinds get no identity
    /// constraint beyond the trust root.
    pub fn identity_policy(&self) -> IdentityPolicy {
        let (issuer, prefix, suffix) = match (self.kind.as_str(), self.repository()) {
            ("GitHub", Some(_)) => (GITHUB_ACTIONS_ISSUER, r"^https://github\.com/", "/"),
            ("GitLab", Some(_)) => (GITLAB_ISSUER, r"^https://gitlab\.com/", "//"),
            _ => return IdentityPolicy::any(),
        };
        let repository = self.repository().unwrap_or_default();
        let pattern = format!("{prefix}{}{suffix}", regex::escape(repository));
        let policy = IdentityPolicy::any().with_issuer(issuer);
        match policy.clone().with_subject_pattern(&pattern) {
            Ok(policy) => policy,
            Err(e) => {
                tracing::debug!(pattern = %pattern, error = %e, "publisher subject pattern rejected");
                policy
            }
        }
    }

    fn to_trusted_publisher(&self) -> TrustedPublisher {
        let mut claims = self.claims.clone();
        if let Some(environment) = &self.environment {
            claims.insert("environment".to_string(), Value::String(environment.clone()));
        }
        TrustedPublisher {
            kind: self.kind.clone(),
            repository: self.repository.clone().unwrap_or_default(),
            workflow: self.workflow.clone(),
            claims,
        }
    }
}

enum FileOutcome {
    Verified(TrustedPublisher),
    Failed(String),
}

pub struct PypiVerifier {
    transport: Arc<dyn Transport>,
    bundles: Arc<dyn AttestationVerifier>,
    simple_url: String,
    matching: VersionMatching,
}

impl PypiVerifier {
    pub fn new(transport: Arc<dyn Transport>, bundles: Arc<dyn AttestationVerifier>) -> Self {
        Self {
            transport,
            bundles,
            simple_url: DEFAULT_SIMPLE_URL.to_string(),
            matching: VersionMatching::default(),
        }
    }

    pub fn with_simple_url(mut self, url: impl Into<String>) -> Self {
        self.simple_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_version_matching(mut self, matching: VersionMatching) -> Self {
        self.matching = matching;
        self
    }

    pub fn simple_url(&self, name: &str) -> String {
        format!("{}/{}/", self.simple_url, normalize_project_name(name))
    }

    async fn fetch_simple(&self, name: &str, cancel: &CancellationToken) -> Result<SimpleMetadata> {
        let body = self
            .transport
            .get(&self.simple_url(name), Some(PYPI_SIMPLE_JSON), cancel)
            .await?;
        serde_json::from_slice(&body)
            .map_err(|e| ProvenanceError::decode(format!("PyPI simple index for {name}"), e))
    }

    async fn verify_file(
        &self,
        file: &SimpleFile,
        provenance_url: &str,
        cancel: &CancellationToken,
    ) -> Result<FileOutcome> {
        let body = match self
            .transport
            .get(provenance_url, Some("application/json"), cancel)
            .await
        {
            Ok(body) => body,
            Err(ProvenanceError::Cancelled) => return Err(ProvenanceError::Cancelled),
            Err(e) => return Ok(FileOutcome::Failed(format!("failed to fetch provenance: {e}"))),
        };
        let provenance: ProvenanceObject = match serde_json::from_slice(&body) {
            Ok(p) => p,
            Err(e) => return Ok(FileOutcome::Failed(format!("failed to decode provenance: {e}"))),
        };

        let Some(bundle) = provenance.attestation_bundles.first() else {
            return Ok(FileOutcome::Failed("no attestation bundles in provenance".to_string()));
        };
        let Some(attestation) = bundle.attestations.first() else {
            return Ok(FileOutcome::Failed("no attestations in bundle".to_string()));
        };
        let sigstore_bundle = match attestation::to_sigstore_bundle(attestation) {
            Ok(b) => b,
            Err(e) => return Ok(FileOutcome::Failed(e.to_string())),
        };

        let digest = match file.hashes.get("sha256") {
            Some(hex_digest) => match hex::decode(hex_digest) {
                Ok(d) => d,
                Err(e) => {
                    return Ok(FileOutcome::Failed(format!(
                        "failed to decode sha256 hash: {e}"
                    )))
                }
            },
            None => match self
                .transport
                .digest(&file.url, DigestAlgorithm::Sha256, cancel)
                .await
            {
                Ok(d) => d,
                Err(ProvenanceError::Cancelled) => return Err(ProvenanceError::Cancelled),
                Err(e) => return Ok(FileOutcome::Failed(format!("failed to download file: {e}"))),
            },
        };

        let policy = bundle.publisher.identity_policy();
        tracing::debug!(file = %file.filename, %policy, "verifying PyPI attestation");

        match self
            .bundles
            .verify_bundle(&sigstore_bundle, DigestAlgorithm::Sha256, &digest, &policy)
        {
            Ok(verification) => Ok(FileOutcome::Verified(merge_publisher(
                Some(bundle.publisher.to_trusted_publisher()),
                extract_publisher_info(&verification),
            ))),
            Err(e) => Ok(FileOutcome::Failed(e.to_string())),
        }
    }
}

#[async_trait]
impl ProvenanceVerifier for PypiVerifier {
    fn name(&self) -> &'static str {
        "pypi"
    }

    fn supports_ecosystem(&self, ecosystem: Ecosystem) -> bool {
        ecosystem == Ecosystem::Pypi
    }

    async fn verify(
        &self,
        pkg: &PackageIdentifier,
        cancel: &CancellationToken,
    ) -> Result<ProvenanceResult> {
        if pkg.ecosystem != Ecosystem::Pypi {
            return Err(ProvenanceError::UnsupportedEcosystem {
                verifier: self.name(),
                ecosystem: pkg.ecosystem,
            });
        }

        let metadata = self.fetch_simple(&pkg.name, cancel).await?;
        let mut result = ProvenanceResult::new(pkg.clone(), ProvenanceStatus::None);
        let mut verified_files = Vec::new();
        let mut first_publisher = None;

        let candidates = metadata.files.iter().filter_map(|file| {
            let url = file.provenance.as_deref().filter(|u| !u.is_empty())?;
            self.matching
                .matches(&file.filename, &pkg.version)
                .then_some((file, url))
        });

        for (file, provenance_url) in candidates {
            result.attestation_count += 1;
            match self.verify_file(file, provenance_url, cancel).await? {
                FileOutcome::Verified(publisher) => {
                    verified_files.push(Value::String(file.filename.clone()));
                    first_publisher.get_or_insert(publisher);
                }
                FileOutcome::Failed(reason) => {
                    tracing::warn!(
                        package = %pkg,
                        file = %file.filename,
                        error = %reason,
                        "PyPI attestation not verified"
                    );
                    result.insert_detail(format!("verification_error_{}", file.filename), reason);
                }
            }
        }

        if !verified_files.is_empty() {
            result.status = ProvenanceStatus::Verified;
            result.has_attestations = true;
            result.trusted_publisher = first_publisher;
            result.insert_detail("verified_files", verified_files);
        } else if result.attestation_count > 0 {
            result.status = ProvenanceStatus::Attestations;
            result.has_attestations = true;
            result.error_message = Some("attestations found but verification failed".to_string());
        }

        tracing::info!(package = %pkg, status = %result.status, "PyPI provenance checked");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::attestation::testing::pep740;
    use super::*;
    use crate::sigstore::testing::{self, FakeAttestationVerifier};
    use crate::transport::fake::FakeTransport;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SIMPLE: &str = "https://pypi.test/simple";
    const WHEEL: &str = "mcp_clickhouse-0.1.5-py3-none-any.whl";
    const SDIST: &str = "mcp_clickhouse-0.1.5.tar.gz";

    fn pkg(version: &str) -> PackageIdentifier {
        PackageIdentifier::new(Ecosystem::Pypi, "mcp-clickhouse", version)
    }

    fn provenance_url(filename: &str) -> String {
        format!("https://pypi.test/integrity/mcp-clickhouse/0.1.5/{filename}/provenance")
    }

    fn file_entry(filename: &str, contents: &[u8], with_provenance: bool) -> Value {
        let mut entry = json!({
            "filename": filename,
            "url": format!("https://files.test/{filename}"),
            "hashes": { "sha256": hex::encode(DigestAlgorithm::Sha256.digest(contents)) }
        });
        if with_provenance {
            entry["provenance"] = json!(provenance_url(filename));
        }
        entry
    }

    fn provenance(repository: &str, attestation: Value) -> Value {
        json!({
            "version": 1,
            "attestation_bundles": [{
                "publisher": {
                    "kind": "GitHub",
                    "repository": repository,
                    "workflow": "release.yml",
                    "environment": "pypi"
                },
                "attestations": [attestation]
            }]
        })
    }

    fn verifier(transport: FakeTransport) -> (PypiVerifier, Arc<FakeAttestationVerifier>) {
        let bundles = Arc::new(FakeAttestationVerifier::github("ClickHouse/mcp-clickhouse"));
        let verifier = PypiVerifier::new(Arc::new(transport), bundles.clone()).with_simple_url(SIMPLE);
        (verifier, bundles)
    }

    async fn run(verifier: &PypiVerifier, pkg: &PackageIdentifier) -> Result<ProvenanceResult> {
        verifier.verify(pkg, &CancellationToken::new()).await
    }

    #[test]
    fn simple_url_normalizes_name() {
        let (verifier, _) = verifier(FakeTransport::new());
        assert_eq!(
            verifier.simple_url("MCP_ClickHouse"),
            "https://pypi.test/simple/mcp-clickhouse/"
        );
    }

    #[test]
    fn github_publisher_policy_is_scoped_to_repository() {
        let publisher = Publisher {
            kind: "GitHub".into(),
            repository: Some("o/r".into()),
            ..Default::default()
        };
        let policy = publisher.identity_policy();
        assert_eq!(policy.issuer.as_deref(), Some(GITHUB_ACTIONS_ISSUER));
        let subject = policy.subject.unwrap();
        assert!(subject.is_match("https://github.com/o/r/.github/workflows/x.yml@refs/tags/v1"));
        assert!(!subject.is_match("https://github.com/o/r-fork/.github/workflows/x.yml"));

        let gitlab = Publisher {
            kind: "GitLab".into(),
            repository: Some("group/project".into()),
            ..Default::default()
        };
        assert!(gitlab
            .identity_policy()
            .subject
            .unwrap()
            .is_match("https://gitlab.com/group/project//.gitlab-ci.yml@refs/heads/main"));

        assert!(Publisher::default().identity_policy().is_unconstrained());
    }

    #[tokio::test]
    async fn one_valid_file_is_enough() {
        let wheel = b"wheel bytes";
        let sdist = b"sdist bytes";
        let transport = FakeTransport::new()
            .with_json(
                &format!("{SIMPLE}/mcp-clickhouse/"),
                &json!({
                    "name": "mcp-clickhouse",
                    "files": [
                        file_entry(WHEEL, wheel, true),
                        file_entry(SDIST, sdist, true),
                        file_entry("mcp_clickhouse-0.1.4.tar.gz", b"old", true)
                    ]
                }),
            )
            .with_json(
                &provenance_url(WHEEL),
                &provenance(
                    "ClickHouse/mcp-clickhouse",
                    pep740(&DigestAlgorithm::Sha256.digest(wheel), testing::VALID_SIGNATURE),
                ),
            )
            .with_json(
                &provenance_url(SDIST),
                &provenance(
                    "ClickHouse/mcp-clickhouse",
                    pep740(&DigestAlgorithm::Sha256.digest(sdist), testing::FORGED_SIGNATURE),
                ),
            );
        let (verifier, bundles) = verifier(transport);

        let result = run(&verifier, &pkg("0.1.5")).await.unwrap();
        assert_eq!(result.status, ProvenanceStatus::Verified);
        assert!(result.has_attestations);
        assert_eq!(result.attestation_count, 2);
        assert_eq!(result.details["verified_files"], json!([WHEEL]));
        assert!(result
            .details
            .contains_key(&format!("verification_error_{SDIST}")));

        let publisher = result.trusted_publisher.unwrap();
        assert_eq!(publisher.kind, "GitHub");
        assert_eq!(publisher.repository, "ClickHouse/mcp-clickhouse");
        assert_eq!(publisher.workflow.as_deref(), Some("release.yml"));
        assert_eq!(publisher.claims["environment"], json!("pypi"));
        assert_eq!(bundles.calls()[0].algorithm, DigestAlgorithm::Sha256);
    }

    #[tokio::test]
    async fn publisher_repository_mismatch_is_attestations() {
        let wheel = b"wheel bytes";
        let transport = FakeTransport::new()
            .with_json(
                &format!("{SIMPLE}/mcp-clickhouse/"),
                &json!({ "files": [file_entry(WHEEL, wheel, true)] }),
            )
            .with_json(
                &provenance_url(WHEEL),
                &provenance(
                    "someone/else",
                    pep740(&DigestAlgorithm::Sha256.digest(wheel), testing::VALID_SIGNATURE),
                ),
            );
        let (verifier, _) = verifier(transport);

        let result = run(&verifier, &pkg("0.1.5")).await.unwrap();
        assert_eq!(result.status, ProvenanceStatus::Attestations);
        assert_eq!(
            result.error_message.as_deref(),
            Some("attestations found but verification failed")
        );
        let error = result.details[&format!("verification_error_{WHEEL}")]
            .as_str()
            .unwrap();
        assert!(error.contains("policy mismatch"));
    }

    #[tokio::test]
    async fn files_without_provenance_are_none() {
        let transport = FakeTransport::new().with_json(
            &format!("{SIMPLE}/mcp-clickhouse/"),
            &json!({ "files": [file_entry(WHEEL, b"w", false), file_entry(SDIST, b"s", false)] }),
        );
        let (verifier, _) = verifier(transport);

        let result = run(&verifier, &pkg("0.1.5")).await.unwrap();
        assert_eq!(result.status, ProvenanceStatus::None);
        assert_eq!(result.attestation_count, 0);
        assert!(!result.has_attestations);
    }

    #[tokio::test]
    async fn empty_listing_is_none() {
        let transport =
            FakeTransport::new().with_json(&format!("{SIMPLE}/mcp-clickhouse/"), &json!({ "files": [] }));
        let (verifier, _) = verifier(transport);

        let result = run(&verifier, &pkg("0.1.5")).await.unwrap();
        assert_eq!(result.status, ProvenanceStatus::None);
    }

    #[tokio::test]
    async fn missing_hash_downloads_file() {
        let wheel = b"wheel bytes";
        let mut entry = file_entry(WHEEL, wheel, true);
        entry["hashes"] = json!({});
        let transport = FakeTransport::new()
            .with_json(&format!("{SIMPLE}/mcp-clickhouse/"), &json!({ "files": [entry] }))
            .with_json(
                &provenance_url(WHEEL),
                &provenance(
                    "ClickHouse/mcp-clickhouse",
                    pep740(&DigestAlgorithm::Sha256.digest(wheel), testing::VALID_SIGNATURE),
                ),
            )
            .with_body(&format!("https://files.test/{WHEEL}"), wheel.to_vec());
        let (verifier, _) = verifier(transport);

        let result = run(&verifier, &pkg("0.1.5")).await.unwrap();
        assert_eq!(result.status, ProvenanceStatus::Verified);
    }

    #[tokio::test]
    async fn undecodable_provenance_is_recorded_per_file() {
        let transport = FakeTransport::new()
            .with_json(
                &format!("{SIMPLE}/mcp-clickhouse/"),
                &json!({ "files": [file_entry(WHEEL, b"w", true)] }),
            )
            .with_body(&provenance_url(WHEEL), b"not json".to_vec());
        let (verifier, _) = verifier(transport);

        let result = run(&verifier, &pkg("0.1.5")).await.unwrap();
        assert_eq!(result.status, ProvenanceStatus::Attestations);
        assert_eq!(result.attestation_count, 1);
    }

    #[tokio::test]
    async fn provenance_fetch_failure_is_recorded_per_file() {
        let wheel = b"wheel bytes";
        let transport = FakeTransport::new()
            .with_json(
                &format!("{SIMPLE}/mcp-clickhouse/"),
                &json!({ "files": [file_entry(SDIST, b"s", true), file_entry(WHEEL, wheel, true)] }),
            )
            .with_status(&provenance_url(SDIST), 503)
            .with_json(
                &provenance_url(WHEEL),
                &provenance(
                    "ClickHouse/mcp-clickhouse",
                    pep740(&DigestAlgorithm::Sha256.digest(wheel), testing::VALID_SIGNATURE),
                ),
            );
        let (verifier, _) = verifier(transport);

        let result = run(&verifier, &pkg("0.1.5")).await.unwrap();
        assert_eq!(result.status, ProvenanceStatus::Verified);
        assert_eq!(result.attestation_count, 2);
        assert_eq!(result.details["verified_files"], json!([WHEEL]));
        let error = result.details[&format!("verification_error_{SDIST}")]
            .as_str()
            .unwrap();
        assert!(error.contains("503"), "{error}");
    }

    #[tokio::test]
    async fn failed_download_is_recorded_per_file() {
        let mut entry = file_entry(WHEEL, b"w", true);
        entry["hashes"] = json!(null);
        let transport = FakeTransport::new()
            .with_json(&format!("{SIMPLE}/mcp-clickhouse/"), &json!({ "files": [entry] }))
            .with_json(
                &provenance_url(WHEEL),
                &provenance(
                    "ClickHouse/mcp-clickhouse",
                    pep740(&DigestAlgorithm::Sha256.digest(b"w"), testing::VALID_SIGNATURE),
                ),
            )
            .with_timeout(&format!("https://files.test/{WHEEL}"));
        let (verifier, _) = verifier(transport);

        let result = run(&verifier, &pkg("0.1.5")).await.unwrap();
        assert_eq!(result.status, ProvenanceStatus::Attestations);
        let error = result.details[&format!("verification_error_{WHEEL}")]
            .as_str()
            .unwrap();
        assert!(error.starts_with("failed to download file"), "{error}");
    }

    #[tokio::test]
    async fn cancellation_during_provenance_fetch_aborts_the_package() {
        let transport = FakeTransport::new()
            .with_json(
                &format!("{SIMPLE}/mcp-clickhouse/"),
                &json!({ "files": [file_entry(WHEEL, b"w", true)] }),
            )
            .with_cancellation(&provenance_url(WHEEL));
        let (verifier, _) = verifier(transport);

        let err = run(&verifier, &pkg("0.1.5")).await.unwrap_err();
        assert!(matches!(err, ProvenanceError::Cancelled));
    }

    #[tokio::test]
    async fn null_publisher_fields_are_tolerated() {
        let wheel = b"wheel bytes";
        let transport = FakeTransport::new()
            .with_json(
                &format!("{SIMPLE}/mcp-clickhouse/"),
                &json!({ "name": null, "files": [file_entry(WHEEL, wheel, true)] }),
            )
            .with_json(
                &provenance_url(WHEEL),
                &json!({
                    "version": 1,
                    "attestation_bundles": [{
                        "publisher": {
                            "kind": "GitHub",
                            "repository": "ClickHouse/mcp-clickhouse",
                            "workflow": "release.yml",
                            "environment": null,
                            "claims": null
                        },
                        "attestations": [pep740(
                            &DigestAlgorithm::Sha256.digest(wheel),
                            testing::VALID_SIGNATURE
                        )]
                    }]
                }),
            );
        let (verifier, _) = verifier(transport);

        let result = run(&verifier, &pkg("0.1.5")).await.unwrap();
        assert_eq!(result.status, ProvenanceStatus::Verified);
        let publisher = result.trusted_publisher.unwrap();
        assert_eq!(publisher.repository, "ClickHouse/mcp-clickhouse");
        assert!(!publisher.claims.contains_key("environment"));
    }

    #[tokio::test]
    async fn substring_matching_reproduces_prefix_collisions() {
        let transport = FakeTransport::new().with_json(
            &format!("{SIMPLE}/mcp-clickhouse/"),
            &json!({ "files": [file_entry("mcp_clickhouse-0.1.50.tar.gz", b"x", true)] }),
        );
        let verifier = PypiVerifier::new(
            Arc::new(transport),
            Arc::new(FakeAttestationVerifier::github("ClickHouse/mcp-clickhouse")),
        )
        .with_simple_url(SIMPLE);

        let exact = run(&verifier, &pkg("0.1.5")).await.unwrap();
        assert_eq!(exact.status, ProvenanceStatus::None);

        let verifier = verifier.with_version_matching(VersionMatching::Substring);
        let loose = run(&verifier, &pkg("0.1.5")).await.unwrap();
        assert_eq!(loose.status, ProvenanceStatus::Attestations);
        assert_eq!(loose.attestation_count, 1);
    }
}
