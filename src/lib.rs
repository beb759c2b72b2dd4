//! Dockyard: package provenance verification for MCP server images.
//!
//! Checks that an npm or PyPI package version was built and published by the
//! CI workflow it claims, using Sigstore attestations (npm provenance, PEP 740)
//! and falling back to weaker signals (registry signatures) when no
//! attestation exists.
//!
//! # Quick Start
//!
//! ```no_run
//! use dockyard::config::Config;
//! use dockyard::domain::{Ecosystem, PackageIdentifier};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> dockyard::error::Result<()> {
//! let service = dockyard::build_service(&Config::default()).await?;
//! let pkg = PackageIdentifier::new(Ecosystem::Pypi, "mcp-clickhouse", "0.1.5");
//! let outcome = service.verify_provenance(&pkg, &CancellationToken::new()).await;
//! println!("{}: {}", pkg, outcome.result.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod npm;
pub mod output;
pub mod pypi;
pub mod service;
pub mod sigstore;
pub mod transport;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use config::Config;
use domain::{Ecosystem, ExpectedProvenance, PackageIdentifier, ProvenanceRequirements};
use error::{ProvenanceError, Result};
use npm::NpmVerifier;
use output::{OutputFormat, ReportEntry};
use pypi::PypiVerifier;
use service::ProvenanceService;
use sigstore::{AttestationVerifier, SigstoreBundleVerifier};
use transport::{HttpTransport, Transport};

/// Build a service with the npm and PyPI verifiers registered. The trust
/// root is loaded once (over TUF unless configured otherwise) and shared by
/// both.
pub async fn build_service(config: &Config) -> Result<ProvenanceService> {
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
        config.http.timeout(),
        &config.http.user_agent,
    )?);
    let bundles: Arc<dyn AttestationVerifier> =
        Arc::new(SigstoreBundleVerifier::from_config(&config.sigstore).await?);
    build_service_with(config, transport, bundles).await
}

/// Like [`build_service`] with caller-supplied transport and bundle verifier.
pub async fn build_service_with(
    config: &Config,
    transport: Arc<dyn Transport>,
    bundles: Arc<dyn AttestationVerifier>,
) -> Result<ProvenanceService> {
    let service =
        ProvenanceService::new().with_max_concurrency(config.verification.max_concurrency);

    let npm = NpmVerifier::new(transport.clone(), bundles.clone())
        .with_registry_url(&config.registry.npm_url);
    service
        .register_verifier(Ecosystem::Npm, Arc::new(npm))
        .await?;

    let pypi = PypiVerifier::new(transport, bundles)
        .with_simple_url(&config.registry.pypi_simple_url)
        .with_version_matching(config.verification.version_matching);
    service
        .register_verifier(Ecosystem::Pypi, Arc::new(pypi))
        .await?;

    Ok(service)
}

/// Verified packages with their gating outcome.
#[derive(Debug)]
pub struct VerifyReport {
    pub entries: Vec<ReportEntry>,
    /// First verification error, if any package failed outright.
    pub error: Option<ProvenanceError>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.entries.iter().all(ReportEntry::passed)
    }
}

/// Verify packages, evaluate requirements and compare with declared
/// expectations. `expected` applies to every package.
pub async fn verify_packages(
    service: &ProvenanceService,
    packages: &[PackageIdentifier],
    requirements: &ProvenanceRequirements,
    expected: &ExpectedProvenance,
    cancel: &CancellationToken,
) -> VerifyReport {
    let batch = service.batch_verify(packages, cancel).await;
    let entries = batch
        .results
        .into_iter()
        .map(|result| ReportEntry {
            verdict: requirements.evaluate(&result),
            mismatches: expected.check(&result),
            result,
        })
        .collect();

    VerifyReport {
        entries,
        error: batch.error,
    }
}

/// Render a verify report in the specified format.
pub fn render_report(report: &VerifyReport, format: OutputFormat, verbose: bool) -> Result<String> {
    output::render(&report.entries, format, verbose)
}
