//! Provenance service: routes packages to ecosystem verifiers and fans out
//! batch verification.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::domain::{Ecosystem, PackageIdentifier, ProvenanceResult, ProvenanceVerifier};
use crate::error::{ProvenanceError, Result};

pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Outcome of one verification through the service.
///
/// `result` is always present; `error` carries the underlying failure when
/// the result has status `ERROR` because the verifier itself failed.
#[derive(Debug)]
pub struct Verification {
    pub result: ProvenanceResult,
    pub error: Option<ProvenanceError>,
}

impl Verification {
    fn ok(result: ProvenanceResult) -> Self {
        Self {
            result,
            error: None,
        }
    }

    fn failed(pkg: &PackageIdentifier, error: ProvenanceError) -> Self {
        Self {
            result: ProvenanceResult::failed(pkg.clone(), error.to_string()),
            error: Some(error),
        }
    }
}

/// Outcome of a batch. `results[i]` always belongs to input package `i`;
/// `error` is the first failure in input order.
#[derive(Debug)]
pub struct BatchVerification {
    pub results: Vec<ProvenanceResult>,
    pub error: Option<ProvenanceError>,
}

/// Registry of ecosystem verifiers.
pub struct ProvenanceService {
    verifiers: RwLock<HashMap<Ecosystem, Arc<dyn ProvenanceVerifier>>>,
    max_concurrency: usize,
}

impl ProvenanceService {
    pub fn new() -> Self {
        Self {
            verifiers: RwLock::new(HashMap::new()),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Upper bound on packages verified at once by [`Self::batch_verify`].
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Register the verifier for `ecosystem`. Fails, leaving the registry
    /// unchanged, if the verifier does not support the ecosystem or one is
    /// already registered.
    pub async fn register_verifier(
        &self,
        ecosystem: Ecosystem,
        verifier: Arc<dyn ProvenanceVerifier>,
    ) -> Result<()> {
        if !verifier.supports_ecosystem(ecosystem) {
            return Err(ProvenanceError::CapabilityMismatch(ecosystem));
        }

        match self.verifiers.write().await.entry(ecosystem) {
            Entry::Occupied(_) => Err(ProvenanceError::DuplicateVerifier(ecosystem)),
            Entry::Vacant(slot) => {
                tracing::debug!(%ecosystem, verifier = verifier.name(), "registered verifier");
                slot.insert(verifier);
                Ok(())
            }
        }
    }

    /// Ecosystems with a registered verifier, sorted.
    pub async fn registered_ecosystems(&self) -> Vec<Ecosystem> {
        let mut ecosystems: Vec<_> = self.verifiers.read().await.keys().copied().collect();
        ecosystems.sort();
        ecosystems
    }

    /// Verify one package. A missing verifier is an `UNKNOWN` result, not an
    /// error.
    pub async fn verify_provenance(
        &self,
        pkg: &PackageIdentifier,
        cancel: &CancellationToken,
    ) -> Verification {
        let verifier = self.verifiers.read().await.get(&pkg.ecosystem).cloned();
        let Some(verifier) = verifier else {
            tracing::debug!(package = %pkg, "no verifier registered");
            return Verification::ok(ProvenanceResult::unknown(pkg.clone()));
        };

        if cancel.is_cancelled() {
            return Verification::failed(pkg, ProvenanceError::Cancelled);
        }

        match verifier.verify(pkg, cancel).await {
            Ok(result) => Verification::ok(result),
            Err(e) => {
                tracing::warn!(package = %pkg, error = %e, "verification failed");
                Verification::failed(pkg, e)
            }
        }
    }

    /// Verify every package concurrently, preserving input order.
    pub async fn batch_verify(
        &self,
        packages: &[PackageIdentifier],
        cancel: &CancellationToken,
    ) -> BatchVerification {
        let outcomes: Vec<Verification> = stream::iter(
            packages
                .iter()
                .map(|pkg| self.verify_provenance(pkg, cancel)),
        )
        .buffered(self.max_concurrency)
        .collect()
        .await;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut first_error = None;
        for (index, (outcome, pkg)) in outcomes.into_iter().zip(packages).enumerate() {
            if let Some(error) = outcome.error {
                if first_error.is_none() {
                    first_error = Some(ProvenanceError::Batch {
                        index,
                        package: pkg.to_string(),
                        source: Box::new(error),
                    });
                }
            }
            results.push(outcome.result);
        }

        BatchVerification {
            results,
            error: first_error,
        }
    }
}

impl Default for ProvenanceService {
    fn default() -> Self {
        Self::new()
    }
}
