//! Publisher identity from verified bundles and SLSA provenance predicates.

use std::collections::BTreeMap;

use serde_json::Value;

use super::{BundleVerification, InTotoStatement};
use crate::domain::TrustedPublisher;

/// Publisher kind reported when only the certificate policy match is known.
pub const VERIFIED_KIND: &str = "Verified";

/// Generic publisher record for a successful verification.
///
/// Ecosystem verifiers enrich this with repository and workflow parsed from
/// their own provenance metadata, see [`merge_publisher`].
pub fn extract_publisher_info(verification: &BundleVerification) -> TrustedPublisher {
    let mut claims = BTreeMap::new();
    if let Some(identity) = &verification.identity {
        claims.insert(
            "certificate_identity".to_string(),
            Value::String(identity.clone()),
        );
    }
    if let Some(issuer) = &verification.issuer {
        claims.insert("certificate_issuer".to_string(), Value::String(issuer.clone()));
    }
    if let Some(time) = verification.integrated_time {
        claims.insert("integrated_time".to_string(), Value::from(time));
    }

    TrustedPublisher {
        kind: VERIFIED_KIND.to_string(),
        repository: String::new(),
        workflow: None,
        claims,
    }
}

/// Fill the verified record with the declared publisher's fields. Declared
/// values win; claims from both sides are kept.
pub fn merge_publisher(
    declared: Option<TrustedPublisher>,
    verified: TrustedPublisher,
) -> TrustedPublisher {
    let Some(declared) = declared else {
        return verified;
    };

    let mut claims = verified.claims;
    claims.extend(declared.claims);

    TrustedPublisher {
        kind: non_empty(declared.kind).unwrap_or(verified.kind),
        repository: non_empty(declared.repository).unwrap_or(verified.repository),
        workflow: declared.workflow.or(verified.workflow),
        claims,
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Reduce a repository URL to `owner/repo`.
///
/// Accepts `git+https://github.com/o/r.git`, `https://github.com/o/r`,
/// `git@github.com:o/r.git` and bare `o/r`.
pub fn normalize_repository_uri(uri: &str) -> String {
    let mut s = uri.trim();
    s = s.strip_prefix("git+").unwrap_or(s);
    if let Some(rest) = s.strip_prefix("git@") {
        s = rest.split_once(':').map(|(_, path)| path).unwrap_or(rest);
    } else if let Ok(parsed) = url::Url::parse(s) {
        let path = parsed.path().trim_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);
        return owner_repo(path);
    }
    let s = s.trim_matches('/');
    owner_repo(s.strip_suffix(".git").unwrap_or(s))
}

fn owner_repo(path: &str) -> String {
    path.split('/').take(2).collect::<Vec<_>>().join("/")
}

fn kind_for_host(uri: &str) -> Option<&'static str> {
    let host = url::Url::parse(uri.trim_start_matches("git+"))
        .ok()?
        .host_str()?
        .to_lowercase();
    match host.as_str() {
        "github.com" => Some("GitHub"),
        "gitlab.com" => Some("GitLab"),
        _ => None,
    }
}

/// Publisher declared by a SLSA provenance predicate (v1 or v0.2).
pub fn publisher_from_slsa(statement: &InTotoStatement) -> Option<TrustedPublisher> {
    let predicate = &statement.predicate;
    let mut claims = BTreeMap::new();

    let (repository_uri, workflow) = if let Some(workflow) =
        predicate.pointer("/buildDefinition/externalParameters/workflow")
    {
        if let Some(r) = workflow.get("ref").and_then(Value::as_str) {
            claims.insert("ref".to_string(), Value::String(r.to_string()));
        }
        (
            workflow.get("repository").and_then(Value::as_str)?.to_string(),
            workflow.get("path").and_then(Value::as_str).map(str::to_string),
        )
    } else {
        let source = predicate.pointer("/invocation/configSource")?;
        let uri = source.get("uri").and_then(Value::as_str)?;
        let (repo, git_ref) = match uri.rsplit_once('@') {
            Some((repo, git_ref)) if !repo.ends_with("git") => (repo, Some(git_ref)),
            _ => (uri, None),
        };
        if let Some(r) = git_ref {
            claims.insert("ref".to_string(), Value::String(r.to_string()));
        }
        (
            repo.to_string(),
            source
                .get("entryPoint")
                .and_then(Value::as_str)
                .map(str::to_string),
        )
    };

    if let Some(build_type) = predicate
        .pointer("/buildDefinition/buildType")
        .or_else(|| predicate.get("buildType"))
        .and_then(Value::as_str)
    {
        claims.insert("build_type".to_string(), Value::String(build_type.to_string()));
    }

    let repository = normalize_repository_uri(&repository_uri);
    if repository.is_empty() {
        return None;
    }

    Some(TrustedPublisher {
        kind: kind_for_host(&repository_uri).unwrap_or(VERIFIED_KIND).to_string(),
        repository,
        workflow,
        claims,
    })
}
