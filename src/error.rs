use thiserror::Error;

use crate::domain::Ecosystem;

pub type Result<T> = std::result::Result<T, ProvenanceError>;

#[derive(Error, Debug)]
pub enum ProvenanceError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected status code {status} from {url}: {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("verification cancelled")]
    Cancelled,

    #[error("failed to decode {what}: {message}")]
    Decode { what: String, message: String },

    #[error("version {version} not found in registry for {package}")]
    VersionNotFound { package: String, version: String },

    #[error("{verifier} verifier does not support ecosystem {ecosystem}")]
    UnsupportedEcosystem {
        verifier: &'static str,
        ecosystem: Ecosystem,
    },

    #[error("verifier does not support ecosystem {0}")]
    CapabilityMismatch(Ecosystem),

    #[error("a verifier is already registered for ecosystem {0}")]
    DuplicateVerifier(Ecosystem),

    #[error("invalid package identifier '{input}': {message}")]
    InvalidPackage { input: String, message: String },

    #[error("Trust root error: {0}")]
    TrustRoot(String),

    #[error("package {index} ({package}) failed: {source}")]
    Batch {
        index: usize,
        package: String,
        #[source]
        source: Box<ProvenanceError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProvenanceError {
    pub fn exit_code(&self) -> i32 {
        2
    }

    /// Whether this error came from the network layer rather than from
    /// decoding or configuration.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Http { .. } | Self::HttpStatus { .. } | Self::Timeout { .. } => true,
            Self::Batch { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    pub(crate) fn decode(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            what: what.into(),
            message: err.to_string(),
        }
    }
}
