use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ProvenanceRequirements;
use crate::error::{ProvenanceError, Result};
use crate::npm::DEFAULT_REGISTRY_URL;
use crate::pypi::{VersionMatching, DEFAULT_SIMPLE_URL};
use crate::service::DEFAULT_MAX_CONCURRENCY;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = ".dockhand.toml";

/// Top-level configuration from `.dockhand.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sigstore: SigstoreConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub requirements: ProvenanceRequirements,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_npm_url")]
    pub npm_url: String,
    #[serde(default = "default_pypi_simple_url")]
    pub pypi_simple_url: String,
}

fn default_npm_url() -> String {
    DEFAULT_REGISTRY_URL.to_string()
}

fn default_pypi_simple_url() -> String {
    DEFAULT_SIMPLE_URL.to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            npm_url: default_npm_url(),
            pypi_simple_url: default_pypi_simple_url(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("dockhand/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Trust material for bundle verification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SigstoreConfig {
    /// `trusted_root.json` to use instead of the production root.
    #[serde(default)]
    pub trusted_root: Option<PathBuf>,
    /// Use the production root bundled with the verification library instead
    /// of fetching the current one over TUF.
    #[serde(default)]
    pub offline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub version_matching: VersionMatching,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            version_matching: VersionMatching::default(),
        }
    }
}

impl Config {
    /// Load config from a TOML file. Returns default if file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.http.timeout_secs == 0 {
            return Err(ProvenanceError::Config(
                "http.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.verification.max_concurrency == 0 {
            return Err(ProvenanceError::Config(
                "verification.max_concurrency must be greater than zero".to_string(),
            ));
        }
        for (key, value) in [
            ("registry.npm_url", &self.registry.npm_url),
            ("registry.pypi_simple_url", &self.registry.pypi_simple_url),
        ] {
            url::Url::parse(value)
                .map_err(|e| ProvenanceError::Config(format!("{key} is not a valid URL: {e}")))?;
        }
        Ok(())
    }

    /// Generate a starter config file.
    pub fn starter_toml() -> &'static str {
        r#"# Dockhand configuration

[registry]
# npm_url = "https://registry.npmjs.org"
# pypi_simple_url = "https://pypi.org/simple"

[http]
timeout_secs = 30

[sigstore]
# Path to a trusted_root.json. Defaults to the Sigstore production root,
# fetched through TUF.
# trusted_root = "trusted_root.json"
# Skip TUF and use the production root bundled with dockhand.
offline = false

[verification]
# Packages verified at once by `dockhand batch`.
max_concurrency = 8
# How PyPI files are matched to the requested version: "exact" or "substring".
version_matching = "exact"

[requirements]
# Fail unless the package carries attestations / a trusted publisher / registry signatures.
require_attestations = false
require_trusted_publisher = false
require_signatures = false
# Accept packages without any provenance (warn, don't fail).
allow_none = true
# Only VERIFIED and ATTESTATIONS pass.
strict = false
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.http.timeout(), Duration::from_secs(30));
        assert!(config.requirements.allow_none);
    }

    #[test]
    fn starter_toml_parses_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, Config::starter_toml()).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "[verification]\nversion_matching = \"substring\"\n\n[requirements]\nstrict = true\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.verification.version_matching, VersionMatching::Substring);
        assert_eq!(config.verification.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert!(config.requirements.strict);
        assert_eq!(config.registry, RegistryConfig::default());
    }

    #[test]
    fn rejects_zero_timeout_and_bad_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[http]\ntimeout_secs = 0\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ProvenanceError::Config(_))));

        std::fs::write(&path, "[registry]\nnpm_url = \"not a url\"\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ProvenanceError::Config(_))));
    }

    #[test]
    fn sigstore_section_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "[sigstore]\ntrusted_root = \"roots/trusted_root.json\"\noffline = true\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.sigstore.trusted_root.as_deref(),
            Some(Path::new("roots/trusted_root.json"))
        );
        assert!(config.sigstore.offline);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[http\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ProvenanceError::Toml(_))));
    }
}
