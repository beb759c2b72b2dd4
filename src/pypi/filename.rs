//! Distribution filename parsing (wheel and sdist).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static NAME_SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-_.]+").unwrap());

const SDIST_SUFFIXES: &[&str] = &[".tar.gz", ".zip", ".tar.bz2", ".tgz", ".tar.xz"];

/// How files in a Simple-API listing are matched to the requested version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionMatching {
    /// Version parsed from the filename must equal the requested version.
    #[default]
    Exact,
    /// Filename merely contains the version string ("1.0" matches "1.0.1").
    Substring,
}

impl VersionMatching {
    pub fn matches(&self, filename: &str, version: &str) -> bool {
        match self {
            Self::Substring => filename.contains(version),
            Self::Exact => {
                filename_version(filename).is_some_and(|v| v.eq_ignore_ascii_case(version))
            }
        }
    }
}

/// PEP 503 normalized project name.
pub fn normalize_project_name(name: &str) -> String {
    NAME_SEPARATORS.replace_all(name.trim(), "-").to_lowercase()
}

/// Version component of a wheel (`{name}-{version}(-{build})?-{py}-{abi}-{plat}.whl`)
/// or sdist (`{name}-{version}.tar.gz`) filename.
pub fn filename_version(filename: &str) -> Option<&str> {
    if let Some(stem) = filename.strip_suffix(".whl") {
        // Wheel names escape '-' in the project name, so the second field is the version.
        return stem.split('-').nth(1).filter(|v| !v.is_empty());
    }
    let stem = SDIST_SUFFIXES
        .iter()
        .find_map(|suffix| filename.strip_suffix(suffix))?;
    stem.rsplit_once('-')
        .map(|(_, version)| version)
        .filter(|v| !v.is_empty())
}
