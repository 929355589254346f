//! Model version records, slug derivation and numeric version ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::RegistryError;

/// Lifecycle status of a registered version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelStatus { Registered, Deploying, Deployed, Failed }

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Registered => "REGISTERED",
            ModelStatus::Deploying => "DEPLOYING",
            ModelStatus::Deployed => "DEPLOYED",
            ModelStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for ModelStatus {
    type Err = RegistryError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "REGISTERED" => Ok(ModelStatus::Registered),
            "DEPLOYING" => Ok(ModelStatus::Deploying),
            "DEPLOYED" => Ok(ModelStatus::Deployed),
            "FAILED" => Ok(ModelStatus::Failed),
            other => Err(RegistryError::validation("status", format!("unknown model status {other}"))),
        }
    }
}

/// `Shared` marks a version readable by every team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility { #[default] Team, Shared }

/// Free-form metadata bag. Replaced wholesale on update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hyperparameters: BTreeMap<String, serde_json::Value>,
}

impl ModelMetadata {
    pub fn validate(&self) -> Result<(), RegistryError> {
        if let Some(acc) = self.accuracy {
            if !(0.0..=1.0).contains(&acc) || acc.is_nan() {
                return Err(RegistryError::validation("metadata.accuracy", "must be within [0, 1]"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelVersion {
    pub model_id: String,
    pub version: String,
    pub name: String,
    pub framework: String,
    pub artifact_uri: String,
    pub deployment_target: String,
    pub status: ModelStatus,
    pub team: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub metadata: ModelMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelVersion {
    pub fn key(&self) -> String { version_key(&self.model_id, &self.version) }
    pub fn semver(&self) -> Option<SemVer> { self.version.parse().ok() }
    pub fn label(&self) -> String { format!("{}@{}", self.model_id, self.version) }
}

/// Storage key; sorts by model then by version string (not numerically).
pub fn version_key(model_id: &str, version: &str) -> String { format!("{model_id}/{version}") }

/// Lowercase, collapse non-alphanumeric runs to one hyphen, trim hyphens.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() { out.push('-'); }
            pending_hyphen = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    out
}

/// `major.minor.patch`, compared as a numeric tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SemVer { pub major: u64, pub minor: u64, pub patch: u64 }

impl FromStr for SemVer {
    type Err = RegistryError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || RegistryError::validation("version", format!("{s:?} is not major.minor.patch"));
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 { return Err(bad()); }
        let mut nums = [0u64; 3];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) { return Err(bad()); }
            *slot = part.parse().map_err(|_| bad())?;
        }
        Ok(SemVer { major: nums[0], minor: nums[1], patch: nums[2] })
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}.{}.{}", self.major, self.minor, self.patch) }
}

/// `01.0.0` and `1.0.0` name the same version; both map to `1.0.0`.
/// Unparsable input is returned as is.
pub fn canonical_version(version: &str) -> String {
    version.parse::<SemVer>().map(|v| v.to_string()).unwrap_or_else(|_| version.to_string())
}

/// Highest version by numeric tuple; unparsable versions never win.
pub fn latest<'a, I>(versions: I) -> Option<&'a ModelVersion>
where I: IntoIterator<Item = &'a ModelVersion> {
    versions.into_iter().max_by(|a, b| match (a.semver(), b.semver()) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    })
}
