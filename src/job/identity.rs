//! Job identity ("jhash").

use serde::{Deserialize, Serialize};

/// Hash of a job's input parameters.
///
/// Two start requests for the same run directory with equal identities are the
/// same logical job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobIdentity(String);

impl JobIdentity {
    pub fn new(jhash: impl Into<String>) -> Self {
        Self(jhash.into())
    }

    /// Derive an identity from simulation parameters.
    ///
    /// `serde_json` keeps object keys sorted, so equal parameter sets hash
    /// equally regardless of the order they were built in.
    pub fn from_parameters(params: &serde_json::Value) -> Self {
        let canonical = params.to_string();
        Self(blake3::hash(canonical.as_bytes()).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobIdentity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for JobIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}
