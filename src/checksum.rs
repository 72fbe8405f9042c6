//! Checksums guarding the persisted scheduler state

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

use crate::error::{Result, SchedError};

/// SHA256 checksum of a persisted payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum(String);

impl Checksum {
    /// Compute checksum from raw bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(format!("{:x}", hash))
    }

    /// Compute checksum over the JSON encoding of a payload
    ///
    /// Payload types serialize maps as `BTreeMap`, so the encoding is stable.
    pub fn of<T: Serialize>(payload: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(payload)?;
        Ok(Self::from_bytes(&encoded))
    }

    /// Get the hex string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Verify a payload loaded from `path` against this checksum
    pub fn verify<T: Serialize>(&self, payload: &T, path: &Path) -> Result<()> {
        let actual = Self::of(payload)?;
        if actual != *self {
            return Err(SchedError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected: self.0.clone(),
                actual: actual.0,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
