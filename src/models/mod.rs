//! Data models.

mod batch;
mod message;

use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use batch::*;
pub use message::*;

/// A 32 byte hash value, rendered as lowercase hex.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Bytes32(pub [u8; 32]);

impl Bytes32 {
    /// Finalize the given hasher into a new value.
    pub fn from_hasher(hasher: Sha256) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    /// The SHA-256 hash of the given bytes.
    pub fn sha256(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    /// The raw bytes of this value.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes32({})", self)
    }
}

impl FromStr for Bytes32 {
    type Err = anyhow::Error;

    fn from_str(val: &str) -> Result<Self> {
        let bytes = hex::decode(val.trim_start_matches("0x")).context("invalid hex given for 32 byte hash")?;
        if bytes.len() != 32 {
            bail!("invalid 32 byte hash, got {} bytes", bytes.len());
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl TryFrom<String> for Bytes32 {
    type Error = anyhow::Error;

    fn try_from(val: String) -> Result<Self> {
        val.parse()
    }
}

impl From<Bytes32> for String {
    fn from(val: Bytes32) -> Self {
        val.to_string()
    }
}
