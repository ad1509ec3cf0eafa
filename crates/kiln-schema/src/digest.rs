use crate::types::name_type;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::ops::Deref;

const ALGORITHM: &str = "sha256";
const HEX_LEN: usize = 64;

name_type!(
    /// Content digest in OCI form, `sha256:<hex>`.
    ///
    /// Layer digests are computed over the uncompressed, deterministic tar of the
    /// layer tree, so a layer digest doubles as its OCI diff id.
    Digest
);

impl Digest {
    /// Compute the sha256 digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(format!("{ALGORITHM}:{}", hex::encode(Sha256::digest(data))))
    }

    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> Result<Self, SchemaError> {
        let digest = Self::new(s);
        if digest.is_valid() {
            Ok(digest)
        } else {
            Err(SchemaError::InvalidDigest(s.to_owned()))
        }
    }

    /// Whether this digest is `sha256:` followed by exactly 64 lowercase hex characters.
    pub fn is_valid(&self) -> bool {
        match self.0.split_once(':') {
            Some((algo, hex)) => {
                algo == ALGORITHM
                    && hex.len() == HEX_LEN
                    && hex
                        .bytes()
                        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
            }
            None => false,
        }
    }

    /// The hex part after the algorithm prefix.
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(_, h)| h)
    }

    /// The first 12 hex characters, for log output.
    pub fn short(&self) -> &str {
        let hex = self.hex();
        &hex[..12.min(hex.len())]
    }

    /// Whether `data` hashes to this digest.
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }
}
