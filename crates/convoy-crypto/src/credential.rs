//! Account credentials.
//!
//! Tokens are never kept in plaintext once loaded: configuration may hold the
//! SHA-256 hex digest directly, and plaintext tokens are hashed on load.
//! Verification compares digests in constant time.

use anyhow::{Result, bail};
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// SHA-256 digest of an account token.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenDigest([u8; 32]);

impl TokenDigest {
    /// Hash a plaintext token.
    pub fn of_token(token: &str) -> Self {
        let token = Zeroizing::new(token.as_bytes().to_vec());
        let digest = Sha256::digest(&token[..]);
        Self(digest.into())
    }

    /// Parse a lowercase or uppercase hex digest as written in configuration.
    pub fn from_hex(hex_digest: &str) -> Result<Self> {
        let bytes = hex::decode(hex_digest.trim())?;
        let Ok(arr) = <[u8; 32]>::try_from(bytes.as_slice()) else {
            bail!("token digest must be 32 bytes, got {}", bytes.len());
        };
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Check a presented plaintext token against this digest.
    pub fn verify(&self, presented: &str) -> bool {
        let presented = Self::of_token(presented);
        self.0.ct_eq(&presented.0).into()
    }
}

impl std::fmt::Debug for TokenDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only a prefix, enough to tell digests apart in logs.
        write!(f, "TokenDigest({}…)", &self.to_hex()[..8])
    }
}

/// Generate a random account token (32 bytes, hex-encoded).
pub fn generate_token() -> Zeroizing<String> {
    let mut bytes = Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill(&mut bytes[..]);
    Zeroizing::new(hex::encode(&bytes[..]))
}
