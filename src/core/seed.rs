//! Server Seed Commitment
//!
//! Commit to a secret seed before a game starts, reveal it afterwards.
//! The public hash is SHA-256 over the hex-encoded secret so any player
//! can check the reveal with a stock sha256 tool.

use std::fmt;

use rand::RngCore;
use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

/// Secret size in bytes.
pub const SECRET_LEN: usize = 32;

/// A per-game server seed and its public commitment.
///
/// Immutable after creation. The secret must not be sent to clients while
/// the game it seeds is still in progress.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSeed {
    secret: [u8; SECRET_LEN],
    public_hash: String,
}

impl GameSeed {
    /// Generate a fresh seed from the operating system's CSPRNG.
    pub fn generate() -> Self {
        let mut secret = [0u8; SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self::from_secret(secret)
    }

    /// Build a seed from known secret bytes.
    pub fn from_secret(secret: [u8; SECRET_LEN]) -> Self {
        let public_hash = commitment_hash(&hex::encode(secret));
        Self { secret, public_hash }
    }

    /// Parse a revealed secret from its hex form.
    pub fn from_hex(secret_hex: &str) -> Option<Self> {
        let bytes = hex::decode(secret_hex).ok()?;
        let secret: [u8; SECRET_LEN] = bytes.try_into().ok()?;
        Some(Self::from_secret(secret))
    }

    /// Hex-encoded secret (the string that feeds the game RNG).
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret)
    }

    /// Public commitment (hex SHA-256 of `secret_hex`).
    pub fn public_hash(&self) -> &str {
        &self.public_hash
    }
}

// Keep the secret out of log lines.
impl fmt::Debug for GameSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameSeed")
            .field("public_hash", &self.public_hash)
            .finish_non_exhaustive()
    }
}

/// Hex SHA-256 of a revealed secret string.
pub fn commitment_hash(secret_hex: &str) -> String {
    hex::encode(Sha256::digest(secret_hex.as_bytes()))
}

/// Check a revealed secret against a previously published commitment.
pub fn verify_commitment(secret_hex: &str, public_hash: &str) -> bool {
    commitment_hash(secret_hex).eq_ignore_ascii_case(public_hash)
}
