//! Core deterministic primitives.
//!
//! Seeded randomness, seed commitments and the bounded ring shared by
//! game history and chat. Nothing here touches the network or the clock.

pub mod rng;
pub mod seed;
pub mod ring;

// Re-export core types
pub use rng::SeededRng;
pub use seed::{GameSeed, commitment_hash, verify_commitment};
pub use ring::HistoryRing;
