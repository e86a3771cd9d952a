//! # Rugpull Game Server
//!
//! Provably-fair crash and candleflip games over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    RUGPULL SERVER                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── rng.rs      - SHA-256 seeded PRNG                       │
//! │  ├── seed.rs     - Server seeds and commitments              │
//! │  └── ring.rs     - Bounded history buffer                    │
//! │                                                              │
//! │  game/           - Game logic (deterministic)                │
//! │  ├── crash.rs    - Crash price walk                          │
//! │  ├── candleflip.rs - Bull/bear rooms and payouts             │
//! │  ├── candle.rs   - OHLC candle aggregation                   │
//! │  └── verify.rs   - Replay from a revealed seed               │
//! │                                                              │
//! │  network/        - Networking (non-deterministic)            │
//! │  ├── hub.rs      - Topic fan-out with per-connection mailbox │
//! │  ├── session.rs  - Live bets, history, batches               │
//! │  ├── service.rs  - Player operations                         │
//! │  ├── game_loop.rs- Crash loop and batch runners              │
//! │  ├── server.rs   - WebSocket server                          │
//! │  └── protocol.rs - Message types                             │
//! │                                                              │
//! │  ledger/         - Persistence and payouts (side effects)    │
//! │  config.rs       - Environment configuration                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fairness Guarantee
//!
//! Before a game starts the server publishes `sha256(secret)`. The secret
//! is revealed only when the game ends, and every tick of the game is a pure
//! function of it, so anyone can replay the game with [`game::verify`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod ledger;
pub mod network;

// Re-export commonly used types
pub use config::ServerConfig;
pub use core::rng::SeededRng;
pub use core::seed::GameSeed;
pub use game::crash::{CrashEngine, CrashOutcome};
pub use game::candleflip::Side;
pub use network::{AppContext, GameServer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
