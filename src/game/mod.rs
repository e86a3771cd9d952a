//! Game Logic Module
//!
//! All game simulation code. 100% deterministic: every outcome is a pure
//! function of seed material, so the server and any verifier agree.
//!
//! ## Module Structure
//!
//! - `crash`: Peak-predetermined crash price walk
//! - `candleflip`: Fixed-length bull/bear walk and batch payouts
//! - `candle`: Tick-to-OHLC aggregation with pairwise merging
//! - `verify`: Commitment check plus replay

pub mod crash;
pub mod candleflip;
pub mod candle;
pub mod verify;

// Re-export key types
pub use crash::{CrashEngine, CrashOutcome, CrashParams, PricePoint};
pub use candleflip::{RoomOutcome, Side};
pub use candle::{CandleAggregator, CandleGroup, CandleGroupingState, TickCandles};
pub use verify::VerifyError;
