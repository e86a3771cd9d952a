//! Candleflip Simulation
//!
//! Fixed-length bull/bear walk. Every room runs exactly [`TOTAL_TICKS`]
//! moves from a starting price of 1.0; a final price at or above the start
//! is a green (bull) candle.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Deserialize};

use crate::core::rng::SeededRng;

/// Price each room opens at.
pub const STARTING_PRICE: f64 = 1.0;

/// Moves per room.
pub const TOTAL_TICKS: usize = 40;

/// Chance of a big move on a tick.
pub const BIG_MOVE_CHANCE: f64 = 0.01;

/// Big move magnitude.
pub const BIG_MOVE_PCT: f64 = 0.20;

/// Small move magnitude bounds.
pub const SMALL_MOVE_MIN: f64 = 0.01;
/// Upper bound for small moves.
pub const SMALL_MOVE_MAX: f64 = 0.05;

/// A candleflip prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Final price at or above the start (green).
    Bull,
    /// Final price below the start (red).
    Bear,
}

impl Side {
    /// The other side, taken by the house.
    pub fn opposite(self) -> Self {
        match self {
            Side::Bull => Side::Bear,
            Side::Bear => Side::Bull,
        }
    }

    /// Candle colour shown for this side.
    pub fn color(self) -> &'static str {
        match self {
            Side::Bull => "GREEN",
            Side::Bear => "RED",
        }
    }

    /// Winning side for a final price.
    pub fn from_final_price(price: f64) -> Self {
        if price >= STARTING_PRICE {
            Side::Bull
        } else {
            Side::Bear
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Bull => write!(f, "bull"),
            Side::Bear => write!(f, "bear"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bull" | "bullish" | "green" => Ok(Side::Bull),
            "bear" | "bearish" | "red" => Ok(Side::Bear),
            other => Err(format!("unknown side '{}'", other)),
        }
    }
}

/// One candleflip move.
///
/// Up moves multiply by `1 + m`, down moves divide by it, so the walk is
/// symmetric in log space and neither side carries an edge.
pub fn next_price(rng: &mut SeededRng, last: f64) -> f64 {
    let magnitude = if rng.chance(BIG_MOVE_CHANCE) {
        BIG_MOVE_PCT
    } else {
        rng.next_range(SMALL_MOVE_MIN, SMALL_MOVE_MAX)
    };

    let next = if rng.chance(0.5) {
        last / (1.0 + magnitude)
    } else {
        last * (1.0 + magnitude)
    };
    next.max(0.0)
}

/// Full price path for a piece of seed material, start price included.
pub fn simulate_path(material: &str) -> [f64; TOTAL_TICKS + 1] {
    let mut rng = SeededRng::from_material(material);
    let mut path = [STARTING_PRICE; TOTAL_TICKS + 1];
    for i in 1..=TOTAL_TICKS {
        path[i] = next_price(&mut rng, path[i - 1]);
    }
    path
}

/// Seed material for room `index` (zero-based) of a batch.
pub fn room_material(secret: &str, index: usize) -> String {
    format!("{}-room-{}", secret, index)
}

/// Seed material for a standalone candleflip game.
pub fn game_material(secret: &str) -> String {
    format!("{}-candleflip", secret)
}

/// Result of one simulated room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomOutcome {
    /// Zero-based room index within the batch.
    pub index: usize,
    /// Prices, start included.
    pub path: Vec<f64>,
    /// Last price of the path.
    pub final_price: f64,
    /// Winning side.
    pub winner: Side,
}

/// Simulate room `index` of a batch seeded by `secret`.
pub fn simulate_room(secret: &str, index: usize) -> RoomOutcome {
    let path = simulate_path(&room_material(secret, index));
    let final_price = path[TOTAL_TICKS];
    RoomOutcome {
        index,
        path: path.to_vec(),
        final_price,
        winner: Side::from_final_price(final_price),
    }
}

/// Winning side of a standalone candleflip game.
pub fn simulate_game(secret: &str) -> (Vec<f64>, Side) {
    let path = simulate_path(&game_material(secret));
    (path.to_vec(), Side::from_final_price(path[TOTAL_TICKS]))
}

/// Batch payout in wei: each won room returns double the stake.
///
/// `None` on overflow.
pub fn batch_payout(amount_per_room: u128, won_rooms: u32) -> Option<u128> {
    amount_per_room
        .checked_mul(u128::from(won_rooms))?
        .checked_mul(2)
}

/// Round for display.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let ratio = 10f64.powi(decimals);
    (value * ratio).round() / ratio
}

// =============================================================================
// TESTS
// =============================================================================
