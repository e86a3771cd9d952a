//! Crash Price Simulation
//!
//! Peak-predetermined crash engine. The peak is drawn once from its own
//! sub-seed, then the tick stream walks the price up to it and lets it bleed
//! until a rug check fires.
//!
//! The live game loop and offline verification drive the same
//! [`CrashEngine::step`], so a replay from the revealed seed reproduces the
//! broadcast game tick for tick.

use serde::{Serialize, Deserialize};

use crate::core::rng::SeededRng;

/// Price every crash game starts at.
pub const STARTING_PRICE: f64 = 1.0;

/// One band of the peak distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakBand {
    /// Cumulative probability at the top of this band.
    pub cumulative: f64,
    /// Lowest peak in the band (inclusive).
    pub min: f64,
    /// Highest peak in the band (exclusive).
    pub max: f64,
}

/// Canonical peak table: 40 / 30 / 18 / 9 / 3 percent.
pub const PEAK_BANDS: [PeakBand; 5] = [
    PeakBand { cumulative: 0.40, min: 1.0, max: 1.5 },
    PeakBand { cumulative: 0.70, min: 1.5, max: 3.0 },
    PeakBand { cumulative: 0.88, min: 3.0, max: 10.0 },
    PeakBand { cumulative: 0.97, min: 10.0, max: 50.0 },
    PeakBand { cumulative: 1.00, min: 50.0, max: 200.0 },
];

/// Map a uniform draw in `[0, 1)` onto the peak table.
///
/// The draw picks a band by cumulative weight and is then rescaled linearly
/// inside that band, so a single float fully determines the peak.
pub fn peak_from_unit(r: f64) -> f64 {
    let mut lower = 0.0;
    for band in PEAK_BANDS.iter() {
        if r < band.cumulative {
            let normalized = (r - lower) / (band.cumulative - lower);
            return band.min + normalized * (band.max - band.min);
        }
        lower = band.cumulative;
    }
    PEAK_BANDS[PEAK_BANDS.len() - 1].max
}

/// Seed material for the tick-by-tick stream.
pub fn tick_material(secret: &str, game_id: &str) -> String {
    format!("{}-{}", secret, game_id)
}

/// Seed material for the peak draw.
///
/// Kept separate from the tick stream so the number of draws a tick consumes
/// can never shift the chosen peak.
pub fn peak_material(secret: &str, game_id: &str) -> String {
    format!("{}-{}-peak", secret, game_id)
}

/// Draw the predetermined peak for a game.
pub fn draw_peak(secret: &str, game_id: &str) -> f64 {
    let mut rng = SeededRng::from_material(&peak_material(secret, game_id));
    peak_from_unit(rng.next_f64())
}

/// Tunables for the crash walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashParams {
    /// Hard tick ceiling.
    pub max_ticks: u32,
    /// Rug checks are skipped while `tick <= warmup_ticks`.
    pub warmup_ticks: u32,
    /// Per-tick rug probability before the peak is reached.
    pub rug_before_peak: f64,
    /// Per-tick rug probability once the peak has been reached.
    pub rug_after_peak: f64,
    /// Chance of a god candle on a tick.
    pub god_candle_chance: f64,
    /// God candle multiplicative factor.
    pub god_candle_mult: f64,
    /// Chance of a big move on a tick.
    pub big_move_chance: f64,
    /// Big move magnitude lower bound.
    pub big_move_min: f64,
    /// Big move magnitude upper bound.
    pub big_move_max: f64,
    /// Drift lower bound.
    pub drift_min: f64,
    /// Drift upper bound.
    pub drift_max: f64,
    /// Chance a post-peak big move or god candle goes up.
    pub post_peak_up_chance: f64,
    /// Added to drift after the peak.
    pub post_peak_drift_bias: f64,
    /// Price never falls below this.
    pub price_floor: f64,
}

impl Default for CrashParams {
    fn default() -> Self {
        Self {
            max_ticks: 5000,
            warmup_ticks: 20,
            rug_before_peak: 0.005,
            rug_after_peak: 0.05,
            god_candle_chance: 0.002,
            god_candle_mult: 2.5,
            big_move_chance: 0.12,
            big_move_min: 0.08,
            big_move_max: 0.50,
            drift_min: -0.04,
            drift_max: 0.04,
            post_peak_up_chance: 0.4,
            post_peak_drift_bias: -0.01,
            price_floor: 0.5,
        }
    }
}

/// A single simulated price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    /// Tick index, starting at zero.
    pub tick: u32,
    /// Price (multiplier) after this tick.
    pub price: f64,
    /// Whether the predetermined peak had been hit by this tick.
    pub peak_reached: bool,
}

/// Final result of a crash game.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashOutcome {
    /// Predetermined peak (the price never exceeds it).
    pub peak_multiplier: f64,
    /// Price at the last produced tick.
    pub final_price: f64,
    /// Number of ticks produced.
    pub total_ticks: u32,
    /// True if the game ended on a rug rather than the tick ceiling.
    pub rugged: bool,
}

/// Why the engine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Rugged,
    TickCeiling,
}

/// Tick-by-tick crash simulation.
#[derive(Debug, Clone)]
pub struct CrashEngine {
    params: CrashParams,
    rng: SeededRng,
    peak: f64,
    price: f64,
    tick: u32,
    peak_reached: bool,
    ended: Option<Termination>,
}

impl CrashEngine {
    /// Create the engine for a game.
    pub fn new(secret: &str, game_id: &str, params: CrashParams) -> Self {
        Self::with_peak(secret, game_id, draw_peak(secret, game_id), params)
    }

    /// Engine with a fixed peak; tick randomness still comes from the seed.
    pub(crate) fn with_peak(secret: &str, game_id: &str, peak: f64, params: CrashParams) -> Self {
        Self {
            params,
            rng: SeededRng::from_material(&tick_material(secret, game_id)),
            peak,
            price: STARTING_PRICE,
            tick: 0,
            // A 1.0x peak is already reached before the first tick.
            peak_reached: STARTING_PRICE >= peak,
            ended: None,
        }
    }

    /// The predetermined peak.
    pub fn peak(&self) -> f64 {
        self.peak
    }

    /// Current price.
    pub fn price(&self) -> f64 {
        self.price
    }

    /// Ticks produced so far.
    pub fn ticks(&self) -> u32 {
        self.tick
    }

    /// True once `step` has returned `None`.
    pub fn is_finished(&self) -> bool {
        self.ended.is_some()
    }

    /// Advance one tick. Returns `None` once the game has ended.
    pub fn step(&mut self) -> Option<PricePoint> {
        if self.ended.is_some() {
            return None;
        }

        if self.tick >= self.params.max_ticks {
            self.ended = Some(Termination::TickCeiling);
            return None;
        }

        let rug_prob = if self.peak_reached {
            self.params.rug_after_peak
        } else {
            self.params.rug_before_peak
        };
        if self.tick > self.params.warmup_ticks && self.rng.chance(rug_prob) {
            self.ended = Some(Termination::Rugged);
            return None;
        }

        if self.peak_reached {
            self.move_after_peak();
        } else {
            self.move_before_peak();
        }

        let point = PricePoint {
            tick: self.tick,
            price: self.price,
            peak_reached: self.peak_reached,
        };
        self.tick += 1;
        Some(point)
    }

    /// Final outcome, available once the engine has finished.
    pub fn outcome(&self) -> Option<CrashOutcome> {
        let ended = self.ended?;
        Some(CrashOutcome {
            peak_multiplier: self.peak,
            final_price: self.price,
            total_ticks: self.tick,
            rugged: ended == Termination::Rugged,
        })
    }

    /// Run to completion.
    pub fn run_to_end(mut self) -> CrashOutcome {
        while self.step().is_some() {}
        CrashOutcome {
            peak_multiplier: self.peak,
            final_price: self.price,
            total_ticks: self.tick,
            rugged: self.ended == Some(Termination::Rugged),
        }
    }

    // Only upward moves; the clamp is what flips the peak flag.
    fn move_before_peak(&mut self) {
        let p = &self.params;
        let next = if self.rng.chance(p.god_candle_chance) {
            self.price * p.god_candle_mult
        } else if self.rng.chance(p.big_move_chance) {
            self.price * (1.0 + self.rng.next_range(p.big_move_min, p.big_move_max))
        } else {
            let drift = self.rng.next_range(0.0, p.drift_max);
            let change = (drift + self.noise()).max(0.0);
            self.price * (1.0 + change)
        };

        if next >= self.peak {
            self.price = self.peak;
            self.peak_reached = true;
        } else {
            self.price = next;
        }
    }

    fn move_after_peak(&mut self) {
        let p = &self.params;
        let next = if self.rng.chance(p.god_candle_chance) {
            if self.rng.chance(p.post_peak_up_chance) {
                self.price * p.god_candle_mult
            } else {
                self.price / p.god_candle_mult
            }
        } else if self.rng.chance(p.big_move_chance) {
            let magnitude = self.rng.next_range(p.big_move_min, p.big_move_max);
            if self.rng.chance(p.post_peak_up_chance) {
                self.price * (1.0 + magnitude)
            } else {
                self.price * (1.0 - magnitude)
            }
        } else {
            let drift = self.rng.next_range(p.drift_min, p.drift_max) + p.post_peak_drift_bias;
            self.price * (1.0 + drift + self.noise())
        };

        self.price = next.clamp(self.params.price_floor, self.peak);
    }

    fn noise(&mut self) -> f64 {
        let volatility = 0.015 * self.price.sqrt().min(15.0);
        volatility * (2.0 * self.rng.next_f64() - 1.0)
    }
}

/// Simulate a full crash game with default parameters.
pub fn simulate(secret: &str, game_id: &str) -> CrashOutcome {
    simulate_with(secret, game_id, CrashParams::default())
}

/// Simulate a full crash game.
pub fn simulate_with(secret: &str, game_id: &str, params: CrashParams) -> CrashOutcome {
    CrashEngine::new(secret, game_id, params).run_to_end()
}

/// Full price path, for replay views.
pub fn price_path(secret: &str, game_id: &str, params: CrashParams) -> Vec<PricePoint> {
    let mut engine = CrashEngine::new(secret, game_id, params);
    let mut path = Vec::new();
    while let Some(point) = engine.step() {
        path.push(point);
    }
    path
}

// =============================================================================
// TESTS
// =============================================================================
