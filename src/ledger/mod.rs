//! External collaborators: durable records and payouts.
//!
//! The in-memory session state is authoritative. Everything here is a side
//! channel for audit and restart warm-up; calls run on their own tasks with
//! a deadline and failures are logged, never surfaced to players.

pub mod memory;
pub mod jsonl;
pub mod payout;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Serialize, Deserialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::game::candle::CandleGroup;
use crate::network::protocol::{ChatEntry, CrashHistoryEntry};

pub use memory::MemoryLedger;
pub use jsonl::JsonlLedger;
pub use payout::LoggingPayout;

/// Wei per native unit.
pub const WEI_PER_UNIT: f64 = 1e18;

/// Collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Call exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Collaborator refused the request.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Boxed future returned by collaborator calls.
pub type LedgerFuture<T> = BoxFuture<'static, Result<T, LedgerError>>;

/// Opaque payout transaction reference.
pub type TxHandle = String;

/// Durable record of a finished crash game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    /// Game id.
    pub game_id: String,
    /// Revealed secret.
    pub server_seed: String,
    /// Commitment.
    pub server_seed_hash: String,
    /// Predetermined peak.
    pub peak_multiplier: f64,
    /// Last price.
    pub final_price: f64,
    /// Ended on a rug.
    pub rugged: bool,
    /// Ticks produced.
    pub total_ticks: u32,
    /// Completed candles.
    pub candles: Vec<CandleGroup>,
    /// Completion time.
    pub timestamp: DateTime<Utc>,
}

impl GameRecord {
    /// History entry broadcast on `crash`.
    pub fn to_history_entry(&self) -> CrashHistoryEntry {
        CrashHistoryEntry {
            game_id: self.game_id.clone(),
            peak_multiplier: self.peak_multiplier,
            rugged: self.rugged,
            candles: self.candles.clone(),
            timestamp: self.timestamp,
            server_seed: Some(self.server_seed.clone()),
            server_seed_hash: Some(self.server_seed_hash.clone()),
        }
    }
}

/// Bet lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    /// Placed, game running.
    Active,
    /// Player cashed out.
    CashedOut,
    /// Game ended with the bet open.
    Lost,
}

/// Durable record of a crash bet event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetRecord {
    /// Game id.
    pub game_id: String,
    /// Bettor.
    pub player_address: String,
    /// Opaque user id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Stake.
    pub bet_amount: f64,
    /// Price when the bet was taken.
    pub entry_multiplier: f64,
    /// Server-side cashout multiplier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cashout_multiplier: Option<f64>,
    /// Amount paid, native units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout: Option<f64>,
    /// Lifecycle.
    pub status: BetStatus,
    /// Deposit transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    /// Event time.
    pub timestamp: DateTime<Utc>,
}

/// Append-only store for history, bets and chat.
pub trait Persistence: Send + Sync + 'static {
    /// Store a finished game.
    fn append_game_history(&self, record: GameRecord) -> LedgerFuture<()>;

    /// Most recent games, oldest first.
    fn recent_game_history(&self, limit: usize) -> LedgerFuture<Vec<GameRecord>>;

    /// Store a bet event.
    fn record_bet(&self, record: BetRecord) -> LedgerFuture<()>;

    /// Store a chat line.
    fn append_chat(&self, entry: ChatEntry) -> LedgerFuture<()>;

    /// Most recent chat lines, oldest first.
    fn recent_chat(&self, limit: usize) -> LedgerFuture<Vec<ChatEntry>>;
}

/// Sends winnings to a player.
pub trait Payout: Send + Sync + 'static {
    /// Pay `amount_wei` to `address`.
    fn pay_player(&self, address: &str, amount_wei: u128) -> LedgerFuture<TxHandle>;
}

/// Open the JSONL ledger at `dir`, or an in-memory one when there is no
/// directory or it cannot be opened. Startup never fails on persistence.
pub async fn open_persistence(dir: Option<&Path>) -> Arc<dyn Persistence> {
    let Some(dir) = dir else {
        info!("Ledger: in-memory");
        return Arc::new(MemoryLedger::new());
    };
    match JsonlLedger::open(dir).await {
        Ok(ledger) => {
            info!("Ledger: {}", dir.display());
            Arc::new(ledger)
        }
        Err(e) => {
            warn!("Cannot open ledger at {}: {}; falling back to in-memory", dir.display(), e);
            Arc::new(MemoryLedger::new())
        }
    }
}

/// Await a collaborator call with a deadline, logging any failure.
pub async fn run_side_effect<T, F>(name: &'static str, timeout: Duration, fut: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    let result = match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout(timeout)),
    };
    if let Err(e) = &result {
        warn!("{} failed: {}", name, e);
    }
    result
}

/// Fire-and-forget variant of [`run_side_effect`].
pub fn spawn_side_effect<T, F>(name: &'static str, timeout: Duration, fut: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Future<Output = Result<T, LedgerError>> + Send + 'static,
{
    tokio::spawn(async move {
        let _ = run_side_effect(name, timeout, fut).await;
    })
}

/// Convert a native amount to wei. Negative or non-finite amounts are zero.
pub fn to_wei(amount: f64) -> u128 {
    if !amount.is_finite() || amount <= 0.0 {
        return 0;
    }
    (amount * WEI_PER_UNIT).round() as u128
}

/// Convert wei to native units, for display.
pub fn from_wei(amount: u128) -> f64 {
    amount as f64 / WEI_PER_UNIT
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[test]
    fn test_wei_conversion() {
        assert_eq!(to_wei(1.0), 1_000_000_000_000_000_000);
        assert_eq!(to_wei(0.001), 1_000_000_000_000_000);
        assert_eq!(to_wei(-1.0), 0);
        assert_eq!(to_wei(f64::NAN), 0);
        assert!((from_wei(2_500_000_000_000_000_000) - 2.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_side_effect_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, LedgerError>(())
        };
        let result = run_side_effect("slow", Duration::from_millis(10), slow).await;
        assert!(matches!(result, Err(LedgerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_side_effect_passes_value() {
        let fast = async { Ok::<_, LedgerError>(7) }.boxed();
        let result = run_side_effect("fast", Duration::from_secs(1), fast).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_spawned_failure_is_contained() {
        let failing = async { Err::<(), _>(LedgerError::Rejected("down".into())) };
        let handle = spawn_side_effect("failing", Duration::from_secs(1), failing);
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_unopenable_ledger_falls_back_to_memory() {
        let blocker = std::env::temp_dir().join(format!("rugpull-blocker-{}", uuid::Uuid::new_v4()));
        std::fs::write(&blocker, b"not a directory").unwrap();

        let persistence = open_persistence(Some(&blocker.join("ledger"))).await;
        let entry = ChatEntry {
            player_address: "0xA".into(),
            message: "gm".into(),
            timestamp: Utc::now(),
        };
        persistence.append_chat(entry).await.unwrap();
        let chat = persistence.recent_chat(10).await.unwrap();
        assert_eq!(chat.len(), 1);

        let none = open_persistence(None).await;
        assert!(none.recent_game_history(5).await.unwrap().is_empty());

        std::fs::remove_file(&blocker).unwrap();
    }

    #[test]
    fn test_history_entry_from_record() {
        let record = GameRecord {
            game_id: "g1".into(),
            server_seed: "ab".into(),
            server_seed_hash: "cd".into(),
            peak_multiplier: 2.0,
            final_price: 1.5,
            rugged: true,
            total_ticks: 40,
            candles: vec![],
            timestamp: Utc::now(),
        };
        let entry = record.to_history_entry();
        assert_eq!(entry.game_id, "g1");
        assert_eq!(entry.server_seed.as_deref(), Some("ab"));
        assert!(entry.rugged);
    }
}
