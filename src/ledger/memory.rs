//! In-process ledger. Default backend and test double.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use futures_util::future::ready;

use super::{BetRecord, GameRecord, LedgerError, LedgerFuture, Persistence};
use crate::network::protocol::ChatEntry;

#[derive(Debug, Default)]
struct MemoryState {
    games: Vec<GameRecord>,
    bets: Vec<BetRecord>,
    chat: Vec<ChatEntry>,
}

/// Ledger that keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<MemoryState>>,
    failing: Arc<AtomicBool>,
}

impl MemoryLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, for degraded-mode tests.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All stored bet records.
    pub fn bets(&self) -> Vec<BetRecord> {
        self.with_state(|s| s.bets.clone()).unwrap_or_default()
    }

    /// All stored games.
    pub fn games(&self) -> Vec<GameRecord> {
        self.with_state(|s| s.games.clone()).unwrap_or_default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T, LedgerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LedgerError::Rejected("memory ledger set to fail".into()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| LedgerError::Rejected("memory ledger poisoned".into()))?;
        Ok(f(&mut state))
    }
}

fn tail<T: Clone>(items: &[T], limit: usize) -> Vec<T> {
    items[items.len().saturating_sub(limit)..].to_vec()
}

impl Persistence for MemoryLedger {
    fn append_game_history(&self, record: GameRecord) -> LedgerFuture<()> {
        ready(self.with_state(|s| s.games.push(record))).boxed()
    }

    fn recent_game_history(&self, limit: usize) -> LedgerFuture<Vec<GameRecord>> {
        ready(self.with_state(|s| tail(&s.games, limit))).boxed()
    }

    fn record_bet(&self, record: BetRecord) -> LedgerFuture<()> {
        ready(self.with_state(|s| s.bets.push(record))).boxed()
    }

    fn append_chat(&self, entry: ChatEntry) -> LedgerFuture<()> {
        ready(self.with_state(|s| s.chat.push(entry))).boxed()
    }

    fn recent_chat(&self, limit: usize) -> LedgerFuture<Vec<ChatEntry>> {
        ready(self.with_state(|s| tail(&s.chat, limit))).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chat(message: &str) -> ChatEntry {
        ChatEntry {
            player_address: "0xA".into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_recent_chat_is_tail_in_order() {
        let ledger = MemoryLedger::new();
        for m in ["a", "b", "c", "d"] {
            ledger.append_chat(chat(m)).await.unwrap();
        }
        let recent: Vec<String> = ledger
            .recent_chat(3)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.message)
            .collect();
        assert_eq!(recent, vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let ledger = MemoryLedger::new();
        ledger.set_failing(true);
        assert!(ledger.append_chat(chat("x")).await.is_err());
        ledger.set_failing(false);
        assert!(ledger.recent_chat(10).await.unwrap().is_empty());
    }
}
