//! Append-only JSON-lines ledger.
//!
//! One file per record kind under a directory. Survives restarts, which is
//! what lets the server warm its crash history and chat backlog at boot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{BetRecord, GameRecord, LedgerError, LedgerFuture, Persistence};
use crate::network::protocol::ChatEntry;

const GAMES_FILE: &str = "games.jsonl";
const BETS_FILE: &str = "bets.jsonl";
const CHAT_FILE: &str = "chat.jsonl";

/// Ledger backed by `.jsonl` files.
#[derive(Debug, Clone)]
pub struct JsonlLedger {
    dir: Arc<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl JsonlLedger {
    /// Open (creating if needed) a ledger directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        debug!("JSON-lines ledger at {}", dir.display());
        Ok(Self {
            dir: Arc::new(dir),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn append<T: Serialize>(&self, file: &'static str, record: &T) -> LedgerFuture<()> {
        let line = serde_json::to_string(record);
        let path = self.path(file);
        let lock = self.write_lock.clone();
        async move {
            let mut line = line?;
            line.push('\n');
            let _guard = lock.lock().await;
            let mut handle = OpenOptions::new().create(true).append(true).open(&path).await?;
            handle.write_all(line.as_bytes()).await?;
            handle.flush().await?;
            Ok::<(), LedgerError>(())
        }
        .boxed()
    }

    fn tail<T>(&self, file: &'static str, limit: usize) -> LedgerFuture<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let path = self.path(file);
        async move {
            let text = match fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(LedgerError::Io(e)),
            };
            let mut records: Vec<T> = Vec::new();
            for (n, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str(line) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Skipping bad line {} in {}: {}", n + 1, path.display(), e),
                }
            }
            let skip = records.len().saturating_sub(limit);
            Ok::<Vec<T>, LedgerError>(records.into_iter().skip(skip).collect())
        }
        .boxed()
    }
}

impl Persistence for JsonlLedger {
    fn append_game_history(&self, record: GameRecord) -> LedgerFuture<()> {
        self.append(GAMES_FILE, &record)
    }

    fn recent_game_history(&self, limit: usize) -> LedgerFuture<Vec<GameRecord>> {
        self.tail(GAMES_FILE, limit)
    }

    fn record_bet(&self, record: BetRecord) -> LedgerFuture<()> {
        self.append(BETS_FILE, &record)
    }

    fn append_chat(&self, entry: ChatEntry) -> LedgerFuture<()> {
        self.append(CHAT_FILE, &entry)
    }

    fn recent_chat(&self, limit: usize) -> LedgerFuture<Vec<ChatEntry>> {
        self.tail(CHAT_FILE, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("rugpull-ledger-{}", uuid::Uuid::new_v4()))
    }

    fn game(id: &str) -> GameRecord {
        GameRecord {
            game_id: id.into(),
            server_seed: "00".into(),
            server_seed_hash: "11".into(),
            peak_multiplier: 1.5,
            final_price: 1.2,
            rugged: true,
            total_ticks: 30,
            candles: vec![],
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = scratch_dir();
        {
            let ledger = JsonlLedger::open(&dir).await.unwrap();
            for id in ["1", "2", "3"] {
                ledger.append_game_history(game(id)).await.unwrap();
            }
        }

        let reopened = JsonlLedger::open(&dir).await.unwrap();
        let recent = reopened.recent_game_history(2).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|g| g.game_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_and_bad_lines_skipped() {
        let dir = scratch_dir();
        let ledger = JsonlLedger::open(&dir).await.unwrap();
        assert!(ledger.recent_chat(10).await.unwrap().is_empty());

        ledger
            .append_chat(ChatEntry {
                player_address: "0xA".into(),
                message: "gm".into(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        std::fs::write(
            dir.join(CHAT_FILE),
            format!("{}not json\n", std::fs::read_to_string(dir.join(CHAT_FILE)).unwrap()),
        )
        .unwrap();

        let chat = ledger.recent_chat(10).await.unwrap();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].message, "gm");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
