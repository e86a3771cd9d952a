//! Session State
//!
//! Authoritative in-memory state shared by the game loops and request
//! handlers: live crash game, active bettors, finished-game history and
//! candleflip batches.
//!
//! Each structure sits behind its own `std::sync::RwLock`. Guards are never
//! held across an `.await`; publishing to the hub is a non-blocking channel
//! send, so the bettor registry publishes while still holding its guard
//! and subscribers see lists in mutation order.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::ring::HistoryRing;
use crate::game::candle::CandleGroup;
use crate::network::hub::{HubHandle, SnapshotSource};
use crate::network::protocol::{
    ActiveBettor, BatchSnapshot, CrashHistoryEntry, CrashPhase, CrashStateInfo,
    ErrorCode, RoomSummary, RoomStatus, ServerEvent, Topic,
};

/// Rejected player request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BetError {
    /// Address already holds a bet in this game.
    #[error("{0} already has an active bet")]
    DuplicateBet(String),

    /// Address has no bet to act on.
    #[error("{0} has no active bet")]
    NoActiveBet(String),

    /// Action not allowed in this phase.
    #[error("not allowed while game is {0:?}")]
    WrongPhase(CrashPhase),

    /// Field failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl BetError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            BetError::DuplicateBet(_) => ErrorCode::DuplicateBet,
            BetError::NoActiveBet(_) => ErrorCode::NoActiveBet,
            BetError::WrongPhase(_) => ErrorCode::WrongPhase,
            BetError::InvalidInput(_) => ErrorCode::InvalidInput,
        }
    }

    /// `error` event for the requesting client.
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::error(self.code(), self.to_string())
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// BETTOR REGISTRY
// =============================================================================

/// Bets in the current crash game, one per address, insertion ordered.
pub struct BettorRegistry {
    bettors: RwLock<Vec<ActiveBettor>>,
    hub: HubHandle,
}

impl BettorRegistry {
    /// Empty registry publishing to `hub`.
    pub fn new(hub: HubHandle) -> Self {
        Self {
            bettors: RwLock::new(Vec::new()),
            hub,
        }
    }

    fn publish(&self, bettors: &[ActiveBettor]) {
        self.hub
            .publish(Topic::Crash, &ServerEvent::active_bettors(bettors.to_vec()));
    }

    /// Add a bet. Rejects a second bet from the same address.
    pub fn add(
        &self,
        address: &str,
        bet_amount: f64,
        entry_multiplier: f64,
    ) -> Result<ActiveBettor, BetError> {
        let mut bettors = write(&self.bettors);
        if bettors.iter().any(|b| b.address.eq_ignore_ascii_case(address)) {
            return Err(BetError::DuplicateBet(address.to_string()));
        }
        let bettor = ActiveBettor {
            address: address.to_string(),
            bet_amount,
            entry_multiplier,
            bet_time: Utc::now(),
        };
        bettors.push(bettor.clone());
        debug!("Bettor {} added ({} active)", address, bettors.len());
        self.publish(&bettors);
        Ok(bettor)
    }

    /// Remove a bet, returning it.
    pub fn remove(&self, address: &str) -> Option<ActiveBettor> {
        let mut bettors = write(&self.bettors);
        let index = bettors
            .iter()
            .position(|b| b.address.eq_ignore_ascii_case(address))?;
        let removed = bettors.remove(index);
        self.publish(&bettors);
        Some(removed)
    }

    /// Drop every bet. Publishes only if something was cleared.
    pub fn clear_all(&self) -> Vec<ActiveBettor> {
        let mut bettors = write(&self.bettors);
        if bettors.is_empty() {
            return Vec::new();
        }
        let cleared = std::mem::take(&mut *bettors);
        self.publish(&bettors);
        cleared
    }

    /// Copy of the live bets.
    pub fn list_active(&self) -> Vec<ActiveBettor> {
        read(&self.bettors).clone()
    }

    /// Live bet for `address`.
    pub fn get(&self, address: &str) -> Option<ActiveBettor> {
        read(&self.bettors)
            .iter()
            .find(|b| b.address.eq_ignore_ascii_case(address))
            .cloned()
    }
}

// =============================================================================
// CRASH HISTORY & LIVE GAME
// =============================================================================

/// Recent finished crash games.
pub struct CrashHistory {
    ring: RwLock<HistoryRing<CrashHistoryEntry>>,
}

impl CrashHistory {
    /// Keep at most `capacity` games.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(HistoryRing::new(capacity)),
        }
    }

    /// Append a game, evicting the oldest when full.
    pub fn push(&self, entry: CrashHistoryEntry) {
        write(&self.ring).push(entry);
    }

    /// Append several games, oldest first.
    pub fn extend(&self, entries: Vec<CrashHistoryEntry>) {
        write(&self.ring).extend(entries);
    }

    /// Oldest first.
    pub fn to_vec(&self) -> Vec<CrashHistoryEntry> {
        read(&self.ring).to_vec()
    }
}

/// The one live crash game.
pub struct CrashLive {
    state: RwLock<CrashStateInfo>,
}

impl Default for CrashLive {
    fn default() -> Self {
        Self {
            state: RwLock::new(CrashStateInfo {
                phase: CrashPhase::Waiting,
                game_id: String::new(),
                server_seed_hash: String::new(),
                current_tick: 0,
                current_price: 1.0,
                previous_candles: Vec::new(),
                current_candle: None,
            }),
        }
    }
}

impl CrashLive {
    /// Enter countdown for a new game.
    pub fn begin(&self, game_id: &str, server_seed_hash: &str) {
        *write(&self.state) = CrashStateInfo {
            phase: CrashPhase::Countdown,
            game_id: game_id.to_string(),
            server_seed_hash: server_seed_hash.to_string(),
            current_tick: 0,
            current_price: 1.0,
            previous_candles: Vec::new(),
            current_candle: None,
        };
    }

    /// Change phase.
    pub fn set_phase(&self, phase: CrashPhase) {
        write(&self.state).phase = phase;
    }

    /// Record a tick along with the aggregator's candle view.
    pub fn record_tick(
        &self,
        tick: u32,
        price: f64,
        candles: Vec<CandleGroup>,
        current: Option<CandleGroup>,
    ) {
        let mut state = write(&self.state);
        state.current_tick = tick;
        state.current_price = price;
        state.previous_candles = candles;
        state.current_candle = current;
    }

    /// Replace the completed candles (after a merge or at game end).
    pub fn set_candles(&self, candles: Vec<CandleGroup>, current: Option<CandleGroup>) {
        let mut state = write(&self.state);
        state.previous_candles = candles;
        state.current_candle = current;
    }

    /// Copy of the live game.
    pub fn snapshot(&self) -> CrashStateInfo {
        read(&self.state).clone()
    }

    /// Current phase.
    pub fn phase(&self) -> CrashPhase {
        read(&self.state).phase
    }

    /// Read access for callers that must act on a consistent view.
    pub fn view(&self) -> RwLockReadGuard<'_, CrashStateInfo> {
        read(&self.state)
    }
}

// =============================================================================
// CANDLEFLIP BATCHES
// =============================================================================

struct BatchEntry {
    snapshot: BatchSnapshot,
    created_at: DateTime<Utc>,
}

/// Live candleflip batches by id.
#[derive(Default)]
pub struct BatchDirectory {
    batches: RwLock<BTreeMap<String, BatchEntry>>,
}

impl BatchDirectory {
    /// Track a new batch.
    pub fn insert(&self, snapshot: BatchSnapshot) {
        write(&self.batches).insert(
            snapshot.batch_id.clone(),
            BatchEntry {
                snapshot,
                created_at: Utc::now(),
            },
        );
    }

    /// Mutate a batch in place. Returns the updated copy.
    pub fn update<F>(&self, batch_id: &str, f: F) -> Option<BatchSnapshot>
    where
        F: FnOnce(&mut BatchSnapshot),
    {
        let mut batches = write(&self.batches);
        let entry = batches.get_mut(batch_id)?;
        f(&mut entry.snapshot);
        Some(entry.snapshot.clone())
    }

    /// Copy of one batch.
    pub fn get(&self, batch_id: &str) -> Option<BatchSnapshot> {
        read(&self.batches).get(batch_id).map(|e| e.snapshot.clone())
    }

    /// Stop tracking a batch.
    pub fn remove(&self, batch_id: &str) -> Option<BatchSnapshot> {
        write(&self.batches).remove(batch_id).map(|e| e.snapshot)
    }

    /// Number of live batches.
    pub fn len(&self) -> usize {
        read(&self.batches).len()
    }

    /// True if no batch is live.
    pub fn is_empty(&self) -> bool {
        read(&self.batches).is_empty()
    }

    /// Lobby lines, oldest batch first.
    pub fn summaries(&self) -> Vec<RoomSummary> {
        let batches = read(&self.batches);
        let mut rooms: Vec<RoomSummary> = batches
            .values()
            .map(|entry| {
                let s = &entry.snapshot;
                RoomSummary {
                    batch_id: s.batch_id.clone(),
                    player_address: s.player_address.clone(),
                    side: s.player_side,
                    amount_per_room: s.amount_per_room.clone(),
                    total_rooms: s.total_rooms,
                    completed_rooms: s
                        .rooms
                        .iter()
                        .filter(|r| r.status == RoomStatus::Completed)
                        .count() as u32,
                    won_rooms: s.won_rooms,
                    status: s.status,
                    created_at: entry.created_at,
                }
            })
            .collect();
        rooms.sort_by_key(|r| r.created_at);
        rooms
    }
}

// =============================================================================
// SESSION STORE
// =============================================================================

/// Everything a subscriber can be caught up on.
pub struct SessionStore {
    /// Live crash bets.
    pub bettors: BettorRegistry,
    /// Recent crash games.
    pub history: CrashHistory,
    /// Live crash game.
    pub live: CrashLive,
    /// Live candleflip batches.
    pub batches: BatchDirectory,
}

impl SessionStore {
    /// Empty store publishing to `hub`.
    pub fn new(hub: HubHandle, history_len: usize) -> Self {
        Self {
            bettors: BettorRegistry::new(hub),
            history: CrashHistory::new(history_len),
            live: CrashLive::default(),
            batches: BatchDirectory::default(),
        }
    }
}

impl SnapshotSource for SessionStore {
    fn snapshot(&self, topic: &Topic) -> Vec<ServerEvent> {
        match topic {
            Topic::Crash => vec![
                ServerEvent::CrashHistory {
                    history: self.history.to_vec(),
                },
                ServerEvent::active_bettors(self.bettors.list_active()),
                ServerEvent::CrashState(self.live.snapshot()),
            ],
            Topic::Rooms => vec![ServerEvent::RoomsUpdate {
                rooms: self.batches.summaries(),
            }],
            Topic::Room(id) => self
                .batches
                .get(id)
                .map(ServerEvent::BatchState)
                .into_iter()
                .collect(),
            Topic::Chat => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::candleflip::Side;
    use crate::network::hub::{Hub, HubConfig};
    use crate::network::protocol::{BatchStatus, RoomState};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn store() -> (Arc<SessionStore>, HubHandle) {
        let (hub, dispatcher) = Hub::new(HubConfig::default());
        let store = Arc::new(SessionStore::new(hub.clone(), 3));
        tokio::spawn(dispatcher.run(store.clone()));
        (store, hub)
    }

    fn batch(id: &str) -> BatchSnapshot {
        BatchSnapshot {
            batch_id: id.into(),
            player_address: "0xB".into(),
            amount_per_room: "100".into(),
            total_rooms: 2,
            player_side: Side::Bull,
            ai_side: Side::Bear,
            status: BatchStatus::Waiting,
            won_rooms: 0,
            payout_amount: None,
            payout_error: None,
            server_seed: None,
            server_seed_hash: "h".into(),
            rooms: (1..=2)
                .map(|n| RoomState {
                    room_number: n,
                    status: RoomStatus::Waiting,
                    final_price: None,
                    winner: None,
                    player_won: false,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_bettor_add_list_remove() {
        let (store, _hub) = store();
        store.bettors.add("0xA", 10.0, 2.0).unwrap();

        let active = store.bettors.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].address, "0xA");
        assert_eq!(active[0].bet_amount, 10.0);
        assert_eq!(active[0].entry_multiplier, 2.0);

        assert!(store.bettors.remove("0xA").is_some());
        assert!(store.bettors.list_active().is_empty());
        assert!(store.bettors.remove("0xA").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_bet_rejected() {
        let (store, _hub) = store();
        store.bettors.add("0xA", 1.0, 1.0).unwrap();
        let err = store.bettors.add("0xa", 2.0, 1.0).unwrap_err();
        assert_eq!(err, BetError::DuplicateBet("0xa".into()));
        assert_eq!(err.code(), ErrorCode::DuplicateBet);
    }

    #[tokio::test]
    async fn test_mutations_publish_full_list() {
        let (store, hub) = store();
        let (tx, mut rx) = mpsc::channel(32);
        hub.register(1, tx);
        hub.subscribe(1, Topic::Crash);
        hub.barrier().await;
        // Snapshot: history, bettors, state.
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        store.bettors.add("0xA", 1.0, 1.0).unwrap();
        store.bettors.add("0xB", 1.0, 1.0).unwrap();
        assert_eq!(store.bettors.clear_all().len(), 2);
        // Idempotent: nothing to clear, nothing published.
        assert!(store.bettors.clear_all().is_empty());
        hub.barrier().await;

        let counts: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| serde_json::from_str::<serde_json::Value>(&f).unwrap()["count"].as_u64().unwrap())
            .collect();
        assert_eq!(counts, vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn test_crash_snapshot_order() {
        let (store, _hub) = store();
        store.live.begin("g1", "hash");
        let events = store.snapshot(&Topic::Crash);
        assert!(matches!(events[0], ServerEvent::CrashHistory { .. }));
        assert!(matches!(events[1], ServerEvent::ActiveBettors { .. }));
        match &events[2] {
            ServerEvent::CrashState(state) => {
                assert_eq!(state.phase, CrashPhase::Countdown);
                assert_eq!(state.game_id, "g1");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(store.snapshot(&Topic::Chat).is_empty());
    }

    #[tokio::test]
    async fn test_history_bounded() {
        let (store, _hub) = store();
        for i in 0..5 {
            store.history.push(CrashHistoryEntry {
                game_id: i.to_string(),
                peak_multiplier: 1.0,
                rugged: true,
                candles: vec![],
                timestamp: Utc::now(),
                server_seed: None,
                server_seed_hash: None,
            });
        }
        let ids: Vec<String> = store.history.to_vec().into_iter().map(|h| h.game_id).collect();
        assert_eq!(ids, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_batch_directory() {
        let (store, _hub) = store();
        store.batches.insert(batch("b1"));
        assert!(store.snapshot(&Topic::room("missing")).is_empty());
        assert_eq!(store.snapshot(&Topic::room("b1")).len(), 1);

        let updated = store
            .batches
            .update("b1", |b| {
                b.rooms[0].status = RoomStatus::Completed;
                b.won_rooms = 1;
            })
            .unwrap();
        assert_eq!(updated.won_rooms, 1);

        let summaries = store.batches.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].completed_rooms, 1);

        assert!(store.batches.remove("b1").is_some());
        assert!(store.batches.is_empty());
    }
}
