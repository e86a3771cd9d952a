//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Inbound frames are `{type, data}` envelopes; outbound events are flat
//! `{type, ...fields}` objects. Everything is JSON.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::game::candle::CandleGroup;
use crate::game::candleflip::Side;

// =============================================================================
// TOPICS
// =============================================================================

/// A broadcast channel a connection can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Live crash game.
    Crash,
    /// Global chat.
    Chat,
    /// Candleflip lobby.
    Rooms,
    /// One candleflip batch, by id.
    Room(String),
}

impl Topic {
    /// Per-batch spectator topic.
    pub fn room(batch_id: impl Into<String>) -> Self {
        Topic::Room(batch_id.into())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Crash => write!(f, "crash"),
            Topic::Chat => write!(f, "chat"),
            Topic::Rooms => write!(f, "rooms"),
            Topic::Room(id) => write!(f, "room:{}", id),
        }
    }
}

impl FromStr for Topic {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crash" => Ok(Topic::Crash),
            "chat" => Ok(Topic::Chat),
            "rooms" => Ok(Topic::Rooms),
            other => match other.strip_prefix("room:") {
                Some(id) if !id.is_empty() => Ok(Topic::Room(id.to_string())),
                _ => Err(ProtocolError::UnknownTopic(other.to_string())),
            },
        }
    }
}

/// Protocol-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame did not parse.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Topic name not recognised.
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving a topic.
    Subscribe(ChannelRequest),
    /// Stop receiving a topic.
    Unsubscribe(ChannelRequest),
    /// Post to global chat.
    ChatMessage(ChatRequest),
    /// Bet on the current crash game.
    CrashBetPlaced(BetRequest),
    /// Cash out of the current crash game.
    CrashCashout(CashoutRequest),
    /// Open a candleflip batch.
    CreateBatch(CreateBatchRequest),
    /// Spectate one candleflip batch.
    JoinRoom(JoinRoomRequest),
    /// Re-derive a finished crash game from its revealed seed.
    VerifyGame(VerifyRequest),
    /// Liveness check.
    Ping,
}

/// Topic name carried by subscribe / unsubscribe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRequest {
    /// Topic name, e.g. `crash` or `room:<id>`.
    pub channel: String,
}

/// Chat post.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Message text.
    pub message: String,
    /// Sender; falls back to the connection id.
    #[serde(default)]
    pub player_address: Option<String>,
}

/// Crash bet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetRequest {
    /// Bettor address.
    pub player_address: String,
    /// Stake in native units.
    pub bet_amount: f64,
    /// Game the client thinks it is betting on.
    #[serde(default)]
    pub game_id: Option<String>,
    /// Opaque user id for the audit record.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Deposit transaction, if any.
    #[serde(default)]
    pub transaction_hash: Option<String>,
}

/// Crash cashout. Any client-side multiplier is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashoutRequest {
    /// Bettor address.
    pub player_address: String,
    /// Game the client thinks it is cashing out of.
    #[serde(default)]
    pub game_id: Option<String>,
}

/// Candleflip batch creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBatchRequest {
    /// Player address.
    pub address: String,
    /// Number of rooms.
    pub room_count: u32,
    /// Stake per room in wei, as a decimal string.
    pub amount_per_room: String,
    /// `bull` or `bear`.
    pub side: String,
}

/// Spectate request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    /// Batch id.
    pub room_id: String,
}

/// Verification request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// Revealed secret (hex).
    pub server_seed: String,
    /// Commitment published before the game.
    pub server_seed_hash: String,
    /// Game id.
    pub game_id: String,
}

// =============================================================================
// SHARED WIRE TYPES
// =============================================================================

/// Crash game lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashPhase {
    /// Between games.
    Waiting,
    /// Accepting bets before the first tick.
    Countdown,
    /// Price is moving.
    Running,
    /// Game over.
    Crashed,
}

/// A live crash bet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveBettor {
    /// Bettor address.
    pub address: String,
    /// Stake in native units.
    pub bet_amount: f64,
    /// Price when the bet was taken.
    pub entry_multiplier: f64,
    /// When the bet was taken.
    pub bet_time: DateTime<Utc>,
}

/// One finished crash game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashHistoryEntry {
    /// Game id.
    pub game_id: String,
    /// Predetermined peak.
    pub peak_multiplier: f64,
    /// Ended on a rug.
    pub rugged: bool,
    /// Completed candles.
    pub candles: Vec<CandleGroup>,
    /// Completion time.
    pub timestamp: DateTime<Utc>,
    /// Revealed secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_seed: Option<String>,
    /// Commitment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_seed_hash: Option<String>,
}

/// A chat line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    /// Sender.
    pub player_address: String,
    /// Text.
    pub message: String,
    /// Server receive time.
    pub timestamp: DateTime<Utc>,
}

/// Candleflip batch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created, not yet started.
    Waiting,
    /// Rooms running.
    Running,
    /// All rooms done, payout pending.
    Completed,
    /// Payout attempted.
    Paid,
}

/// Candleflip room lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    /// Not started.
    Waiting,
    /// Ticking.
    Running,
    /// Settled.
    Completed,
}

/// One room inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    /// One-based room number.
    pub room_number: u32,
    /// Lifecycle.
    pub status: RoomStatus,
    /// Final price once settled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_price: Option<f64>,
    /// Winner once settled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<Side>,
    /// Player won this room.
    pub player_won: bool,
}

/// Full view of a batch, sent to `room:{id}` subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSnapshot {
    /// Batch id.
    pub batch_id: String,
    /// Player address.
    pub player_address: String,
    /// Stake per room (wei).
    pub amount_per_room: String,
    /// Room count.
    pub total_rooms: u32,
    /// Player's side.
    pub player_side: Side,
    /// House side.
    pub ai_side: Side,
    /// Lifecycle.
    pub status: BatchStatus,
    /// Rooms won so far.
    pub won_rooms: u32,
    /// Payout (wei) once computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout_amount: Option<String>,
    /// Payout failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout_error: Option<String>,
    /// Revealed only once every room is settled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_seed: Option<String>,
    /// Commitment.
    pub server_seed_hash: String,
    /// Rooms in order.
    pub rooms: Vec<RoomState>,
}

/// Lobby line for one batch, sent on `rooms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    /// Batch id.
    pub batch_id: String,
    /// Player address.
    pub player_address: String,
    /// Player's side.
    pub side: Side,
    /// Stake per room (wei).
    pub amount_per_room: String,
    /// Room count.
    pub total_rooms: u32,
    /// Rooms settled.
    pub completed_rooms: u32,
    /// Rooms won.
    pub won_rooms: u32,
    /// Lifecycle.
    pub status: BatchStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Request fields failed validation.
    InvalidInput,
    /// Not allowed in the current game phase.
    WrongPhase,
    /// Address already has a bet in this game.
    DuplicateBet,
    /// No bet to cash out.
    NoActiveBet,
    /// Unknown topic or room.
    NotFound,
    /// Server is at its connection cap.
    ServerFull,
    /// Internal server error.
    InternalError,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Events sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A crash game entered countdown.
    GameStart(GameStartInfo),
    /// Seconds left before the first tick.
    Countdown(CountdownInfo),
    /// Crash tick.
    PriceUpdate(PriceUpdate),
    /// Crash game over; seed revealed.
    GameEnd(GameEndInfo),
    /// Recent crash games.
    CrashHistory {
        /// Oldest first.
        history: Vec<CrashHistoryEntry>,
    },
    /// Live bets in the current crash game.
    ActiveBettors {
        /// Bettors in insertion order.
        bettors: Vec<ActiveBettor>,
        /// `bettors.len()`.
        count: usize,
    },
    /// Current crash game, for late joiners.
    CrashState(CrashStateInfo),
    /// Chat line.
    ChatMessage(ChatEntry),
    /// Candleflip lobby.
    RoomsUpdate {
        /// One line per live batch.
        rooms: Vec<RoomSummary>,
    },
    /// Reply to `create_batch`.
    BatchCreated {
        /// New batch id.
        #[serde(rename = "batchId")]
        batch_id: String,
    },
    /// Batch about to run.
    BatchStart(BatchStartInfo),
    /// Full batch view, for late joiners.
    BatchState(BatchSnapshot),
    /// Room started ticking.
    RoomStart(RoomRef),
    /// Candleflip tick.
    RoomPriceUpdate(RoomPriceUpdate),
    /// Room settled.
    RoomEnd(RoomEndInfo),
    /// All rooms settled; seed revealed.
    BatchEnd(BatchEndInfo),
    /// Reply to `crash_bet_placed`.
    BetAccepted(ActiveBettor),
    /// Reply to `crash_cashout`.
    CashoutResult(CashoutInfo),
    /// A payout could not be sent.
    PayoutFailed(PayoutFailure),
    /// Reply to `verify_game`.
    VerifyResult(VerifyOutcome),
    /// Request rejected.
    Error(ServerError),
    /// Reply to `ping`.
    Pong {
        /// Server time (unix ms).
        #[serde(rename = "serverTime")]
        server_time: i64,
    },
}

/// Crash game announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStartInfo {
    /// Game id.
    pub game_id: String,
    /// Commitment for this game.
    pub server_seed_hash: String,
    /// Countdown length.
    pub countdown_secs: u64,
}

/// Countdown step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountdownInfo {
    /// Game id.
    pub game_id: String,
    /// Seconds left.
    pub seconds: u64,
}

/// Crash tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    /// Game id.
    pub game_id: String,
    /// Tick index.
    pub tick: u32,
    /// Current price.
    pub price: f64,
    /// Same as `price`; kept for clients that read the multiplier field.
    pub multiplier: f64,
    /// Always false on ticks.
    pub game_ended: bool,
    /// Completed candles.
    pub previous_candles: Vec<CandleGroup>,
    /// In-progress candle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_candle: Option<CandleGroup>,
}

/// Crash game result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEndInfo {
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
    /// All candles of the game.
    pub previous_candles: Vec<CandleGroup>,
}

/// Snapshot of the live crash game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashStateInfo {
    /// Lifecycle.
    pub phase: CrashPhase,
    /// Game id, empty while waiting.
    pub game_id: String,
    /// Commitment.
    pub server_seed_hash: String,
    /// Last tick.
    pub current_tick: u32,
    /// Last price.
    pub current_price: f64,
    /// Completed candles.
    pub previous_candles: Vec<CandleGroup>,
    /// In-progress candle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_candle: Option<CandleGroup>,
}

/// Batch announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStartInfo {
    /// Batch id.
    pub batch_id: String,
    /// Player address.
    pub player_address: String,
    /// Room count.
    pub total_rooms: u32,
    /// Stake per room (wei).
    pub amount_per_room: String,
    /// Player's side.
    pub player_side: Side,
    /// House side.
    pub ai_side: Side,
    /// Commitment.
    pub server_seed_hash: String,
}

/// Identifies a room within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    /// Batch id.
    pub batch_id: String,
    /// One-based room number.
    pub room_number: u32,
}

/// Candleflip tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPriceUpdate {
    /// Batch id.
    pub batch_id: String,
    /// One-based room number.
    pub room_number: u32,
    /// One-based tick.
    pub tick: u32,
    /// Price, rounded for display.
    pub price: f64,
    /// Ticks per room.
    pub total_ticks: u32,
}

/// Room settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomEndInfo {
    /// Batch id.
    pub batch_id: String,
    /// One-based room number.
    pub room_number: u32,
    /// Final price, rounded for display.
    pub final_price: f64,
    /// Winning side.
    pub winner: Side,
    /// Player won.
    pub player_won: bool,
}

/// Batch settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEndInfo {
    /// Batch id.
    pub batch_id: String,
    /// Room count.
    pub total_rooms: u32,
    /// Rooms won.
    pub won_rooms: u32,
    /// Revealed secret.
    pub server_seed: String,
    /// Payout (wei).
    pub payout_amount: String,
}

/// Cashout acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashoutInfo {
    /// Always true; failures are sent as `error`.
    pub success: bool,
    /// Bettor.
    pub player_address: String,
    /// Game id.
    pub game_id: String,
    /// Server-side multiplier (current / entry).
    pub multiplier: f64,
    /// Payout in native units.
    pub payout: f64,
}

/// Payout failure notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutFailure {
    /// Batch id for candleflip payouts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Payee.
    pub player_address: String,
    /// Reason.
    pub error: String,
}

/// Verification reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    /// Commitment matched.
    pub valid: bool,
    /// Game id.
    pub game_id: String,
    /// Replayed peak.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_multiplier: Option<f64>,
    /// Replayed final price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_price: Option<f64>,
    /// Replayed tick count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_ticks: Option<u32>,
    /// Replayed rug flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rugged: Option<bool>,
    /// Why verification failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Server error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerEvent {
    /// Build an `error` event.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error(ServerError {
            code,
            message: message.into(),
        })
    }

    /// Build an `active_bettors` event.
    pub fn active_bettors(bettors: Vec<ActiveBettor>) -> Self {
        let count = bettors.len();
        ServerEvent::ActiveBettors { bettors, count }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }
}

impl ServerEvent {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
