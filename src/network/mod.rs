//! Network Layer
//!
//! WebSocket server, topic hub and the timed game loops.
//! This layer is **non-deterministic** (clock, sockets, OS entropy); every
//! game outcome is computed by `game/`.

pub mod protocol;
pub mod hub;
pub mod session;
pub mod service;
pub mod game_loop;
pub mod server;

pub use protocol::{ClientMessage, ServerEvent, Topic};
pub use hub::{Hub, HubConfig, HubDispatcher, HubHandle, SnapshotSource};
pub use session::{BetError, SessionStore};
pub use service::{AppContext, GameService};
pub use server::{GameServer, GameServerError};
