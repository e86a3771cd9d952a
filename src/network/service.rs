//! Application context and player-facing operations.
//!
//! `AppContext` is the one place the hub, session state, collaborators and
//! configuration live; it is built once and shared by `Arc`. `GameService`
//! is the request-handler surface: the websocket handlers call it, and so
//! can any other front end.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::core::seed::GameSeed;
use crate::game::candleflip::Side;
use crate::game::verify;
use crate::ledger::{
    self, BetRecord, BetStatus, Payout, Persistence, to_wei,
};
use crate::network::game_loop;
use crate::network::hub::{Hub, HubDispatcher, HubHandle};
use crate::network::protocol::{
    ActiveBettor, BatchSnapshot, BatchStartInfo, BatchStatus, BetRequest, CashoutInfo,
    CashoutRequest, ChatEntry, ChatRequest, CrashPhase, CreateBatchRequest, RoomState,
    RoomStatus, ServerEvent, Topic, VerifyOutcome, VerifyRequest,
};
use crate::network::session::{BetError, SessionStore};

/// Longest accepted chat line, in characters.
pub const MAX_CHAT_LEN: usize = 500;

/// Shared application state.
pub struct AppContext {
    /// Configuration.
    pub config: ServerConfig,
    /// Event hub.
    pub hub: HubHandle,
    /// Authoritative session state.
    pub store: Arc<SessionStore>,
    /// Durable records.
    pub persistence: Arc<dyn Persistence>,
    /// Payout backend.
    pub payout: Arc<dyn Payout>,
}

impl AppContext {
    /// Build the context and the hub dispatcher that must be run for it.
    pub fn build(
        config: ServerConfig,
        persistence: Arc<dyn Persistence>,
        payout: Arc<dyn Payout>,
    ) -> (Arc<Self>, HubDispatcher) {
        let (hub, dispatcher) = Hub::new(config.hub_config());
        let store = Arc::new(SessionStore::new(hub.clone(), config.crash.history_len));
        let ctx = Arc::new(Self {
            config,
            hub,
            store,
            persistence,
            payout,
        });
        (ctx, dispatcher)
    }

    /// Build the context and spawn its hub dispatcher.
    pub fn start(
        config: ServerConfig,
        persistence: Arc<dyn Persistence>,
        payout: Arc<dyn Payout>,
    ) -> Arc<Self> {
        let (ctx, dispatcher) = Self::build(config, persistence, payout);
        tokio::spawn(dispatcher.run(ctx.store.clone()));
        ctx
    }

    /// Load recent crash history and chat from persistence.
    ///
    /// A failing store leaves both empty; startup continues.
    pub async fn warm_up(&self) {
        let timeout = self.config.side_effect_timeout;

        let history = ledger::run_side_effect(
            "recent_game_history",
            timeout,
            self.persistence.recent_game_history(self.config.crash.history_len),
        )
        .await;
        if let Ok(records) = history {
            info!("Loaded {} crash games from ledger", records.len());
            self.store
                .history
                .extend(records.iter().map(|r| r.to_history_entry()).collect());
        }

        let chat = ledger::run_side_effect(
            "recent_chat",
            timeout,
            self.persistence.recent_chat(self.config.chat_history),
        )
        .await;
        if let Ok(entries) = chat {
            info!("Loaded {} chat messages from ledger", entries.len());
            let events: Vec<ServerEvent> = entries.into_iter().map(ServerEvent::ChatMessage).collect();
            self.hub.preload(Topic::Chat, &events);
        }
    }
}

/// Player-facing operations.
#[derive(Clone)]
pub struct GameService {
    ctx: Arc<AppContext>,
}

impl GameService {
    /// Wrap a context.
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Underlying context.
    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Take a crash bet.
    ///
    /// Accepted during countdown (entry 1.0) or while running (entry is the
    /// current server price).
    pub fn place_crash_bet(&self, req: BetRequest) -> Result<ActiveBettor, BetError> {
        let crash = &self.ctx.config.crash;
        let address = req.player_address.trim();
        if address.is_empty() {
            return Err(BetError::InvalidInput("playerAddress is required".into()));
        }
        if !req.bet_amount.is_finite() || req.bet_amount < crash.min_bet || req.bet_amount > crash.max_bet {
            return Err(BetError::InvalidInput(format!(
                "betAmount must be between {} and {}",
                crash.min_bet, crash.max_bet
            )));
        }

        let (bettor, game_id) = {
            let live = self.ctx.store.live.view();
            let entry = match live.phase {
                CrashPhase::Countdown => 1.0,
                CrashPhase::Running => live.current_price,
                phase => return Err(BetError::WrongPhase(phase)),
            };
            if let Some(game_id) = &req.game_id {
                if *game_id != live.game_id {
                    return Err(BetError::InvalidInput(format!("game {} is not live", game_id)));
                }
            }
            // Added under the live guard so the loop cannot end the game in between.
            let bettor = self.ctx.store.bettors.add(address, req.bet_amount, entry)?;
            (bettor, live.game_id.clone())
        };

        info!(
            address,
            amount = bettor.bet_amount,
            entry = bettor.entry_multiplier,
            game_id = %game_id,
            "Crash bet placed"
        );
        ledger::spawn_side_effect(
            "record_bet",
            self.ctx.config.side_effect_timeout,
            self.ctx.persistence.record_bet(BetRecord {
                game_id,
                player_address: bettor.address.clone(),
                user_id: req.user_id,
                bet_amount: bettor.bet_amount,
                entry_multiplier: bettor.entry_multiplier,
                cashout_multiplier: None,
                payout: None,
                status: BetStatus::Active,
                transaction_hash: req.transaction_hash,
                timestamp: bettor.bet_time,
            }),
        );
        Ok(bettor)
    }

    /// Cash out a crash bet at the current server price.
    ///
    /// The acknowledgement does not wait for the payout; a failed payout is
    /// logged and the ledger stays authoritative.
    pub fn cash_out(&self, req: CashoutRequest) -> Result<CashoutInfo, BetError> {
        let address = req.player_address.trim();
        let (bettor, price, game_id) = {
            let live = self.ctx.store.live.view();
            if live.phase != CrashPhase::Running {
                return Err(BetError::WrongPhase(live.phase));
            }
            let bettor = self
                .ctx
                .store
                .bettors
                .remove(address)
                .ok_or_else(|| BetError::NoActiveBet(address.to_string()))?;
            (bettor, live.current_price, live.game_id.clone())
        };

        let multiplier = if bettor.entry_multiplier > 0.0 {
            price / bettor.entry_multiplier
        } else {
            price
        };
        let payout = bettor.bet_amount * multiplier;
        info!(address, multiplier, payout, game_id = %game_id, "Crash cashout");

        let timeout = self.ctx.config.side_effect_timeout;
        ledger::spawn_side_effect(
            "record_bet",
            timeout,
            self.ctx.persistence.record_bet(BetRecord {
                game_id: game_id.clone(),
                player_address: bettor.address.clone(),
                user_id: None,
                bet_amount: bettor.bet_amount,
                entry_multiplier: bettor.entry_multiplier,
                cashout_multiplier: Some(multiplier),
                payout: Some(payout),
                status: BetStatus::CashedOut,
                transaction_hash: None,
                timestamp: Utc::now(),
            }),
        );
        ledger::spawn_side_effect(
            "pay_player",
            self.ctx.config.payout_timeout,
            self.ctx.payout.pay_player(&bettor.address, to_wei(payout)),
        );

        Ok(CashoutInfo {
            success: true,
            player_address: bettor.address,
            game_id,
            multiplier,
            payout,
        })
    }

    /// Post to global chat. `fallback_sender` is used when no address is given.
    pub fn post_chat(&self, fallback_sender: &str, req: ChatRequest) -> Result<ChatEntry, BetError> {
        let message = req.message.trim();
        if message.is_empty() {
            return Err(BetError::InvalidInput("message is empty".into()));
        }
        if message.chars().count() > MAX_CHAT_LEN {
            return Err(BetError::InvalidInput(format!(
                "message longer than {} characters",
                MAX_CHAT_LEN
            )));
        }
        let player_address = req
            .player_address
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| fallback_sender.to_string());

        let entry = ChatEntry {
            player_address,
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        self.ctx
            .hub
            .publish(Topic::Chat, &ServerEvent::ChatMessage(entry.clone()));
        ledger::spawn_side_effect(
            "append_chat",
            self.ctx.config.side_effect_timeout,
            self.ctx.persistence.append_chat(entry.clone()),
        );
        Ok(entry)
    }

    /// Open a candleflip batch and start running it. Returns the batch id.
    pub fn create_batch(&self, req: CreateBatchRequest) -> Result<String, BetError> {
        let max_rooms = self.ctx.config.candleflip.max_rooms;
        let address = req.address.trim().to_string();
        if address.is_empty() {
            return Err(BetError::InvalidInput("address is required".into()));
        }
        if req.room_count == 0 || req.room_count > max_rooms {
            return Err(BetError::InvalidInput(format!(
                "roomCount must be between 1 and {}",
                max_rooms
            )));
        }
        let amount_per_room: u128 = req
            .amount_per_room
            .trim()
            .parse()
            .ok()
            .filter(|a| *a > 0)
            .ok_or_else(|| BetError::InvalidInput("amountPerRoom must be a positive wei amount".into()))?;
        let side: Side = req.side.parse().map_err(BetError::InvalidInput)?;

        let seed = GameSeed::generate();
        let batch_id = Uuid::new_v4().to_string();

        self.ctx.store.batches.insert(BatchSnapshot {
            batch_id: batch_id.clone(),
            player_address: address.clone(),
            amount_per_room: amount_per_room.to_string(),
            total_rooms: req.room_count,
            player_side: side,
            ai_side: side.opposite(),
            status: BatchStatus::Waiting,
            won_rooms: 0,
            payout_amount: None,
            payout_error: None,
            server_seed: None,
            server_seed_hash: seed.public_hash().to_string(),
            rooms: (1..=req.room_count)
                .map(|n| RoomState {
                    room_number: n,
                    status: RoomStatus::Waiting,
                    final_price: None,
                    winner: None,
                    player_won: false,
                })
                .collect(),
        });

        let start = ServerEvent::BatchStart(BatchStartInfo {
            batch_id: batch_id.clone(),
            player_address: address.clone(),
            total_rooms: req.room_count,
            amount_per_room: amount_per_room.to_string(),
            player_side: side,
            ai_side: side.opposite(),
            server_seed_hash: seed.public_hash().to_string(),
        });
        self.ctx.hub.publish(Topic::Rooms, &start);
        self.ctx.hub.publish(Topic::room(batch_id.clone()), &start);

        info!(
            batch_id = %batch_id,
            address = %address,
            rooms = req.room_count,
            side = %side,
            "Candleflip batch created"
        );
        tokio::spawn(game_loop::run_batch(self.ctx.clone(), batch_id.clone(), seed));
        Ok(batch_id)
    }

    /// Check a revealed crash seed and replay the game.
    pub fn verify_game(&self, req: VerifyRequest) -> VerifyOutcome {
        match verify::verify_crash_with(
            &req.server_seed,
            &req.server_seed_hash,
            &req.game_id,
            self.ctx.config.crash.params.clone(),
        ) {
            Ok(outcome) => VerifyOutcome {
                valid: true,
                game_id: req.game_id,
                peak_multiplier: Some(outcome.peak_multiplier),
                final_price: Some(outcome.final_price),
                total_ticks: Some(outcome.total_ticks),
                rugged: Some(outcome.rugged),
                error: None,
            },
            Err(e) => {
                warn!(game_id = %req.game_id, "Verification failed: {}", e);
                VerifyOutcome {
                    valid: false,
                    game_id: req.game_id,
                    peak_multiplier: None,
                    final_price: None,
                    total_ticks: None,
                    rugged: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LoggingPayout, MemoryLedger};
    use std::time::Duration;

    fn service() -> (GameService, MemoryLedger) {
        let ledger = MemoryLedger::new();
        let ctx = AppContext::start(
            ServerConfig::default(),
            Arc::new(ledger.clone()),
            Arc::new(LoggingPayout),
        );
        (GameService::new(ctx), ledger)
    }

    fn bet(address: &str, amount: f64) -> BetRequest {
        BetRequest {
            player_address: address.into(),
            bet_amount: amount,
            game_id: None,
            user_id: None,
            transaction_hash: None,
        }
    }

    #[tokio::test]
    async fn test_bet_rejected_while_waiting() {
        let (service, _) = service();
        let err = service.place_crash_bet(bet("0xA", 1.0)).unwrap_err();
        assert_eq!(err, BetError::WrongPhase(CrashPhase::Waiting));
    }

    #[tokio::test]
    async fn test_bet_amount_bounds() {
        let (service, _) = service();
        service.context().store.live.begin("g1", "h");
        assert!(matches!(
            service.place_crash_bet(bet("0xA", 0.0)),
            Err(BetError::InvalidInput(_))
        ));
        assert!(matches!(
            service.place_crash_bet(bet("0xA", 1_000.0)),
            Err(BetError::InvalidInput(_))
        ));
        assert!(matches!(
            service.place_crash_bet(bet("", 1.0)),
            Err(BetError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_cashout_uses_server_price() {
        let (service, ledger) = service();
        let store = &service.context().store;
        store.live.begin("g1", "h");

        let placed = service.place_crash_bet(bet("0xA", 10.0)).unwrap();
        assert_eq!(placed.entry_multiplier, 1.0);
        assert!(matches!(
            service.cash_out(CashoutRequest { player_address: "0xA".into(), game_id: None }),
            Err(BetError::WrongPhase(CrashPhase::Countdown))
        ));

        store.live.set_phase(CrashPhase::Running);
        store.live.record_tick(12, 2.5, vec![], None);
        let result = service
            .cash_out(CashoutRequest { player_address: "0xA".into(), game_id: None })
            .unwrap();
        assert!((result.multiplier - 2.5).abs() < 1e-12);
        assert!((result.payout - 25.0).abs() < 1e-9);
        assert!(store.bettors.list_active().is_empty());

        assert!(matches!(
            service.cash_out(CashoutRequest { player_address: "0xA".into(), game_id: None }),
            Err(BetError::NoActiveBet(_))
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let statuses: Vec<BetStatus> = ledger.bets().iter().map(|b| b.status).collect();
        assert_eq!(statuses, vec![BetStatus::Active, BetStatus::CashedOut]);
    }

    #[tokio::test]
    async fn test_mid_game_entry_is_current_price() {
        let (service, _) = service();
        let store = &service.context().store;
        store.live.begin("g2", "h");
        store.live.set_phase(CrashPhase::Running);
        store.live.record_tick(3, 1.8, vec![], None);

        let placed = service.place_crash_bet(bet("0xB", 1.0)).unwrap();
        assert_eq!(placed.entry_multiplier, 1.8);

        store.live.record_tick(4, 3.6, vec![], None);
        let result = service
            .cash_out(CashoutRequest { player_address: "0xB".into(), game_id: None })
            .unwrap();
        assert!((result.multiplier - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_stale_game_id_rejected() {
        let (service, _) = service();
        service.context().store.live.begin("g3", "h");
        let mut req = bet("0xA", 1.0);
        req.game_id = Some("old".into());
        assert!(matches!(service.place_crash_bet(req), Err(BetError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_failing_ledger_does_not_block_bets() {
        let (service, ledger) = service();
        ledger.set_failing(true);
        service.context().store.live.begin("g4", "h");
        assert!(service.place_crash_bet(bet("0xA", 1.0)).is_ok());
        assert!(service
            .post_chat("conn-1", ChatRequest { message: "hi".into(), player_address: None })
            .is_ok());
    }

    #[tokio::test]
    async fn test_chat_validation() {
        let (service, _) = service();
        let entry = service
            .post_chat("conn-9", ChatRequest { message: "  gm  ".into(), player_address: None })
            .unwrap();
        assert_eq!(entry.message, "gm");
        assert_eq!(entry.player_address, "conn-9");

        assert!(service
            .post_chat("conn-9", ChatRequest { message: "   ".into(), player_address: None })
            .is_err());
        assert!(service
            .post_chat(
                "conn-9",
                ChatRequest { message: "x".repeat(MAX_CHAT_LEN + 1), player_address: None }
            )
            .is_err());
    }

    #[tokio::test]
    async fn test_create_batch_validation() {
        let (service, _) = service();
        let req = |rooms: u32, amount: &str, side: &str| CreateBatchRequest {
            address: "0xC".into(),
            room_count: rooms,
            amount_per_room: amount.into(),
            side: side.into(),
        };
        assert!(service.create_batch(req(0, "10", "bull")).is_err());
        assert!(service.create_batch(req(11, "10", "bull")).is_err());
        assert!(service.create_batch(req(2, "0", "bull")).is_err());
        assert!(service.create_batch(req(2, "-5", "bull")).is_err());
        assert!(service.create_batch(req(2, "10", "sideways")).is_err());

        let id = service.create_batch(req(2, "10", "bear")).unwrap();
        let batch = service.context().store.batches.get(&id).unwrap();
        assert_eq!(batch.total_rooms, 2);
        assert_eq!(batch.player_side, Side::Bear);
        assert!(batch.server_seed.is_none());
    }

    #[tokio::test]
    async fn test_verify_game() {
        let (service, _) = service();
        let seed = GameSeed::from_secret([4; 32]);
        let ok = service.verify_game(VerifyRequest {
            server_seed: seed.secret_hex(),
            server_seed_hash: seed.public_hash().to_string(),
            game_id: "7".into(),
        });
        assert!(ok.valid);
        assert!(ok.peak_multiplier.is_some());

        let bad = service.verify_game(VerifyRequest {
            server_seed: seed.secret_hex(),
            server_seed_hash: "00".into(),
            game_id: "7".into(),
        });
        assert!(!bad.valid);
        assert!(bad.error.is_some());
    }
}
