//! Timed game loops.
//!
//! One crash loop runs for the lifetime of the server. Each candleflip batch
//! gets its own task. All of them tick on `tokio::time::interval` with
//! `MissedTickBehavior::Skip` and publish through the hub.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::seed::GameSeed;
use crate::game::candle::CandleAggregator;
use crate::game::candleflip::{batch_payout, round_to, simulate_room, TOTAL_TICKS};
use crate::game::crash::{CrashEngine, CrashOutcome};
use crate::ledger::{self, BetRecord, BetStatus, GameRecord};
use crate::network::protocol::{
    BatchEndInfo, BatchStatus, CountdownInfo, CrashPhase, GameEndInfo, GameStartInfo,
    PayoutFailure, PriceUpdate, RoomEndInfo, RoomPriceUpdate, RoomRef, RoomStatus, ServerEvent,
    Topic,
};
use crate::network::service::AppContext;

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

// =============================================================================
// CRASH
// =============================================================================

/// Run crash games back to back until shutdown.
pub async fn run_crash_loop(ctx: Arc<AppContext>, mut shutdown: broadcast::Receiver<()>) {
    info!("Crash loop started");
    loop {
        tokio::select! {
            outcome = run_round(&ctx) => {
                debug!(peak = outcome.peak_multiplier, rugged = outcome.rugged, "Round complete");
            }
            _ = shutdown.recv() => break,
        }

        tokio::select! {
            _ = tokio::time::sleep(ctx.config.crash.cooldown) => {}
            _ = shutdown.recv() => break,
        }
        ctx.store.live.set_phase(CrashPhase::Waiting);
    }
    info!("Crash loop stopped");
}

/// Play one crash game: countdown, ticks, reveal, settlement.
#[instrument(skip(ctx))]
pub async fn run_round(ctx: &AppContext) -> CrashOutcome {
    let cfg = &ctx.config.crash;
    let hub = &ctx.hub;
    let store = &ctx.store;

    let seed = GameSeed::generate();
    let game_id = Uuid::new_v4().to_string();
    let secret = seed.secret_hex();
    let hash = seed.public_hash().to_string();

    // Phase 1: countdown (bets open at 1.0x)
    store.live.begin(&game_id, &hash);
    let countdown_secs = cfg.countdown.as_secs();
    hub.publish(
        Topic::Crash,
        &ServerEvent::GameStart(GameStartInfo {
            game_id: game_id.clone(),
            server_seed_hash: hash.clone(),
            countdown_secs,
        }),
    );
    info!(game_id = %game_id, hash = %hash, "Crash game starting");

    if countdown_secs == 0 {
        tokio::time::sleep(cfg.countdown).await;
    } else {
        for remaining in (1..=countdown_secs).rev() {
            hub.publish(
                Topic::Crash,
                &ServerEvent::Countdown(CountdownInfo {
                    game_id: game_id.clone(),
                    seconds: remaining,
                }),
            );
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    // Phase 2: price walk
    store.live.set_phase(CrashPhase::Running);
    let mut engine = CrashEngine::new(&secret, &game_id, cfg.params.clone());
    let mut candles = CandleAggregator::new(cfg.candle_duration_ms, cfg.merge_threshold);
    let mut tick_interval = ticker(cfg.tick_interval);

    while let Some(point) = engine.step() {
        tick_interval.tick().await;

        let tick_candles = candles.on_tick(point.price, Utc::now().timestamp_millis());
        let previous = candles.completed();
        store.live.record_tick(
            point.tick,
            point.price,
            previous.clone(),
            Some(tick_candles.current.clone()),
        );
        hub.publish(
            Topic::Crash,
            &ServerEvent::PriceUpdate(PriceUpdate {
                game_id: game_id.clone(),
                tick: point.tick,
                price: point.price,
                multiplier: point.price,
                game_ended: false,
                previous_candles: previous,
                current_candle: Some(tick_candles.current),
            }),
        );

        #[cfg(feature = "debug-tracing")]
        tracing::trace!(
            tick = point.tick,
            price = point.price,
            peak_reached = point.peak_reached,
            "Crash tick"
        );
    }

    // Phase 3: end and reveal
    let outcome = engine.run_to_end();
    candles.finish(outcome.rugged);
    let all_candles = candles.into_completed();

    store.live.set_phase(CrashPhase::Crashed);
    store.live.set_candles(all_candles.clone(), None);

    hub.publish(
        Topic::Crash,
        &ServerEvent::GameEnd(GameEndInfo {
            game_id: game_id.clone(),
            server_seed: secret.clone(),
            server_seed_hash: hash.clone(),
            peak_multiplier: outcome.peak_multiplier,
            final_price: outcome.final_price,
            rugged: outcome.rugged,
            total_ticks: outcome.total_ticks,
            previous_candles: all_candles.clone(),
        }),
    );
    info!(
        game_id = %game_id,
        peak = outcome.peak_multiplier,
        final_price = outcome.final_price,
        ticks = outcome.total_ticks,
        rugged = outcome.rugged,
        "Crash game ended"
    );

    let record = GameRecord {
        game_id: game_id.clone(),
        server_seed: secret,
        server_seed_hash: hash,
        peak_multiplier: outcome.peak_multiplier,
        final_price: outcome.final_price,
        rugged: outcome.rugged,
        total_ticks: outcome.total_ticks,
        candles: all_candles,
        timestamp: Utc::now(),
    };
    store.history.push(record.to_history_entry());
    hub.publish(
        Topic::Crash,
        &ServerEvent::CrashHistory {
            history: store.history.to_vec(),
        },
    );
    ledger::spawn_side_effect(
        "append_game_history",
        ctx.config.side_effect_timeout,
        ctx.persistence.append_game_history(record),
    );

    // Phase 4: open bets lose
    let lost = store.bettors.clear_all();
    if !lost.is_empty() {
        debug!(game_id = %game_id, count = lost.len(), "Settling open bets as lost");
    }
    for bettor in lost {
        ledger::spawn_side_effect(
            "record_bet",
            ctx.config.side_effect_timeout,
            ctx.persistence.record_bet(BetRecord {
                game_id: game_id.clone(),
                player_address: bettor.address,
                user_id: None,
                bet_amount: bettor.bet_amount,
                entry_multiplier: bettor.entry_multiplier,
                cashout_multiplier: None,
                payout: Some(0.0),
                status: BetStatus::Lost,
                transaction_hash: None,
                timestamp: Utc::now(),
            }),
        );
    }

    outcome
}

// =============================================================================
// CANDLEFLIP
// =============================================================================

/// Play every room of a batch, settle it, then retire it after the linger.
///
/// The batch must already be in the directory.
#[instrument(skip(ctx, seed))]
pub async fn run_batch(ctx: Arc<AppContext>, batch_id: String, seed: GameSeed) {
    let cfg = &ctx.config.candleflip;
    let hub = &ctx.hub;
    let batches = &ctx.store.batches;
    let topic = Topic::room(batch_id.clone());
    let secret = seed.secret_hex();

    let Some(batch) = batches.update(&batch_id, |b| b.status = BatchStatus::Running) else {
        warn!("Batch {} vanished before it started", batch_id);
        return;
    };
    hub.publish(topic.clone(), &ServerEvent::BatchState(batch.clone()));

    let mut won_rooms = 0u32;
    for index in 0..batch.total_rooms as usize {
        let room_number = index as u32 + 1;
        batches.update(&batch_id, |b| {
            if let Some(room) = b.rooms.get_mut(index) {
                room.status = RoomStatus::Running;
            }
        });
        hub.publish(
            topic.clone(),
            &ServerEvent::RoomStart(RoomRef {
                batch_id: batch_id.clone(),
                room_number,
            }),
        );

        let outcome = simulate_room(&secret, index);
        let mut tick_interval = ticker(cfg.tick_interval);
        for (tick, price) in outcome.path.iter().enumerate().skip(1) {
            tick_interval.tick().await;
            hub.publish(
                topic.clone(),
                &ServerEvent::RoomPriceUpdate(RoomPriceUpdate {
                    batch_id: batch_id.clone(),
                    room_number,
                    tick: tick as u32,
                    price: round_to(*price, 3),
                    total_ticks: TOTAL_TICKS as u32,
                }),
            );
        }

        let player_won = outcome.winner == batch.player_side;
        if player_won {
            won_rooms += 1;
        }
        batches.update(&batch_id, |b| {
            if let Some(room) = b.rooms.get_mut(index) {
                room.status = RoomStatus::Completed;
                room.final_price = Some(outcome.final_price);
                room.winner = Some(outcome.winner);
                room.player_won = player_won;
            }
            b.won_rooms = won_rooms;
        });
        hub.publish(
            topic.clone(),
            &ServerEvent::RoomEnd(RoomEndInfo {
                batch_id: batch_id.clone(),
                room_number,
                final_price: round_to(outcome.final_price, 3),
                winner: outcome.winner,
                player_won,
            }),
        );
        debug!(
            batch_id = %batch_id,
            room = room_number,
            winner = %outcome.winner,
            player_won,
            "Room finished"
        );

        if room_number < batch.total_rooms {
            tokio::time::sleep(cfg.room_gap).await;
        }
    }

    // Settlement: reveal the seed, then pay.
    let amount_per_room: u128 = batch.amount_per_room.parse().unwrap_or(0);
    let payout = batch_payout(amount_per_room, won_rooms);
    let payout_amount = payout.unwrap_or(0).to_string();

    let settled = batches.update(&batch_id, |b| {
        b.status = BatchStatus::Completed;
        b.won_rooms = won_rooms;
        b.server_seed = Some(secret.clone());
        b.payout_amount = Some(payout_amount.clone());
    });
    let end = ServerEvent::BatchEnd(BatchEndInfo {
        batch_id: batch_id.clone(),
        total_rooms: batch.total_rooms,
        won_rooms,
        server_seed: secret,
        payout_amount,
    });
    hub.publish(topic.clone(), &end);
    hub.publish(Topic::Rooms, &end);
    if let Some(settled) = settled {
        hub.publish(topic.clone(), &ServerEvent::BatchState(settled));
    }
    info!(
        batch_id = %batch_id,
        rooms = batch.total_rooms,
        won = won_rooms,
        "Candleflip batch complete"
    );

    tokio::spawn(settle_payout(
        ctx.clone(),
        batch_id.clone(),
        batch.player_address.clone(),
        payout,
        won_rooms,
    ));

    tokio::time::sleep(cfg.linger).await;
    batches.remove(&batch_id);
    hub.publish(
        Topic::Rooms,
        &ServerEvent::RoomsUpdate {
            rooms: batches.summaries(),
        },
    );
    debug!("Batch {} retired", batch_id);
}

async fn settle_payout(
    ctx: Arc<AppContext>,
    batch_id: String,
    address: String,
    payout: Option<u128>,
    won_rooms: u32,
) {
    let result = match payout {
        _ if won_rooms == 0 => Ok(()),
        Some(amount) => ledger::run_side_effect(
            "pay_player",
            ctx.config.payout_timeout,
            ctx.payout.pay_player(&address, amount),
        )
        .await
        .map(|tx| debug!(batch_id = %batch_id, tx = %tx, "Batch payout sent")),
        None => Err(ledger::LedgerError::Rejected("payout overflows u128".into())),
    };

    let failure = result.err().map(|e| e.to_string());
    ctx.store.batches.update(&batch_id, |b| {
        b.status = BatchStatus::Paid;
        b.payout_error = failure.clone();
    });

    if let Some(error) = failure {
        warn!(batch_id = %batch_id, address = %address, "Batch payout failed: {}", error);
        let event = ServerEvent::PayoutFailed(PayoutFailure {
            batch_id: Some(batch_id.clone()),
            player_address: address,
            error,
        });
        ctx.hub.publish(Topic::room(batch_id), &event);
        ctx.hub.publish(Topic::Rooms, &event);
    }
}

/// Push lobby summaries while batches exist, plus one final empty update.
pub async fn run_rooms_broadcaster(ctx: Arc<AppContext>, mut shutdown: broadcast::Receiver<()>) {
    let mut tick_interval = ticker(ctx.config.candleflip.rooms_broadcast_interval);
    let mut was_empty = true;
    loop {
        tokio::select! {
            _ = tick_interval.tick() => {}
            _ = shutdown.recv() => break,
        }
        let rooms = ctx.store.batches.summaries();
        if rooms.is_empty() && was_empty {
            continue;
        }
        was_empty = rooms.is_empty();
        ctx.hub.publish(Topic::Rooms, &ServerEvent::RoomsUpdate { rooms });
    }
}
