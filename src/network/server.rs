//! WebSocket Game Server
//!
//! Accepts connections, registers each one with the hub, and routes client
//! messages to `GameService`. Outbound traffic goes through the per-connection
//! mailbox the hub fills; inbound traffic is handled on the reader loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::network::hub::{ConnectionId, Frame};
use crate::network::protocol::{ClientMessage, ErrorCode, ServerEvent, Topic};
use crate::network::service::{AppContext, GameService};

/// How long a closing connection gets to flush queued frames.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,
}

/// The game server.
pub struct GameServer {
    /// Request handlers (and through them, the app context).
    service: GameService,
    /// One permit per live connection, held from accept until cleanup.
    connection_slots: Arc<Semaphore>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server over an application context.
    pub fn new(ctx: Arc<AppContext>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let slots = match ctx.hub.max_connections() {
            0 => Semaphore::MAX_PERMITS,
            n => n.min(Semaphore::MAX_PERMITS),
        };
        Self {
            service: GameService::new(ctx),
            connection_slots: Arc::new(Semaphore::new(slots)),
            shutdown_tx,
        }
    }

    /// Receiver that fires on [`GameServer::shutdown`]; hand it to background loops.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let bind_addr = self.service.context().config.bind_addr;
        let listener = TcpListener::bind(bind_addr).await?;
        info!("Game server listening on {}", bind_addr);
        self.serve(listener).await
    }

    /// Serve an already-bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => match self.admit() {
                            Ok(permit) => {
                                info!("New connection from {}", addr);
                                self.handle_connection(stream, addr, permit);
                            }
                            Err(e) => warn!("{}, rejecting {}", e, addr),
                        },
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Reserve a connection slot before the handshake starts.
    fn admit(&self) -> Result<OwnedSemaphorePermit, GameServerError> {
        self.connection_slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| GameServerError::ConnectionLimitReached)
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, permit: OwnedSemaphorePermit) {
        let service = self.service.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if let Err(e) = Self::serve_connection(service, stream, addr, shutdown_rx).await {
                error!("Connection {} failed: {}", addr, e);
            }
            // The slot frees only after the hub has been told to unregister.
            drop(permit);
        });
    }

    async fn serve_connection(
        service: GameService,
        stream: TcpStream,
        addr: SocketAddr,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), GameServerError> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let ctx = service.context().clone();
        let hub = &ctx.hub;
        let id = hub.next_connection_id();
        let (mailbox, mut frames) = mpsc::channel::<Frame>(ctx.config.mailbox_capacity);
        hub.register(id, mailbox);
        debug!("Client {} registered as connection {}", addr, id);

        // Writer: drain the mailbox until the hub drops it.
        let mut writer = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if ws_sender.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match ClientMessage::from_json(&text) {
                                Ok(client_msg) => Self::handle_client_message(&service, id, client_msg),
                                Err(e) => debug!("Dropping malformed frame from {}: {}", addr, e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Client {} disconnected", addr);
                            break;
                        }
                        Some(Err(e)) => {
                            warn!("WebSocket error for {}: {}", addr, e);
                            break;
                        }
                        _ => {}
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        // Dropping the registration closes the mailbox, which ends the writer.
        hub.unregister(id);
        if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }

        info!("Client {} cleaned up", addr);
        Ok(())
    }

    /// Route one client message. Replies go straight to the sender's mailbox.
    fn handle_client_message(service: &GameService, id: ConnectionId, msg: ClientMessage) {
        let ctx = service.context();
        let hub = &ctx.hub;

        match msg {
            ClientMessage::Subscribe(req) => match req.channel.parse::<Topic>() {
                Ok(topic) => {
                    debug!("Connection {} subscribed to {}", id, topic);
                    hub.subscribe(id, topic);
                }
                Err(e) => hub.send_to(id, &ServerEvent::error(ErrorCode::NotFound, e.to_string())),
            },
            ClientMessage::Unsubscribe(req) => match req.channel.parse::<Topic>() {
                Ok(topic) => hub.unsubscribe(id, topic),
                Err(e) => hub.send_to(id, &ServerEvent::error(ErrorCode::NotFound, e.to_string())),
            },
            ClientMessage::ChatMessage(req) => {
                if let Err(e) = service.post_chat(&format!("conn-{}", id), req) {
                    hub.send_to(id, &e.to_event());
                }
            }
            ClientMessage::CrashBetPlaced(req) => match service.place_crash_bet(req) {
                Ok(bettor) => hub.send_to(id, &ServerEvent::BetAccepted(bettor)),
                Err(e) => hub.send_to(id, &e.to_event()),
            },
            ClientMessage::CrashCashout(req) => match service.cash_out(req) {
                Ok(info) => hub.send_to(id, &ServerEvent::CashoutResult(info)),
                Err(e) => hub.send_to(id, &e.to_event()),
            },
            ClientMessage::CreateBatch(req) => match service.create_batch(req) {
                Ok(batch_id) => {
                    hub.send_to(id, &ServerEvent::BatchCreated { batch_id: batch_id.clone() });
                    hub.subscribe(id, Topic::room(batch_id));
                }
                Err(e) => hub.send_to(id, &e.to_event()),
            },
            ClientMessage::JoinRoom(req) => {
                if ctx.store.batches.get(&req.room_id).is_some() {
                    hub.subscribe(id, Topic::room(req.room_id));
                } else {
                    hub.send_to(
                        id,
                        &ServerEvent::error(ErrorCode::NotFound, format!("no batch {}", req.room_id)),
                    );
                }
            }
            ClientMessage::VerifyGame(req) => {
                hub.send_to(id, &ServerEvent::VerifyResult(service.verify_game(req)));
            }
            ClientMessage::Ping => {
                hub.send_to(
                    id,
                    &ServerEvent::Pong {
                        server_time: Utc::now().timestamp_millis(),
                    },
                );
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.service.context().hub.connection_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::ledger::{LoggingPayout, MemoryLedger};
    use crate::network::protocol::{ChatRequest, ChannelRequest, CrashPhase};
    use tokio_tungstenite::connect_async;

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<TcpStream>,
    >;

    async fn start(config: ServerConfig) -> (Arc<GameServer>, Arc<AppContext>, SocketAddr) {
        let ctx = AppContext::start(config, Arc::new(MemoryLedger::new()), Arc::new(LoggingPayout));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(GameServer::new(ctx.clone()));
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });
        (server, ctx, addr)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, msg: &ClientMessage) {
        ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
    }

    async fn next_event(ws: &mut Client) -> ServerEvent {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return ServerEvent::from_json(&text).unwrap();
            }
        }
    }

    async fn wait_for_connections(ctx: &AppContext, n: usize) {
        for _ in 0..200 {
            if ctx.hub.connection_count().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} connections", n);
    }

    #[tokio::test]
    async fn test_chat_round_trip() {
        let (_server, ctx, addr) = start(ServerConfig::default()).await;
        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;
        wait_for_connections(&ctx, 2).await;

        for ws in [&mut alice, &mut bob] {
            send(ws, &ClientMessage::Subscribe(ChannelRequest { channel: "chat".into() })).await;
        }
        // Ping is answered in order, so the subscription is in place after the pong.
        send(&mut bob, &ClientMessage::Ping).await;
        assert!(matches!(next_event(&mut bob).await, ServerEvent::Pong { .. }));

        send(
            &mut alice,
            &ClientMessage::ChatMessage(ChatRequest {
                message: "gm".into(),
                player_address: Some("0xA".into()),
            }),
        )
        .await;

        match next_event(&mut bob).await {
            ServerEvent::ChatMessage(entry) => {
                assert_eq!(entry.message, "gm");
                assert_eq!(entry.player_address, "0xA");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_crash_subscribe_gets_snapshot() {
        let (_server, _ctx, addr) = start(ServerConfig::default()).await;
        let mut ws = connect(addr).await;
        send(&mut ws, &ClientMessage::Subscribe(ChannelRequest { channel: "crash".into() })).await;

        assert!(matches!(next_event(&mut ws).await, ServerEvent::CrashHistory { .. }));
        assert!(matches!(next_event(&mut ws).await, ServerEvent::ActiveBettors { count: 0, .. }));
        match next_event(&mut ws).await {
            ServerEvent::CrashState(state) => assert_eq!(state.phase, CrashPhase::Waiting),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_errors_and_malformed_frames() {
        let (_server, _ctx, addr) = start(ServerConfig::default()).await;
        let mut ws = connect(addr).await;

        ws.send(Message::Text("{not json".into())).await.unwrap();
        send(&mut ws, &ClientMessage::Subscribe(ChannelRequest { channel: "lobby".into() })).await;
        match next_event(&mut ws).await {
            ServerEvent::Error(err) => assert_eq!(err.code, ErrorCode::NotFound),
            other => panic!("unexpected {:?}", other),
        }

        send(
            &mut ws,
            &ClientMessage::CrashCashout(crate::network::protocol::CashoutRequest {
                player_address: "0xA".into(),
                game_id: None,
            }),
        )
        .await;
        match next_event(&mut ws).await {
            ServerEvent::Error(err) => assert_eq!(err.code, ErrorCode::WrongPhase),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_limit_and_cleanup() {
        let config = ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        };
        let (server, ctx, addr) = start(config).await;

        let mut first = connect(addr).await;
        wait_for_connections(&ctx, 1).await;
        assert!(connect_async(format!("ws://{}", addr)).await.is_err());

        first.close(None).await.unwrap();
        wait_for_connections(&ctx, 0).await;
        assert_eq!(server.connection_count().await, 0);

        // The slot comes back once the old connection has finished cleanup.
        let mut again = None;
        for _ in 0..200 {
            if let Ok((ws, _)) = connect_async(format!("ws://{}", addr)).await {
                again = Some(ws);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(again.is_some());
        wait_for_connections(&ctx, 1).await;
        server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connects_respect_limit() {
        let config = ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        };
        let (server, ctx, addr) = start(config).await;

        let attempts: Vec<_> = (0..8)
            .map(|_| tokio::spawn(connect_async(format!("ws://{}", addr))))
            .collect();
        let mut accepted = Vec::new();
        for attempt in attempts {
            if let Ok((ws, _)) = attempt.await.unwrap() {
                accepted.push(ws);
            }
        }

        assert_eq!(accepted.len(), 1);
        wait_for_connections(&ctx, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.hub.connection_count().await, 1);
        server.shutdown();
    }
}
