//! WebSocket broker
//!
//! Accepts client sockets, upgrades them on the configured path, and runs one
//! supervised read loop per connection. Whatever way a read loop ends, the
//! supervisor detaches the connection from every room before dropping it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::Dispatcher;
use super::protocol::{ProtocolError, ServerMessage};
use crate::config::BrokerConfig;
use crate::connection::{ConnectionError, ConnectionHandle, ConnectionId, ConnectionState};
use crate::room::RoomRegistry;

/// Query parameter a client uses to claim its member identifier
pub const MEMBER_QUERY_PARAM: &str = "member_id";

/// Upgrade URL query string
#[derive(Debug, Default, Deserialize)]
struct MemberClaim {
    #[serde(default)]
    member_id: Option<String>,
}

/// Why a read loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or end of stream from the client
    ClientClosed,
    /// No frame within the idle timeout
    IdleTimeout,
    /// Broker shutdown
    Shutdown,
    /// The write side failed or the client could not keep up
    WriterClosed,
}

/// Connections currently attached to the broker
type ConnectionTable = Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>;

/// Room chat broker
#[derive(Clone)]
pub struct Broker {
    config: Arc<BrokerConfig>,
    registry: Arc<RoomRegistry>,
    dispatcher: Arc<Dispatcher>,
    connections: ConnectionTable,
    shutdown_tx: broadcast::Sender<()>,
}

impl Broker {
    /// Create a new broker
    pub fn new(config: BrokerConfig) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(RoomRegistry::with_presets(&config.rooms));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&config),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            dispatcher,
            connections: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Number of connections currently attached
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Trigger broker shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!(
            "Broker listening on ws://{}{}",
            listener.local_addr()?,
            self.config.server.path
        );
        self.serve(listener).await
    }

    /// Accept connections from `listener` until shutdown
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let broker = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = broker.accept(stream, peer_addr).await {
                                    warn!("Rejected connection from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping broker");
                    break;
                }
            }
        }

        let active = self.connection_count().await;
        if active > 0 {
            info!("Closing {} active connections", active);
        }
        Ok(())
    }

    /// Upgrade a socket and start its supervised read loop
    pub async fn accept(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> anyhow::Result<ConnectionHandle> {
        debug!("New socket from {}", peer_addr);

        let expected_path = self.config.server.path.clone();
        let mut claimed = None;
        let ws_stream = accept_hdr_async(stream, |req: &Request, resp: Response| {
            if req.uri().path() != expected_path {
                let mut denied = ErrorResponse::new(Some("Not Found".to_string()));
                *denied.status_mut() = StatusCode::NOT_FOUND;
                return Err(denied);
            }
            claimed = req.uri().query().and_then(claimed_member_id);
            Ok(resp)
        })
        .await?;

        let member_id = claimed.unwrap_or_else(guest_member_id);
        let (handle, outbound) = ConnectionHandle::new(
            member_id,
            Some(peer_addr),
            self.config.limits.outbound_queue,
        );
        let (sink, source) = ws_stream.split();
        handle.spawn_writer(sink, outbound);

        let shutdown_rx = self.shutdown_tx.subscribe();
        handle.send(&ServerMessage::welcome(handle.id(), handle.member_id()))?;

        self.connections
            .write()
            .await
            .insert(handle.id(), handle.clone());
        info!(
            "Connection {} from {} as {}",
            handle.id(),
            peer_addr,
            handle.member_id()
        );

        let broker = self.clone();
        let supervised = handle.clone();
        tokio::spawn(async move { broker.supervise(supervised, source, shutdown_rx).await });

        Ok(handle)
    }

    /// Run a read loop to completion, then always clean up
    async fn supervise<St>(
        &self,
        handle: ConnectionHandle,
        source: St,
        shutdown_rx: broadcast::Receiver<()>,
    ) where
        St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
    {
        let task = tokio::spawn(read_loop(
            source,
            handle.clone(),
            Arc::clone(&self.dispatcher),
            shutdown_rx,
            self.config.idle_timeout(),
        ));

        match task.await {
            Ok(Ok(reason)) => info!("Connection {} ended: {:?}", handle.id(), reason),
            Ok(Err(e)) => warn!("Connection {} failed: {}", handle.id(), e),
            Err(e) => error!("Read loop for connection {} aborted: {}", handle.id(), e),
        }

        self.disconnect(&handle).await;
    }

    /// Detach a connection from every room and forget it
    pub async fn disconnect(&self, handle: &ConnectionHandle) {
        handle.begin_close();
        let left = self.registry.leave_all(handle.id()).await;
        for (room_id, member_id) in &left {
            self.dispatcher.announce(room_id, member_id, "left").await;
        }
        self.connections.write().await.remove(&handle.id());
        handle.mark_closed();
        debug!(
            "Connection {} cleaned up, left {} rooms",
            handle.id(),
            left.len()
        );
    }
}

/// Extract `member_id` from an upgrade query string
fn claimed_member_id(query: &str) -> Option<String> {
    let claim: MemberClaim = match serde_urlencoded::from_str(query) {
        Ok(claim) => claim,
        Err(e) => {
            debug!("Ignoring malformed upgrade query {:?}: {}", query, e);
            return None;
        }
    };
    claim
        .member_id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn guest_member_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("guest-{}", &id[..8])
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Read frames until the client goes away, the connection stops being open,
/// the idle timeout fires, or the broker shuts down
async fn read_loop<St>(
    mut source: St,
    handle: ConnectionHandle,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: broadcast::Receiver<()>,
    idle_timeout: Option<Duration>,
) -> Result<CloseReason, ConnectionError>
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut state_rx = handle.subscribe_state();
    let mut closing = Box::pin(async move {
        let _ = state_rx
            .wait_for(|state| *state != ConnectionState::Open)
            .await;
    });

    loop {
        tokio::select! {
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received frame from {}: {}", handle.id(), text);
                        dispatcher.dispatch(&handle, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary frame from {} ({} bytes)", handle.id(), data.len());
                        dispatcher.reject(
                            &handle,
                            ProtocolError::Decode("binary frames are not supported".to_string()),
                        );
                    }
                    Some(Ok(Message::Ping(data))) => {
                        handle.enqueue(Message::Pong(data))?;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(CloseReason::ClientClosed);
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        return Err(ConnectionError::Transport(e));
                    }
                }
            }
            _ = &mut closing => {
                return Ok(CloseReason::WriterClosed);
            }
            _ = idle(idle_timeout) => {
                info!("Connection {} idle, closing", handle.id());
                let _ = handle.enqueue(Message::Close(None));
                return Ok(CloseReason::IdleTimeout);
            }
            _ = shutdown_rx.recv() => {
                let _ = handle.enqueue(Message::Close(None));
                return Ok(CloseReason::Shutdown);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomPreset;
    use crate::server::ClientMessage;
    use futures_util::SinkExt;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(config: BrokerConfig) -> (Broker, SocketAddr) {
        let broker = Broker::new(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = broker.clone();
        tokio::spawn(async move { server.serve(listener).await });
        (broker, addr)
    }

    async fn connect(addr: SocketAddr, member_id: &str) -> Client {
        let url = format!("ws://{}/ws?{}={}", addr, MEMBER_QUERY_PARAM, member_id);
        let (client, _) = connect_async(url).await.unwrap();
        client
    }

    async fn send(client: &mut Client, message: ClientMessage) {
        let json = message.to_json().unwrap();
        client.send(Message::Text(json)).await.unwrap();
    }

    async fn next_text(client: &mut Client) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = msg {
                return text;
            }
        }
    }

    async fn next_frame(client: &mut Client) -> ServerMessage {
        ServerMessage::from_json(&next_text(client).await).unwrap()
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_claimed_member_id() {
        assert_eq!(
            claimed_member_id("member_id=JohnCena"),
            Some("JohnCena".to_string())
        );
        assert_eq!(
            claimed_member_id("x=1&member_id=A&y=2"),
            Some("A".to_string())
        );
        assert_eq!(claimed_member_id("member_id="), None);
        assert_eq!(claimed_member_id("other=1"), None);
    }

    #[test]
    fn test_claimed_member_id_is_percent_decoded() {
        assert_eq!(
            claimed_member_id("member_id=John%20Cena"),
            Some("John Cena".to_string())
        );
        assert_eq!(
            claimed_member_id("member_id=John+Cena&x=1"),
            Some("John Cena".to_string())
        );
        assert_eq!(
            claimed_member_id("member_id=caf%C3%A9"),
            Some("café".to_string())
        );
        assert_eq!(claimed_member_id("member_id=%20%20"), None);
    }

    #[tokio::test]
    async fn test_read_loop_ends_when_already_closing() {
        let config = Arc::new(BrokerConfig::default());
        let registry = Arc::new(RoomRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(registry, config));
        let (handle, _outbound) = ConnectionHandle::new("A".to_string(), None, 4);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        // The connection leaves Open before its read loop starts watching
        handle.begin_close();

        let source = futures_util::stream::pending::<Result<Message, tungstenite::Error>>();
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            read_loop(source, handle.clone(), dispatcher, shutdown_rx, None),
        )
        .await
        .expect("read loop kept waiting on a closing connection");
        assert_eq!(result.unwrap(), CloseReason::WriterClosed);
    }

    #[tokio::test]
    async fn test_encoded_member_id_end_to_end() {
        let (_broker, addr) = start(BrokerConfig::default()).await;
        let mut client = connect(addr, "John%20Cena").await;

        match next_frame(&mut client).await {
            ServerMessage::Welcome { member_id, .. } => assert_eq!(member_id, "John Cena"),
            other => panic!("Expected welcome, got {:?}", other),
        }
    }

    #[test]
    fn test_guest_member_id() {
        let id = guest_member_id();
        assert!(id.starts_with("guest-"));
        assert_eq!(id.len(), "guest-".len() + 8);
    }

    #[tokio::test]
    async fn test_welcome_carries_identity() {
        let (broker, addr) = start(BrokerConfig::default()).await;
        let mut client = connect(addr, "JohnCena").await;

        match next_frame(&mut client).await {
            ServerMessage::Welcome { member_id, version, .. } => {
                assert_eq!(member_id, "JohnCena");
                assert_eq!(version, crate::server::PROTOCOL_VERSION);
            }
            other => panic!("Expected welcome, got {:?}", other),
        }
        assert_eq!(broker.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_wrong_path_is_refused() {
        let (_broker, addr) = start(BrokerConfig::default()).await;
        let result = connect_async(format!("ws://{}/elsewhere", addr)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_room_fan_out_end_to_end() {
        let (_broker, addr) = start(BrokerConfig::default()).await;
        let mut a = connect(addr, "A").await;
        let mut b = connect(addr, "B").await;
        next_frame(&mut a).await;
        next_frame(&mut b).await;

        send(&mut a, ClientMessage::join_room("public", "A")).await;
        assert_eq!(
            next_frame(&mut a).await,
            ServerMessage::room_joined("public", "A", 1)
        );
        send(&mut b, ClientMessage::join_room("public", "B")).await;
        assert_eq!(
            next_frame(&mut b).await,
            ServerMessage::room_joined("public", "B", 2)
        );

        send(&mut a, ClientMessage::message_room("public", "A", "hi")).await;
        let expected =
            r#"{"action":"room-message","data":{"room_id":"public","member_id":"A","message":"hi"}}"#;
        assert_eq!(next_text(&mut a).await, expected);
        assert_eq!(next_text(&mut b).await, expected);
    }

    #[tokio::test]
    async fn test_bogus_action_keeps_connection_open() {
        let (_broker, addr) = start(BrokerConfig::default()).await;
        let mut a = connect(addr, "A").await;
        next_frame(&mut a).await;

        a.send(Message::Text(r#"{"action":"bogus"}"#.to_string()))
            .await
            .unwrap();
        match next_frame(&mut a).await {
            ServerMessage::Error { code, .. } => {
                assert_eq!(code, Some(crate::server::ErrorCode::UnknownAction))
            }
            other => panic!("Expected error, got {:?}", other),
        }

        send(&mut a, ClientMessage::Ping { seq: 3 }).await;
        assert_eq!(next_frame(&mut a).await, ServerMessage::pong(3));
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_membership() {
        let config = BrokerConfig {
            rooms: vec![RoomPreset::new("Public")],
            ..Default::default()
        };
        let (broker, addr) = start(config).await;
        let mut a = connect(addr, "A").await;
        next_frame(&mut a).await;

        send(&mut a, ClientMessage::join_room("public", "A")).await;
        send(&mut a, ClientMessage::join_room("scratch", "A")).await;
        next_frame(&mut a).await;
        next_frame(&mut a).await;
        assert_eq!(broker.registry().room_count().await, 2);

        a.close(None).await.unwrap();
        drop(a);

        let registry = Arc::clone(broker.registry());
        eventually(|| {
            let registry = Arc::clone(&registry);
            async move { registry.members_of("public").await.is_empty() }
        })
        .await;
        eventually(|| {
            let broker = broker.clone();
            async move { broker.connection_count().await == 0 }
        })
        .await;

        // The seeded room stays, the lazily created one is gone
        let rooms = broker.registry().list_rooms().await;
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].id, "public");
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let mut config = BrokerConfig::default();
        config.limits.idle_timeout_secs = Some(1);
        let (broker, addr) = start(config).await;
        let mut a = connect(addr, "A").await;
        next_frame(&mut a).await;

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(Ok(msg)) = a.next().await {
                if msg.is_close() {
                    return true;
                }
            }
            true
        })
        .await
        .unwrap();
        assert!(closed);

        eventually(|| {
            let broker = broker.clone();
            async move { broker.connection_count().await == 0 }
        })
        .await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (broker, addr) = start(BrokerConfig::default()).await;
        let mut a = connect(addr, "A").await;
        next_frame(&mut a).await;

        broker.shutdown();

        eventually(|| {
            let broker = broker.clone();
            async move { broker.connection_count().await == 0 }
        })
        .await;
    }
}
