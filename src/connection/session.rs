//! Individual client connection
//!
//! A [`ConnectionHandle`] is the cheap, cloneable side of a connection that
//! the room registry and dispatcher hold on to. All frames for a client go
//! through its bounded outbound queue and are written to the socket by a
//! single writer task, so concurrent fan-outs never interleave on the wire.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::server::ServerMessage;

/// Server-assigned connection identifier
pub type ConnectionId = Uuid;

/// Default capacity of the outbound queue
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Errors that end a connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Connection closed")]
    Closed,

    #[error("Failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting and delivering frames
    Open,
    /// A failure or shutdown was observed, cleanup pending
    Closing,
    /// Cleanup done (terminal)
    Closed,
}

/// Shared handle to a client connection
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    member_id: Arc<str>,
    peer: Option<SocketAddr>,
    outbound: mpsc::Sender<Message>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("member_id", &self.member_id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    /// Create a connection and the receiving end of its outbound queue
    ///
    /// The receiver is meant to be handed to [`ConnectionHandle::spawn_writer`].
    pub fn new(
        member_id: impl Into<Arc<str>>,
        peer: Option<SocketAddr>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Open);
        let handle = Self {
            id: Uuid::new_v4(),
            member_id: member_id.into(),
            peer,
            outbound,
            state: Arc::new(state),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Member identifier claimed or assigned at connect time
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Move from `Open` to `Closing`; later states are left untouched
    pub fn begin_close(&self) {
        if close_state(&self.state) {
            debug!("Connection {} closing", self.id);
        }
    }

    /// Enter the terminal state
    pub fn mark_closed(&self) {
        self.state.send_replace(ConnectionState::Closed);
    }

    /// Serialize a frame and queue it for the writer
    pub fn send(&self, frame: &ServerMessage) -> ConnectionResult<()> {
        let text = serde_json::to_string(frame)?;
        self.enqueue(Message::Text(text))
    }

    /// Queue a raw WebSocket message without waiting
    ///
    /// A full or closed queue moves the connection to `Closing`.
    pub fn enqueue(&self, message: Message) -> ConnectionResult<()> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        match self.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound queue full for connection {}", self.id);
                self.begin_close();
                Err(ConnectionError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.begin_close();
                Err(ConnectionError::Closed)
            }
        }
    }
}

/// Drain the outbound queue into the socket sink
///
/// Runs until every handle has been dropped, a close frame was written, or
/// a write fails. A failed write moves the connection to `Closing` so its
/// read loop stops too.
async fn run_writer<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Message>,
    state: Arc<watch::Sender<ConnectionState>>,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            warn!("Write failed: {}", e);
            close_state(&state);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

fn close_state(state: &watch::Sender<ConnectionState>) -> bool {
    state.send_if_modified(|s| {
        if *s == ConnectionState::Open {
            *s = ConnectionState::Closing;
            true
        } else {
            false
        }
    })
}

impl ConnectionHandle {
    /// Spawn the single writer task for this connection
    pub fn spawn_writer<S>(
        &self,
        sink: S,
        outbound: mpsc::Receiver<Message>,
    ) -> tokio::task::JoinHandle<()>
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: fmt::Display,
    {
        tokio::spawn(run_writer(sink, outbound, Arc::clone(&self.state)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;

    fn collecting_sink(
        tx: mpsc::UnboundedSender<Message>,
    ) -> impl Sink<Message, Error = String> + Unpin + Send + 'static {
        Box::pin(sink::unfold(tx, |tx, item: Message| async move {
            tx.send(item).map_err(|e| e.to_string())?;
            Ok::<_, String>(tx)
        }))
    }

    #[test]
    fn test_new_connection_is_open() {
        let (handle, _rx) = ConnectionHandle::new("JohnCena", None, 4);
        assert_eq!(handle.member_id(), "JohnCena");
        assert_eq!(handle.state(), ConnectionState::Open);
        assert!(handle.peer().is_none());
    }

    #[test]
    fn test_send_queues_json_text() {
        let (handle, mut rx) = ConnectionHandle::new("a", None, 4);
        handle
            .send(&ServerMessage::room_message("public", "a", "hi"))
            .unwrap();
        match rx.try_recv().unwrap() {
            Message::Text(text) => assert!(text.contains("\"action\":\"room-message\"")),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_full_queue_moves_to_closing() {
        let (handle, _rx) = ConnectionHandle::new("a", None, 1);
        handle.send(&ServerMessage::pong(1)).unwrap();
        let result = handle.send(&ServerMessage::pong(2));
        assert!(matches!(result, Err(ConnectionError::QueueFull)));
        assert_eq!(handle.state(), ConnectionState::Closing);

        let result = handle.send(&ServerMessage::pong(3));
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }

    #[test]
    fn test_dropped_receiver_moves_to_closing() {
        let (handle, rx) = ConnectionHandle::new("a", None, 4);
        drop(rx);
        let result = handle.send(&ServerMessage::pong(1));
        assert!(matches!(result, Err(ConnectionError::Closed)));
        assert_eq!(handle.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_closed_is_terminal() {
        let (handle, _rx) = ConnectionHandle::new("a", None, 4);
        handle.mark_closed();
        handle.begin_close();
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_state_watch_sees_closing() {
        let (handle, _rx) = ConnectionHandle::new("a", None, 4);
        let mut state_rx = handle.subscribe_state();
        handle.begin_close();
        state_rx.changed().await.unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let (handle, rx) = ConnectionHandle::new("a", None, 8);
        let (tx, mut written) = mpsc::unbounded_channel();
        let writer = handle.spawn_writer(collecting_sink(tx), rx);

        for seq in 0..5 {
            handle.send(&ServerMessage::pong(seq)).unwrap();
        }
        drop(handle);
        writer.await.unwrap();

        for seq in 0..5 {
            match written.recv().await.unwrap() {
                Message::Text(text) => {
                    let frame = ServerMessage::from_json(&text).unwrap();
                    assert_eq!(frame, ServerMessage::pong(seq));
                }
                other => panic!("Expected text frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_writer_failure_moves_to_closing() {
        let (handle, rx) = ConnectionHandle::new("a", None, 8);
        let failing = Box::pin(sink::unfold((), |_, _item: Message| async {
            Err::<(), _>("broken pipe".to_string())
        }));
        let writer = handle.spawn_writer(failing, rx);

        handle.send(&ServerMessage::pong(1)).unwrap();
        writer.await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Closing);
    }
}
