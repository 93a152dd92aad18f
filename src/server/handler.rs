//! Frame dispatcher
//!
//! Decodes one inbound frame, validates it, and carries out its effect on
//! the room registry. Holds no per-connection state, so frames from one
//! connection are handled strictly in the order its read loop passes them in.

use std::sync::Arc;

use tracing::{debug, warn};

use super::protocol::{ClientMessage, ProtocolError, ServerMessage, SERVER_MEMBER_ID};
use crate::config::BrokerConfig;
use crate::connection::{ConnectionError, ConnectionHandle};
use crate::room::RoomRegistry;

/// Side effect of an executed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Joined {
        room_id: String,
        newly_joined: bool,
        member_count: usize,
    },
    Delivered {
        room_id: String,
        recipients: usize,
    },
    Left {
        room_id: String,
        member_count: usize,
    },
    Listed {
        rooms: usize,
    },
    Ponged,
}

/// How a frame ended up
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Decoded, validated, and applied
    Executed(Effect),
    /// Refused; an error frame was queued for the sender
    Rejected(ProtocolError),
    /// The sender's connection could not take the reply
    Failed(ConnectionError),
}

impl DispatchOutcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, DispatchOutcome::Executed(_))
    }
}

/// Routes decoded frames to the room registry
pub struct Dispatcher {
    registry: Arc<RoomRegistry>,
    config: Arc<BrokerConfig>,
}

impl Dispatcher {
    pub fn new(registry: Arc<RoomRegistry>, config: Arc<BrokerConfig>) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Handle one text frame received on `conn`
    pub async fn dispatch(&self, conn: &ConnectionHandle, text: &str) -> DispatchOutcome {
        let message = match ClientMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => return self.reject(conn, e),
        };
        debug!("Connection {} sent {}", conn.id(), message.action());

        match self.execute(conn, message).await {
            Ok(effect) => DispatchOutcome::Executed(effect),
            Err(DispatchError::Protocol(e)) => self.reject(conn, e),
            Err(DispatchError::Connection(e)) => {
                warn!("Reply to connection {} failed: {}", conn.id(), e);
                DispatchOutcome::Failed(e)
            }
        }
    }

    /// Tell the sender why its frame was refused
    pub fn reject(&self, conn: &ConnectionHandle, err: ProtocolError) -> DispatchOutcome {
        warn!("Rejected frame from connection {}: {}", conn.id(), err);
        match conn.send(&ServerMessage::from(&err)) {
            Ok(()) => DispatchOutcome::Rejected(err),
            Err(e) => DispatchOutcome::Failed(e),
        }
    }

    async fn execute(
        &self,
        conn: &ConnectionHandle,
        message: ClientMessage,
    ) -> Result<Effect, DispatchError> {
        match message {
            ClientMessage::JoinRoom(req) => {
                let outcome = self.registry.join(&req.room_id, conn, &req.joiner_id).await;
                conn.send(&ServerMessage::room_joined(
                    &req.room_id,
                    &req.joiner_id,
                    outcome.member_count,
                ))?;

                if outcome.newly_joined {
                    self.announce(&req.room_id, &req.joiner_id, "joined").await;
                }
                Ok(Effect::Joined {
                    room_id: req.room_id,
                    newly_joined: outcome.newly_joined,
                    member_count: outcome.member_count,
                })
            }

            ClientMessage::MessageRoom(req) => {
                let frame = ServerMessage::room_message(&req.room_id, &req.member_id, req.message);
                let delivery = self
                    .registry
                    .broadcast(&req.room_id, &frame)
                    .await
                    .map_err(ConnectionError::from)?;
                Ok(Effect::Delivered {
                    room_id: req.room_id,
                    recipients: delivery.delivered,
                })
            }

            ClientMessage::LeaveRoom(req) => {
                let outcome = self
                    .registry
                    .leave(conn.id(), &req.room_id)
                    .await
                    .ok_or_else(|| ProtocolError::NotInRoom(req.room_id.clone()))?;
                conn.send(&ServerMessage::room_left(
                    &req.room_id,
                    &outcome.member_id,
                    outcome.member_count,
                ))?;

                self.announce(&req.room_id, &outcome.member_id, "left").await;
                Ok(Effect::Left {
                    room_id: req.room_id,
                    member_count: outcome.member_count,
                })
            }

            ClientMessage::ListRooms => {
                let rooms = self.registry.list_rooms().await;
                let count = rooms.len();
                conn.send(&ServerMessage::RoomList { rooms })?;
                Ok(Effect::Listed { rooms: count })
            }

            ClientMessage::Ping { seq } => {
                conn.send(&ServerMessage::pong(seq))?;
                Ok(Effect::Ponged)
            }
        }
    }

    /// Post "<name> has <verb> the chat" to a room when announcements are on
    pub async fn announce(&self, room_id: &str, member_id: &str, verb: &str) {
        if !self.config.announce_membership {
            return;
        }
        let text = format!(
            "{} has {} the chat",
            self.config.display_name(member_id),
            verb
        );
        let frame = ServerMessage::room_message(room_id, SERVER_MEMBER_ID, text);
        if let Err(e) = self.registry.broadcast(room_id, &frame).await {
            warn!("Failed to announce in room {}: {}", room_id, e);
        }
    }
}

enum DispatchError {
    Protocol(ProtocolError),
    Connection(ConnectionError),
}

impl From<ProtocolError> for DispatchError {
    fn from(err: ProtocolError) -> Self {
        DispatchError::Protocol(err)
    }
}

impl From<ConnectionError> for DispatchError {
    fn from(err: ConnectionError) -> Self {
        DispatchError::Connection(err)
    }
}
