//! Live connection bookkeeping: one outbound channel per user id.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ServerMessage;
use crate::storage::UserId;

/// What the socket writer task is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(ServerMessage),
    Close(&'static str),
}

/// Sending half of one live client connection.
#[derive(Debug, Clone)]
pub struct ClientChannel {
    connection_id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            connection_id: Uuid::new_v4(),
            tx,
        };
        (channel, rx)
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Queue a message for the client. Returns `false` once the writer is gone,
    /// which for a superseded or closing connection is expected and harmless.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(Outbound::Message(message)).is_ok()
    }

    /// Ask the writer to send a close frame and stop.
    pub fn close(&self, reason: &'static str) {
        let _ = self.tx.send(Outbound::Close(reason));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn same_connection(&self, other: &ClientChannel) -> bool {
        self.connection_id == other.connection_id
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    channels: Arc<DashMap<UserId, ClientChannel>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `channel` for `user_id`, returning whatever it replaced. The replaced
    /// channel is left open; closing it is the caller's decision.
    pub fn register(&self, user_id: UserId, channel: ClientChannel) -> Option<ClientChannel> {
        self.channels.insert(user_id, channel)
    }

    /// Remove the mapping only if it still points at `channel`.
    pub fn unregister(&self, user_id: UserId, channel: &ClientChannel) -> bool {
        self.channels
            .remove_if(&user_id, |_, current| current.same_connection(channel))
            .is_some()
    }

    pub fn lookup(&self, user_id: UserId) -> Option<ClientChannel> {
        self.channels.get(&user_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
