use std::fmt::Debug;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::message::ServerMessage;

/// Outbound half of the session transport. The networking layer itself lives
/// outside this crate; it only has to accept messages.
pub trait ServerLink: Send + Sync + Debug {
    fn send(&self, msg: ServerMessage) -> Result<(), LinkError>;
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LinkError {
    #[error("server link closed")]
    Closed,
}

/// Hands outbound messages to whoever holds the receiver.
#[derive(Debug, Clone)]
pub struct ChannelServerLink {
    tx: UnboundedSender<ServerMessage>,
}

impl ChannelServerLink {
    pub fn new() -> (Self, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ServerLink for ChannelServerLink {
    fn send(&self, msg: ServerMessage) -> Result<(), LinkError> {
        trace!(name = msg.name(), "sending server message");
        self.tx.send(msg).map_err(|_| LinkError::Closed)
    }
}

/// Inbound half: anything that wants to consume server pushes.
pub trait IncomingHandler: Send + Sync {
    fn handle_incoming(&self, msg: ServerMessage);
}
