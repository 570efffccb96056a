//! Outbound packet delivery and the in-process connection handle
//!
//! The tick loop never blocks on a client. Every packet goes into a bounded
//! per-connection channel with `try_send`; a slow or vanished reader costs a
//! dropped packet, counted and logged, never a stalled tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;
use tracing::{debug, warn};

use crate::game::input_buffer::{ClientCommand, CommandSender, ConnectionId, QueueError};
use crate::net::protocol::{decode, ClientMessage, DecodeError};

/// Packets buffered per connection before new ones are dropped
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Sink for finished update packets
pub trait Transport {
    /// Hand a packet to the connection. Fire-and-forget: delivery failures
    /// are the transport's business.
    fn send(&mut self, connection: ConnectionId, packet: Vec<u8>);
}

/// Transport backed by one bounded crossbeam channel per connection
pub struct ChannelTransport {
    outbound: HashMap<ConnectionId, Sender<Vec<u8>>, FxBuildHasher>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            outbound: HashMap::with_hasher(FxBuildHasher),
            capacity: capacity.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the outbound queue of a connection. Re-registering replaces the
    /// previous queue.
    pub fn register(&mut self, connection: ConnectionId) -> Receiver<Vec<u8>> {
        let (tx, rx) = bounded(self.capacity);
        if self.outbound.insert(connection, tx).is_some() {
            debug!("connection {} re-registered, old queue closed", connection);
        }
        rx
    }

    pub fn unregister(&mut self, connection: ConnectionId) -> bool {
        self.outbound.remove(&connection).is_some()
    }

    pub fn is_registered(&self, connection: ConnectionId) -> bool {
        self.outbound.contains_key(&connection)
    }

    /// Non-blocking send. Returns false (and counts a drop) when the queue is
    /// full, the receiver is gone or the connection is unknown.
    pub fn try_send(&mut self, connection: ConnectionId, packet: Vec<u8>) -> bool {
        let Some(tx) = self.outbound.get(&connection) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("packet for unregistered connection {} dropped", connection);
            return false;
        };
        match tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("outbound queue of connection {} full, packet dropped", connection);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("connection {} receiver gone, closing its queue", connection);
                self.outbound.remove(&connection);
                false
            }
        }
    }

    /// Packets dropped since creation
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared drop counter, readable from other tasks
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.outbound.len()
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_CAPACITY)
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, connection: ConnectionId, packet: Vec<u8>) {
        self.try_send(connection, packet);
    }
}

/// Inbound side of one connection: decodes raw client messages and queues
/// them for the next tick boundary
#[derive(Clone)]
pub struct ConnectionHandle {
    connection: ConnectionId,
    commands: CommandSender,
}

/// Why an inbound message was not queued
#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ConnectionHandle {
    pub fn new(connection: ConnectionId, commands: CommandSender) -> Self {
        Self {
            connection,
            commands,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Queue an already-decoded message
    pub fn submit(&self, message: ClientMessage) -> Result<(), QueueError> {
        self.commands
            .try_send(ClientCommand::from_message(self.connection, message))
    }

    /// Decode and queue a raw message. A malformed message is dropped on its
    /// own; the connection stays usable.
    pub fn receive(&self, bytes: &[u8]) -> Result<(), InboundError> {
        let message: ClientMessage = decode(bytes).map_err(|e| {
            warn!("connection {}: dropping malformed message: {}", self.connection, e);
            e
        })?;
        self.submit(message).map_err(|e| {
            debug!("connection {}: {}", self.connection, e);
            e
        })?;
        Ok(())
    }
}
