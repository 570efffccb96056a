//! Lock-free command queue between connection handlers and the tick loop
//!
//! Uses crossbeam-channel for lock-free MPSC communication. Handlers submit
//! at any time; the game loop drains everything at the start of a tick, so
//! world state is never touched mid-tick.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::net::protocol::{ClientMessage, PlayerInput};

/// Transport-level connection handle. Client ids are assigned by the game
/// loop on join; connections keep this handle for their whole lifetime.
pub type ConnectionId = u64;

/// Something a client asked for, applied at the next tick boundary
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Join { connection: ConnectionId, name: String },
    Leave { connection: ConnectionId },
    Camera { connection: ConnectionId, zoom: f32 },
    Input { connection: ConnectionId, input: PlayerInput },
}

impl ClientCommand {
    /// Map a decoded client message to a command
    pub fn from_message(connection: ConnectionId, message: ClientMessage) -> Self {
        match message {
            ClientMessage::Join { name } => ClientCommand::Join { connection, name },
            ClientMessage::Input(input) => ClientCommand::Input { connection, input },
            ClientMessage::Camera { zoom } => ClientCommand::Camera { connection, zoom },
            ClientMessage::Leave => ClientCommand::Leave { connection },
        }
    }

    pub fn connection(&self) -> ConnectionId {
        match self {
            ClientCommand::Join { connection, .. }
            | ClientCommand::Leave { connection }
            | ClientCommand::Camera { connection, .. }
            | ClientCommand::Input { connection, .. } => *connection,
        }
    }
}

/// Lock-free command queue using bounded channel
///
/// Multiple connection handlers can submit without blocking,
/// and the game loop drains all pending commands at the start of each tick.
pub struct CommandQueue {
    /// Sender side - cloned to each connection handler
    sender: Sender<ClientCommand>,
    /// Receiver side - used by game loop
    receiver: Receiver<ClientCommand>,
    /// Buffer capacity for tracking
    capacity: usize,
}

impl CommandQueue {
    /// Create a new queue with given capacity
    ///
    /// Capacity should be large enough to handle burst inputs between
    /// ticks (e.g., 1000 for 100+ clients at 60 Hz client rate)
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    /// Create a new sender handle for a connection
    pub fn sender(&self) -> CommandSender {
        CommandSender {
            sender: self.sender.clone(),
        }
    }

    /// Try to submit a command (non-blocking)
    ///
    /// Returns true if successful, false if the queue is full
    #[inline]
    pub fn try_submit(&self, command: ClientCommand) -> bool {
        self.sender.try_send(command).is_ok()
    }

    /// Drain all pending commands for this tick
    pub fn drain(&self) -> Vec<ClientCommand> {
        self.receiver.try_iter().collect()
    }

    /// Get number of pending commands
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        // ~100 clients * 10 commands per tick
        Self::new(1000)
    }
}

/// Clonable sender handle for connection handlers
#[derive(Clone)]
pub struct CommandSender {
    sender: Sender<ClientCommand>,
}

impl CommandSender {
    /// Submit a command (non-blocking)
    #[inline]
    pub fn try_send(&self, command: ClientCommand) -> Result<(), QueueError> {
        self.sender.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Disconnected(_) => QueueError::Disconnected,
        })
    }
}

/// Command queue errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Queue is full (backpressure)
    #[error("command queue full")]
    Full,
    /// Channel disconnected (game loop stopped)
    #[error("game loop stopped")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(connection: ConnectionId, sequence: u32) -> ClientCommand {
        ClientCommand::Input {
            connection,
            input: PlayerInput::new(sequence),
        }
    }

    #[test]
    fn test_submit_and_drain_preserves_order() {
        let queue = CommandQueue::new(10);

        assert!(queue.try_submit(input(1, 1)));
        assert!(queue.try_submit(input(2, 2)));
        assert!(queue.try_submit(ClientCommand::Leave { connection: 1 }));
        assert_eq!(queue.pending_count(), 3);

        let commands = queue.drain();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0], input(1, 1));
        assert_eq!(commands[1].connection(), 2);
        assert_eq!(commands[2], ClientCommand::Leave { connection: 1 });
        assert!(queue.is_empty());
    }

    #[test]
    fn test_backpressure() {
        let queue = CommandQueue::new(2);
        assert!(queue.try_submit(input(1, 1)));
        assert!(queue.try_submit(input(1, 2)));
        assert!(!queue.try_submit(input(1, 3)));

        queue.drain();
        assert!(queue.try_submit(input(1, 3)));
    }

    #[test]
    fn test_sender_clone_and_disconnect() {
        let queue = CommandQueue::new(1);
        let sender = queue.sender();
        let other = sender.clone();

        assert!(sender.try_send(input(1, 1)).is_ok());
        assert_eq!(other.try_send(input(1, 2)), Err(QueueError::Full));

        drop(queue);
        assert_eq!(sender.try_send(input(1, 3)), Err(QueueError::Disconnected));
    }

    #[test]
    fn test_from_message() {
        assert_eq!(
            ClientCommand::from_message(4, ClientMessage::Camera { zoom: 0.5 }),
            ClientCommand::Camera { connection: 4, zoom: 0.5 }
        );
        assert_eq!(
            ClientCommand::from_message(4, ClientMessage::Join { name: "x".into() }),
            ClientCommand::Join { connection: 4, name: "x".into() }
        );
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(CommandQueue::default().capacity(), 1000);
    }
}
