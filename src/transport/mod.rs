//! Cross-context messaging primitives
//!
//! Contexts (page, relay, background, panel) never share memory; they talk
//! through the two channel kinds defined here:
//!
//! - [`Port`]: a long-lived duplex channel. Each end can post messages and
//!   observe the other end going away (its receiver yields `None`).
//! - [`RuntimeClient`]: one-shot request/response messaging to the
//!   background process.

use crate::models::{PortMessage, RuntimeMessage, RuntimeResponse};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

const CHANNEL_CLOSED_PATTERN: &str = "message channel is closed";
const CONTEXT_INVALIDATED_PATTERN: &str = "extension context invalidated";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Attempting to use a disconnected port object")]
    Disconnected,
    #[error("The message channel is closed before a response was received")]
    ChannelClosed,
    #[error("Extension context invalidated")]
    ContextInvalidated,
    /// Error text reported by the host environment.
    #[error("{0}")]
    Host(String),
}

impl TransportError {
    /// Errors after which the channel is known to be dead but a fresh one is
    /// likely to work.
    pub fn is_transient(&self) -> bool {
        let text = self.to_string().to_ascii_lowercase();
        text.contains(CHANNEL_CLOSED_PATTERN) || text.contains(CONTEXT_INVALIDATED_PATTERN)
    }

    /// The receiving side went away (tab navigated, page cached). Expected
    /// noise when forwarding to contexts that come and go.
    pub fn is_channel_closed(&self) -> bool {
        self.to_string()
            .to_ascii_lowercase()
            .contains(CHANNEL_CLOSED_PATTERN)
    }
}

pub type PortId = u64;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

fn next_port_id() -> PortId {
    NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Sending half of one port end. Clones share the same underlying channel,
/// so disconnecting any clone disconnects them all.
#[derive(Debug, Clone)]
pub struct PortSender {
    port_id: PortId,
    slot: Arc<Mutex<Option<mpsc::UnboundedSender<PortMessage>>>>,
}

impl PortSender {
    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    pub fn post_message(&self, message: PortMessage) -> Result<(), TransportError> {
        let guard = self.slot.lock().expect("port mutex poisoned");
        match guard.as_ref() {
            None => Err(TransportError::Disconnected),
            Some(tx) => tx.send(message).map_err(|_| TransportError::ChannelClosed),
        }
    }

    /// Close this end. The peer's receiver ends once it has drained what was
    /// already sent.
    pub fn disconnect(&self) {
        self.slot.lock().expect("port mutex poisoned").take();
    }

    pub fn is_connected(&self) -> bool {
        self.slot
            .lock()
            .expect("port mutex poisoned")
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

/// One end of a named duplex channel.
#[derive(Debug)]
pub struct Port {
    name: String,
    sender: PortSender,
    receiver: mpsc::UnboundedReceiver<PortMessage>,
}

impl Port {
    /// Two connected ends of a new channel.
    pub fn pair(name: &str) -> (Port, Port) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Port {
            name: name.to_string(),
            sender: PortSender {
                port_id: next_port_id(),
                slot: Arc::new(Mutex::new(Some(b_tx))),
            },
            receiver: a_rx,
        };
        let b = Port {
            name: name.to_string(),
            sender: PortSender {
                port_id: next_port_id(),
                slot: Arc::new(Mutex::new(Some(a_tx))),
            },
            receiver: b_rx,
        };
        (a, b)
    }

    pub fn id(&self) -> PortId {
        self.sender.port_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender(&self) -> PortSender {
        self.sender.clone()
    }

    pub fn post_message(&self, message: PortMessage) -> Result<(), TransportError> {
        self.sender.post_message(message)
    }

    pub fn disconnect(&self) {
        self.sender.disconnect();
    }

    /// Split into the sending half and the incoming message stream. The
    /// stream ending is this port's close event.
    pub fn into_parts(self) -> (PortSender, mpsc::UnboundedReceiver<PortMessage>) {
        (self.sender, self.receiver)
    }
}

/// Opens ports to the background process.
pub trait PortConnector: Send + Sync {
    fn connect(&self, name: &str) -> Result<Port, TransportError>;
}

/// One-shot messaging to the background process.
pub trait RuntimeClient: Send + Sync {
    /// `Ok(None)` means the background handled the message without replying.
    fn send_message(
        &self,
        message: RuntimeMessage,
    ) -> BoxFuture<'_, Result<Option<RuntimeResponse>, TransportError>>;
}
