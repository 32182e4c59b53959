//! Page-side bridge to the extension
//!
//! Page code cannot reach extension storage directly. It posts a `PING` on
//! its own document channel; the relay living in the same document answers
//! with a `RULES` message. The bridge gives up after a short timeout so a
//! missing relay can never stall the page's network calls.

mod relay;

pub use relay::ContentRelay;

use crate::models::{BridgeMessage, MockedRequest, RulesPayload};
use std::time::Duration;
use tokio::sync::broadcast;

pub const DEFAULT_RULES_TIMEOUT: Duration = Duration::from_millis(250);
const CHANNEL_CAPACITY: usize = 64;

/// Same-document message channel. Every subscriber, including the poster,
/// observes every message posted after it subscribed.
#[derive(Debug, Clone)]
pub struct PageChannel {
    tx: broadcast::Sender<BridgeMessage>,
}

impl Default for PageChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl PageChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Posting with nobody listening is not an error.
    pub fn post_message(&self, message: BridgeMessage) {
        let _ = self.tx.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeMessage> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[derive(Debug, Clone)]
pub struct PageBridge {
    channel: PageChannel,
    timeout: Duration,
}

impl PageBridge {
    pub fn new(channel: PageChannel) -> Self {
        Self::with_timeout(channel, DEFAULT_RULES_TIMEOUT)
    }

    pub fn with_timeout(channel: PageChannel, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    pub fn channel(&self) -> &PageChannel {
        &self.channel
    }

    /// Current rules and switch, or [`RulesPayload::disabled`] if no relay
    /// answers in time.
    ///
    /// One listener is installed for the duration of the call and removed on
    /// every exit path, including cancellation.
    pub async fn request_rules(&self) -> RulesPayload {
        let mut listener = self.channel.subscribe();
        self.channel.post_message(BridgeMessage::Ping);

        let wait = async {
            loop {
                match listener.recv().await {
                    Ok(BridgeMessage::Rules { payload }) => return Some(payload),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "bridge listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(Some(payload)) => payload,
            Ok(None) => RulesPayload::disabled(),
            Err(_) => {
                tracing::debug!(timeout_ms = self.timeout.as_millis() as u64, "no rules reply, mocking off");
                RulesPayload::disabled()
            }
        }
    }

    /// Fire-and-forget notification that a call was mocked.
    pub fn notify_mocked(&self, payload: MockedRequest) {
        self.channel
            .post_message(BridgeMessage::MockedRequest { payload });
    }
}
