use crate::bridge::PageChannel;
use crate::models::{BridgeMessage, MockedRequest, RulesPayload, RuntimeMessage, RuntimeResponse};
use crate::transport::RuntimeClient;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Runs in the page's document with access to the background process.
/// Answers rule requests from page code and forwards mock notifications.
pub struct ContentRelay {
    channel: PageChannel,
    runtime: Arc<dyn RuntimeClient>,
}

impl ContentRelay {
    pub fn new(channel: PageChannel, runtime: Arc<dyn RuntimeClient>) -> Self {
        Self { channel, runtime }
    }

    /// Start relaying. The listener is attached before this returns, so a
    /// `PING` posted right afterwards is seen. The task ends when the page
    /// channel closes or the handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        let rx = self.channel.subscribe();
        tokio::spawn(self.run(rx))
    }

    async fn run(self, mut rx: broadcast::Receiver<BridgeMessage>) {
        loop {
            match rx.recv().await {
                Ok(BridgeMessage::Ping) => {
                    let payload = self.fetch_rules().await;
                    self.channel.post_message(BridgeMessage::Rules { payload });
                }
                Ok(BridgeMessage::MockedRequest { payload }) => self.forward_mocked(payload).await,
                // Our own replies come back on the shared channel.
                Ok(BridgeMessage::Rules { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "relay fell behind the page channel");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!("content relay stopped");
    }

    async fn fetch_rules(&self) -> RulesPayload {
        match self.runtime.send_message(RuntimeMessage::GetRules).await {
            Ok(Some(RuntimeResponse::Rules(payload))) => payload,
            Ok(other) => {
                tracing::warn!(?other, "unexpected reply to rules request");
                RulesPayload::disabled()
            }
            Err(err) => {
                tracing::warn!("rules request failed: {err}");
                RulesPayload::disabled()
            }
        }
    }

    async fn forward_mocked(&self, payload: MockedRequest) {
        if let Err(err) = self
            .runtime
            .send_message(RuntimeMessage::MockedRequest { payload })
            .await
        {
            tracing::debug!("dropping mocked-request notification: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::PageBridge;
    use crate::models::Rule;
    use crate::transport::TransportError;
    use futures::future::{self, BoxFuture};
    use serde_json::json;
    use std::sync::Mutex;

    /// Records messages and replies with a fixed result.
    struct ScriptedRuntime {
        reply: Result<Option<RuntimeResponse>, TransportError>,
        seen: Mutex<Vec<RuntimeMessage>>,
    }

    impl ScriptedRuntime {
        fn new(reply: Result<Option<RuntimeResponse>, TransportError>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl RuntimeClient for ScriptedRuntime {
        fn send_message(
            &self,
            message: RuntimeMessage,
        ) -> BoxFuture<'_, Result<Option<RuntimeResponse>, TransportError>> {
            self.seen.lock().unwrap().push(message);
            Box::pin(future::ready(self.reply.clone()))
        }
    }

    fn stored() -> RulesPayload {
        RulesPayload::new(
            true,
            vec![Rule {
                id: "1".into(),
                operation_name: "GetUser".into(),
                endpoint: "/graphql".into(),
                status_code: 200,
                response: json!({"data": {}}),
                variables: None,
            }],
        )
    }

    #[tokio::test]
    async fn ping_is_answered_from_background() {
        let channel = PageChannel::new();
        let runtime = ScriptedRuntime::new(Ok(Some(RuntimeResponse::Rules(stored()))));
        let relay = ContentRelay::new(channel.clone(), runtime.clone()).spawn();

        let bridge = PageBridge::new(channel);
        assert_eq!(bridge.request_rules().await, stored());
        assert_eq!(runtime.seen.lock().unwrap()[0], RuntimeMessage::GetRules);
        relay.abort();
    }

    #[tokio::test]
    async fn background_failure_yields_safe_default_promptly() {
        let channel = PageChannel::new();
        let runtime = ScriptedRuntime::new(Err(TransportError::ContextInvalidated));
        let relay = ContentRelay::new(channel.clone(), runtime).spawn();

        // A long timeout proves the reply came from the relay, not the timer.
        let bridge = PageBridge::with_timeout(channel, std::time::Duration::from_secs(30));
        assert_eq!(bridge.request_rules().await, RulesPayload::disabled());
        relay.abort();
    }

    #[tokio::test]
    async fn mocked_notifications_are_forwarded() {
        let channel = PageChannel::new();
        let runtime = ScriptedRuntime::new(Err(TransportError::ChannelClosed));
        let relay = ContentRelay::new(channel.clone(), runtime.clone()).spawn();

        PageBridge::new(channel.clone()).notify_mocked(MockedRequest {
            url: "https://api.example.com/graphql".into(),
            body: "{}".into(),
            response: json!({"data": {}}),
            status_code: 200,
            timestamp: 1,
        });

        for _ in 0..50 {
            if !runtime.seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let seen = runtime.seen.lock().unwrap();
        assert!(matches!(seen[0], RuntimeMessage::MockedRequest { .. }));
        drop(seen);
        assert!(!relay.is_finished(), "forwarding errors are swallowed");
        relay.abort();
    }
}
