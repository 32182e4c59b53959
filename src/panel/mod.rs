//! Devtools panel side of the panel/background port
//!
//! [`PanelTransport`] keeps one live port to the background process and
//! registers it for the inspected tab. Closed ports are retried on a bounded
//! schedule; after too many failures the transport gives up until the panel
//! becomes visible again.
//!
//! ```text
//!   DISCONNECTED --connect--> CONNECTING --ok--> CONNECTED
//!                                 |                  |
//!                               error              closed
//!                                 v                  v
//!                          RECONNECT_SCHEDULED <-----+
//!                                 |   \
//!                            timer     attempts >= max
//!                                 v     \
//!                            CONNECTING  ABORTED
//! ```

mod requests;

pub use requests::{LoggedRequest, MockedRequestLog};

use crate::background::DEVTOOLS_PORT_NAME;
use crate::models::{PortMessage, TabId};
use crate::transport::{PortConnector, PortSender};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Retry schedule: `min(base + attempts * step, cap)`, at most
/// `max_attempts` scheduled retries in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub step: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            step: Duration::from_millis(300),
            cap: Duration::from_millis(5000),
            max_attempts: 20,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempts: u32) -> Duration {
        (self.base + self.step * attempts).min(self.cap)
    }
}

pub type ListenerId = u64;
type Listener = Arc<dyn Fn(&PortMessage) + Send + Sync>;

struct ReconnectState {
    attempts: u32,
    connecting: bool,
    channel: Option<PortSender>,
    state: PortState,
    /// Bumped on every connection attempt and forced reconnect. Port
    /// watchers and retry timers carry the value they were created under
    /// and do nothing once it is stale.
    generation: u64,
    shut_down: bool,
}

struct Shared {
    connector: Arc<dyn PortConnector>,
    tab_id: TabId,
    policy: ReconnectPolicy,
    state: Mutex<ReconnectState>,
    listeners: Mutex<BTreeMap<ListenerId, Listener>>,
    next_listener: AtomicU64,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, ReconnectState> {
        self.state.lock().expect("panel state mutex poisoned")
    }

    fn dispatch(&self, message: &PortMessage) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .expect("listener mutex poisoned")
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(message);
        }
    }
}

/// Panel end of the devtools port. Clones share the same connection.
///
/// Methods that (re)connect spawn tasks and must run inside a Tokio runtime.
#[derive(Clone)]
pub struct PanelTransport {
    shared: Arc<Shared>,
}

impl PanelTransport {
    pub fn new(connector: Arc<dyn PortConnector>, tab_id: TabId) -> Self {
        Self::with_policy(connector, tab_id, ReconnectPolicy::default())
    }

    pub fn with_policy(connector: Arc<dyn PortConnector>, tab_id: TabId, policy: ReconnectPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                tab_id,
                policy,
                state: Mutex::new(ReconnectState {
                    attempts: 0,
                    connecting: false,
                    channel: None,
                    state: PortState::Disconnected,
                    generation: 0,
                    shut_down: false,
                }),
                listeners: Mutex::new(BTreeMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn tab_id(&self) -> TabId {
        self.shared.tab_id
    }

    pub fn state(&self) -> PortState {
        self.shared.state().state
    }

    pub fn attempts(&self) -> u32 {
        self.shared.state().attempts
    }

    /// Delay the next scheduled retry would use.
    pub fn next_delay(&self) -> Duration {
        self.shared.policy.delay_for(self.attempts())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PortState::Connected
    }

    /// Open a port and register it for the inspected tab. A no-op while a
    /// connection attempt is already running.
    pub fn connect(&self) {
        let generation = {
            let mut st = self.shared.state();
            if st.connecting || st.shut_down {
                return;
            }
            st.connecting = true;
            st.state = PortState::Connecting;
            st.generation += 1;
            st.generation
        };

        match self.shared.connector.connect(DEVTOOLS_PORT_NAME) {
            Ok(port) => {
                let (sender, incoming) = port.into_parts();
                if let Err(err) = sender.post_message(PortMessage::Register {
                    tab_id: self.shared.tab_id,
                }) {
                    tracing::debug!("register message not delivered: {err}");
                }
                {
                    let mut st = self.shared.state();
                    st.attempts = 0;
                    st.connecting = false;
                    st.channel = Some(sender);
                    st.state = PortState::Connected;
                }
                tracing::info!(tab_id = self.shared.tab_id, "devtools port connected");
                tokio::spawn(watch_port(Arc::clone(&self.shared), generation, incoming));
            }
            Err(err) => {
                self.shared.state().connecting = false;
                tracing::warn!("devtools port connect failed: {err}");
                schedule_reconnect(&self.shared, "connect-error");
            }
        }
    }

    /// Drop the current port, if any, and connect again right away. Also
    /// revives a transport that gave up.
    pub fn reconnect(&self) {
        let old = {
            let mut st = self.shared.state();
            if st.shut_down {
                return;
            }
            st.generation += 1;
            if st.state == PortState::Aborted {
                st.attempts = 0;
            }
            st.state = PortState::Disconnected;
            st.channel.take()
        };
        if let Some(old) = old {
            old.disconnect();
        }
        self.connect();
    }

    /// The panel came back into view; its port may have gone stale.
    pub fn on_visibility_change(&self, visibility: Visibility) {
        if visibility == Visibility::Visible {
            self.reconnect();
        }
    }

    /// The panel document was shown. `persisted` means it was restored from
    /// the back/forward cache.
    pub fn on_page_show(&self, persisted: bool) {
        if persisted {
            self.reconnect();
        }
    }

    /// Best-effort send. Returns whether the message was handed to a live
    /// port; when it was not, a reconnect is started so the next message has
    /// a chance.
    pub fn post_message(&self, message: PortMessage) -> bool {
        let channel = self.shared.state().channel.clone();
        let Some(channel) = channel else {
            tracing::debug!("no devtools port, reconnecting and dropping message");
            self.reconnect();
            return false;
        };
        match channel.post_message(message) {
            Ok(()) => true,
            Err(err) if err.is_transient() => {
                tracing::warn!("devtools port invalidated, reconnecting: {err}");
                self.reconnect();
                false
            }
            Err(err) => {
                tracing::warn!("devtools post_message failed: {err}");
                false
            }
        }
    }

    /// Register a listener for messages from the background. Listeners stay
    /// attached across reconnects.
    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PortMessage) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .lock()
            .expect("listener mutex poisoned")
            .insert(id, Arc::new(listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared
            .listeners
            .lock()
            .expect("listener mutex poisoned")
            .remove(&id)
            .is_some()
    }

    /// Panel unload: close the port and stop retrying for good.
    pub fn shutdown(&self) {
        let old = {
            let mut st = self.shared.state();
            st.shut_down = true;
            st.generation += 1;
            st.state = PortState::Disconnected;
            st.channel.take()
        };
        if let Some(old) = old {
            old.disconnect();
        }
        tracing::debug!(tab_id = self.shared.tab_id, "panel transport shut down");
    }
}

async fn watch_port(
    shared: Arc<Shared>,
    generation: u64,
    mut incoming: mpsc::UnboundedReceiver<PortMessage>,
) {
    while let Some(message) = incoming.recv().await {
        shared.dispatch(&message);
    }

    let current = {
        let mut st = shared.state();
        if st.generation != generation || st.shut_down {
            false
        } else {
            st.channel = None;
            true
        }
    };
    if current {
        tracing::info!("devtools port closed");
        schedule_reconnect(&shared, "disconnect");
    }
}

fn schedule_reconnect(shared: &Arc<Shared>, reason: &'static str) {
    let (delay, token) = {
        let mut st = shared.state();
        if st.shut_down {
            return;
        }
        if st.attempts >= shared.policy.max_attempts {
            st.state = PortState::Aborted;
            st.channel = None;
            tracing::warn!(
                reason,
                attempts = st.attempts,
                "devtools port reconnect aborted after max attempts"
            );
            return;
        }
        let delay = shared.policy.delay_for(st.attempts);
        st.attempts += 1;
        st.state = PortState::ReconnectScheduled;
        (delay, st.generation)
    };

    tracing::debug!(reason, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let due = {
            let st = shared.state();
            !st.shut_down && st.state == PortState::ReconnectScheduled && st.generation == token
        };
        if due {
            PanelTransport { shared }.connect();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::Background;
    use crate::storage::MemoryRuleStore;
    use crate::transport::{Port, TransportError};
    use std::sync::atomic::AtomicUsize;

    /// Fails every connect, counting attempts.
    #[derive(Default)]
    struct DeadConnector {
        calls: AtomicUsize,
    }

    impl PortConnector for DeadConnector {
        fn connect(&self, _name: &str) -> Result<Port, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Host("Could not establish connection".into()))
        }
    }

    /// Hands out ports and keeps the far ends so tests can close them.
    #[derive(Default)]
    struct ManualConnector {
        far_ends: Mutex<Vec<Port>>,
    }

    impl ManualConnector {
        fn close_latest(&self) {
            self.far_ends.lock().unwrap().pop();
        }

        fn opened(&self) -> usize {
            self.far_ends.lock().unwrap().len()
        }
    }

    impl PortConnector for ManualConnector {
        fn connect(&self, name: &str) -> Result<Port, TransportError> {
            let (near, far) = Port::pair(name);
            self.far_ends.lock().unwrap().push(far);
            Ok(near)
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn default_policy_schedule() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1400));
        assert_eq!(policy.delay_for(15), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(19), Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn three_failures_back_off_linearly() {
        let connector = Arc::new(DeadConnector::default());
        let transport = PanelTransport::new(connector.clone(), 1);

        transport.connect();
        assert_eq!(transport.state(), PortState::ReconnectScheduled);
        assert_eq!(transport.attempts(), 1);

        tokio::time::sleep(Duration::from_millis(501)).await;
        assert_eq!(transport.attempts(), 2);
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(transport.attempts(), 3);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(transport.next_delay(), Duration::from_millis(1400));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let connector = Arc::new(DeadConnector::default());
        let transport = PanelTransport::new(connector.clone(), 1);

        transport.connect();
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(transport.state(), PortState::Aborted);
        assert_eq!(transport.attempts(), 20);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 21);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.calls.load(Ordering::SeqCst), 21, "no retries once aborted");
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_revives_an_aborted_transport() {
        let policy = ReconnectPolicy {
            max_attempts: 2,
            ..ReconnectPolicy::default()
        };
        let connector = Arc::new(DeadConnector::default());
        let transport = PanelTransport::with_policy(connector.clone(), 1, policy);
        transport.connect();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.state(), PortState::Aborted);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);

        transport.on_visibility_change(Visibility::Hidden);
        assert_eq!(transport.state(), PortState::Aborted);
        transport.on_visibility_change(Visibility::Visible);
        assert_eq!(transport.state(), PortState::ReconnectScheduled);
        assert_eq!(transport.attempts(), 1);

        // The revived transport gets a full budget, then gives up again.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.state(), PortState::Aborted);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn close_schedules_reconnect_and_success_resets_attempts() {
        let connector = Arc::new(ManualConnector::default());
        let transport = PanelTransport::new(connector.clone(), 9);
        transport.connect();
        assert!(transport.is_connected());

        connector.close_latest();
        settle().await;
        assert_eq!(transport.state(), PortState::ReconnectScheduled);
        assert_eq!(transport.attempts(), 1);

        tokio::time::sleep(Duration::from_millis(501)).await;
        assert!(transport.is_connected());
        assert_eq!(transport.attempts(), 0);
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_reconnect_does_not_double_schedule() {
        let connector = Arc::new(ManualConnector::default());
        let transport = PanelTransport::new(connector.clone(), 9);
        transport.connect();

        transport.on_page_show(false);
        assert_eq!(connector.opened(), 1);

        transport.on_page_show(true);
        settle().await;
        assert!(transport.is_connected());
        assert_eq!(connector.opened(), 2);

        // The superseded port closing must not trigger a retry.
        connector.far_ends.lock().unwrap().remove(0);
        settle().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(transport.is_connected());
        assert_eq!(transport.attempts(), 0);
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_is_ignored() {
        let connector = Arc::new(ManualConnector::default());
        let transport = PanelTransport::new(connector.clone(), 9);
        transport.connect();
        connector.close_latest();
        settle().await;
        assert_eq!(transport.state(), PortState::ReconnectScheduled);

        transport.on_visibility_change(Visibility::Visible);
        assert!(transport.is_connected());
        assert_eq!(connector.opened(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.opened(), 1, "the old timer did not connect again");
    }

    #[tokio::test]
    async fn post_without_channel_reconnects() {
        let connector = Arc::new(ManualConnector::default());
        let transport = PanelTransport::new(connector.clone(), 3);
        assert!(!transport.post_message(PortMessage::Register { tab_id: 3 }));
        assert!(transport.is_connected());
        assert!(transport.post_message(PortMessage::Register { tab_id: 3 }));
    }

    #[tokio::test]
    async fn listeners_survive_reconnects() {
        let bg = Background::new(Arc::new(MemoryRuleStore::new()));
        let transport = PanelTransport::new(Arc::new(bg.clone()), 4);
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        let id = transport.on_message(move |msg| {
            if matches!(msg, PortMessage::MockedRequest { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        transport.connect();
        settle().await;
        send_mocked(&bg, 4).await;
        transport.reconnect();
        settle().await;
        send_mocked(&bg, 4).await;
        settle().await;
        assert_eq!(received.load(Ordering::SeqCst), 2);

        assert!(transport.remove_listener(id));
        send_mocked(&bg, 4).await;
        settle().await;
        assert_eq!(received.load(Ordering::SeqCst), 2);
    }

    async fn send_mocked(bg: &Background, tab_id: TabId) {
        use crate::models::{MessageSender, MockedRequest, RuntimeMessage};
        bg.handle_message(
            RuntimeMessage::MockedRequest {
                payload: MockedRequest {
                    url: "/graphql".into(),
                    body: String::new(),
                    response: serde_json::json!({}),
                    status_code: 200,
                    timestamp: 0,
                },
            },
            MessageSender::tab(tab_id),
        )
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_everything() {
        let connector = Arc::new(ManualConnector::default());
        let transport = PanelTransport::new(connector.clone(), 2);
        transport.connect();
        transport.shutdown();
        settle().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.state(), PortState::Disconnected);
        transport.connect();
        assert_eq!(transport.state(), PortState::Disconnected);
    }
}
