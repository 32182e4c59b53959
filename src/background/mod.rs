//! Background process
//!
//! Owns rule storage and the association between inspected tabs and their
//! devtools panels. Relays reach it with one-shot [`RuntimeMessage`]s;
//! panels hold a long-lived [`Port`] and register the tab they inspect.

use crate::models::{MessageSender, PortMessage, RuntimeMessage, RuntimeResponse, TabId};
use crate::storage::{self, RuleStore};
use crate::transport::{Port, PortConnector, PortSender, RuntimeClient, TransportError};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const DEVTOOLS_PORT_NAME: &str = "devtools";

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Background {
    store: Arc<dyn RuleStore>,
    devtools_ports: Arc<DashMap<TabId, PortSender>>,
    alive: Arc<AtomicBool>,
}

impl Background {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self {
            store,
            devtools_ports: Arc::new(DashMap::new()),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn store(&self) -> Arc<dyn RuleStore> {
        Arc::clone(&self.store)
    }

    /// First-run setup.
    pub async fn install(&self) -> anyhow::Result<()> {
        storage::install_defaults(self.store.as_ref()).await
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Tear the process down. Open ports close, and every later connect or
    /// runtime message fails with [`TransportError::ContextInvalidated`].
    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        for entry in self.devtools_ports.iter() {
            entry.value().disconnect();
        }
        self.devtools_ports.clear();
        tracing::info!("background stopped");
    }

    pub async fn handle_message(
        &self,
        message: RuntimeMessage,
        sender: MessageSender,
    ) -> Option<RuntimeResponse> {
        match message {
            RuntimeMessage::GetRules => Some(RuntimeResponse::Rules(
                storage::load_payload(self.store.as_ref()).await,
            )),
            RuntimeMessage::SetRules { rules } => {
                let result = storage::save_rules(self.store.as_ref(), &rules).await;
                Some(ack("saving rules", result))
            }
            RuntimeMessage::SetEnabled { enabled } => {
                let result = storage::save_enabled(self.store.as_ref(), enabled).await;
                Some(ack("saving mocking switch", result))
            }
            RuntimeMessage::MockedRequest { payload } => {
                let Some(tab_id) = sender.tab_id else {
                    tracing::debug!("mocked-request notification without a tab");
                    return None;
                };
                if let Some(port) = self.devtools_ports.get(&tab_id).map(|p| p.value().clone()) {
                    safe_send(&port, PortMessage::MockedRequest { payload });
                }
                None
            }
            RuntimeMessage::RegisterDevtools => Some(RuntimeResponse::Ack { success: true }),
        }
    }

    /// Take ownership of the background end of a newly opened port.
    pub fn accept_port(&self, port: Port) {
        if port.name() != DEVTOOLS_PORT_NAME {
            tracing::debug!(name = port.name(), "ignoring port");
            return;
        }

        let (sender, mut incoming) = port.into_parts();
        let ports = Arc::clone(&self.devtools_ports);
        tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                match message {
                    PortMessage::Register { tab_id } if tab_id != 0 => {
                        tracing::info!(tab_id, port_id = sender.port_id(), "devtools registered");
                        ports.insert(tab_id, sender.clone());
                    }
                    other => tracing::debug!(?other, "unexpected message on devtools port"),
                }
            }
            let port_id = sender.port_id();
            ports.retain(|_, registered| registered.port_id() != port_id);
            sender.disconnect();
            tracing::debug!(port_id, "devtools port closed");
        });
    }

    pub fn devtools_port(&self, tab_id: TabId) -> Option<PortSender> {
        self.devtools_ports.get(&tab_id).map(|p| p.value().clone())
    }

    pub fn registered_tabs(&self) -> Vec<TabId> {
        let mut tabs: Vec<TabId> = self.devtools_ports.iter().map(|e| *e.key()).collect();
        tabs.sort_unstable();
        tabs
    }

    /// Runtime messaging endpoint for a relay running in `tab_id`.
    pub fn runtime_for_tab(&self, tab_id: TabId) -> Arc<dyn RuntimeClient> {
        Arc::new(TabRuntime {
            background: self.clone(),
            sender: MessageSender::tab(tab_id),
        })
    }
}

impl PortConnector for Background {
    fn connect(&self, name: &str) -> Result<Port, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::ContextInvalidated);
        }
        let (client, server) = Port::pair(name);
        self.accept_port(server);
        Ok(client)
    }
}

struct TabRuntime {
    background: Background,
    sender: MessageSender,
}

impl RuntimeClient for TabRuntime {
    fn send_message(
        &self,
        message: RuntimeMessage,
    ) -> BoxFuture<'_, Result<Option<RuntimeResponse>, TransportError>> {
        Box::pin(async move {
            if !self.background.is_alive() {
                return Err(TransportError::ContextInvalidated);
            }
            Ok(self.background.handle_message(message, self.sender).await)
        })
    }
}

fn ack(what: &str, result: anyhow::Result<()>) -> RuntimeResponse {
    match result {
        Ok(()) => RuntimeResponse::Ack { success: true },
        Err(err) => {
            tracing::error!("{what} failed: {err:#}");
            RuntimeResponse::Ack { success: false }
        }
    }
}

/// Forward to a context that may already be gone. A closed channel is
/// expected and stays quiet; anything else is worth a warning.
pub fn safe_send(port: &PortSender, message: PortMessage) {
    if let Err(err) = port.post_message(message) {
        if err.is_channel_closed() {
            tracing::trace!("devtools channel closed, dropping message");
        } else {
            tracing::warn!("forwarding to devtools failed: {err}");
        }
    }
}
