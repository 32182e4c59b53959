//! Messages exchanged between the page, the relay, the background process
//! and the devtools panel.
//!
//! Each context only ever sees owned values of these types; nothing is shared
//! by reference across a boundary. The serde representations match the wire
//! shapes used on each channel.

use crate::models::{Rule, RulesPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Browser tab identifier.
pub type TabId = u32;

/// Notification that a call was answered from a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockedRequest {
    pub url: String,
    /// Original request body
    pub body: String,
    /// Response served in place of the real one
    pub response: Value,
    pub status_code: u16,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// Same-document messages between page code and the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__marker")]
pub enum BridgeMessage {
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "RULES")]
    Rules { payload: RulesPayload },
    #[serde(rename = "MOCKED_REQUEST")]
    MockedRequest { payload: MockedRequest },
}

/// One-shot requests sent to the background process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuntimeMessage {
    #[serde(rename = "GQLENS_GET_RULES")]
    GetRules,
    #[serde(rename = "GQLENS_SET_RULES")]
    SetRules { rules: Vec<Rule> },
    #[serde(rename = "GQLENS_SET_ENABLED")]
    SetEnabled { enabled: bool },
    #[serde(rename = "GQLENS_MOCKED_REQUEST")]
    MockedRequest { payload: MockedRequest },
    #[serde(rename = "GQLENS_REGISTER_DEVTOOLS")]
    RegisterDevtools,
}

/// Replies from the background process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuntimeResponse {
    Ack { success: bool },
    Rules(RulesPayload),
}

/// Who sent a runtime message. Messages from a relay carry the tab it runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageSender {
    pub tab_id: Option<TabId>,
}

impl MessageSender {
    pub fn tab(tab_id: TabId) -> Self {
        Self {
            tab_id: Some(tab_id),
        }
    }
}

/// Messages carried on the long-lived panel/background port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PortMessage {
    #[serde(rename = "REGISTER")]
    Register {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
    #[serde(rename = "MOCKED_REQUEST")]
    MockedRequest { payload: MockedRequest },
}
