//! # GraphQLens Core
//!
//! GraphQL request mocking engine. Outgoing GraphQL calls are matched against
//! user-authored rules and answered with a fabricated response instead of
//! reaching the network.
//!
//! ## Features
//!
//! - Request parsing for JSON, form-encoded and raw GraphQL bodies
//! - Rule matching by endpoint, operation name and exact variables
//! - Rule storage (SQLite, in-memory, read-through cache)
//! - Cross-context transport with a self-healing panel port
//! - HTTP proxy host with upstream pass-through
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐  PageChannel   ┌──────────────┐
//! │ page: FetchInterceptor   │◄──────────────►│ ContentRelay │
//! │       PageBridge         │  PING / RULES  └──────┬───────┘
//! └────────────┬─────────────┘                       │ RuntimeMessage
//!              │ Fetch                        ┌──────▼───────┐
//!       ┌──────▼──────┐                       │  Background  │── RuleStore
//!       │ proxy host  │                       └──────┬───────┘
//!       │ + upstream  │                              │ Port
//!       └─────────────┘                       ┌──────▼───────┐
//!                                             │ PanelTransport│
//!                                             │ + request log │
//!                                             └──────────────┘
//! ```

pub mod api;
pub mod background;
pub mod bridge;
pub mod graphql;
pub mod interceptor;
pub mod models;
pub mod panel;
pub mod proxy;
pub mod rules;
pub mod storage;
pub mod transport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
