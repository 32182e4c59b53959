//! Data models for GraphQLens
//!
//! These models travel between the page, relay, background and panel
//! contexts, so every type here is an owned, serializable value.

pub mod fetch;
pub mod messages;
pub mod rule;

pub use fetch::*;
pub use messages::*;
pub use rule::*;
