//! GraphQLens API
//!
//! Entry points for hosts embedding the core: proxy lifecycle and rule
//! administration.

pub mod proxy_api;
pub mod rules_api;
