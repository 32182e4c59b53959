//! HTTP proxy host
//!
//! Puts the fetch interceptor in front of real traffic: the server accepts
//! proxied HTTP requests and the upstream client performs the calls that no
//! rule answers.

pub mod server;
pub mod upstream;

pub use server::*;
pub use upstream::UpstreamFetch;
