//! Receipt intake: relay-delivered mail stored, processed and archived under
//! a least-privilege policy, with tag-driven retention and budget alerts.

pub mod access;
pub mod config;
pub mod cost;
pub mod error;
pub mod invoker;
pub mod notify;
pub mod params;
pub mod pipeline;
pub mod server;
pub mod store;
