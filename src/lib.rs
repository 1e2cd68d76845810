//! dnstap-blackhole - passive DNS blackholing feed.
//!
//! Watches resolver answers over dnstap, and when a blocklisted domain
//! resolves to an address, asks the routing daemon to null-route it for a
//! configurable time-to-live.

pub mod admission;
pub mod blocklist;
pub mod cache;
pub mod config;
pub mod dnstap;
pub mod error;
pub mod init;
pub mod routes;
pub mod stats;
pub mod store;
pub mod types;
