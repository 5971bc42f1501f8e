//! Offline-first client runtime for a fleet tracking API.
//!
//! Every remote call goes through [`dispatch::Dispatcher`]: reads fall back
//! to a durable cache, mutations are queued while offline and replayed on
//! reconnect, and branding assets are kept in sync by version marker.

pub mod branding;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod connectivity;
pub mod dispatch;
pub mod events;
pub mod http;
pub mod queue;
pub mod runtime;
pub mod session;
pub mod store;

pub use config::Config;
pub use runtime::Runtime;
