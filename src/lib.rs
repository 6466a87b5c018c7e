//! offcache: an offline-caching request intermediary.
//!
//! Requests are classified by [`router::Router`] and served by one of the
//! strategies in [`strategy`], backed by bounded regions in [`cache`].
//! Writes that cannot reach the network are kept in [`queue`] and replayed
//! on the next reconnect signal.

pub mod app;
pub mod cache;
pub mod config;
pub mod engine;
pub mod event;
pub mod http;
pub mod logging;
pub mod prefetch;
pub mod queue;
pub mod router;
pub mod strategy;
pub mod transport;
