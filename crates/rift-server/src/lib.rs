//! rift-server: the public side of a rift tunnel.
//!
//! Clients log in over a control connection and register proxies. The server
//! binds their public endpoints, brokers client-dialed work connections to
//! incoming users and visitors, and coordinates hole punching for xtcp.

pub mod broker;
pub mod config;
pub mod control;
pub mod event;
pub mod nathole;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod visitor;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::ServerConfig;
pub use event::{EventBus, ServerEvent};
pub use server::{RiftServer, ServerContext};
