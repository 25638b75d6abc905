//! rift-client: the private side of a rift tunnel.
//!
//! Logs in to a rift server, registers the configured proxies, answers work
//! connection requests by dialing back and bridging to local services, and
//! runs visitor listeners for secret proxies.

pub mod client;
pub mod config;
pub mod control;
pub mod event;
mod udp;
pub mod visitor;
mod work;
pub mod xtcp;

#[cfg(test)]
pub(crate) mod testutil;

pub use client::{ClientContext, RiftClient};
pub use config::{ClientConfig, CommonSection, ProxyConfig, VisitorConfig};
pub use control::{ProxyStatus, Session};
pub use event::{ClientEvent, EventBus};
pub use visitor::VisitorHandle;
pub use xtcp::{punch_as_client, punch_as_visitor, Punch};
