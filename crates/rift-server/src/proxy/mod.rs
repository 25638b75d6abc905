//! Public endpoints: accept user traffic and bridge it onto work connections.

pub mod tcp;
pub mod udp;

use crate::registry::{ListenTarget, ListenerKind, ProxyListener};
use crate::server::ServerContext;
use rift_core::{RiftError, RiftResult};
use std::sync::Arc;

/// Hand a bound endpoint to the runtime and start serving it.
///
/// The listener runs until its registry entry is removed.
pub(crate) fn spawn_listener(ctx: Arc<ServerContext>, listener: ProxyListener) -> RiftResult<()> {
    let ProxyListener {
        kind,
        target,
        cancel_rx,
    } = listener;

    match (kind, target) {
        (ListenerKind::Tcp(l), target) => {
            let l = tokio::net::TcpListener::from_std(l)?;
            tokio::spawn(tcp::accept_loop(ctx, l, target, cancel_rx));
        }
        (ListenerKind::Udp(s), ListenTarget::Proxy(proxy_name)) => {
            let s = tokio::net::UdpSocket::from_std(s)?;
            tokio::spawn(udp::serve(ctx, s, proxy_name, cancel_rx));
        }
        (ListenerKind::Udp(_), ListenTarget::Group(group)) => {
            return Err(RiftError::EndpointUnavailable(format!(
                "udp proxies cannot join group [{group}]"
            )));
        }
    }
    Ok(())
}
