//! Visitor links: a peer that knows a secret proxy's `sk` reaches it through
//! the server without a public port.

use crate::broker::{TransformFlags, WorkConn};
use crate::server::ServerContext;
use rift_core::messages::{NewVisitorConn, NewVisitorConnResp, StartWorkConn};
use rift_core::{verify_auth_key, write_message, BoxedStream, RiftError, RiftResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Serve a connection that opened with `NewVisitorConn`.
pub(crate) async fn handle(
    ctx: Arc<ServerContext>,
    mut stream: BoxedStream,
    req: NewVisitorConn,
    peer: SocketAddr,
    local: SocketAddr,
) -> RiftResult<()> {
    let proxy_name = req.proxy_name.clone();
    let mut work = match link(&ctx, &req, peer, local).await {
        Ok(work) => work,
        Err(e) => {
            warn!(proxy = %proxy_name, peer = %peer, error = %e, "visitor rejected");
            let resp = NewVisitorConnResp {
                proxy_name,
                error: e.to_string(),
            };
            let _ = write_message(&mut stream, &resp.into()).await;
            return Err(e);
        }
    };

    let resp = NewVisitorConnResp {
        proxy_name: proxy_name.clone(),
        error: String::new(),
    };
    write_message(&mut stream, &resp.into()).await?;
    info!(proxy = %proxy_name, peer = %peer, "visitor linked");

    let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut work.stream)
        .await
        .map_err(RiftError::from_stream)?;
    debug!(proxy = %proxy_name, peer = %peer, up, down, "visitor link finished");
    Ok(())
}

async fn link(
    ctx: &ServerContext,
    req: &NewVisitorConn,
    peer: SocketAddr,
    local: SocketAddr,
) -> RiftResult<WorkConn> {
    let route = ctx
        .registry
        .lookup(&req.proxy_name)
        .await
        .ok_or_else(|| RiftError::ProxyNotFound(req.proxy_name.clone()))?;
    if !route.proxy_type.is_visitor_reachable() {
        return Err(RiftError::AuthenticationFailed(format!(
            "proxy [{}] of type {} does not accept visitors",
            req.proxy_name, route.proxy_type
        )));
    }
    verify_auth_key(
        &route.sk,
        req.timestamp,
        &req.sign_key,
        ctx.config.freshness_window,
    )
    .map_err(|_| RiftError::AuthenticationFailed("invalid sign key".into()))?;

    let start = StartWorkConn {
        proxy_name: route.name.clone(),
        src_addr: peer.ip().to_string(),
        src_port: peer.port(),
        dst_addr: local.ip().to_string(),
        dst_port: local.port(),
        error: String::new(),
    };
    let flags = TransformFlags {
        use_encryption: req.use_encryption,
        use_compression: req.use_compression,
    };
    route.control.pool.start_work_conn(start, flags).await
}
