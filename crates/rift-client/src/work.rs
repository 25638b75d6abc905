//! Work connections: dialed on `ReqWorkConn`, parked on the server until a
//! user or visitor arrives, then bound to the local service.

use crate::client::ClientContext;
use crate::config::ProxyConfig;
use crate::event::ClientEvent;
use crate::{udp, xtcp};
use rift_core::messages::{Message, NatHoleSid, NewWorkConn, StartWorkConn};
use rift_core::{auth_key, read_message, unix_now, write_message, BoxedStream, ProxyType, RiftError, RiftResult};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Dial one work connection for session `run_id` and serve whatever the server binds it to.
pub(crate) async fn serve(ctx: Arc<ClientContext>, run_id: String) {
    match handle(&ctx, &run_id).await {
        Ok(()) | Err(RiftError::StreamClosed) => {}
        Err(e) => warn!(run_id = %run_id, error = %e, "work connection failed"),
    }
}

async fn handle(ctx: &Arc<ClientContext>, run_id: &str) -> RiftResult<()> {
    let mut stream = ctx.dial().await?;
    let ts = unix_now();
    let hello = NewWorkConn {
        run_id: run_id.to_string(),
        privilege_key: auth_key(&ctx.config.common.token, ts),
        timestamp: ts,
    };
    write_message(&mut stream, &hello.into()).await?;

    // Parked until the server needs it; no deadline on our side.
    let start = match read_message(&mut stream, ctx.max_message_size).await? {
        Message::StartWorkConn(start) => start,
        other => {
            return Err(RiftError::MalformedMessage(format!(
                "expected StartWorkConn, got {:?}",
                other.msg_type()
            )))
        }
    };
    if !start.error.is_empty() {
        return Err(RiftError::Other(format!("work connection refused: {}", start.error)));
    }
    let proxy = ctx
        .config
        .proxy(&start.proxy_name)
        .ok_or_else(|| RiftError::ProxyNotFound(start.proxy_name.clone()))?;
    debug!(
        proxy = %proxy.name,
        src = %format!("{}:{}", start.src_addr, start.src_port),
        "work connection started"
    );

    match proxy.kind()? {
        ProxyType::Udp => udp::serve_carrier(stream, &proxy.local_endpoint(), ctx.max_message_size).await,
        // A hole-punch handoff has no tcp destination; relayed visitors do.
        ProxyType::Xtcp if start.dst_addr.is_empty() => punch(ctx, proxy, stream).await,
        _ => splice_local(stream, proxy, &start).await,
    }
}

async fn splice_local(mut stream: BoxedStream, proxy: &ProxyConfig, start: &StartWorkConn) -> RiftResult<()> {
    let endpoint = proxy.local_endpoint();
    let mut local = TcpStream::connect(&endpoint)
        .await
        .map_err(|e| RiftError::Transport(format!("connect local {endpoint}: {e}")))?;
    let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut local)
        .await
        .map_err(RiftError::from_stream)?;
    debug!(proxy = %proxy.name, src_addr = %start.src_addr, up, down, "work connection finished");
    Ok(())
}

async fn punch(ctx: &ClientContext, proxy: &ProxyConfig, mut stream: BoxedStream) -> RiftResult<()> {
    let sid = match read_message(&mut stream, ctx.max_message_size).await? {
        Message::NatHoleSid(NatHoleSid { sid }) => sid,
        other => {
            return Err(RiftError::MalformedMessage(format!(
                "expected NatHoleSid, got {:?}",
                other.msg_type()
            )))
        }
    };
    drop(stream);

    let server = ctx.server_udp_addr().await?;
    let punched = xtcp::punch_as_client(server, &proxy.name, &sid, ctx.config.common.nat_hole_timeout()).await?;
    ctx.events.emit(ClientEvent::PunchResolved(punched.outcome));
    Ok(())
}
