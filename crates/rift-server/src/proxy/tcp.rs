//! tcp proxies: one accept loop per public port.

use crate::registry::ListenTarget;
use crate::server::ServerContext;
use rift_core::messages::StartWorkConn;
use rift_core::transport::ACCEPT_ERROR_BACKOFF;
use rift_core::{RiftError, RiftResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) async fn accept_loop(
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    target: ListenTarget,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    info!(port, listen = ?target, "tcp proxy listening");

    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(port, "tcp proxy listener stopped");
                break;
            }
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    let target = target.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_user_conn(&ctx, &target, stream, peer).await {
                            debug!(peer = %peer, error = %e, "user connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(port, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

async fn handle_user_conn(
    ctx: &ServerContext,
    target: &ListenTarget,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> RiftResult<()> {
    let _ = stream.set_nodelay(true);
    let route = ctx.registry.resolve(target).await.ok_or_else(|| {
        RiftError::ProxyNotFound(match target {
            ListenTarget::Proxy(name) | ListenTarget::Group(name) => name.clone(),
        })
    })?;

    let local = stream.local_addr()?;
    let start = StartWorkConn {
        proxy_name: route.name.clone(),
        src_addr: peer.ip().to_string(),
        src_port: peer.port(),
        dst_addr: local.ip().to_string(),
        dst_port: local.port(),
        error: String::new(),
    };
    let mut work = match route.control.pool.start_work_conn(start, route.transform).await {
        Ok(w) => w,
        Err(e) => {
            warn!(proxy = %route.name, peer = %peer, error = %e, "no work connection for user");
            return Err(e);
        }
    };

    let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut work.stream)
        .await
        .map_err(RiftError::from_stream)?;
    debug!(proxy = %route.name, peer = %peer, up, down, "user connection finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::ServerConfig;
    use crate::testutil::*;
    use rift_core::messages::*;
    use rift_core::{read_message, write_message};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn user_traffic_reaches_work_conn() {
        let server = start_server(test_config()).await;
        let (mut control, login_resp) = login(server.addr, TOKEN, "").await;
        let resp = new_proxy(&mut control, tcp_proxy("echo", 0)).await;
        assert!(resp.error.is_empty(), "{}", resp.error);
        let port = public_port(&resp.remote_addr);

        let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let user_port = user.local_addr().unwrap().port();
        expect_req_work_conn(&mut control).await;

        let mut work = dial_work_conn(server.addr, &login_resp.run_id).await;
        let Message::StartWorkConn(start) = read_message(&mut work, 1 << 20).await.unwrap() else {
            panic!("expected StartWorkConn");
        };
        assert_eq!(start.proxy_name, "echo");
        assert_eq!(start.src_port, user_port);
        assert_eq!(start.dst_port, port);

        user.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        work.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        work.write_all(b"pong").await.unwrap();
        user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn user_dropped_when_no_work_conn_arrives() {
        let server = start_server(ServerConfig {
            pending_conn_timeout: Duration::from_millis(200),
            ..test_config()
        })
        .await;
        let (mut control, _) = login(server.addr, TOKEN, "").await;
        let resp = new_proxy(&mut control, tcp_proxy("idle", 0)).await;
        let port = public_port(&resp.remote_addr);

        let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), user.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn closed_proxy_stops_accepting() {
        let server = start_server(test_config()).await;
        let (mut control, _) = login(server.addr, TOKEN, "").await;
        let resp = new_proxy(&mut control, tcp_proxy("gone", 0)).await;
        let port = public_port(&resp.remote_addr);

        write_message(
            &mut control,
            &CloseProxy {
                proxy_name: "gone".into(),
            }
            .into(),
        )
        .await
        .unwrap();

        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(refused, "listener still accepting on {port}");
    }
}
