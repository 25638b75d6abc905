//! Visitor listeners: local ports that reach a secret proxy through the server.
//!
//! Every accepted connection dials the server with `NewVisitorConn` and, once
//! linked, is spliced to the proxy's work connection. An xtcp visitor also
//! starts one background hole punch on its first connection and reports the
//! outcome; the bytes flow over the relay without waiting for it.

use crate::client::ClientContext;
use crate::config::VisitorConfig;
use crate::event::ClientEvent;
use crate::xtcp;
use rift_core::messages::{Message, NewVisitorConn};
use rift_core::transport::ACCEPT_ERROR_BACKOFF;
use rift_core::{auth_key, read_message, unix_now, write_message, BoxedStream, ProxyType, RiftError, RiftResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

/// A running visitor listener. Dropping it stops accepting.
pub struct VisitorHandle {
    pub name: String,
    pub local_addr: SocketAddr,
    _cancel: mpsc::Sender<()>,
}

pub(crate) async fn start(ctx: Arc<ClientContext>, cfg: VisitorConfig) -> RiftResult<VisitorHandle> {
    let kind = cfg.kind()?;
    let endpoint = cfg.bind_endpoint();
    let listener = TcpListener::bind(&endpoint)
        .await
        .map_err(|e| RiftError::EndpointUnavailable(format!("visitor [{}] bind {endpoint}: {e}", cfg.name)))?;
    let local_addr = listener.local_addr()?;
    info!(visitor = %cfg.name, proxy = %cfg.server_name, addr = %local_addr, "visitor listening");

    let (cancel_tx, cancel_rx) = mpsc::channel(1);
    let name = cfg.name.clone();
    tokio::spawn(accept_loop(ctx, Arc::new(cfg), kind, listener, cancel_rx));
    Ok(VisitorHandle {
        name,
        local_addr,
        _cancel: cancel_tx,
    })
}

async fn accept_loop(
    ctx: Arc<ClientContext>,
    cfg: Arc<VisitorConfig>,
    kind: ProxyType,
    listener: TcpListener,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    let mut punch_started = false;
    loop {
        tokio::select! {
            // Fires when the handle is dropped.
            _ = cancel_rx.recv() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    // Needs the coordinator port from a login; until then, retry per connection.
                    if kind == ProxyType::Xtcp && !punch_started && ctx.server_udp_port() != 0 {
                        punch_started = true;
                        let ctx = ctx.clone();
                        let cfg = cfg.clone();
                        tokio::spawn(async move { try_punch(&ctx, &cfg).await });
                    }
                    let ctx = ctx.clone();
                    let cfg = cfg.clone();
                    tokio::spawn(async move {
                        match handle_local(&ctx, &cfg, stream).await {
                            Ok(()) | Err(RiftError::StreamClosed) => {}
                            Err(e) => warn!(visitor = %cfg.name, peer = %peer, error = %e, "visitor connection failed"),
                        }
                    });
                }
                Err(e) => {
                    warn!(visitor = %cfg.name, error = %e, "accept failed");
                    time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
    debug!(visitor = %cfg.name, "visitor stopped");
}

async fn handle_local(ctx: &ClientContext, cfg: &VisitorConfig, mut local: TcpStream) -> RiftResult<()> {
    let mut remote = time::timeout(ctx.config.common.login_timeout(), link(ctx, cfg))
        .await
        .map_err(|_| RiftError::Timeout(format!("linking visitor [{}]", cfg.name)))??;
    let (up, down) = tokio::io::copy_bidirectional(&mut local, &mut remote)
        .await
        .map_err(RiftError::from_stream)?;
    debug!(visitor = %cfg.name, up, down, "visitor connection finished");
    Ok(())
}

/// Dial the server and ask to be linked to the proxy.
async fn link(ctx: &ClientContext, cfg: &VisitorConfig) -> RiftResult<BoxedStream> {
    let mut stream = ctx.dial().await?;
    let ts = unix_now();
    let req = NewVisitorConn {
        proxy_name: cfg.server_name.clone(),
        sign_key: auth_key(&cfg.sk, ts),
        timestamp: ts,
        use_encryption: cfg.use_encryption,
        use_compression: cfg.use_compression,
    };
    write_message(&mut stream, &req.into()).await?;
    match read_message(&mut stream, ctx.max_message_size).await? {
        Message::NewVisitorConnResp(resp) if resp.error.is_empty() => Ok(stream),
        Message::NewVisitorConnResp(resp) => Err(RiftError::Other(format!(
            "visitor [{}] refused: {}",
            cfg.name, resp.error
        ))),
        other => Err(RiftError::MalformedMessage(format!(
            "expected NewVisitorConnResp, got {:?}",
            other.msg_type()
        ))),
    }
}

async fn try_punch(ctx: &ClientContext, cfg: &VisitorConfig) {
    let server = match ctx.server_udp_addr().await {
        Ok(server) => server,
        Err(e) => {
            debug!(visitor = %cfg.name, error = %e, "skipping hole punch");
            return;
        }
    };
    let timeout = ctx.config.common.nat_hole_timeout();
    match xtcp::punch_as_visitor(server, &cfg.server_name, &cfg.sk, timeout).await {
        Ok(punch) => ctx.events.emit(ClientEvent::PunchResolved(punch.outcome)),
        Err(e) => debug!(visitor = %cfg.name, error = %e, "hole punch could not start"),
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{ProxyConfig, VisitorConfig};
    use crate::event::ClientEvent;
    use crate::testutil::*;
    use crate::RiftClient;
    use rift_core::PunchOutcome;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    const SK: &str = "shh";

    fn secret_proxy(kind: &str, local_port: u16) -> ProxyConfig {
        ProxyConfig {
            name: "db".into(),
            proxy_type: kind.into(),
            local_ip: "127.0.0.1".into(),
            local_port,
            sk: SK.into(),
            ..Default::default()
        }
    }

    fn visitor(kind: &str, sk: &str) -> VisitorConfig {
        VisitorConfig {
            name: "db-visitor".into(),
            visitor_type: kind.into(),
            server_name: "db".into(),
            sk: sk.into(),
            bind_addr: "127.0.0.1".into(),
            bind_port: 0,
            ..Default::default()
        }
    }

    async fn ping_pong(addr: std::net::SocketAddr) -> Vec<u8> {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        match tokio::time::timeout(WAIT, conn.read_exact(&mut buf)).await.unwrap() {
            Ok(_) => buf.to_vec(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn stcp_visitor_reaches_service() {
        let server = start_server(server_config()).await;
        let echo = echo_server().await;

        let mut provider = client_config(&server);
        provider.proxies.push(secret_proxy("stcp", echo.port()));
        let provider = RiftClient::new(provider);
        let mut events = provider.subscribe();
        let _session = provider.login("").await.unwrap();
        wait_proxy_started(&mut events, "db").await;

        let mut consumer = client_config(&server);
        consumer.visitors.push(visitor("stcp", SK));
        let consumer = RiftClient::new(consumer);
        let handles = consumer.start_visitors().await.unwrap();

        assert_eq!(ping_pong(handles[0].local_addr).await, b"hello");
    }

    #[tokio::test]
    async fn wrong_sk_closes_local_connection() {
        let server = start_server(server_config()).await;
        let echo = echo_server().await;
        let mut provider = client_config(&server);
        provider.proxies.push(secret_proxy("stcp", echo.port()));
        let provider = RiftClient::new(provider);
        let mut events = provider.subscribe();
        let _session = provider.login("").await.unwrap();
        wait_proxy_started(&mut events, "db").await;

        let mut consumer = client_config(&server);
        consumer.visitors.push(visitor("stcp", "wrong"));
        let handles = RiftClient::new(consumer).start_visitors().await.unwrap();

        assert!(ping_pong(handles[0].local_addr).await.is_empty());
    }

    #[tokio::test]
    async fn xtcp_relay_does_not_wait_for_punch() {
        let server = start_server(punch_server_config()).await;
        let echo = echo_server().await;

        let mut provider = client_config(&server);
        provider.proxies.push(secret_proxy("xtcp", echo.port()));
        let provider = RiftClient::new(provider);
        let mut provider_events = provider.subscribe();
        let _provider_session = provider.login("").await.unwrap();
        wait_proxy_started(&mut provider_events, "db").await;
        // Point the provider's punch reports at a dead port so the punch never completes.
        provider.context().set_server_udp_port(free_udp_port());

        let mut consumer = client_config(&server);
        consumer.common.nat_hole_timeout = 10;
        consumer.visitors.push(visitor("xtcp", SK));
        let consumer = RiftClient::new(consumer);
        let _consumer_session = consumer.login("").await.unwrap();
        let handles = consumer.start_visitors().await.unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(ping_pong(handles[0].local_addr).await, b"hello");
        assert!(started.elapsed() < std::time::Duration::from_secs(3), "{:?}", started.elapsed());
    }

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn xtcp_visitor_punches_then_relays() {
        let server = start_server(punch_server_config()).await;
        let echo = echo_server().await;

        let mut provider = client_config(&server);
        provider.proxies.push(secret_proxy("xtcp", echo.port()));
        let provider = RiftClient::new(provider);
        let mut provider_events = provider.subscribe();
        let _provider_session = provider.login("").await.unwrap();
        wait_proxy_started(&mut provider_events, "db").await;

        // The visitor side learns the coordinator port from its own login.
        let mut consumer = client_config(&server);
        consumer.visitors.push(visitor("xtcp", SK));
        let consumer = RiftClient::new(consumer);
        let mut consumer_events = consumer.subscribe();
        let _consumer_session = consumer.login("").await.unwrap();
        let handles = consumer.start_visitors().await.unwrap();

        assert_eq!(ping_pong(handles[0].local_addr).await, b"hello");

        let outcome = loop {
            let event = tokio::time::timeout(WAIT, consumer_events.recv())
                .await
                .unwrap()
                .unwrap();
            if let ClientEvent::PunchResolved(outcome) = event {
                break outcome;
            }
        };
        assert!(matches!(outcome, PunchOutcome::Established { .. }), "{outcome:?}");
    }
}
