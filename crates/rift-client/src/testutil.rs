//! Loopback fixtures: a real server plus helpers to point clients at it.

use crate::config::{ClientConfig, ProxyConfig};
use crate::event::ClientEvent;
use rift_server::{RiftServer, ServerConfig, ServerContext};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

pub(crate) const TOKEN: &str = "test-token";

pub(crate) const WAIT: Duration = Duration::from_secs(5);

pub(crate) fn server_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1".into(),
        bind_port: 0,
        proxy_bind_addr: "127.0.0.1".into(),
        token: TOKEN.into(),
        pending_conn_timeout: Duration::from_secs(3),
        handshake_timeout: Duration::from_secs(3),
        nat_hole_expiry: Duration::from_secs(3),
        ..ServerConfig::default()
    }
}

/// Server config with the hole-punch coordinator on an ephemeral port.
pub(crate) fn punch_server_config() -> ServerConfig {
    ServerConfig {
        nat_hole_port: Some(0),
        ..server_config()
    }
}

/// A running server, shut down when dropped.
pub(crate) struct TestServer {
    pub addr: SocketAddr,
    pub ctx: Arc<ServerContext>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.ctx.shutdown();
    }
}

pub(crate) async fn start_server(config: ServerConfig) -> TestServer {
    let server = RiftServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let ctx = server.context();
    tokio::spawn(server.run());
    TestServer { addr, ctx }
}

pub(crate) fn server_udp_addr(server: &TestServer) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], server.ctx.udp_port()))
}

pub(crate) fn client_config(server: &TestServer) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.common.server_addr = server.addr.ip().to_string();
    config.common.server_port = server.addr.port();
    config.common.token = TOKEN.into();
    config.common.login_timeout = 5;
    config
}

pub(crate) fn tcp_proxy(name: &str, local_port: u16) -> ProxyConfig {
    ProxyConfig {
        name: name.into(),
        proxy_type: "tcp".into(),
        local_ip: "127.0.0.1".into(),
        local_port,
        ..Default::default()
    }
}

/// Wait for `name` to be registered and return its remote address.
pub(crate) async fn wait_proxy_started(events: &mut broadcast::Receiver<ClientEvent>, name: &str) -> String {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for ProxyStarted")
            .unwrap();
        match event {
            ClientEvent::ProxyStarted { name: n, remote_addr } if n == name => return remote_addr,
            ClientEvent::ProxyFailed { name: n, error } if n == name => panic!("proxy {name} failed: {error}"),
            _ => {}
        }
    }
}

pub(crate) async fn wait_session_ended(events: &mut broadcast::Receiver<ClientEvent>) -> (String, String) {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for SessionEnded")
            .unwrap();
        if let ClientEvent::SessionEnded { run_id, reason } = event {
            return (run_id, reason);
        }
    }
}

/// Port out of a `":port"` remote address.
pub(crate) fn public_port(remote_addr: &str) -> u16 {
    remote_addr
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or_else(|| panic!("no port in {remote_addr:?}"))
}

/// A tcp service that writes back whatever it reads.
pub(crate) async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                let _ = w.shutdown().await;
            });
        }
    });
    addr
}

pub(crate) fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
