//! Loopback fixtures shared by the server's unit tests.

use crate::config::ServerConfig;
use crate::event::ServerEvent;
use crate::server::{RiftServer, ServerContext};
use rift_core::messages::*;
use rift_core::{auth_key, read_message, unix_now, write_message};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

pub(crate) const TOKEN: &str = "test-token";

const WAIT: Duration = Duration::from_secs(5);

pub(crate) fn test_config() -> ServerConfig {
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

/// A running server, shut down when dropped.
pub(crate) struct TestServer {
    pub addr: SocketAddr,
    pub ctx: Arc<ServerContext>,
}

impl TestServer {
    pub fn server_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.ctx.events.subscribe()
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.ctx.udp_port()))
    }
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

pub(crate) async fn login(addr: SocketAddr, token: &str, run_id: &str) -> (TcpStream, LoginResp) {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    let ts = unix_now();
    let msg = Login {
        version: PROTOCOL_VERSION.into(),
        hostname: "test-host".into(),
        user: "tester".into(),
        privilege_key: auth_key(token, ts),
        timestamp: ts,
        run_id: run_id.into(),
        ..Default::default()
    };
    write_message(&mut conn, &msg.into()).await.unwrap();
    match read_message(&mut conn, 1 << 20).await.unwrap() {
        Message::LoginResp(resp) => (conn, resp),
        other => panic!("expected LoginResp, got {other:?}"),
    }
}

/// Next control message that is not a `ReqWorkConn`.
pub(crate) async fn next_non_req(conn: &mut TcpStream) -> Message {
    loop {
        let msg = tokio::time::timeout(WAIT, read_message(conn, 1 << 20))
            .await
            .expect("timed out waiting for control message")
            .unwrap();
        if !matches!(msg, Message::ReqWorkConn(_)) {
            return msg;
        }
    }
}

pub(crate) async fn expect_req_work_conn(conn: &mut TcpStream) {
    loop {
        let msg = tokio::time::timeout(WAIT, read_message(conn, 1 << 20))
            .await
            .expect("timed out waiting for ReqWorkConn")
            .unwrap();
        if matches!(msg, Message::ReqWorkConn(_)) {
            return;
        }
    }
}

pub(crate) async fn new_proxy(conn: &mut TcpStream, req: NewProxy) -> NewProxyResp {
    write_message(conn, &req.into()).await.unwrap();
    loop {
        if let Message::NewProxyResp(resp) = next_non_req(conn).await {
            return resp;
        }
    }
}

pub(crate) fn tcp_proxy(name: &str, remote_port: u16) -> NewProxy {
    NewProxy {
        proxy_name: name.into(),
        proxy_type: "tcp".into(),
        remote_port,
        ..Default::default()
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

/// Dial and announce a work connection for `run_id`.
pub(crate) async fn dial_work_conn(addr: SocketAddr, run_id: &str) -> TcpStream {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    let ts = unix_now();
    let msg = NewWorkConn {
        run_id: run_id.into(),
        privilege_key: auth_key(TOKEN, ts),
        timestamp: ts,
    };
    write_message(&mut conn, &msg.into()).await.unwrap();
    conn
}

pub(crate) async fn wait_session_ended(events: &mut broadcast::Receiver<ServerEvent>) -> (String, String) {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for SessionEnded")
            .unwrap();
        if let ServerEvent::SessionEnded { run_id, reason } = event {
            return (run_id, reason);
        }
    }
}

pub(crate) fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
