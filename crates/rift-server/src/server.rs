//! Core server: accepts connections and dispatches them by their first message.
//!
//! Owns the shared [`ServerContext`] (registry, sessions, hole-punch
//! coordinator, event bus) and the listening sockets.

use crate::broker::WorkConn;
use crate::config::ServerConfig;
use crate::control::{self, SessionTable};
use crate::event::{EventBus, ServerEvent};
use crate::nathole::{self, NatHoleController};
use crate::registry::ProxyRegistry;
use crate::visitor;
use rift_core::messages::*;
use rift_core::transport::{send_datagram, ACCEPT_ERROR_BACKOFF};
use rift_core::{read_message, verify_auth_key, write_message, BoxedStream, RiftError, RiftResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Process-wide state shared by every connection.
pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: ProxyRegistry,
    pub sessions: SessionTable,
    pub nathole: NatHoleController,
    pub events: EventBus,
    udp_port: u16,
    next_session_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, udp_port: u16) -> Self {
        Self {
            registry: ProxyRegistry::new(&config),
            nathole: NatHoleController::new(config.nat_hole_expiry),
            sessions: SessionTable::default(),
            events: EventBus::default(),
            udp_port,
            next_session_id: AtomicU64::new(1),
            shutdown_tx: broadcast::channel(1).0,
            config,
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Hole-punch port announced in `LoginResp`, `0` when xtcp is disabled.
    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop accepting and close every session.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Authenticate a client-dialed work connection and offer it to its session.
    pub(crate) async fn accept_work_conn(
        &self,
        mut stream: BoxedStream,
        req: NewWorkConn,
        peer: SocketAddr,
    ) -> RiftResult<()> {
        let checked = verify_auth_key(
            &self.config.token,
            req.timestamp,
            &req.privilege_key,
            self.config.freshness_window,
        );
        let session = match checked {
            Ok(()) => self.sessions.get(&req.run_id).await,
            Err(e) => {
                warn!(run_id = %req.run_id, peer = %peer, error = %e, "work connection rejected");
                reject_work_conn(&mut stream, &e).await;
                return Err(e);
            }
        };
        let Some(session) = session else {
            let e = RiftError::SessionClosed(format!("no session with run id [{}]", req.run_id));
            debug!(run_id = %req.run_id, peer = %peer, "work connection for unknown session");
            reject_work_conn(&mut stream, &e).await;
            return Err(e);
        };

        debug!(run_id = %req.run_id, peer = %peer, "work connection offered");
        session.pool.offer(WorkConn::new(stream, Some(peer))).await
    }
}

async fn reject_work_conn(stream: &mut BoxedStream, e: &RiftError) {
    let resp = StartWorkConn {
        error: e.to_string(),
        ..Default::default()
    };
    let _ = write_message(stream, &resp.into()).await;
}

/// The rift server instance.
pub struct RiftServer {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    nat_hole_socket: Option<Arc<UdpSocket>>,
}

impl RiftServer {
    /// Bind the control listener and, when configured, the hole-punch socket.
    pub async fn bind(config: ServerConfig) -> RiftResult<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RiftError::Transport(format!("bind {addr}: {e}")))?;

        let nat_hole_socket = match config.nat_hole_port {
            Some(port) => {
                let udp_addr = format!("{}:{port}", config.bind_addr);
                let socket = UdpSocket::bind(&udp_addr)
                    .await
                    .map_err(|e| RiftError::Transport(format!("bind udp {udp_addr}: {e}")))?;
                Some(Arc::new(socket))
            }
            None => None,
        };
        let udp_port = match &nat_hole_socket {
            Some(s) => s.local_addr()?.port(),
            None => 0,
        };

        Ok(Self {
            ctx: Arc::new(ServerContext::new(config, udp_port)),
            listener,
            nat_hole_socket,
        })
    }

    pub fn local_addr(&self) -> RiftResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.ctx.events.subscribe()
    }

    /// Accept connections until [`ServerContext::shutdown`] is called.
    pub async fn run(self) -> RiftResult<()> {
        let Self {
            ctx,
            listener,
            nat_hole_socket,
        } = self;
        let mut shutdown_rx = ctx.subscribe_shutdown();

        if let Some(socket) = nat_hole_socket {
            tokio::spawn(nathole::serve(ctx.clone(), socket.clone()));
            tokio::spawn(sweep_hole_punches(ctx.clone(), socket));
        }

        info!(
            addr = %listener.local_addr()?,
            nat_hole_port = ctx.udp_port(),
            "rift-server ready"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutting down");
                    break;
                }
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            match handle_connection(ctx, stream, peer).await {
                                Ok(()) | Err(RiftError::StreamClosed) => {}
                                Err(e) => debug!(peer = %peer, error = %e, "connection ended with error"),
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Expire stale hole-punch attempts and tell their visitors.
async fn sweep_hole_punches(ctx: Arc<ServerContext>, socket: Arc<UdpSocket>) {
    let period = (ctx.config.nat_hole_expiry / 2).clamp(Duration::from_millis(50), Duration::from_secs(5));
    let mut interval = tokio::time::interval(period);
    let mut shutdown_rx = ctx.subscribe_shutdown();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {}
        }
        for session in ctx.nathole.sweep().await {
            info!(sid = %session.sid, proxy = %session.proxy_name, "hole-punch attempt expired");
            let resp = NatHoleResp {
                sid: session.sid,
                error: RiftError::HolePunch("attempt expired".into()).to_string(),
                ..Default::default()
            };
            let _ = send_datagram(socket.as_ref(), &resp.into(), session.visitor_addr).await;
        }
    }
}

/// Route a fresh connection by its opening message.
async fn handle_connection(ctx: Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) -> RiftResult<()> {
    let _ = stream.set_nodelay(true);
    let local = stream.local_addr()?;
    let mut stream: BoxedStream = Box::new(stream);

    let first = tokio::time::timeout(
        ctx.config.handshake_timeout,
        read_message(&mut stream, ctx.config.max_message_size),
    )
    .await
    .map_err(|_| RiftError::Timeout(format!("no opening message from {peer}")))??;

    match first {
        Message::Login(login) => control::serve(ctx, stream, login, peer).await,
        Message::NewWorkConn(req) => ctx.accept_work_conn(stream, req, peer).await,
        Message::NewVisitorConn(req) => visitor::handle(ctx, stream, req, peer, local).await,
        other => {
            warn!(peer = %peer, msg_type = ?other.msg_type(), "unexpected opening message");
            Err(RiftError::MalformedMessage(format!(
                "unexpected opening message {:?}",
                other.msg_type()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use rift_core::{auth_key, unix_now};

    #[tokio::test]
    async fn work_conn_with_bad_key_gets_error() {
        let server = start_server(test_config()).await;
        let (_control, resp) = login(server.addr, TOKEN, "").await;
        let mut conn = TcpStream::connect(server.addr).await.unwrap();
        let req = NewWorkConn {
            run_id: resp.run_id,
            privilege_key: "bad".into(),
            timestamp: unix_now(),
        };
        write_message(&mut conn, &req.into()).await.unwrap();
        let Message::StartWorkConn(start) = read_message(&mut conn, 1 << 20).await.unwrap() else {
            panic!("expected StartWorkConn");
        };
        assert!(start.error.contains("authentication failed"));
    }

    #[tokio::test]
    async fn work_conn_for_unknown_session_gets_error() {
        let server = start_server(test_config()).await;
        let mut conn = TcpStream::connect(server.addr).await.unwrap();
        let ts = unix_now();
        let req = NewWorkConn {
            run_id: "ghost".into(),
            privilege_key: auth_key(TOKEN, ts),
            timestamp: ts,
        };
        write_message(&mut conn, &req.into()).await.unwrap();
        let Message::StartWorkConn(start) = read_message(&mut conn, 1 << 20).await.unwrap() else {
            panic!("expected StartWorkConn");
        };
        assert!(start.error.contains("ghost"));
    }

    #[tokio::test]
    async fn valid_work_conn_is_parked() {
        let server = start_server(test_config()).await;
        let (_control, resp) = login(server.addr, TOKEN, "").await;
        let _work = dial_work_conn(server.addr, &resp.run_id).await;

        let session = server.ctx.sessions.get(&resp.run_id).await.unwrap();
        let mut parked = 0;
        for _ in 0..50 {
            parked = session.pool.offered_len().await;
            if parked == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(parked, 1);
    }

    #[tokio::test]
    async fn unexpected_opening_message_is_dropped() {
        let server = start_server(test_config()).await;
        let mut conn = TcpStream::connect(server.addr).await.unwrap();
        write_message(&mut conn, &Pong::default().into()).await.unwrap();
        assert!(matches!(
            read_message(&mut conn, 1 << 20).await,
            Err(RiftError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn silent_connection_times_out() {
        let server = start_server(ServerConfig {
            handshake_timeout: Duration::from_millis(100),
            ..test_config()
        })
        .await;
        let mut conn = TcpStream::connect(server.addr).await.unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), read_message(&mut conn, 1 << 20))
            .await
            .unwrap();
        assert!(matches!(closed, Err(RiftError::StreamClosed)));
    }

    #[tokio::test]
    async fn shutdown_ends_sessions() {
        let server = start_server(test_config()).await;
        let mut events = server.server_events();
        let (_control, resp) = login(server.addr, TOKEN, "").await;
        server.ctx.shutdown();
        let (run_id, reason) = wait_session_ended(&mut events).await;
        assert_eq!(run_id, resp.run_id);
        assert_eq!(reason, "server shutdown");
    }
}
