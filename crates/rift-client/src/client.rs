//! The rift client.
//!
//! `RiftClient` owns the configuration and event bus, logs in control
//! sessions and binds visitor listeners. Everything spawned from it shares
//! one [`ClientContext`].

use crate::config::ClientConfig;
use crate::control::Session;
use crate::event::{ClientEvent, EventBus};
use crate::visitor::{self, VisitorHandle};
use rift_core::{BoxedStream, RiftError, RiftResult, DEFAULT_MAX_FRAME_LEN};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time;

/// State shared by the control session, work connections and visitors.
pub struct ClientContext {
    pub config: ClientConfig,
    pub events: EventBus,
    pub max_message_size: usize,
    /// Announced by the last successful login, `0` when the server has no coordinator.
    server_udp_port: AtomicU16,
}

impl ClientContext {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            events: EventBus::default(),
            max_message_size: DEFAULT_MAX_FRAME_LEN,
            server_udp_port: AtomicU16::new(0),
        }
    }

    pub fn server_udp_port(&self) -> u16 {
        self.server_udp_port.load(Ordering::Relaxed)
    }

    pub(crate) fn set_server_udp_port(&self, port: u16) {
        self.server_udp_port.store(port, Ordering::Relaxed);
    }

    /// Open a new connection to the server's control listener.
    pub(crate) async fn dial(&self) -> RiftResult<BoxedStream> {
        let endpoint = self.config.common.server_endpoint();
        let stream = time::timeout(self.config.common.login_timeout(), TcpStream::connect(&endpoint))
            .await
            .map_err(|_| RiftError::Timeout(format!("connecting to {endpoint}")))?
            .map_err(|e| RiftError::Transport(format!("connect {endpoint}: {e}")))?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }

    /// The server's hole-punch coordinator.
    pub async fn server_udp_addr(&self) -> RiftResult<SocketAddr> {
        let port = self.server_udp_port();
        if port == 0 {
            return Err(RiftError::HolePunch("server has no hole-punch port".into()));
        }
        let host = self.config.common.server_addr.as_str();
        tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| RiftError::Transport(format!("cannot resolve {host}")))
    }
}

/// The main rift client.
pub struct RiftClient {
    ctx: Arc<ClientContext>,
}

impl RiftClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            ctx: Arc::new(ClientContext::new(config)),
        }
    }

    pub fn context(&self) -> Arc<ClientContext> {
        self.ctx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.ctx.events.subscribe()
    }

    /// Log in and register every configured proxy.
    ///
    /// Pass the previous session's run id to reclaim its proxies after a reconnect.
    pub async fn login(&self, run_id: &str) -> RiftResult<Session> {
        Session::start(self.ctx.clone(), run_id).await
    }

    /// Bind a local listener for every configured visitor.
    pub async fn start_visitors(&self) -> RiftResult<Vec<VisitorHandle>> {
        let mut handles = Vec::with_capacity(self.ctx.config.visitors.len());
        for cfg in &self.ctx.config.visitors {
            handles.push(visitor::start(self.ctx.clone(), cfg.clone()).await?);
        }
        Ok(handles)
    }
}
