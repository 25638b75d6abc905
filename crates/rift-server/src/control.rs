//! Control sessions: login, heartbeat, proxy registration and teardown.
//!
//! Each logged-in client gets one reader task, one writer task (fed through
//! an mpsc queue) and a session loop that dispatches incoming messages and
//! enforces the heartbeat deadline.

use crate::broker::{PoolSettings, WorkConnPool};
use crate::event::{EventBus, ServerEvent};
use crate::proxy;
use crate::server::ServerContext;
use rift_core::messages::*;
use rift_core::{
    generate_id, read_message, verify_auth_key, write_message, BoxedStream, ProxyType,
    RiftError, RiftResult,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CONTROL_QUEUE: usize = 128;

/// Shared handle to one live control session.
pub struct ControlHandle {
    /// Unique per connection, unlike `run_id` which a reconnecting client reuses.
    pub session_id: u64,
    pub run_id: String,
    pub user: String,
    pub pool: WorkConnPool,
    outbound: mpsc::Sender<Message>,
    closed_tx: watch::Sender<Option<String>>,
}

impl ControlHandle {
    pub fn new(
        session_id: u64,
        run_id: String,
        user: String,
        settings: PoolSettings,
        outbound: mpsc::Sender<Message>,
        events: EventBus,
    ) -> Self {
        let pool = WorkConnPool::new(run_id.clone(), settings, outbound.clone(), events);
        Self {
            session_id,
            run_id,
            user,
            pool,
            outbound,
            closed_tx: watch::channel(None).0,
        }
    }

    /// Queue a message on the control connection.
    pub async fn send(&self, msg: Message) -> RiftResult<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| RiftError::SessionClosed(self.run_id.clone()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed_tx.borrow().is_some()
    }

    /// Record the close reason. Returns `true` only for the first caller.
    fn mark_closed(&self, reason: &str) -> bool {
        self.closed_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.to_string());
                true
            } else {
                false
            }
        })
    }

    fn closed(&self) -> watch::Receiver<Option<String>> {
        self.closed_tx.subscribe()
    }
}

/// Live sessions by run id.
#[derive(Default)]
pub struct SessionTable {
    inner: RwLock<HashMap<String, Arc<ControlHandle>>>,
}

impl SessionTable {
    pub async fn insert(&self, handle: Arc<ControlHandle>) -> Option<Arc<ControlHandle>> {
        self.inner
            .write()
            .await
            .insert(handle.run_id.clone(), handle)
    }

    pub async fn get(&self, run_id: &str) -> Option<Arc<ControlHandle>> {
        self.inner.read().await.get(run_id).cloned()
    }

    /// Remove the entry for this handle's run id, unless a newer session took it over.
    pub async fn remove_if_current(&self, handle: &ControlHandle) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get(&handle.run_id) {
            Some(h) if h.session_id == handle.session_id => {
                inner.remove(&handle.run_id);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

fn check_login(ctx: &ServerContext, login: &Login) -> RiftResult<()> {
    if !is_version_compatible(&login.version) {
        return Err(RiftError::AuthenticationFailed(format!(
            "incompatible version {} (server {PROTOCOL_VERSION})",
            login.version
        )));
    }
    verify_auth_key(
        &ctx.config.token,
        login.timestamp,
        &login.privilege_key,
        ctx.config.freshness_window,
    )
}

/// Run a control session that opened with `login`. Returns when the session ends.
pub(crate) async fn serve(
    ctx: Arc<ServerContext>,
    mut stream: BoxedStream,
    login: Login,
    peer: SocketAddr,
) -> RiftResult<()> {
    if let Err(e) = check_login(&ctx, &login) {
        warn!(peer = %peer, user = %login.user, error = %e, "login rejected");
        let resp = LoginResp {
            version: PROTOCOL_VERSION.to_string(),
            error: e.to_string(),
            ..Default::default()
        };
        write_message(&mut stream, &resp.into()).await?;
        return Err(e);
    }

    // Subscribe before answering so a shutdown right after login is not missed.
    let shutdown_rx = ctx.subscribe_shutdown();
    let run_id = if login.run_id.is_empty() {
        generate_id(8)
    } else {
        login.run_id.clone()
    };
    if let Some(old) = ctx.sessions.get(&run_id).await {
        info!(run_id = %run_id, "replacing existing session");
        teardown(&ctx, &old, "replaced by a new login").await;
    }

    let pool_count = login.pool_count.min(ctx.config.max_pool_count) as usize;
    let (out_tx, out_rx) = mpsc::channel(CONTROL_QUEUE);
    let handle = Arc::new(ControlHandle::new(
        ctx.next_session_id(),
        run_id.clone(),
        login.user.clone(),
        PoolSettings {
            pool_count,
            pending_timeout: ctx.config.pending_conn_timeout,
            idle_timeout: ctx.config.work_conn_idle_timeout,
        },
        out_tx,
        ctx.events.clone(),
    ));

    let resp = LoginResp {
        version: PROTOCOL_VERSION.to_string(),
        run_id: run_id.clone(),
        server_udp_port: ctx.udp_port(),
        error: String::new(),
    };
    write_message(&mut stream, &resp.into()).await?;

    if let Some(raced) = ctx.sessions.insert(handle.clone()).await {
        teardown(&ctx, &raced, "replaced by a new login").await;
    }
    info!(
        run_id = %run_id,
        user = %login.user,
        hostname = %login.hostname,
        peer = %peer,
        pool_count,
        "client logged in"
    );

    let (reader, writer) = tokio::io::split(stream);
    let writer_task = tokio::spawn(write_loop(writer, out_rx, handle.closed()));
    let (in_tx, in_rx) = mpsc::channel(CONTROL_QUEUE);
    let reader_task = tokio::spawn(read_loop(reader, in_tx, ctx.config.max_message_size));

    handle.pool.prefill().await;

    let reason = session_loop(&ctx, &handle, in_rx, shutdown_rx).await;
    teardown(&ctx, &handle, &reason).await;

    reader_task.abort();
    let _ = writer_task.await;
    Ok(())
}

async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    tx: mpsc::Sender<RiftResult<Message>>,
    max_len: usize,
) {
    loop {
        let result = read_message(&mut reader, max_len).await;
        let failed = result.is_err();
        if tx.send(result).await.is_err() || failed {
            break;
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<BoxedStream>,
    mut rx: mpsc::Receiver<Message>,
    mut closed: watch::Receiver<Option<String>>,
) {
    loop {
        tokio::select! {
            biased;

            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = write_message(&mut writer, &msg).await {
                        debug!(error = %e, "control write failed");
                        break;
                    }
                }
                None => break,
            },

            _ = closed.changed() => {
                // Flush whatever was queued before the close, e.g. an error Pong.
                while let Ok(msg) = rx.try_recv() {
                    if write_message(&mut writer, &msg).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

fn tick_period(heartbeat_timeout: Duration) -> Duration {
    let period = if heartbeat_timeout.is_zero() {
        Duration::from_secs(1)
    } else {
        (heartbeat_timeout / 2).min(Duration::from_secs(1))
    };
    period.max(Duration::from_millis(10))
}

/// Dispatch messages until the session should end, returning the reason.
async fn session_loop(
    ctx: &Arc<ServerContext>,
    handle: &Arc<ControlHandle>,
    mut in_rx: mpsc::Receiver<RiftResult<Message>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> String {
    let mut closed = handle.closed();
    let heartbeat_timeout = ctx.config.heartbeat_timeout;
    let mut tick = tokio::time::interval(tick_period(heartbeat_timeout));
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = closed.changed() => {
                return closed
                    .borrow_and_update()
                    .clone()
                    .unwrap_or_else(|| "closed".to_string());
            }

            _ = shutdown_rx.recv() => {
                debug!(run_id = %handle.run_id, "shutdown signal received");
                return "server shutdown".to_string();
            }

            _ = tick.tick() => {
                if !heartbeat_timeout.is_zero() && last_seen.elapsed() > heartbeat_timeout {
                    warn!(run_id = %handle.run_id, "heartbeat timeout");
                    return RiftError::SessionExpired(format!(
                        "no heartbeat for {:?}",
                        last_seen.elapsed()
                    ))
                    .to_string();
                }
                let dropped = handle.pool.sweep_idle().await;
                if dropped > 0 {
                    debug!(run_id = %handle.run_id, dropped, "swept idle work connections");
                }
            }

            msg = in_rx.recv() => match msg {
                Some(Ok(msg)) => {
                    if let Err(e) = dispatch_message(ctx, handle, msg, &mut last_seen).await {
                        return e.to_string();
                    }
                }
                Some(Err(RiftError::StreamClosed)) | None => {
                    return "connection closed by client".to_string();
                }
                Some(Err(e)) => {
                    warn!(run_id = %handle.run_id, error = %e, "control read failed");
                    return e.to_string();
                }
            }
        }
    }
}

async fn dispatch_message(
    ctx: &Arc<ServerContext>,
    handle: &Arc<ControlHandle>,
    msg: Message,
    last_seen: &mut Instant,
) -> RiftResult<()> {
    match msg {
        Message::NewProxy(req) => {
            let resp = register_proxy(ctx, handle, req).await;
            handle.send(resp.into()).await?;
        }
        Message::CloseProxy(req) => {
            close_proxy(ctx, handle, &req.proxy_name).await;
        }
        Message::Ping(ping) => {
            match verify_auth_key(
                &ctx.config.token,
                ping.timestamp,
                &ping.privilege_key,
                ctx.config.freshness_window,
            ) {
                Ok(()) => {
                    *last_seen = Instant::now();
                    debug!(run_id = %handle.run_id, "heartbeat");
                    handle.send(Pong::default().into()).await?;
                }
                Err(e) => {
                    warn!(run_id = %handle.run_id, error = %e, "heartbeat rejected");
                    handle
                        .send(
                            Pong {
                                error: e.to_string(),
                            }
                            .into(),
                        )
                        .await?;
                    return Err(e);
                }
            }
        }
        other => {
            debug!(run_id = %handle.run_id, msg_type = ?other.msg_type(), "ignoring unexpected control message");
        }
    }
    Ok(())
}

async fn register_proxy(
    ctx: &Arc<ServerContext>,
    handle: &Arc<ControlHandle>,
    req: NewProxy,
) -> NewProxyResp {
    let proxy_name = req.proxy_name.clone();
    match admit(ctx, handle, &req).await {
        Ok((proxy_type, remote_addr, domains)) => {
            info!(
                run_id = %handle.run_id,
                proxy = %proxy_name,
                proxy_type = %proxy_type,
                remote_addr = %remote_addr,
                "proxy registered"
            );
            ctx.events.emit(ServerEvent::ProxyRegistered {
                run_id: handle.run_id.clone(),
                proxy_name: proxy_name.clone(),
                proxy_type,
                remote_addr: remote_addr.clone(),
                domains,
                locations: req.locations,
            });
            NewProxyResp {
                proxy_name,
                remote_addr,
                error: String::new(),
            }
        }
        Err(e) => {
            warn!(run_id = %handle.run_id, proxy = %proxy_name, error = %e, "proxy rejected");
            NewProxyResp {
                proxy_name,
                remote_addr: String::new(),
                error: e.to_string(),
            }
        }
    }
}

/// Register the proxy and start serving its endpoint, undoing the
/// registration if the endpoint cannot be served.
async fn admit(
    ctx: &Arc<ServerContext>,
    handle: &Arc<ControlHandle>,
    req: &NewProxy,
) -> RiftResult<(ProxyType, String, Vec<String>)> {
    if matches!(req.proxy_type.parse(), Ok(ProxyType::Xtcp)) && ctx.udp_port() == 0 {
        return Err(RiftError::EndpointUnavailable(format!(
            "proxy [{}]: xtcp needs the hole-punch port, which this server does not open",
            req.proxy_name
        )));
    }
    let admission = ctx.registry.register(handle, req).await?;
    handle.pool.open_proxy(&req.proxy_name).await;
    if let Some(listener) = admission.listener {
        if let Err(e) = proxy::spawn_listener(ctx.clone(), listener) {
            ctx.registry.unregister(handle.session_id, &req.proxy_name).await;
            return Err(e);
        }
    }
    Ok((admission.proxy_type, admission.remote_addr, admission.domains))
}

/// Remove one of this session's proxies. Unknown names are ignored.
async fn close_proxy(ctx: &ServerContext, handle: &ControlHandle, proxy_name: &str) {
    // Waiters fail from here on, including those racing the unregister.
    handle.pool.cancel_proxy(proxy_name).await;
    if ctx
        .registry
        .unregister(handle.session_id, proxy_name)
        .await
        .is_none()
    {
        debug!(run_id = %handle.run_id, proxy = %proxy_name, "close for unknown proxy");
        return;
    }
    info!(run_id = %handle.run_id, proxy = %proxy_name, "proxy closed");
    ctx.events.emit(ServerEvent::ProxyUnregistered {
        run_id: handle.run_id.clone(),
        proxy_name: proxy_name.to_string(),
    });
}

/// Tear down a session and everything it owns. Only the first call does anything.
pub(crate) async fn teardown(ctx: &ServerContext, handle: &ControlHandle, reason: &str) {
    if !handle.mark_closed(reason) {
        return;
    }
    handle.pool.close(reason).await;

    let removed = ctx.registry.unregister_session(handle.session_id).await;
    for proxy_name in &removed {
        ctx.events.emit(ServerEvent::ProxyUnregistered {
            run_id: handle.run_id.clone(),
            proxy_name: proxy_name.clone(),
        });
    }
    ctx.sessions.remove_if_current(handle).await;

    info!(
        run_id = %handle.run_id,
        reason = %reason,
        proxies = removed.len(),
        "control session closed"
    );
    ctx.events.emit(ServerEvent::SessionEnded {
        run_id: handle.run_id.clone(),
        reason: reason.to_string(),
    });
}
