//! Client side of a control session: login, proxy registration, heartbeat
//! and work-connection requests.

use crate::client::ClientContext;
use crate::event::ClientEvent;
use crate::work;
use rift_core::messages::*;
use rift_core::{auth_key, read_message, unix_now, write_message, BoxedStream, RiftError, RiftResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

const CONTROL_QUEUE: usize = 128;

/// Registration state of one configured proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyStatus {
    Pending,
    Running { remote_addr: String },
    Failed { error: String },
}

type ProxyTable = Arc<RwLock<HashMap<String, ProxyStatus>>>;

/// A logged-in control session.
///
/// Dropping the handle closes the session.
pub struct Session {
    run_id: String,
    server_udp_port: u16,
    proxies: ProxyTable,
    stop_tx: mpsc::Sender<()>,
    closed_rx: watch::Receiver<Option<String>>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    pub(crate) async fn start(ctx: Arc<ClientContext>, run_id: &str) -> RiftResult<Self> {
        let login_timeout = ctx.config.common.login_timeout();
        let (stream, resp) = time::timeout(login_timeout, login(&ctx, run_id))
            .await
            .map_err(|_| RiftError::Timeout("waiting for login response".into()))??;

        ctx.set_server_udp_port(resp.server_udp_port);
        info!(
            run_id = %resp.run_id,
            server = %ctx.config.common.server_endpoint(),
            server_udp_port = resp.server_udp_port,
            "logged in"
        );
        ctx.events.emit(ClientEvent::LoggedIn {
            run_id: resp.run_id.clone(),
            server_udp_port: resp.server_udp_port,
        });

        let (reader, writer) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::channel(CONTROL_QUEUE);
        let writer_task = tokio::spawn(write_loop(writer, out_rx));
        let (in_tx, in_rx) = mpsc::channel(CONTROL_QUEUE);
        let reader_task = tokio::spawn(read_loop(reader, in_tx, ctx.max_message_size));

        let proxies: ProxyTable = Arc::new(RwLock::new(
            ctx.config
                .proxies
                .iter()
                .map(|p| (p.name.clone(), ProxyStatus::Pending))
                .collect(),
        ));
        for proxy in &ctx.config.proxies {
            out_tx
                .send(proxy.to_new_proxy().into())
                .await
                .map_err(|_| RiftError::SessionClosed(resp.run_id.clone()))?;
        }

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = watch::channel(None);
        let task = {
            let run_id = resp.run_id.clone();
            let proxies = proxies.clone();
            tokio::spawn(async move {
                let reason = session_loop(&ctx, &run_id, &proxies, &out_tx, in_rx, stop_rx).await;
                info!(run_id = %run_id, reason = %reason, "session ended");
                proxies.write().await.clear();
                reader_task.abort();
                drop(out_tx);
                let _ = writer_task.await;
                ctx.events.emit(ClientEvent::SessionEnded {
                    run_id,
                    reason: reason.clone(),
                });
                let _ = closed_tx.send(Some(reason));
            })
        };

        Ok(Self {
            run_id: resp.run_id,
            server_udp_port: resp.server_udp_port,
            proxies,
            stop_tx,
            closed_rx,
            task: Some(task),
        })
    }

    /// Run id assigned by the server. Reuse it when reconnecting.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn server_udp_port(&self) -> u16 {
        self.server_udp_port
    }

    pub async fn proxy_status(&self, name: &str) -> Option<ProxyStatus> {
        self.proxies.read().await.get(name).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_rx.borrow().is_some()
    }

    /// Wait for the session to end and return why it did.
    pub async fn closed(&mut self) -> String {
        loop {
            if let Some(reason) = self.closed_rx.borrow_and_update().clone() {
                return reason;
            }
            if self.closed_rx.changed().await.is_err() {
                return "session task stopped".to_string();
            }
        }
    }

    /// Close the control connection and wait for teardown.
    pub async fn close(mut self) -> String {
        let _ = self.stop_tx.try_send(());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.closed().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
    }
}

async fn login(ctx: &ClientContext, run_id: &str) -> RiftResult<(BoxedStream, LoginResp)> {
    let common = &ctx.config.common;
    let mut stream = ctx.dial().await?;
    let ts = unix_now();
    let msg = Login {
        version: PROTOCOL_VERSION.to_string(),
        hostname: hostname::get()?.to_string_lossy().into_owned(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        user: common.user.clone(),
        privilege_key: auth_key(&common.token, ts),
        timestamp: ts,
        run_id: run_id.to_string(),
        metas: common.metas.clone(),
        pool_count: common.pool_count,
    };
    write_message(&mut stream, &msg.into()).await?;

    match read_message(&mut stream, ctx.max_message_size).await? {
        Message::LoginResp(resp) if resp.error.is_empty() => Ok((stream, resp)),
        Message::LoginResp(resp) => Err(RiftError::AuthenticationFailed(format!(
            "login rejected: {}",
            resp.error
        ))),
        other => Err(RiftError::MalformedMessage(format!(
            "expected LoginResp, got {:?}",
            other.msg_type()
        ))),
    }
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

async fn write_loop(mut writer: WriteHalf<BoxedStream>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &msg).await {
            debug!(error = %e, "control write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Dispatch server messages and send heartbeats until the session should
/// end, returning the reason.
async fn session_loop(
    ctx: &Arc<ClientContext>,
    run_id: &str,
    proxies: &ProxyTable,
    out_tx: &mpsc::Sender<Message>,
    mut in_rx: mpsc::Receiver<RiftResult<Message>>,
    mut stop_rx: mpsc::Receiver<()>,
) -> String {
    let common = &ctx.config.common;
    let interval = common.heartbeat_interval();
    let heartbeat_timeout = common.heartbeat_timeout();
    let mut ping = time::interval(interval.max(Duration::from_millis(10)));
    ping.tick().await; // skip the immediate first tick
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = stop_rx.recv() => return "closed by client".to_string(),

            _ = ping.tick(), if !interval.is_zero() => {
                if !heartbeat_timeout.is_zero() && last_pong.elapsed() > heartbeat_timeout {
                    warn!(run_id = %run_id, "heartbeat timeout");
                    return format!("no pong for {heartbeat_timeout:?}");
                }
                let ts = unix_now();
                let msg = Ping {
                    privilege_key: auth_key(&common.token, ts),
                    timestamp: ts,
                };
                if out_tx.send(msg.into()).await.is_err() {
                    return "control connection closed".to_string();
                }
            }

            msg = in_rx.recv() => match msg {
                Some(Ok(Message::Pong(pong))) => {
                    if !pong.error.is_empty() {
                        warn!(run_id = %run_id, error = %pong.error, "heartbeat rejected");
                        return format!("heartbeat rejected: {}", pong.error);
                    }
                    last_pong = Instant::now();
                }
                Some(Ok(Message::ReqWorkConn(_))) => {
                    tokio::spawn(work::serve(ctx.clone(), run_id.to_string()));
                }
                Some(Ok(Message::NewProxyResp(resp))) => on_proxy_resp(ctx, proxies, resp).await,
                Some(Ok(other)) => {
                    debug!(run_id = %run_id, msg_type = ?other.msg_type(), "ignoring control message");
                }
                Some(Err(RiftError::StreamClosed)) | None => {
                    return "control connection closed by server".to_string();
                }
                Some(Err(e)) => return e.to_string(),
            },
        }
    }
}

async fn on_proxy_resp(ctx: &ClientContext, proxies: &ProxyTable, resp: NewProxyResp) {
    let status = if resp.error.is_empty() {
        info!(proxy = %resp.proxy_name, remote_addr = %resp.remote_addr, "proxy started");
        ctx.events.emit(ClientEvent::ProxyStarted {
            name: resp.proxy_name.clone(),
            remote_addr: resp.remote_addr.clone(),
        });
        ProxyStatus::Running {
            remote_addr: resp.remote_addr,
        }
    } else {
        warn!(proxy = %resp.proxy_name, error = %resp.error, "proxy rejected");
        ctx.events.emit(ClientEvent::ProxyFailed {
            name: resp.proxy_name.clone(),
            error: resp.error.clone(),
        });
        ProxyStatus::Failed { error: resp.error }
    };
    proxies.write().await.insert(resp.proxy_name, status);
}
