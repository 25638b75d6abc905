//! Work connection broker.
//!
//! Each control session owns one [`WorkConnPool`]. Client-dialed work
//! connections are offered to the pool and matched against waiters (user or
//! visitor connections that need a tunnel) in FIFO order. Every state change
//! happens under the pool's mutex, and handoff is a oneshot rendezvous, so a
//! connection is bound at most once and a timed-out waiter never swallows one.

use crate::event::{EventBus, ServerEvent};
use rift_core::messages::{Message, ReqWorkConn, StartWorkConn};
use rift_core::{write_message, BoxedStream, RiftError, RiftResult};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// Attempts at writing `StartWorkConn` before giving up on a user connection.
const START_WORK_CONN_ATTEMPTS: usize = 3;

/// A client-dialed work connection.
pub struct WorkConn {
    pub stream: BoxedStream,
    pub peer_addr: Option<SocketAddr>,
    offered_at: Instant,
}

impl WorkConn {
    pub fn new(stream: BoxedStream, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            stream,
            peer_addr,
            offered_at: Instant::now(),
        }
    }
}

impl std::fmt::Debug for WorkConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkConn")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Negotiated per-connection transforms, applied by the data-plane collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformFlags {
    pub use_encryption: bool,
    pub use_compression: bool,
}

struct Waiter {
    proxy_name: String,
    tx: oneshot::Sender<RiftResult<WorkConn>>,
}

#[derive(Default)]
struct PoolState {
    offered: VecDeque<WorkConn>,
    waiters: VecDeque<Waiter>,
    /// `ReqWorkConn` sent but not yet answered.
    outstanding: usize,
    closed: Option<String>,
    /// Proxies closed since their last registration; acquiring for them fails fast.
    closed_proxies: HashSet<String>,
}

impl PoolState {
    fn prune_waiters(&mut self) {
        self.waiters.retain(|w| !w.tx.is_closed());
    }

    fn drop_stale(&mut self, idle_timeout: Duration) -> usize {
        let before = self.offered.len();
        self.offered
            .retain(|c| c.offered_at.elapsed() <= idle_timeout);
        before - self.offered.len()
    }
}

/// Pool tunables, taken from the server config and the login request.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub pool_count: usize,
    pub pending_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Per-session rendezvous between pending connections and work connections.
pub struct WorkConnPool {
    run_id: String,
    settings: PoolSettings,
    /// Control channel outbound queue, used to send `ReqWorkConn`.
    requests: mpsc::Sender<Message>,
    events: EventBus,
    state: Mutex<PoolState>,
}

impl WorkConnPool {
    pub fn new(
        run_id: String,
        settings: PoolSettings,
        requests: mpsc::Sender<Message>,
        events: EventBus,
    ) -> Self {
        Self {
            run_id,
            settings,
            requests,
            events,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Ceiling on parked connections; extra offers are dropped.
    fn max_offered(&self) -> usize {
        self.settings.pool_count.max(1) * 2
    }

    async fn request(&self, count: usize) {
        for _ in 0..count {
            if self
                .requests
                .send(Message::ReqWorkConn(ReqWorkConn {}))
                .await
                .is_err()
            {
                debug!(run_id = %self.run_id, "control channel gone, not requesting work conn");
                return;
            }
        }
        if count > 0 {
            debug!(run_id = %self.run_id, count, "requested work connections");
        }
    }

    /// Ask the client for the session's initial pool.
    pub async fn prefill(&self) {
        let count = {
            let mut st = self.state.lock().await;
            if st.closed.is_some() {
                return;
            }
            st.outstanding += self.settings.pool_count;
            self.settings.pool_count
        };
        self.request(count).await;
    }

    /// Obtain a work connection for `proxy_name`, waiting up to the pending timeout.
    pub async fn acquire(&self, proxy_name: &str) -> RiftResult<WorkConn> {
        let (mut rx, to_request) = {
            let mut st = self.state.lock().await;
            if let Some(reason) = &st.closed {
                return Err(RiftError::SessionClosed(reason.clone()));
            }
            if st.closed_proxies.contains(proxy_name) {
                return Err(RiftError::ProxyClosed(proxy_name.to_string()));
            }
            st.prune_waiters();
            let dropped = st.drop_stale(self.settings.idle_timeout);
            if dropped > 0 {
                debug!(run_id = %self.run_id, dropped, "dropped stale work connections");
            }

            if let Some(conn) = st.offered.pop_front() {
                // Replace what we took so the pool stays warm.
                st.outstanding += 1;
                drop(st);
                self.request(1).await;
                return Ok(conn);
            }

            let (tx, rx) = oneshot::channel();
            st.waiters.push_back(Waiter {
                proxy_name: proxy_name.to_string(),
                tx,
            });
            let deficit = st.waiters.len().saturating_sub(st.outstanding);
            st.outstanding += deficit;
            (rx, deficit)
        };

        self.request(to_request).await;

        match tokio::time::timeout(self.settings.pending_timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RiftError::SessionClosed(format!(
                "session {} closed",
                self.run_id
            ))),
            Err(_) => {
                rx.close();
                // A handoff may have landed between the deadline and close().
                if let Ok(result) = rx.try_recv() {
                    return result;
                }
                let mut st = self.state.lock().await;
                st.prune_waiters();
                // Treat the request behind this waiter as lost.
                st.outstanding = st.outstanding.saturating_sub(1);
                Err(RiftError::Timeout(format!(
                    "no work connection for proxy [{proxy_name}] within {:?}",
                    self.settings.pending_timeout
                )))
            }
        }
    }

    /// Hand a freshly authenticated work connection to the oldest live waiter,
    /// or park it.
    pub async fn offer(&self, conn: WorkConn) -> RiftResult<()> {
        let mut st = self.state.lock().await;
        if let Some(reason) = &st.closed {
            return Err(RiftError::SessionClosed(reason.clone()));
        }
        st.outstanding = st.outstanding.saturating_sub(1);

        let mut conn = conn;
        while let Some(waiter) = st.waiters.pop_front() {
            match waiter.tx.send(Ok(conn)) {
                Ok(()) => {
                    debug!(run_id = %self.run_id, proxy = %waiter.proxy_name, "work connection handed to waiter");
                    return Ok(());
                }
                // Receiver gone (timed out); take the connection back and try the next.
                Err(Ok(returned)) => conn = returned,
                Err(Err(_)) => return Ok(()),
            }
        }

        if st.offered.len() >= self.max_offered() {
            debug!(run_id = %self.run_id, "work connection pool full, dropping offer");
            return Ok(());
        }
        conn.offered_at = Instant::now();
        st.offered.push_back(conn);
        Ok(())
    }

    /// Fail every waiter of a proxy that is going away, and any that arrive
    /// until it is opened again.
    pub async fn cancel_proxy(&self, proxy_name: &str) {
        let mut st = self.state.lock().await;
        st.closed_proxies.insert(proxy_name.to_string());
        let waiters = std::mem::take(&mut st.waiters);
        for w in waiters {
            if w.proxy_name == proxy_name {
                let _ = w.tx.send(Err(RiftError::ProxyClosed(proxy_name.to_string())));
            } else {
                st.waiters.push_back(w);
            }
        }
    }

    /// Accept waiters for a proxy name again after it is re-registered.
    pub async fn open_proxy(&self, proxy_name: &str) {
        self.state.lock().await.closed_proxies.remove(proxy_name);
    }

    /// Close the pool: fail all waiters and drop parked connections. Idempotent.
    pub async fn close(&self, reason: &str) {
        let mut st = self.state.lock().await;
        if st.closed.is_some() {
            return;
        }
        st.closed = Some(reason.to_string());
        for w in st.waiters.drain(..) {
            let _ = w.tx.send(Err(RiftError::SessionClosed(reason.to_string())));
        }
        let dropped = st.offered.len();
        st.offered.clear();
        st.outstanding = 0;
        debug!(run_id = %self.run_id, dropped, "work connection pool closed");
    }

    /// Drop parked connections idle past the limit.
    pub async fn sweep_idle(&self) -> usize {
        let mut st = self.state.lock().await;
        st.drop_stale(self.settings.idle_timeout)
    }

    pub async fn offered_len(&self) -> usize {
        self.state.lock().await.offered.len()
    }

    pub async fn waiting_len(&self) -> usize {
        let mut st = self.state.lock().await;
        st.prune_waiters();
        st.waiters.len()
    }

    /// Obtain a work connection and announce it with `StartWorkConn`.
    ///
    /// A connection whose write fails is discarded and another one is obtained.
    pub async fn start_work_conn(
        &self,
        start: StartWorkConn,
        transform: TransformFlags,
    ) -> RiftResult<WorkConn> {
        let proxy_name = start.proxy_name.clone();
        let src_addr = start.src_addr.clone();
        let msg = Message::StartWorkConn(start);

        let mut last_err = None;
        for attempt in 1..=START_WORK_CONN_ATTEMPTS {
            let mut conn = self.acquire(&proxy_name).await?;
            match write_message(&mut conn.stream, &msg).await {
                Ok(()) => {
                    info!(
                        run_id = %self.run_id,
                        proxy = %proxy_name,
                        src = %src_addr,
                        "work connection bound"
                    );
                    self.events.emit(ServerEvent::WorkConnBound {
                        run_id: self.run_id.clone(),
                        proxy_name,
                        src_addr,
                        use_encryption: transform.use_encryption,
                        use_compression: transform.use_compression,
                    });
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(run_id = %self.run_id, proxy = %proxy_name, attempt, error = %e, "StartWorkConn write failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(RiftError::StreamClosed))
    }
}
