//! Hole-punch coordinator for xtcp proxies.
//!
//! Listens on a UDP port. Each datagram carries one framed message and its
//! source address is the peer's server-observed candidate. The coordinator
//! pairs a visitor's request with the owning client, exchanges candidates,
//! and expires attempts that never get confirmed.

use crate::server::ServerContext;
use rift_core::messages::*;
use rift_core::transport::{recv_datagram, send_datagram, MAX_DATAGRAM};
use rift_core::{
    generate_id, verify_auth_key, write_message, HolePunchSession, ProxyType, PunchStatus,
    RiftError, RiftResult,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Default)]
struct NatHoleState {
    sessions: HashMap<String, HolePunchSession>,
    /// Retired sids, kept so a late message cannot revive them.
    tombstones: HashMap<String, Instant>,
}

pub struct NatHoleController {
    expiry: Duration,
    state: Mutex<NatHoleState>,
}

impl NatHoleController {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            state: Mutex::new(NatHoleState::default()),
        }
    }

    /// Open an attempt for a visitor. Returns the new sid, or `None` when the
    /// same visitor address already has a live attempt on this proxy (a
    /// retransmitted request).
    pub async fn begin(
        &self,
        proxy_name: &str,
        visitor_addr: SocketAddr,
        visitor_local_addr: &str,
    ) -> Option<String> {
        let mut st = self.state.lock().await;
        let duplicate = st
            .sessions
            .values()
            .any(|s| s.visitor_addr == visitor_addr && s.proxy_name == proxy_name && !s.status.is_terminal());
        if duplicate {
            return None;
        }
        let sid = loop {
            let sid = generate_id(8);
            if !st.sessions.contains_key(&sid) && !st.tombstones.contains_key(&sid) {
                break sid;
            }
        };
        let mut session = HolePunchSession::new(sid.clone(), proxy_name.to_string(), visitor_addr);
        session.visitor_local_addr = visitor_local_addr.to_string();
        st.sessions.insert(sid.clone(), session);
        Some(sid)
    }

    /// Record the client's candidates and build the response both peers get.
    ///
    /// A retransmitted report gets the same response again.
    pub async fn client_report(
        &self,
        req: &NatHoleClient,
        client_addr: SocketAddr,
    ) -> RiftResult<(NatHoleResp, SocketAddr)> {
        let mut st = self.state.lock().await;
        if st.tombstones.contains_key(&req.sid) {
            return Err(RiftError::HolePunch(format!("sid [{}] has expired", req.sid)));
        }
        let session = st
            .sessions
            .get_mut(&req.sid)
            .ok_or_else(|| RiftError::HolePunch(format!("unknown sid [{}]", req.sid)))?;
        if session.proxy_name != req.proxy_name {
            return Err(RiftError::HolePunch(format!(
                "sid [{}] does not belong to proxy [{}]",
                req.sid, req.proxy_name
            )));
        }

        session.client_addr = Some(client_addr);
        session.client_local_addr = req.local_addr.clone();
        session.advance(PunchStatus::CandidatesExchanged);

        let resp = NatHoleResp {
            sid: session.sid.clone(),
            visitor_addr: session.visitor_addr.to_string(),
            client_addr: client_addr.to_string(),
            visitor_local_addr: session.visitor_local_addr.clone(),
            client_local_addr: session.client_local_addr.clone(),
            error: String::new(),
        };
        Ok((resp, session.visitor_addr))
    }

    /// The client reported a successful probe. Returns whether the status moved.
    pub async fn confirm(&self, sid: &str) -> bool {
        let mut st = self.state.lock().await;
        match st.sessions.get_mut(sid) {
            Some(s) if s.status == PunchStatus::CandidatesExchanged => s.advance(PunchStatus::DetectConfirmed),
            _ => false,
        }
    }

    /// Give up on an attempt right away, e.g. when the client cannot be reached.
    pub async fn fail(&self, sid: &str) -> Option<HolePunchSession> {
        let mut st = self.state.lock().await;
        let mut session = st.sessions.remove(sid)?;
        session.advance(PunchStatus::Failed);
        st.tombstones.insert(sid.to_string(), Instant::now());
        Some(session)
    }

    pub async fn status(&self, sid: &str) -> Option<PunchStatus> {
        let st = self.state.lock().await;
        if st.tombstones.contains_key(sid) {
            return Some(PunchStatus::Failed);
        }
        st.sessions.get(sid).map(|s| s.status)
    }

    /// Retire attempts older than the expiry. Unconfirmed ones fail and are
    /// returned; confirmed ones are dropped quietly.
    pub async fn sweep(&self) -> Vec<HolePunchSession> {
        let expiry = self.expiry;
        let mut st = self.state.lock().await;
        st.tombstones.retain(|_, at| at.elapsed() < expiry);

        let expired: Vec<String> = st
            .sessions
            .values()
            .filter(|s| s.created_at.elapsed() >= expiry)
            .map(|s| s.sid.clone())
            .collect();

        let mut failed = Vec::new();
        for sid in expired {
            let Some(mut session) = st.sessions.remove(&sid) else {
                continue;
            };
            if session.status == PunchStatus::DetectConfirmed {
                continue;
            }
            session.advance(PunchStatus::Failed);
            st.tombstones.insert(sid, Instant::now());
            failed.push(session);
        }
        failed
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }
}

/// Receive loop for the coordinator socket. Runs until shutdown.
pub(crate) async fn serve(ctx: Arc<ServerContext>, socket: Arc<UdpSocket>) {
    let mut shutdown = ctx.subscribe_shutdown();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (from, result) = tokio::select! {
            r = recv_datagram(socket.as_ref(), &mut buf) => r,
            _ = shutdown.recv() => break,
        };
        match result {
            Ok(msg) => handle_datagram(&ctx, &socket, msg, from).await,
            Err(RiftError::Io(e)) => {
                warn!(error = %e, "hole-punch socket failed");
                break;
            }
            Err(e) => debug!(from = %from, error = %e, "dropping malformed datagram"),
        }
    }
    debug!("hole-punch coordinator stopped");
}

async fn handle_datagram(ctx: &Arc<ServerContext>, socket: &Arc<UdpSocket>, msg: Message, from: SocketAddr) {
    match msg {
        Message::NatHoleVisitor(req) => {
            // Brokering the client's work connection can take a while.
            let ctx = ctx.clone();
            let socket = socket.clone();
            tokio::spawn(async move { visitor_request(ctx, socket, req, from).await });
        }
        Message::NatHoleClient(req) => match ctx.nathole.client_report(&req, from).await {
            Ok((resp, visitor_addr)) => {
                info!(proxy = %req.proxy_name, sid = %req.sid, visitor = %visitor_addr, client = %from, "hole-punch candidates exchanged");
                let msg = Message::NatHoleResp(resp);
                for target in [from, visitor_addr] {
                    if let Err(e) = send_datagram(socket.as_ref(), &msg, target).await {
                        warn!(sid = %req.sid, to = %target, error = %e, "NatHoleResp send failed");
                    }
                }
            }
            Err(e) => {
                debug!(sid = %req.sid, from = %from, error = %e, "client report rejected");
                let resp = NatHoleResp {
                    sid: req.sid,
                    error: e.to_string(),
                    ..Default::default()
                };
                let _ = send_datagram(socket.as_ref(), &resp.into(), from).await;
            }
        },
        Message::NatHoleClientDetectOk(ok) => {
            if ctx.nathole.confirm(&ok.sid).await {
                info!(sid = %ok.sid, "hole-punch detect confirmed");
            }
        }
        other => {
            debug!(from = %from, msg_type = ?other.msg_type(), "unexpected datagram");
        }
    }
}

async fn visitor_request(ctx: Arc<ServerContext>, socket: Arc<UdpSocket>, req: NatHoleVisitor, from: SocketAddr) {
    let mut sid = String::new();
    if let Err(e) = start_punch(&ctx, &req, from, &mut sid).await {
        warn!(proxy = %req.proxy_name, visitor = %from, error = %e, "hole-punch request failed");
        if !sid.is_empty() {
            ctx.nathole.fail(&sid).await;
        }
        let resp = NatHoleResp {
            sid,
            error: e.to_string(),
            ..Default::default()
        };
        let _ = send_datagram(socket.as_ref(), &resp.into(), from).await;
    }
}

/// Validate the visitor, open the attempt and hand its sid to the client
/// over a fresh work connection. `sid` is set once the attempt exists.
async fn start_punch(
    ctx: &ServerContext,
    req: &NatHoleVisitor,
    from: SocketAddr,
    sid: &mut String,
) -> RiftResult<()> {
    let route = ctx
        .registry
        .lookup(&req.proxy_name)
        .await
        .ok_or_else(|| RiftError::ProxyNotFound(req.proxy_name.clone()))?;
    if route.proxy_type != ProxyType::Xtcp {
        return Err(RiftError::HolePunch(format!(
            "proxy [{}] is not an xtcp proxy",
            req.proxy_name
        )));
    }
    verify_auth_key(&route.sk, req.timestamp, &req.sign_key, ctx.config.freshness_window)
        .map_err(|_| RiftError::AuthenticationFailed("invalid sign key".into()))?;

    let Some(new_sid) = ctx.nathole.begin(&req.proxy_name, from, &req.local_addr).await else {
        debug!(proxy = %req.proxy_name, visitor = %from, "retransmitted hole-punch request");
        return Ok(());
    };
    *sid = new_sid;
    // No tcp destination: the client reads a NatHoleSid next instead of splicing.
    let start = StartWorkConn {
        proxy_name: route.name.clone(),
        src_addr: from.ip().to_string(),
        src_port: from.port(),
        ..Default::default()
    };
    let mut work = route.control.pool.start_work_conn(start, route.transform).await?;
    write_message(&mut work.stream, &NatHoleSid { sid: sid.clone() }.into()).await?;
    info!(proxy = %req.proxy_name, sid = %sid, visitor = %from, "hole-punch initiated");
    Ok(())
}
