//! Both peers of an xtcp hole punch.
//!
//! The visitor asks the coordinator for an attempt, the client reports its
//! own address for the sid it was handed, and the coordinator sends both
//! candidates to both sides. The visitor then probes the client with
//! `NatHoleSid` until the client answers `NatHoleClientDetectOk`. Both sides
//! give up at the deadline.

use rift_core::messages::{Message, NatHoleClient, NatHoleClientDetectOk, NatHoleSid, NatHoleVisitor};
use rift_core::transport::{recv_datagram, send_datagram, MAX_DATAGRAM};
use rift_core::{auth_key, unix_now, PunchOutcome, RiftResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, info};

const PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// Result of one attempt, with the socket the probes went through.
///
/// On success the socket's NAT mapping is open towards `peer`.
#[derive(Debug)]
pub struct Punch {
    pub outcome: PunchOutcome,
    pub socket: UdpSocket,
}

async fn bind_towards(server: SocketAddr) -> RiftResult<UdpSocket> {
    let any: SocketAddr = if server.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    Ok(UdpSocket::bind(any).await?)
}

/// Self-reported address for peers on the same network. Empty when bound to
/// the wildcard address.
fn reported_local(socket: &UdpSocket) -> String {
    socket
        .local_addr()
        .ok()
        .filter(|a| !a.ip().is_unspecified())
        .map(|a| a.to_string())
        .unwrap_or_default()
}

/// Observed and self-reported addresses of a peer, deduplicated.
fn candidates(observed: &str, reported: &str) -> Vec<SocketAddr> {
    let mut out: Vec<SocketAddr> = Vec::new();
    for addr in [observed, reported].into_iter().filter_map(|s| s.parse().ok()) {
        if !out.contains(&addr) {
            out.push(addr);
        }
    }
    out
}

async fn probe_all(socket: &UdpSocket, sid: &str, targets: &[SocketAddr]) {
    let probe: Message = NatHoleSid { sid: sid.to_string() }.into();
    for target in targets {
        if let Err(e) = send_datagram(socket, &probe, *target).await {
            debug!(sid = %sid, to = %target, error = %e, "probe send failed");
        }
    }
}

fn failed(sid: &str, reason: impl Into<String>) -> PunchOutcome {
    PunchOutcome::Failed {
        sid: sid.to_string(),
        reason: reason.into(),
    }
}

/// Client side: report for `sid`, then answer the visitor's first probe.
pub async fn punch_as_client(
    server: SocketAddr,
    proxy_name: &str,
    sid: &str,
    timeout: Duration,
) -> RiftResult<Punch> {
    let socket = bind_towards(server).await?;
    let deadline = Instant::now() + timeout;
    let report: Message = NatHoleClient {
        proxy_name: proxy_name.to_string(),
        sid: sid.to_string(),
        local_addr: reported_local(&socket),
    }
    .into();

    let mut visitor: Vec<SocketAddr> = Vec::new();
    let mut tick = time::interval(PROBE_INTERVAL);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let outcome = loop {
        tokio::select! {
            _ = time::sleep_until(deadline) => {
                let reason = if visitor.is_empty() {
                    "no answer from coordinator"
                } else {
                    "no probe from visitor"
                };
                break failed(sid, reason);
            }
            _ = tick.tick() => {
                if visitor.is_empty() {
                    // Retransmits get the same answer from the coordinator.
                    if let Err(e) = send_datagram(&socket, &report, server).await {
                        debug!(sid = %sid, error = %e, "NatHoleClient send failed");
                    }
                } else {
                    // Outbound traffic opens our side of the mapping.
                    probe_all(&socket, sid, &visitor).await;
                }
            }
            (from, msg) = recv_datagram(&socket, &mut buf) => match msg {
                Ok(Message::NatHoleResp(resp)) if resp.sid == sid => {
                    if !resp.error.is_empty() {
                        break failed(sid, resp.error);
                    }
                    if visitor.is_empty() {
                        visitor = candidates(&resp.visitor_addr, &resp.visitor_local_addr);
                        debug!(sid = %sid, candidates = ?visitor, "visitor candidates received");
                    }
                }
                Ok(Message::NatHoleSid(probe)) if probe.sid == sid => {
                    let ok: Message = NatHoleClientDetectOk { sid: sid.to_string() }.into();
                    send_datagram(&socket, &ok, from).await?;
                    send_datagram(&socket, &ok, server).await?;
                    break PunchOutcome::Established {
                        sid: sid.to_string(),
                        peer: from,
                    };
                }
                Ok(other) => debug!(sid = %sid, from = %from, msg_type = ?other.msg_type(), "ignoring datagram"),
                Err(e) => debug!(sid = %sid, from = %from, error = %e, "undecodable datagram"),
            },
        }
    };

    log_outcome("client", proxy_name, &outcome);
    Ok(Punch { outcome, socket })
}

/// Visitor side: request an attempt on `proxy_name` and probe the client
/// until it confirms.
pub async fn punch_as_visitor(
    server: SocketAddr,
    proxy_name: &str,
    sk: &str,
    timeout: Duration,
) -> RiftResult<Punch> {
    let socket = bind_towards(server).await?;
    let deadline = Instant::now() + timeout;
    let ts = unix_now();
    let request: Message = NatHoleVisitor {
        proxy_name: proxy_name.to_string(),
        sign_key: auth_key(sk, ts),
        timestamp: ts,
        local_addr: reported_local(&socket),
    }
    .into();

    let mut sid = String::new();
    let mut client: Vec<SocketAddr> = Vec::new();
    let mut tick = time::interval(PROBE_INTERVAL);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let outcome = loop {
        tokio::select! {
            _ = time::sleep_until(deadline) => {
                let reason = if client.is_empty() {
                    "no answer from coordinator"
                } else {
                    "client never confirmed a probe"
                };
                break failed(&sid, reason);
            }
            _ = tick.tick() => {
                if client.is_empty() {
                    // The coordinator ignores repeats from the same socket.
                    if let Err(e) = send_datagram(&socket, &request, server).await {
                        debug!(proxy = %proxy_name, error = %e, "NatHoleVisitor send failed");
                    }
                } else {
                    probe_all(&socket, &sid, &client).await;
                }
            }
            (from, msg) = recv_datagram(&socket, &mut buf) => match msg {
                Ok(Message::NatHoleResp(resp)) if sid.is_empty() || resp.sid == sid => {
                    if !resp.error.is_empty() {
                        break failed(&resp.sid, resp.error);
                    }
                    if client.is_empty() {
                        sid = resp.sid;
                        client = candidates(&resp.client_addr, &resp.client_local_addr);
                        debug!(sid = %sid, candidates = ?client, "client candidates received");
                        probe_all(&socket, &sid, &client).await;
                    }
                }
                Ok(Message::NatHoleClientDetectOk(ok)) if !sid.is_empty() && ok.sid == sid => {
                    break PunchOutcome::Established {
                        sid: sid.clone(),
                        peer: from,
                    };
                }
                Ok(other) => debug!(sid = %sid, from = %from, msg_type = ?other.msg_type(), "ignoring datagram"),
                Err(e) => debug!(sid = %sid, from = %from, error = %e, "undecodable datagram"),
            },
        }
    };

    log_outcome("visitor", proxy_name, &outcome);
    Ok(Punch { outcome, socket })
}

fn log_outcome(role: &str, proxy_name: &str, outcome: &PunchOutcome) {
    match outcome {
        PunchOutcome::Established { sid, peer } => {
            info!(role, proxy = %proxy_name, sid = %sid, peer = %peer, "hole punch established");
        }
        PunchOutcome::Failed { sid, reason } => {
            info!(role, proxy = %proxy_name, sid = %sid, reason = %reason, "hole punch failed");
        }
    }
}
