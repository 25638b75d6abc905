//! udp proxies.
//!
//! Datagrams from users are wrapped as `UdpPacket`s and written in arrival
//! order onto a single work connection (the carrier). Replies read back from
//! the carrier go to the packet's `remote_addr`. When the carrier dies, the
//! next datagram brings up a new one.

use crate::server::ServerContext;
use rift_core::messages::{Message, StartWorkConn};
use rift_core::transport::MAX_DATAGRAM;
use rift_core::udp::{forward_packets, read_packet, unwrap_datagram, wrap_datagram};
use rift_core::{RiftError, RiftResult};
use std::sync::Arc;
use tokio::io::ReadHalf;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Datagrams buffered while a carrier is being set up. When full, the
/// socket read loop waits, and the kernel socket buffer absorbs the rest.
const CARRIER_QUEUE: usize = 1024;

pub(crate) async fn serve(
    ctx: Arc<ServerContext>,
    socket: UdpSocket,
    proxy_name: String,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    let socket = Arc::new(socket);
    let port = socket.local_addr().map(|a| a.port()).unwrap_or_default();
    info!(proxy = %proxy_name, port, "udp proxy listening");

    let mut carrier: Option<mpsc::Sender<Message>> = None;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = tokio::select! {
            _ = cancel_rx.recv() => break,
            r = socket.recv_from(&mut buf) => match r {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    warn!(proxy = %proxy_name, error = %e, "udp receive failed");
                    break;
                }
            },
        };

        let mut packet = wrap_datagram(&buf[..n], None, from);
        // A carrier can die between the check and the send; retry once on a fresh one.
        for attempt in 1..=2 {
            let tx = match &carrier {
                Some(tx) if !tx.is_closed() => tx.clone(),
                _ => {
                    let tx = spawn_carrier(ctx.clone(), socket.clone(), proxy_name.clone());
                    carrier = Some(tx.clone());
                    tx
                }
            };
            let sent = tokio::select! {
                _ = cancel_rx.recv() => {
                    debug!(proxy = %proxy_name, port, "udp proxy stopped");
                    return;
                }
                r = tx.send(packet) => r,
            };
            match sent {
                Ok(()) => break,
                Err(mpsc::error::SendError(returned)) => {
                    carrier = None;
                    packet = returned;
                    if attempt == 2 {
                        warn!(proxy = %proxy_name, from = %from, "no udp carrier, datagram dropped");
                    }
                }
            }
        }
    }
    debug!(proxy = %proxy_name, port, "udp proxy stopped");
}

fn spawn_carrier(
    ctx: Arc<ServerContext>,
    socket: Arc<UdpSocket>,
    proxy_name: String,
) -> mpsc::Sender<Message> {
    let (tx, rx) = mpsc::channel(CARRIER_QUEUE);
    tokio::spawn(async move {
        match run_carrier(&ctx, socket, &proxy_name, rx).await {
            Ok(()) => debug!(proxy = %proxy_name, "udp carrier finished"),
            Err(e) => debug!(proxy = %proxy_name, error = %e, "udp carrier closed"),
        }
    });
    tx
}

async fn run_carrier(
    ctx: &ServerContext,
    socket: Arc<UdpSocket>,
    proxy_name: &str,
    rx: mpsc::Receiver<Message>,
) -> RiftResult<()> {
    let route = ctx
        .registry
        .lookup(proxy_name)
        .await
        .ok_or_else(|| RiftError::ProxyNotFound(proxy_name.to_string()))?;
    let start = StartWorkConn {
        proxy_name: proxy_name.to_string(),
        ..Default::default()
    };
    let work = route.control.pool.start_work_conn(start, route.transform).await?;

    let (reader, mut writer) = tokio::io::split(work.stream);
    tokio::select! {
        r = forward_packets(&mut writer, rx) => r,
        r = relay_replies(reader, &socket, ctx.config.max_message_size) => r,
    }
}

async fn relay_replies(
    mut reader: ReadHalf<rift_core::BoxedStream>,
    socket: &UdpSocket,
    max_len: usize,
) -> RiftResult<()> {
    loop {
        let packet = read_packet(&mut reader, max_len).await?;
        let (content, remote) = unwrap_datagram(packet)?;
        socket.send_to(&content, remote).await?;
    }
}
