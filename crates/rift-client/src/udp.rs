//! Client end of a udp carrier.
//!
//! Each remote peer seen on the carrier gets its own socket connected to the
//! local service, so replies can be attributed back to the right peer. A peer
//! whose local socket hears nothing for [`PEER_IDLE_TIMEOUT`] is forgotten and
//! its socket closed; its next datagram opens a fresh one.

use rift_core::messages::Message;
use rift_core::transport::MAX_DATAGRAM;
use rift_core::udp::{forward_packets, read_packet, unwrap_datagram, wrap_datagram};
use rift_core::{BoxedStream, RiftError, RiftResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::ReadHalf;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;

const REPLY_QUEUE: usize = 1024;

pub(crate) const PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Relay datagrams between a carrier and the local udp service at `local`.
pub(crate) async fn serve_carrier(stream: BoxedStream, local: &str, max_len: usize) -> RiftResult<()> {
    serve_carrier_with_idle(stream, local, max_len, PEER_IDLE_TIMEOUT).await
}

async fn serve_carrier_with_idle(
    stream: BoxedStream,
    local: &str,
    max_len: usize,
    idle: Duration,
) -> RiftResult<()> {
    let local: SocketAddr = tokio::net::lookup_host(local)
        .await?
        .next()
        .ok_or_else(|| RiftError::Transport(format!("cannot resolve {local}")))?;
    let (reader, mut writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(REPLY_QUEUE);
    let mut replies = JoinSet::new();

    let result = tokio::select! {
        r = forward_packets(&mut writer, rx) => r,
        r = relay_to_local(reader, local, tx, &mut replies, max_len, idle) => r,
    };
    replies.shutdown().await;
    result
}

async fn relay_to_local(
    mut reader: ReadHalf<BoxedStream>,
    local: SocketAddr,
    tx: mpsc::Sender<Message>,
    replies: &mut JoinSet<()>,
    max_len: usize,
    idle: Duration,
) -> RiftResult<()> {
    // The reply loop holds the only strong reference; an expired peer upgrades to None.
    let mut peers: HashMap<SocketAddr, Weak<UdpSocket>> = HashMap::new();
    loop {
        let packet = read_packet(&mut reader, max_len).await?;
        let (content, remote) = unwrap_datagram(packet)?;
        let socket = match peers.get(&remote).and_then(Weak::upgrade) {
            Some(socket) => socket,
            None => {
                while replies.try_join_next().is_some() {}
                peers.retain(|_, peer| peer.strong_count() > 0);
                let bind: SocketAddr = if local.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = Arc::new(UdpSocket::bind(bind).await?);
                socket.connect(local).await?;
                debug!(remote = %remote, via = %socket.local_addr()?, "new udp peer");
                peers.insert(remote, Arc::downgrade(&socket));
                replies.spawn(reply_loop(socket.clone(), local, remote, tx.clone(), idle));
                socket
            }
        };
        if let Err(e) = socket.send(&content).await {
            debug!(remote = %remote, error = %e, "udp send to local service failed");
        }
    }
}

/// Wrap everything the local service sends back to `remote`, until the
/// socket has been quiet for `idle`.
async fn reply_loop(
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    remote: SocketAddr,
    tx: mpsc::Sender<Message>,
    idle: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = match tokio::time::timeout(idle, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            // The local service is not listening (yet); the next send retries.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
            Err(_) => {
                debug!(remote = %remote, "udp peer idle, closing its socket");
                return;
            }
            Ok(Err(e)) => {
                debug!(remote = %remote, error = %e, "udp reply loop ended");
                return;
            }
        };
        if tx.send(wrap_datagram(&buf[..n], Some(local), remote)).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::serve_carrier_with_idle;
    use crate::config::ProxyConfig;
    use crate::testutil::*;
    use crate::RiftClient;
    use rift_core::udp::{read_packet, wrap_datagram};
    use rift_core::write_message;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    /// Echo server that prefixes each reply with `re:`.
    async fn udp_echo() -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let mut reply = b"re:".to_vec();
                reply.extend_from_slice(&buf[..n]);
                let _ = socket.send_to(&reply, from).await;
            }
        });
        addr
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 1500];
        let n = tokio::time::timeout(Duration::from_secs(5), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn udp_proxy_round_trip_keeps_peers_apart() {
        let server = start_server(server_config()).await;
        let echo = udp_echo().await;
        let mut config = client_config(&server);
        config.proxies.push(ProxyConfig {
            name: "dns".into(),
            proxy_type: "udp".into(),
            local_ip: "127.0.0.1".into(),
            local_port: echo.port(),
            ..Default::default()
        });
        let client = RiftClient::new(config);
        let mut events = client.subscribe();
        let _session = client.login("").await.unwrap();
        let port = public_port(&wait_proxy_started(&mut events, "dns").await);

        let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bob = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        alice.connect(("127.0.0.1", port)).await.unwrap();
        bob.connect(("127.0.0.1", port)).await.unwrap();

        alice.send(b"from-alice").await.unwrap();
        assert_eq!(recv(&alice).await, b"re:from-alice");
        bob.send(b"from-bob").await.unwrap();
        assert_eq!(recv(&bob).await, b"re:from-bob");
        alice.send(b"again").await.unwrap();
        assert_eq!(recv(&alice).await, b"re:again");
    }

    /// Replies with the source port the datagram arrived from.
    async fn port_reporter() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((_, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&from.port().to_be_bytes(), from).await;
            }
        });
        addr
    }

    async fn ask_port(carrier: &mut tokio::io::DuplexStream, remote: SocketAddr) -> u16 {
        write_message(carrier, &wrap_datagram(b"?", None, remote)).await.unwrap();
        let packet = tokio::time::timeout(Duration::from_secs(5), read_packet(carrier, 1 << 20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.remote_addr, Some(remote));
        u16::from_be_bytes([packet.content[0], packet.content[1]])
    }

    #[tokio::test]
    async fn idle_peer_gets_a_fresh_socket() {
        let local = port_reporter().await.to_string();
        let (mut carrier, client_end) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            serve_carrier_with_idle(Box::new(client_end), &local, 1 << 20, Duration::from_millis(100)).await
        });
        let remote: SocketAddr = "203.0.113.7:4000".parse().unwrap();

        let first = ask_port(&mut carrier, remote).await;
        assert_eq!(ask_port(&mut carrier, remote).await, first);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_ne!(ask_port(&mut carrier, remote).await, first);
    }
}
