//! UDP datagram tunneling over a reliable work connection.

use crate::codec::{read_message, write_message};
use crate::error::{RiftError, RiftResult};
use crate::messages::{Message, UdpPacket};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;

/// Wrap one datagram as a [`UdpPacket`] message.
pub fn wrap_datagram(content: &[u8], local_addr: Option<SocketAddr>, remote_addr: SocketAddr) -> Message {
    Message::UdpPacket(UdpPacket {
        content: content.to_vec(),
        local_addr,
        remote_addr: Some(remote_addr),
    })
}

/// Extract the datagram and its remote peer from a [`UdpPacket`].
pub fn unwrap_datagram(packet: UdpPacket) -> RiftResult<(Vec<u8>, SocketAddr)> {
    let remote = packet
        .remote_addr
        .ok_or_else(|| RiftError::MalformedMessage("udp packet without remote address".into()))?;
    Ok((packet.content, remote))
}

/// Read the next [`UdpPacket`] from a carrier stream, skipping keepalives.
///
/// EOF or any non-packet message ends the carrier with [`RiftError::StreamClosed`]
/// or [`RiftError::MalformedMessage`] respectively.
pub async fn read_packet<R>(reader: &mut R, max_len: usize) -> RiftResult<UdpPacket>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        match read_message(reader, max_len).await? {
            Message::UdpPacket(p) => return Ok(p),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => {
                return Err(RiftError::MalformedMessage(format!(
                    "unexpected {:?} on udp carrier",
                    other.msg_type()
                )))
            }
        }
    }
}

/// Drain `rx` onto `writer` in arrival order until the channel closes or a write fails.
pub async fn forward_packets<W>(writer: &mut W, mut rx: mpsc::Receiver<Message>) -> RiftResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_message(writer, &msg).await {
            debug!(error = %e, "udp carrier write failed");
            return Err(e);
        }
    }
    Ok(())
}
