//! Transport abstractions for rift.
//!
//! Control, work and visitor connections are plain reliable byte streams. The
//! hole-punch path needs an unreliable datagram socket.

use crate::codec::{decode_datagram, frame_encode};
use crate::error::{RiftError, RiftResult};
use crate::messages::Message;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// A reliable, ordered, bidirectional byte stream.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn ByteStream>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An unreliable datagram endpoint.
pub trait DatagramSocket: Send + Sync {
    fn send_to<'a>(&'a self, data: &'a [u8], target: SocketAddr) -> BoxFuture<'a, RiftResult<usize>>;

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, RiftResult<(usize, SocketAddr)>>;

    fn local_addr(&self) -> RiftResult<SocketAddr>;
}

impl DatagramSocket for tokio::net::UdpSocket {
    fn send_to<'a>(&'a self, data: &'a [u8], target: SocketAddr) -> BoxFuture<'a, RiftResult<usize>> {
        Box::pin(async move { Ok(tokio::net::UdpSocket::send_to(self, data, target).await?) })
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, RiftResult<(usize, SocketAddr)>> {
        Box::pin(async move { Ok(tokio::net::UdpSocket::recv_from(self, buf).await?) })
    }

    fn local_addr(&self) -> RiftResult<SocketAddr> {
        Ok(tokio::net::UdpSocket::local_addr(self)?)
    }
}

/// Pause after a failed `accept()` so a persistent error (fd exhaustion) does not spin.
pub const ACCEPT_ERROR_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

/// Largest datagram the hole-punch path will read.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Send one framed message as a single datagram.
pub async fn send_datagram<S>(socket: &S, msg: &Message, target: SocketAddr) -> RiftResult<()>
where
    S: DatagramSocket + ?Sized,
{
    let frame = frame_encode(msg)?;
    let n = socket.send_to(&frame, target).await?;
    if n != frame.len() {
        return Err(RiftError::Transport(format!(
            "short datagram write: {n} of {}",
            frame.len()
        )));
    }
    Ok(())
}

/// Receive one datagram and decode it as a framed message.
///
/// The source address is returned even when decoding fails, so callers can log it.
pub async fn recv_datagram<S>(socket: &S, buf: &mut [u8]) -> (SocketAddr, RiftResult<Message>)
where
    S: DatagramSocket + ?Sized,
{
    loop {
        match socket.recv_from(buf).await {
            Ok((n, from)) => return (from, decode_datagram(&buf[..n])),
            // ICMP port-unreachable surfaces here on some platforms; keep reading.
            Err(RiftError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                return (SocketAddr::from(([0, 0, 0, 0], 0)), Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::NatHoleSid;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn datagram_message_exchange() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = DatagramSocket::local_addr(&b).unwrap();

        let msg = Message::NatHoleSid(NatHoleSid { sid: "abc".into() });
        send_datagram(&a, &msg, b_addr).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (from, got) = recv_datagram(&b, &mut buf).await;
        assert_eq!(from, DatagramSocket::local_addr(&a).unwrap());
        assert_eq!(got.unwrap(), msg);
    }

    #[tokio::test]
    async fn garbage_datagram_reports_source() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = DatagramSocket::local_addr(&b).unwrap();
        DatagramSocket::send_to(&a, b"junk", b_addr).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (from, got) = recv_datagram(&b, &mut buf).await;
        assert_eq!(from, DatagramSocket::local_addr(&a).unwrap());
        assert!(got.is_err());
    }
}
