//! Length-prefixed CBOR framing for rift control and work streams.
//!
//! Wire format: `[4-byte big-endian length][1-byte type tag][CBOR payload]`
//!
//! The length covers the tag byte plus the payload.

use crate::error::{RiftError, RiftResult};
use crate::messages::*;
use serde::de::DeserializeOwned;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default ceiling on a single frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Encode a message into a length-prefixed frame.
pub fn frame_encode(msg: &Message) -> RiftResult<Vec<u8>> {
    let mut body = vec![u8::from(msg.msg_type())];
    match msg {
        Message::Login(p) => ciborium::into_writer(p, &mut body)?,
        Message::LoginResp(p) => ciborium::into_writer(p, &mut body)?,
        Message::NewProxy(p) => ciborium::into_writer(p, &mut body)?,
        Message::NewProxyResp(p) => ciborium::into_writer(p, &mut body)?,
        Message::CloseProxy(p) => ciborium::into_writer(p, &mut body)?,
        Message::NewWorkConn(p) => ciborium::into_writer(p, &mut body)?,
        Message::ReqWorkConn(p) => ciborium::into_writer(p, &mut body)?,
        Message::StartWorkConn(p) => ciborium::into_writer(p, &mut body)?,
        Message::NewVisitorConn(p) => ciborium::into_writer(p, &mut body)?,
        Message::NewVisitorConnResp(p) => ciborium::into_writer(p, &mut body)?,
        Message::Ping(p) => ciborium::into_writer(p, &mut body)?,
        Message::Pong(p) => ciborium::into_writer(p, &mut body)?,
        Message::UdpPacket(p) => ciborium::into_writer(p, &mut body)?,
        Message::NatHoleVisitor(p) => ciborium::into_writer(p, &mut body)?,
        Message::NatHoleClient(p) => ciborium::into_writer(p, &mut body)?,
        Message::NatHoleResp(p) => ciborium::into_writer(p, &mut body)?,
        Message::NatHoleClientDetectOk(p) => ciborium::into_writer(p, &mut body)?,
        Message::NatHoleSid(p) => ciborium::into_writer(p, &mut body)?,
    }

    let len = u32::try_from(body.len())
        .map_err(|_| RiftError::MalformedMessage("frame too large".into()))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(body);
    Ok(frame)
}

fn cbor_decode<T: DeserializeOwned>(data: &[u8]) -> RiftResult<T> {
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}

/// Decode a frame body (tag byte plus payload, no length prefix).
pub fn decode_frame(body: &[u8]) -> RiftResult<Message> {
    let (&tag, payload) = body
        .split_first()
        .ok_or_else(|| RiftError::MalformedMessage("empty frame".into()))?;
    let msg_type = MsgType::try_from(tag).map_err(RiftError::MalformedMessage)?;

    let msg = match msg_type {
        MsgType::Login => Message::Login(cbor_decode(payload)?),
        MsgType::LoginResp => Message::LoginResp(cbor_decode(payload)?),
        MsgType::NewProxy => Message::NewProxy(cbor_decode(payload)?),
        MsgType::NewProxyResp => Message::NewProxyResp(cbor_decode(payload)?),
        MsgType::CloseProxy => Message::CloseProxy(cbor_decode(payload)?),
        MsgType::NewWorkConn => Message::NewWorkConn(cbor_decode(payload)?),
        MsgType::ReqWorkConn => Message::ReqWorkConn(cbor_decode(payload)?),
        MsgType::StartWorkConn => Message::StartWorkConn(cbor_decode(payload)?),
        MsgType::NewVisitorConn => Message::NewVisitorConn(cbor_decode(payload)?),
        MsgType::NewVisitorConnResp => Message::NewVisitorConnResp(cbor_decode(payload)?),
        MsgType::Ping => Message::Ping(cbor_decode(payload)?),
        MsgType::Pong => Message::Pong(cbor_decode(payload)?),
        MsgType::UdpPacket => Message::UdpPacket(cbor_decode(payload)?),
        MsgType::NatHoleVisitor => Message::NatHoleVisitor(cbor_decode(payload)?),
        MsgType::NatHoleClient => Message::NatHoleClient(cbor_decode(payload)?),
        MsgType::NatHoleResp => Message::NatHoleResp(cbor_decode(payload)?),
        MsgType::NatHoleClientDetectOk => Message::NatHoleClientDetectOk(cbor_decode(payload)?),
        MsgType::NatHoleSid => Message::NatHoleSid(cbor_decode(payload)?),
    };
    Ok(msg)
}

/// Decode a complete frame including its length prefix.
pub fn decode_datagram(data: &[u8]) -> RiftResult<Message> {
    if data.len() < 4 {
        return Err(RiftError::MalformedMessage("short frame header".into()));
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() - 4 != len {
        return Err(RiftError::MalformedMessage(format!(
            "frame length mismatch: header {len}, got {}",
            data.len() - 4
        )));
    }
    decode_frame(&data[4..])
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_len,
        }
    }

    /// Feed bytes into the decoder and return all complete messages.
    ///
    /// A length header above the ceiling fails immediately, before the body
    /// has arrived.
    pub fn feed(&mut self, data: &[u8]) -> RiftResult<Vec<Message>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();

        while self.buffer.len() >= 4 {
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;

            if len > self.max_len {
                return Err(RiftError::MalformedMessage(format!(
                    "frame length {len} exceeds limit {}",
                    self.max_len
                )));
            }
            if self.buffer.len() < 4 + len {
                break;
            }

            let msg = decode_frame(&self.buffer[4..4 + len]);
            self.buffer.drain(..4 + len);
            messages.push(msg?);
        }

        Ok(messages)
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Read one framed message from a stream.
///
/// Returns [`RiftError::StreamClosed`] on clean EOF at a frame boundary.
pub async fn read_message<R>(reader: &mut R, max_len: usize) -> RiftResult<Message>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(RiftError::from_stream)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(RiftError::MalformedMessage(format!(
            "frame length {len} exceeds limit {max_len}"
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(RiftError::from_stream)?;
    decode_frame(&body)
}

/// Write one framed message to a stream and flush it.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> RiftResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = frame_encode(msg)?;
    writer
        .write_all(&frame)
        .await
        .map_err(RiftError::from_stream)?;
    writer.flush().await.map_err(RiftError::from_stream)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_messages() -> Vec<Message> {
        vec![
            Login {
                version: PROTOCOL_VERSION.into(),
                hostname: "edge-1".into(),
                os: "linux".into(),
                arch: "x86_64".into(),
                user: "alice".into(),
                privilege_key: "abcd".into(),
                timestamp: 1_700_000_000,
                run_id: "r1".into(),
                metas: HashMap::from([("region".into(), "eu".into())]),
                pool_count: 3,
            }
            .into(),
            LoginResp {
                version: PROTOCOL_VERSION.into(),
                run_id: "r1".into(),
                server_udp_port: 7001,
                error: String::new(),
            }
            .into(),
            NewProxy {
                proxy_name: "ssh".into(),
                proxy_type: "tcp".into(),
                remote_port: 6000,
                custom_domains: vec!["a.example.com".into()],
                ..Default::default()
            }
            .into(),
            NewProxyResp {
                proxy_name: "ssh".into(),
                remote_addr: ":6000".into(),
                error: String::new(),
            }
            .into(),
            CloseProxy {
                proxy_name: "ssh".into(),
            }
            .into(),
            NewWorkConn {
                run_id: "r1".into(),
                privilege_key: "k".into(),
                timestamp: 5,
            }
            .into(),
            ReqWorkConn {}.into(),
            StartWorkConn {
                proxy_name: "ssh".into(),
                src_addr: "1.2.3.4".into(),
                dst_addr: "0.0.0.0".into(),
                src_port: 5555,
                dst_port: 6000,
                error: String::new(),
            }
            .into(),
            NewVisitorConn {
                proxy_name: "secret".into(),
                sign_key: "sig".into(),
                timestamp: 9,
                use_encryption: true,
                use_compression: false,
            }
            .into(),
            NewVisitorConnResp {
                proxy_name: "secret".into(),
                error: String::new(),
            }
            .into(),
            Ping {
                privilege_key: "k".into(),
                timestamp: 10,
            }
            .into(),
            Pong {
                error: String::new(),
            }
            .into(),
            UdpPacket {
                content: vec![0, 1, 2, 255],
                local_addr: Some("127.0.0.1:53".parse().unwrap()),
                remote_addr: Some("[::1]:9999".parse().unwrap()),
            }
            .into(),
            NatHoleVisitor {
                proxy_name: "p2p".into(),
                sign_key: "sig".into(),
                timestamp: 11,
                local_addr: String::new(),
            }
            .into(),
            NatHoleClient {
                proxy_name: "p2p".into(),
                sid: "s1".into(),
                local_addr: "10.0.0.2:4000".into(),
            }
            .into(),
            NatHoleResp {
                sid: "s1".into(),
                visitor_addr: "1.1.1.1:1".into(),
                client_addr: "2.2.2.2:2".into(),
                ..Default::default()
            }
            .into(),
            NatHoleClientDetectOk { sid: "s1".into() }.into(),
            NatHoleSid { sid: "s1".into() }.into(),
        ]
    }

    #[test]
    fn every_variant_survives_framing() {
        let msgs = sample_messages();
        assert_eq!(msgs.len(), 18);

        let mut stream = Vec::new();
        for m in &msgs {
            stream.extend(frame_encode(m).unwrap());
        }
        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&stream).unwrap();
        assert_eq!(decoded, msgs);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn incremental_feed() {
        let frame = frame_encode(&Message::Ping(Ping::default())).unwrap();
        let mut decoder = FrameDecoder::new();
        for i in 0..frame.len() - 1 {
            assert!(decoder.feed(&frame[i..i + 1]).unwrap().is_empty());
        }
        let decoded = decoder.feed(&frame[frame.len() - 1..]).unwrap();
        assert_eq!(decoded, vec![Message::Ping(Ping::default())]);
    }

    #[test]
    fn frame_like_strings_survive_split_feed() {
        let msgs = vec![
            Message::CloseProxy(CloseProxy {
                proxy_name: "\0\0\0\x05ssh\u{1F680}ñ".into(),
            }),
            Message::NewProxyResp(NewProxyResp {
                proxy_name: "代理\0".into(),
                remote_addr: ":6000".into(),
                error: "\0\0\0\x02c\u{a0}".into(),
            }),
        ];
        let mut stream = Vec::new();
        for m in &msgs {
            stream.extend(frame_encode(m).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(3) {
            decoded.extend(decoder.feed(chunk).unwrap());
        }
        assert_eq!(decoded, msgs);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn udp_content_is_a_cbor_byte_string() {
        let frame = frame_encode(&Message::UdpPacket(UdpPacket {
            content: vec![0, 1, 2, 255],
            local_addr: None,
            remote_addr: None,
        }))
        .unwrap();
        // Key "c", then a 4-byte byte string (major type 2), not an array.
        let expected = [0x61, b'c', 0x44, 0, 1, 2, 255];
        assert!(frame.windows(expected.len()).any(|w| w == expected));
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let err = decode_frame(&[b'z', 0xa0]).unwrap_err();
        assert!(matches!(err, RiftError::MalformedMessage(_)));
        let err = decode_frame(&[]).unwrap_err();
        assert!(matches!(err, RiftError::MalformedMessage(_)));
    }

    #[test]
    fn bad_payload_is_malformed() {
        // Tag for Login followed by a CBOR text string, not a map.
        let err = decode_frame(&[b'o', 0x61, b'x']).unwrap_err();
        assert!(matches!(err, RiftError::MalformedMessage(_)));
    }

    #[test]
    fn missing_and_unknown_fields_are_tolerated() {
        #[derive(serde::Serialize)]
        struct Extended {
            proxy_name: String,
            future_field: u32,
        }
        let mut body = vec![b'c'];
        ciborium::into_writer(
            &Extended {
                proxy_name: "web".into(),
                future_field: 7,
            },
            &mut body,
        )
        .unwrap();
        let msg = decode_frame(&body).unwrap();
        assert_eq!(
            msg,
            Message::CloseProxy(CloseProxy {
                proxy_name: "web".into()
            })
        );

        // An empty map decodes to defaults.
        let msg = decode_frame(&[b'2', 0xa0]).unwrap();
        assert_eq!(msg, Message::NewProxyResp(NewProxyResp::default()));
    }

    #[test]
    fn oversize_header_rejected_before_body() {
        let mut decoder = FrameDecoder::with_max_len(16);
        let err = decoder.feed(&1024u32.to_be_bytes()).unwrap_err();
        assert!(matches!(err, RiftError::MalformedMessage(_)));
    }

    #[test]
    fn decode_datagram_checks_length() {
        let mut frame = frame_encode(&Message::NatHoleSid(NatHoleSid { sid: "x".into() })).unwrap();
        assert!(decode_datagram(&frame).is_ok());
        frame.push(0);
        assert!(decode_datagram(&frame).is_err());
    }

    #[tokio::test]
    async fn async_read_write() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::CloseProxy(CloseProxy {
            proxy_name: "ssh".into(),
        });
        write_message(&mut a, &msg).await.unwrap();
        let got = read_message(&mut b, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        assert_eq!(got, msg);

        drop(a);
        let err = read_message(&mut b, DEFAULT_MAX_FRAME_LEN).await.unwrap_err();
        assert!(matches!(err, RiftError::StreamClosed));
    }

    #[tokio::test]
    async fn async_read_enforces_limit() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = frame_encode(&Message::Login(Login {
            hostname: "x".repeat(200),
            ..Default::default()
        }))
        .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, &frame)
            .await
            .unwrap();
        let err = read_message(&mut b, 64).await.unwrap_err();
        assert!(matches!(err, RiftError::MalformedMessage(_)));
    }
}
