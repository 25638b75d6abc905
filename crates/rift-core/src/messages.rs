// rift control-plane message catalogue.
//
// Each variant has a fixed one-byte tag and a field-tagged CBOR payload. Field
// keys are short and stable; every payload struct is `#[serde(default)]` so
// absent keys decode to zero values and unknown keys are skipped.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Returns `true` if a peer announcing `version` can talk to this build.
///
/// Versions are compatible when their major components match (and, while the
/// major is `0`, their minor components match too).
pub fn is_version_compatible(version: &str) -> bool {
    fn parts(v: &str) -> Option<(u32, u32)> {
        let mut it = v.trim().split('.');
        let major = it.next()?.parse().ok()?;
        let minor = it.next().unwrap_or("0").parse().ok()?;
        Some((major, minor))
    }

    match (parts(version), parts(PROTOCOL_VERSION)) {
        (Some((0, a)), Some((0, b))) => a == b,
        (Some((a, _)), Some((b, _))) => a == b,
        _ => false,
    }
}

/// One-byte message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Login = b'o',
    LoginResp = b'1',
    NewProxy = b'p',
    NewProxyResp = b'2',
    CloseProxy = b'c',
    NewWorkConn = b'w',
    ReqWorkConn = b'r',
    StartWorkConn = b's',
    NewVisitorConn = b'v',
    NewVisitorConnResp = b'3',
    Ping = b'h',
    Pong = b'4',
    UdpPacket = b'u',
    NatHoleVisitor = b'i',
    NatHoleClient = b'n',
    NatHoleResp = b'm',
    NatHoleClientDetectOk = b'd',
    NatHoleSid = b'5',
}

impl From<MsgType> for u8 {
    fn from(m: MsgType) -> u8 {
        m as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            b'o' => Ok(Self::Login),
            b'1' => Ok(Self::LoginResp),
            b'p' => Ok(Self::NewProxy),
            b'2' => Ok(Self::NewProxyResp),
            b'c' => Ok(Self::CloseProxy),
            b'w' => Ok(Self::NewWorkConn),
            b'r' => Ok(Self::ReqWorkConn),
            b's' => Ok(Self::StartWorkConn),
            b'v' => Ok(Self::NewVisitorConn),
            b'3' => Ok(Self::NewVisitorConnResp),
            b'h' => Ok(Self::Ping),
            b'4' => Ok(Self::Pong),
            b'u' => Ok(Self::UdpPacket),
            b'i' => Ok(Self::NatHoleVisitor),
            b'n' => Ok(Self::NatHoleClient),
            b'm' => Ok(Self::NatHoleResp),
            b'd' => Ok(Self::NatHoleClientDetectOk),
            b'5' => Ok(Self::NatHoleSid),
            _ => Err(format!("unknown message type: 0x{v:02x}")),
        }
    }
}

/// Kinds of proxy a client may register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyType {
    Tcp,
    Udp,
    Http,
    Https,
    Stcp,
    Xtcp,
    TcpMux,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Http => "http",
            Self::Https => "https",
            Self::Stcp => "stcp",
            Self::Xtcp => "xtcp",
            Self::TcpMux => "tcpmux",
        }
    }

    /// Proxies that carry a shared secret and accept visitor connections
    /// instead of exposing a public endpoint.
    pub fn is_visitor_reachable(&self) -> bool {
        matches!(self, Self::Stcp | Self::Xtcp)
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "stcp" => Ok(Self::Stcp),
            "xtcp" => Ok(Self::Xtcp),
            "tcpmux" => Ok(Self::TcpMux),
            other => Err(other.to_string()),
        }
    }
}

// ── Message ──────────────────────────────────────────────────────────

/// A control-plane message. The variant determines the wire tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    NewWorkConn(NewWorkConn),
    ReqWorkConn(ReqWorkConn),
    StartWorkConn(StartWorkConn),
    NewVisitorConn(NewVisitorConn),
    NewVisitorConnResp(NewVisitorConnResp),
    Ping(Ping),
    Pong(Pong),
    UdpPacket(UdpPacket),
    NatHoleVisitor(NatHoleVisitor),
    NatHoleClient(NatHoleClient),
    NatHoleResp(NatHoleResp),
    NatHoleClientDetectOk(NatHoleClientDetectOk),
    NatHoleSid(NatHoleSid),
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Login(_) => MsgType::Login,
            Self::LoginResp(_) => MsgType::LoginResp,
            Self::NewProxy(_) => MsgType::NewProxy,
            Self::NewProxyResp(_) => MsgType::NewProxyResp,
            Self::CloseProxy(_) => MsgType::CloseProxy,
            Self::NewWorkConn(_) => MsgType::NewWorkConn,
            Self::ReqWorkConn(_) => MsgType::ReqWorkConn,
            Self::StartWorkConn(_) => MsgType::StartWorkConn,
            Self::NewVisitorConn(_) => MsgType::NewVisitorConn,
            Self::NewVisitorConnResp(_) => MsgType::NewVisitorConnResp,
            Self::Ping(_) => MsgType::Ping,
            Self::Pong(_) => MsgType::Pong,
            Self::UdpPacket(_) => MsgType::UdpPacket,
            Self::NatHoleVisitor(_) => MsgType::NatHoleVisitor,
            Self::NatHoleClient(_) => MsgType::NatHoleClient,
            Self::NatHoleResp(_) => MsgType::NatHoleResp,
            Self::NatHoleClientDetectOk(_) => MsgType::NatHoleClientDetectOk,
            Self::NatHoleSid(_) => MsgType::NatHoleSid,
        }
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(p: $variant) -> Self {
                    Message::$variant(p)
                }
            }
        )*
    };
}

impl_from_payload!(
    Login,
    LoginResp,
    NewProxy,
    NewProxyResp,
    CloseProxy,
    NewWorkConn,
    ReqWorkConn,
    StartWorkConn,
    NewVisitorConn,
    NewVisitorConnResp,
    Ping,
    Pong,
    UdpPacket,
    NatHoleVisitor,
    NatHoleClient,
    NatHoleResp,
    NatHoleClientDetectOk,
    NatHoleSid,
);

// ── Payloads ─────────────────────────────────────────────────────────

/// Sent by a client on a fresh control connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Login {
    #[serde(rename = "V")]
    pub version: String,
    #[serde(rename = "Hn")]
    pub hostname: String,
    #[serde(rename = "O")]
    pub os: String,
    #[serde(rename = "A")]
    pub arch: String,
    #[serde(rename = "U")]
    pub user: String,
    #[serde(rename = "Pk")]
    pub privilege_key: String,
    #[serde(rename = "Ts")]
    pub timestamp: i64,
    /// Previous run id, when the client is reconnecting.
    #[serde(rename = "Rid")]
    pub run_id: String,
    #[serde(rename = "M")]
    pub metas: HashMap<String, String>,
    #[serde(rename = "pc")]
    pub pool_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginResp {
    #[serde(rename = "V")]
    pub version: String,
    #[serde(rename = "Rid")]
    pub run_id: String,
    #[serde(rename = "Sup")]
    pub server_udp_port: u16,
    #[serde(rename = "E")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewProxy {
    #[serde(rename = "Pn")]
    pub proxy_name: String,
    #[serde(rename = "Pt")]
    pub proxy_type: String,
    #[serde(rename = "Ue")]
    pub use_encryption: bool,
    #[serde(rename = "Uc")]
    pub use_compression: bool,
    pub group: String,
    pub group_key: String,
    pub metas: HashMap<String, String>,

    // tcp and udp
    pub remote_port: u16,

    // http and https
    pub custom_domains: Vec<String>,
    pub subdomain: String,
    pub locations: Vec<String>,
    pub http_user: String,
    pub http_pwd: String,
    pub host_header_rewrite: String,
    pub headers: HashMap<String, String>,

    // stcp and xtcp
    pub sk: String,

    // tcpmux
    pub multiplexer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewProxyResp {
    pub proxy_name: String,
    pub remote_addr: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloseProxy {
    pub proxy_name: String,
}

/// First message on a client-dialed work connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewWorkConn {
    pub run_id: String,
    pub privilege_key: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReqWorkConn {}

/// Sent by the server on a work connection once it is bound to a user connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartWorkConn {
    pub proxy_name: String,
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewVisitorConn {
    pub proxy_name: String,
    pub sign_key: String,
    pub timestamp: i64,
    pub use_encryption: bool,
    pub use_compression: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewVisitorConnResp {
    pub proxy_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ping {
    pub privilege_key: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pong {
    pub error: String,
}

/// A UDP datagram tunneled over a reliable stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpPacket {
    #[serde(rename = "c", with = "serde_bytes")]
    pub content: Vec<u8>,
    #[serde(rename = "l")]
    pub local_addr: Option<SocketAddr>,
    #[serde(rename = "r")]
    pub remote_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleVisitor {
    pub proxy_name: String,
    pub sign_key: String,
    pub timestamp: i64,
    /// Self-reported candidate address, if the visitor knows one.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub local_addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleClient {
    pub proxy_name: String,
    pub sid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub local_addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleResp {
    pub sid: String,
    pub visitor_addr: String,
    pub client_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub visitor_local_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_local_addr: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleClientDetectOk {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleSid {
    pub sid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_unique_and_reversible() {
        let all = [
            MsgType::Login,
            MsgType::LoginResp,
            MsgType::NewProxy,
            MsgType::NewProxyResp,
            MsgType::CloseProxy,
            MsgType::NewWorkConn,
            MsgType::ReqWorkConn,
            MsgType::StartWorkConn,
            MsgType::NewVisitorConn,
            MsgType::NewVisitorConnResp,
            MsgType::Ping,
            MsgType::Pong,
            MsgType::UdpPacket,
            MsgType::NatHoleVisitor,
            MsgType::NatHoleClient,
            MsgType::NatHoleResp,
            MsgType::NatHoleClientDetectOk,
            MsgType::NatHoleSid,
        ];
        let mut seen = std::collections::HashSet::new();
        for t in all {
            let byte: u8 = t.into();
            assert!(seen.insert(byte), "duplicate tag {byte}");
            assert_eq!(MsgType::try_from(byte).unwrap(), t);
        }
        assert!(MsgType::try_from(b'z').is_err());
    }

    #[test]
    fn proxy_type_parse() {
        assert_eq!("stcp".parse::<ProxyType>().unwrap(), ProxyType::Stcp);
        assert!("sudp".parse::<ProxyType>().is_err());
        assert!(ProxyType::Xtcp.is_visitor_reachable());
        assert!(!ProxyType::Tcp.is_visitor_reachable());
    }

    #[test]
    fn version_compatibility() {
        assert!(is_version_compatible(PROTOCOL_VERSION));
        assert!(is_version_compatible("0.1.7"));
        assert!(!is_version_compatible("0.2.0"));
        assert!(!is_version_compatible("1.1.0"));
        assert!(!is_version_compatible("garbage"));
    }
}
