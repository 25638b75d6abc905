//! rift-core: Shared protocol library for the rift tunneling gateway.
//!
//! Provides the control-plane message catalogue, the framed CBOR codec,
//! HMAC credentials, hole-punch session state, UDP tunneling helpers and
//! abstract transport traits.

pub mod auth;
pub mod codec;
pub mod error;
pub mod messages;
pub mod nathole;
pub mod transport;
pub mod udp;

// Re-export commonly used items at crate root.
pub use auth::{auth_key, generate_id, unix_now, verify_auth_key};
pub use codec::{decode_frame, frame_encode, read_message, write_message, FrameDecoder, DEFAULT_MAX_FRAME_LEN};
pub use error::{RiftError, RiftResult};
pub use messages::{Message, MsgType, ProxyType, PROTOCOL_VERSION};
pub use nathole::{HolePunchSession, PunchOutcome, PunchStatus};
pub use transport::{BoxedStream, ByteStream, DatagramSocket};
