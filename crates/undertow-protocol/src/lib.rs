//! Wire protocol shared by the undertow server and client.
//!
//! Every control message travels in its own frame:
//!
//! ```text
//! +--------+------------------+---------------------+
//! | type   | length           | JSON payload        |
//! | 1 byte | u16, big-endian  | `length` bytes      |
//! +--------+------------------+---------------------+
//! ```

pub mod auth;
mod codec;
mod messages;

pub use auth::{Authenticator, NopAuthenticator, TokenAuthenticator};
pub use codec::{
    read_frame, read_message, write_message, CodecError, Frame, FrameCodec, MessageCodec,
    HEADER_LEN, MAX_PAYLOAD_SIZE,
};
pub use messages::{
    ControlMessage, Exchange, Heartbeat, Login, PacketType, ProxyCancel, ProxyRequest,
    ProxyResponse, ProxyType, UdpDatagram, STATUS_FAILED, STATUS_SUCCESS,
};

/// Version string carried in every login
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");
