use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status carried by a successful [`ProxyResponse`]
pub const STATUS_SUCCESS: &str = "success";

/// Status carried by a rejected [`ProxyResponse`]
pub const STATUS_FAILED: &str = "failed";

/// Type byte at the start of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Login = 0x01,
    Heartbeat = 0x02,
    ProxyRequest = 0x03,
    ProxyResponse = 0x04,
    ProxyCancel = 0x05,
    Exchange = 0x06,
    UdpDatagram = 0x07,
}

impl PacketType {
    /// Map a raw type byte back to a known packet type
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Login),
            0x02 => Some(Self::Heartbeat),
            0x03 => Some(Self::ProxyRequest),
            0x04 => Some(Self::ProxyResponse),
            0x05 => Some(Self::ProxyCancel),
            0x06 => Some(Self::Exchange),
            0x07 => Some(Self::UdpDatagram),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Heartbeat => "heartbeat",
            Self::ProxyRequest => "proxy_request",
            Self::ProxyResponse => "proxy_response",
            Self::ProxyCancel => "proxy_cancel",
            Self::Exchange => "exchange",
            Self::UdpDatagram => "udp_datagram",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport protocol of an exposed port
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    /// Stream connections accepted on a TCP listener
    #[default]
    Tcp,
    /// Datagrams received on a UDP socket
    Udp,
}

impl ProxyType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(format!("Invalid proxy type: {}. Use 'tcp' or 'udp'", other)),
        }
    }
}

/// First frame on every physical connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Login {
    /// Hex digest of `secret || timestamp`
    pub token: String,
    /// Client version (mismatch is only logged)
    pub version: String,
    /// Unix timestamp (seconds) the token was derived from
    pub timestamp: i64,
}

/// Liveness signal sent by the server on every control channel
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {}

/// Ask the server to expose a port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyRequest {
    pub remote_port: u16,
    #[serde(default)]
    pub proxy_name: String,
    /// Requested subdomain (empty = auto-generate when domain tunneling is on)
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub proxy_type: ProxyType,
}

/// Answer to a [`ProxyRequest`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyResponse {
    /// Full domain bound to the proxy (empty without domain tunneling)
    #[serde(default)]
    pub domain: String,
    pub status: String,
}

impl ProxyResponse {
    pub fn success(domain: Option<String>) -> Self {
        Self {
            domain: domain.unwrap_or_default(),
            status: STATUS_SUCCESS.to_string(),
        }
    }

    pub fn failed() -> Self {
        Self {
            domain: String::new(),
            status: STATUS_FAILED.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// Tear down the proxy bound to `remote_port`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyCancel {
    #[serde(default)]
    pub proxy_name: String,
    pub remote_port: u16,
}

/// Rendezvous handshake.
///
/// Sent by the server on the control channel when a public connection is
/// waiting, and echoed verbatim by the client as the first frame of the
/// data connection that services it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Exchange {
    pub conn_id: String,
    pub proxy_type: ProxyType,
}

/// One UDP datagram carried over a tunnel stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UdpDatagram {
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Public peer the datagram came from (or should go to)
    #[serde(default)]
    pub addr: Option<SocketAddr>,
}

/// Every message that can appear in a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Login(Login),
    Heartbeat(Heartbeat),
    ProxyRequest(ProxyRequest),
    ProxyResponse(ProxyResponse),
    ProxyCancel(ProxyCancel),
    Exchange(Exchange),
    UdpDatagram(UdpDatagram),
}

impl ControlMessage {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Login(_) => PacketType::Login,
            Self::Heartbeat(_) => PacketType::Heartbeat,
            Self::ProxyRequest(_) => PacketType::ProxyRequest,
            Self::ProxyResponse(_) => PacketType::ProxyResponse,
            Self::ProxyCancel(_) => PacketType::ProxyCancel,
            Self::Exchange(_) => PacketType::Exchange,
            Self::UdpDatagram(_) => PacketType::UdpDatagram,
        }
    }
}

macro_rules! impl_from_message {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for ControlMessage {
                fn from(msg: $variant) -> Self {
                    Self::$variant(msg)
                }
            }
        )*
    };
}

impl_from_message!(
    Login,
    Heartbeat,
    ProxyRequest,
    ProxyResponse,
    ProxyCancel,
    Exchange,
    UdpDatagram,
);

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
