mod error;
mod limit;
mod pool;
mod relay;
mod transport;
mod udp;

pub use error::{SpeedLimitError, TransportError};
pub use limit::{parse_speed_limit, RateLimiter};
pub use pool::{BufferPool, PooledBuf, BUFFER_SIZE};
pub use relay::{relay, relay_metered, Traffic, TrafficStats};
pub use transport::{AsyncStream, BoxedStream, Dialer, MuxDialer, PlainDialer};
pub use udp::{relay_udp_client_side, relay_udp_server_side, MAX_DATAGRAM_SIZE};
