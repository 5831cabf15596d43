//! End-to-end test utilities for the Undertow tunnel system
//!
//! Runs a real server on loopback with a mocked route registrar, plus
//! local services for the client to forward to.

pub mod harness;
pub mod mock_routes;
pub mod mock_tcp_service;
pub mod mock_udp_service;
pub mod test_client;

pub use harness::{free_tcp_port, free_udp_port, init_test, TestServer, TestServerBuilder};
pub use mock_routes::MockRouteRegistrar;
pub use mock_tcp_service::{MockTcpService, RecordedTcpConnection, TcpServiceMode};
pub use mock_udp_service::MockUdpService;
pub use test_client::{connect_with_login, TestClient, TestControlClient};
