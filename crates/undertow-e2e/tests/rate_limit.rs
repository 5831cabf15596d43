//! Speed limits on forwarded connections

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use undertow_e2e::{free_tcp_port, init_test, MockTcpService, TestClient, TestServer};

const LIMIT: u64 = 64 * 1024;

#[tokio::test]
async fn test_speed_limit_bounds_throughput() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockTcpService::start().await;
    let remote_port = free_tcp_port().await;

    let mut forward = server.tcp_forward(mock.port(), remote_port);
    forward.speed_limit = LIMIT;
    let _client = TestClient::start(&server, vec![forward]);
    server.wait_for_proxy(remote_port).await;

    let stream = TcpStream::connect(server.public_addr(remote_port))
        .await
        .unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let total = 3 * LIMIT as usize;
    let started = Instant::now();
    let write = tokio::spawn(async move {
        let payload = vec![0x5a; total];
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut received = 0usize;
    let mut buf = vec![0u8; 16 * 1024];
    while received < total {
        let n = tokio::time::timeout(Duration::from_secs(15), reader.read(&mut buf))
            .await
            .expect("Throttled relay stalled")
            .unwrap();
        assert!(n > 0, "Connection closed early");
        received += n;
    }
    let elapsed = started.elapsed();
    let _writer = write.await.unwrap();

    // bytes <= rate * T + burst, burst = one second worth
    let floor = Duration::from_secs_f64((total as u64 - LIMIT) as f64 / LIMIT as f64);
    assert!(
        elapsed + Duration::from_millis(200) >= floor,
        "{} bytes in {:?}, expected at least {:?}",
        total,
        elapsed,
        floor
    );
    assert!(elapsed < Duration::from_secs(10));
}

#[tokio::test]
async fn test_unlimited_forward_is_fast() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockTcpService::start().await;
    let remote_port = free_tcp_port().await;

    let _client = TestClient::start(&server, vec![server.tcp_forward(mock.port(), remote_port)]);
    server.wait_for_proxy(remote_port).await;

    let mut stream = TcpStream::connect(server.public_addr(remote_port))
        .await
        .unwrap();
    let payload = vec![0xa5; 3 * LIMIT as usize];

    let started = Instant::now();
    let (mut reader, mut writer) = stream.split();
    let (written, echoed) = tokio::join!(writer.write_all(&payload), async {
        let mut echoed = vec![0u8; payload.len()];
        reader.read_exact(&mut echoed).await.map(|_| echoed)
    });
    written.unwrap();
    assert_eq!(echoed.unwrap(), payload);
    assert!(started.elapsed() < Duration::from_secs(1));
}
