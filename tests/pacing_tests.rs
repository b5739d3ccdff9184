// Rate-conformance test: a paced sender over loopback must land within 10%
// of its configured bandwidth.

mod common;

use std::time::Duration;

use netgauge::{Iperf3Client, Iperf3Config};
use tokio::net::TcpListener;

#[tokio::test]
async fn paced_sender_hits_configured_rate() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(common::run_happy_server(listener, 1, false, false));

    // 16 Mbit/s for 2 s over loopback: the link is effectively lossless and
    // far faster than the target, so pacing dominates the outcome.
    let bandwidth_mbps = 16u64;
    let duration = Duration::from_secs(2);
    let config = Iperf3Config::new("127.0.0.1".to_string())
        .with_port(port)
        .with_duration(duration)
        .with_bandwidth_mbps(bandwidth_mbps);

    let result = Iperf3Client::new(config).run().await.unwrap();
    let outcome = server.await.unwrap();

    let sent = result.sent_bytes.unwrap() as f64;
    let expected = (bandwidth_mbps * 1_000_000 / 8) as f64 * duration.as_secs_f64();
    let error = (sent - expected).abs() / expected;
    assert!(
        error <= 0.10,
        "sent {sent} bytes, expected ~{expected} (error {:.1}%)",
        error * 100.0
    );

    assert_eq!(outcome.data_bytes, result.sent_bytes.unwrap());
    let measured = result.bandwidth_mbps;
    assert!(
        (measured - bandwidth_mbps as f64).abs() / bandwidth_mbps as f64 <= 0.10,
        "measured {measured:.2} Mbit/s against a {bandwidth_mbps} Mbit/s target"
    );
}

#[tokio::test]
async fn pacing_splits_rate_across_streams() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(common::run_happy_server(listener, 4, false, false));

    // The total target is shared: four streams must not quadruple it.
    let bandwidth_mbps = 16u64;
    let duration = Duration::from_secs(2);
    let config = Iperf3Config::new("127.0.0.1".to_string())
        .with_port(port)
        .with_duration(duration)
        .with_parallel(4)
        .with_bandwidth_mbps(bandwidth_mbps);

    let result = Iperf3Client::new(config).run().await.unwrap();
    let _outcome = server.await.unwrap();

    let sent = result.sent_bytes.unwrap() as f64;
    let expected = (bandwidth_mbps * 1_000_000 / 8) as f64 * duration.as_secs_f64();
    let error = (sent - expected).abs() / expected;
    assert!(
        error <= 0.10,
        "sent {sent} bytes across 4 streams, expected ~{expected} total (error {:.1}%)",
        error * 100.0
    );
}
