// Simulated iperf3 server used by the integration tests.
//
// Implements the server side of the control-channel walk the client
// expects: cookie, PARAM_EXCHANGE, CREATE_STREAMS, TEST_START/TEST_RUNNING,
// the data phase, and the terminal results exchange.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netgauge::protocol::{self, state, COOKIE_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time;

pub struct MockServerOutcome {
    pub cookie: [u8; COOKIE_SIZE],
    pub params: serde_json::Value,
    pub stream_cookies: Vec<[u8; COOKIE_SIZE]>,
    pub data_bytes: u64,
    pub saw_test_end: bool,
    pub saw_iperf_done: bool,
}

/// Drives one client session through the complete happy path.
///
/// `reverse` makes the server write on the data streams instead of
/// draining them; `udp` accepts datagram streams on the listener's port.
pub async fn run_happy_server(
    listener: TcpListener,
    parallel: usize,
    reverse: bool,
    udp: bool,
) -> MockServerOutcome {
    let port = listener.local_addr().unwrap().port();
    let (mut control, _) = listener.accept().await.unwrap();

    let mut cookie = [0u8; COOKIE_SIZE];
    control.read_exact(&mut cookie).await.unwrap();

    protocol::write_state(&mut control, state::PARAM_EXCHANGE)
        .await
        .unwrap();
    let params: serde_json::Value = protocol::read_framed_json(&mut control).await.unwrap();

    let udp_socket = if udp {
        Some(UdpSocket::bind(("127.0.0.1", port)).await.unwrap())
    } else {
        None
    };

    protocol::write_state(&mut control, state::CREATE_STREAMS)
        .await
        .unwrap();

    let counter = Arc::new(AtomicU64::new(0));
    let mut stream_cookies = Vec::new();
    let mut tcp_tasks = Vec::new();
    let mut udp_task = None;

    if let Some(socket) = udp_socket {
        // Each stream announces itself with a cookie datagram.
        let mut buf = [0u8; 65536];
        for _ in 0..parallel {
            let (n, _) = socket.recv_from(&mut buf).await.unwrap();
            if n >= COOKIE_SIZE {
                let mut c = [0u8; COOKIE_SIZE];
                c.copy_from_slice(&buf[..COOKIE_SIZE]);
                stream_cookies.push(c);
            }
        }
        let counter = Arc::clone(&counter);
        udp_task = Some(tokio::spawn(async move {
            let mut buf = [0u8; 65536];
            while let Ok((n, _)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
        }));
    } else {
        for _ in 0..parallel {
            let (mut data, _) = listener.accept().await.unwrap();
            let mut c = [0u8; COOKIE_SIZE];
            data.read_exact(&mut c).await.unwrap();
            stream_cookies.push(c);

            let counter = Arc::clone(&counter);
            if reverse {
                tcp_tasks.push(tokio::spawn(feed_stream(data, counter)));
            } else {
                tcp_tasks.push(tokio::spawn(drain_stream(data, counter)));
            }
        }
    }

    protocol::write_state(&mut control, state::TEST_START)
        .await
        .unwrap();
    protocol::write_state(&mut control, state::TEST_RUNNING)
        .await
        .unwrap();

    let saw_test_end = protocol::read_state(&mut control).await.unwrap() == state::TEST_END;

    protocol::write_state(&mut control, state::EXCHANGE_RESULTS)
        .await
        .unwrap();
    let _client_results: serde_json::Value = protocol::read_framed_json(&mut control).await.unwrap();
    protocol::write_framed_json(&mut control, &serde_json::json!({}))
        .await
        .unwrap();
    protocol::write_state(&mut control, state::DISPLAY_RESULTS)
        .await
        .unwrap();

    let saw_iperf_done = protocol::read_state(&mut control).await.unwrap() == state::IPERF_DONE;

    // The client has dropped its streams by now; give the workers a moment
    // to observe EOF, then collect.
    for task in tcp_tasks {
        let _ = time::timeout(Duration::from_secs(2), task).await;
    }
    if let Some(task) = udp_task {
        task.abort();
        let _ = task.await;
    }

    MockServerOutcome {
        cookie,
        params,
        stream_cookies,
        data_bytes: counter.load(Ordering::Relaxed),
        saw_test_end,
        saw_iperf_done,
    }
}

async fn drain_stream(mut stream: TcpStream, counter: Arc<AtomicU64>) {
    let mut buf = [0u8; 65536];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
        }
    }
}

async fn feed_stream(mut stream: TcpStream, counter: Arc<AtomicU64>) {
    let buf = [0x5au8; 65536];
    loop {
        match stream.write(&buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
        }
    }
}
