//! End-to-end scenarios against a real supervisor bound to an ephemeral
//! port, covering the seed scenarios of spec §8 (S1-S6).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use filterproxy::event_log::EventLogger;
use filterproxy::rules::FilterEngine;
use filterproxy::shutdown::GracefulShutdown;
use filterproxy::supervisor::Supervisor;
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::{TcpListener, TcpStream};

const POOL_SIZE: usize = 10;

/// Boots a `Supervisor` on an ephemeral `127.0.0.1` port and returns its
/// address alongside the blocked-domains and transaction-log paths so the
/// test can mutate rules or inspect log output.
async fn spawn_proxy(
    blocked_domains: &str,
    pool_size: usize,
) -> (SocketAddr, std::path::PathBuf, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let rules_path = dir.path().join("blocked_domains.txt");
    std::fs::write(&rules_path, blocked_domains).unwrap();
    let log_path = dir.path().join("proxy.log");

    let (filter, _err) = FilterEngine::load(&rules_path);
    let logger = EventLogger::new(&log_path);
    let shutdown = GracefulShutdown::new(Duration::from_secs(5));
    let supervisor = Arc::new(Supervisor::new(Arc::new(filter), logger, shutdown, pool_size));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    smol::spawn(async move {
        let _ = supervisor.serve(listener).await;
    })
    .detach();

    (addr, log_path, dir)
}

/// Spawns a TCP listener that answers every connection with a fixed HTTP
/// response, for use as a forwarder's upstream.
async fn spawn_http_upstream(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    smol::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let mut buf = [0u8; 4096];
            let _ = read_until_header_end(&mut stream, &mut buf).await;
            let _ = stream.write_all(response).await;
            let _ = stream.flush().await;
        }
    })
    .detach();
    addr
}

/// Returns the port of a listener that was bound then immediately
/// dropped, so connecting to it reliably yields `ECONNREFUSED` (S6).
async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn read_until_header_end(stream: &mut TcpStream, buf: &mut [u8]) -> usize {
    let mut total = 0;
    loop {
        let n = stream.read(&mut buf[total..]).await.unwrap_or(0);
        if n == 0 {
            return total;
        }
        total += n;
        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
            return total;
        }
    }
}

async fn read_response(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let read = async { stream.read(&mut buf).await.unwrap_or(0) };
        let timeout = async {
            smol::Timer::after(Duration::from_millis(500)).await;
            0
        };
        let n = smol::future::or(read, timeout).await;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

async fn read_log(path: &std::path::Path) -> String {
    smol::Timer::after(Duration::from_millis(100)).await;
    std::fs::read_to_string(path).unwrap_or_default()
}

#[test]
fn s1_basic_get_is_forwarded_and_logged() {
    smol::block_on(async {
        let upstream = spawn_http_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nfoo").await;
        let (proxy_addr, log_path, _dir) = spawn_proxy("", POOL_SIZE).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request = format!(
            "GET http://{upstream}/hello HTTP/1.1\r\nHost: {upstream}\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let response = read_response(&mut client).await;
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.ends_with("foo"));

        let log = read_log(&log_path).await;
        assert!(log.contains("ALLOWED"));
        assert!(log.contains(&format!("-> {}", upstream)));
        // The logged size is the body alone (3 bytes), not the full
        // status-line-plus-headers-plus-body stream.
        assert!(log.contains("| 200 | 3 bytes"));
    });
}

#[test]
fn s2_exact_host_block_returns_403_and_logs_blocked() {
    smol::block_on(async {
        let (proxy_addr, log_path, _dir) =
            spawn_proxy("blocked.example.com\n", POOL_SIZE).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request =
            "GET http://blocked.example.com/x HTTP/1.1\r\nHost: blocked.example.com\r\n\r\n";
        client.write_all(request.as_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let response = read_response(&mut client).await;
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 403 Forbidden"));
        assert!(text.contains("Access Denied"));

        let log = read_log(&log_path).await;
        assert!(log.contains("BLOCKED"));
        assert!(log.contains("-> blocked.example.com:80"));
    });
}

#[test]
fn s3_suffix_wildcard_blocks_subdomain_and_bare_host_but_allows_others() {
    smol::block_on(async {
        let upstream = spawn_http_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let (proxy_addr, _log_path, _dir) =
            spawn_proxy("*.example.net\n", POOL_SIZE).await;

        for host in ["sub.example.net", "example.net"] {
            let mut client = TcpStream::connect(proxy_addr).await.unwrap();
            let request = format!("GET http://{host}/ HTTP/1.1\r\nHost: {host}\r\n\r\n");
            client.write_all(request.as_bytes()).await.unwrap();
            client.flush().await.unwrap();
            let response = read_response(&mut client).await;
            assert!(
                String::from_utf8_lossy(&response).starts_with("HTTP/1.1 403"),
                "expected {host} to be blocked"
            );
        }

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request = format!(
            "GET http://{upstream}/ HTTP/1.1\r\nHost: {upstream}\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();
        client.flush().await.unwrap();
        let response = read_response(&mut client).await;
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200"));
    });
}

#[test]
fn s4_connect_tunnel_relays_a_round_trip_echo() {
    smol::block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = listener.local_addr().unwrap();
        smol::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let reader = stream.clone();
                let writer = stream;
                let _ = smol::io::copy(reader, writer).await;
            }
        })
        .detach();

        let (proxy_addr, _log_path, _dir) = spawn_proxy("", POOL_SIZE).await;
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let connect_req = format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n");
        client.write_all(connect_req.as_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let mut ack = [0u8; 64];
        let n = client.read(&mut ack).await.unwrap();
        assert!(String::from_utf8_lossy(&ack[..n]).starts_with("HTTP/1.1 200"));

        let payload: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();
        client.flush().await.unwrap();

        let mut echoed = Vec::with_capacity(payload.len());
        let mut buf = [0u8; 8192];
        while echoed.len() < payload.len() {
            let n = client.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            echoed.extend_from_slice(&buf[..n]);
        }
        assert_eq!(echoed, payload);
    });
}

#[test]
fn s5_concurrency_is_bounded_by_pool_size() {
    smol::block_on(async {
        const CLIENTS: usize = 50;
        const POOL: usize = 10;
        const UPSTREAM_DELAY: Duration = Duration::from_millis(50);

        let current = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        {
            let current = current.clone();
            let peak = peak.clone();
            smol::spawn(async move {
                loop {
                    let Ok((mut stream, _)) = listener.accept().await else {
                        break;
                    };
                    let current = current.clone();
                    let peak = peak.clone();
                    smol::spawn(async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        let mut buf = [0u8; 4096];
                        let _ = read_until_header_end(&mut stream, &mut buf).await;
                        smol::Timer::after(UPSTREAM_DELAY).await;
                        let _ = stream
                            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                            .await;
                        let _ = stream.flush().await;
                        current.fetch_sub(1, Ordering::SeqCst);
                    })
                    .detach();
                }
            })
            .detach();
        }

        let (proxy_addr, _log_path, _dir) = spawn_proxy("", POOL).await;

        let start = Instant::now();
        let mut tasks = Vec::with_capacity(CLIENTS);
        for _ in 0..CLIENTS {
            tasks.push(smol::spawn(async move {
                let mut client = TcpStream::connect(proxy_addr).await.unwrap();
                let request = format!(
                    "GET http://{upstream_addr}/ HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n"
                );
                client.write_all(request.as_bytes()).await.unwrap();
                client.flush().await.unwrap();
                let response = read_response(&mut client).await;
                assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200"));
            }));
        }
        for task in tasks {
            task.await;
        }
        let elapsed = start.elapsed();

        // 50 requests over a 10-slot gate against a 50ms-per-request
        // upstream must take at least 5 batches' worth of wall time (spec
        // §8 property 2: in-flight handler contexts never exceed P).
        assert!(
            elapsed >= Duration::from_millis(200),
            "completed too quickly for a bounded pool: {elapsed:?}"
        );
        assert!(
            peak.load(Ordering::SeqCst) <= POOL as u64,
            "peak concurrent upstream connections exceeded the pool size"
        );
    });
}

#[test]
fn s6_upstream_connect_refused_returns_502_and_logs_error() {
    smol::block_on(async {
        let dead_port = unused_port().await;
        let dead_addr = format!("127.0.0.1:{dead_port}");
        let (proxy_addr, log_path, _dir) = spawn_proxy("", POOL_SIZE).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request =
            format!("GET http://{dead_addr}/ HTTP/1.1\r\nHost: {dead_addr}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let response = read_response(&mut client).await;
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway"));

        let log = read_log(&log_path).await;
        assert!(log.contains("ERROR"));
        assert!(log.contains("UPSTREAM_CONNECT"));
    });
}
