//! Connection Supervisor (spec §4.5): accept loop, concurrency gate,
//! per-connection dispatch, and the `ACCEPTED → ... → CLOSED` state
//! machine.
//!
//! Ground: `httproxy::start::handle_local_target` / `accept_or_shutdown`
//! (the `future::or(accept, shutdown)` accept loop and per-connection
//! `smol::spawn` + `InflightGuard`). The concurrency gate extends
//! `shutdown::GracefulShutdown`'s own atomic-counter-plus-condvar idiom
//! (`InflightGuard`) into a bounded permit count of `P` (spec §5, §8
//! property 2), since the teacher spawns each accepted connection
//! unconditionally.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mea::condvar::Condvar;
use mea::mutex::Mutex;
use smol::future;
use smol::io::AsyncWriteExt;
use smol::net::{TcpListener, TcpStream};
use socket2::{Domain, Socket, Type};

use crate::error::ProxyError;
use crate::event_log::{EventLogger, LogRecord};
use crate::forward;
use crate::request::{self, ParsedRequest};
use crate::rules::FilterEngine;
use crate::shutdown::GracefulShutdown;
use crate::tunnel;
use crate::upstream;

const INITIAL_REQUEST_DEADLINE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// A fixed-size counting gate bounding the number of handler contexts
/// running at once (spec §5's "concurrency permit"). The available count
/// lives entirely inside `gate`, so a release and a waiter's check-then-wait
/// transition can never interleave without one of them holding the lock,
/// which is what `shutdown::GracefulShutdown`'s plain-atomic `InflightGuard`
/// cannot guarantee and this gate needs to (the gate's own accept loop would
/// wedge permanently on a lost wakeup; the shutdown drain loop re-checks
/// against other signals and tolerates it).
struct ConcurrencyGate {
    available: Mutex<u64>,
    cv: Condvar,
}

struct GatePermit {
    inner: Arc<ConcurrencyGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        // `Drop` is synchronous and `gate.lock()` is not, so the release
        // that must happen under the lock is handed to a spawned task
        // instead of running inline.
        let inner = self.inner.clone();
        smol::spawn(async move {
            let mut guard = inner.available.lock().await;
            *guard += 1;
            inner.cv.notify_one();
        })
        .detach();
    }
}

impl ConcurrencyGate {
    fn new(permits: u64) -> Arc<Self> {
        Arc::new(ConcurrencyGate {
            available: Mutex::new(permits),
            cv: Condvar::new(),
        })
    }

    async fn acquire(self: &Arc<Self>) -> GatePermit {
        let mut guard = self.available.lock().await;
        while *guard == 0 {
            guard = self.cv.wait(guard).await;
        }
        *guard -= 1;
        drop(guard);
        GatePermit { inner: self.clone() }
    }
}

pub struct Supervisor {
    filter: Arc<FilterEngine>,
    logger: EventLogger,
    shutdown: GracefulShutdown,
    gate: Arc<ConcurrencyGate>,
}

impl Supervisor {
    pub fn new(
        filter: Arc<FilterEngine>,
        logger: EventLogger,
        shutdown: GracefulShutdown,
        concurrency: usize,
    ) -> Self {
        Supervisor {
            filter,
            logger,
            shutdown,
            gate: ConcurrencyGate::new(concurrency as u64),
        }
    }

    pub async fn run(self: Arc<Self>, bind_addr: SocketAddr, backlog: i32) -> Result<()> {
        let listener = bind_listener(bind_addr, backlog)?;
        log::info!("filterproxy listening on {bind_addr} (backlog={backlog})");
        self.serve(listener).await
    }

    /// The accept loop over an already-bound listener, split out from
    /// [`Supervisor::run`] so tests can bind an ephemeral port and read it
    /// back before serving.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let Some((stream, peer)) = accept_or_shutdown(&listener, &self.shutdown).await?
            else {
                break;
            };

            // Blocks the next accept() until a handler context frees up,
            // bounding live connections at P (spec §5, §8 property 2) while
            // letting the kernel backlog absorb the burst in the meantime.
            let permit = self.gate.acquire().await;
            let supervisor = self.clone();
            let shutdown_guard = self.shutdown.inflight_guard();
            smol::spawn(async move {
                let _permit = permit;
                let _guard = shutdown_guard;
                supervisor.handle_connection(stream, peer).await;
            })
            .detach();
        }

        self.shutdown.wait_inflight_zero_with_grace().await;
        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let req = match read_request_with_deadline(&mut stream).await {
            Ok(req) => req,
            Err(e) => {
                self.respond_error_and_log(&mut stream, peer, None, &e).await;
                return;
            }
        };

        if self.filter.is_blocked(&req.host, req.port) {
            let _ = write_status(&mut stream, 403, "Forbidden", Some("Access Denied")).await;
            self.logger
                .log(LogRecord::blocked(
                    peer,
                    (req.host.clone(), req.port),
                    req.method.clone(),
                    req.target.clone(),
                    req.version.clone(),
                ))
                .await;
            return;
        }

        if req.is_connect {
            self.handle_connect(stream, peer, req).await;
        } else {
            self.handle_forward(stream, peer, req).await;
        }
    }

    async fn handle_connect(&self, mut client: TcpStream, peer: SocketAddr, req: ParsedRequest) {
        let upstream_conn = match upstream::connect(&req.host, req.port, CONNECT_TIMEOUT).await {
            Ok(s) => s,
            Err(e) => {
                let error = ProxyError::UpstreamConnect(e);
                let _ = write_status(&mut client, 502, "Bad Gateway", None).await;
                self.log_error(peer, &req, &error).await;
                return;
            }
        };

        match tunnel::run(client, upstream_conn, &req.trailing).await {
            Ok(stats) => {
                log::debug!(
                    "peer={peer} CONNECT {}:{} closed: client->upstream={}B upstream->client={}B",
                    req.host,
                    req.port,
                    stats.client_to_upstream_bytes,
                    stats.upstream_to_client_bytes
                );
                self.logger
                    .log(LogRecord::allowed(
                        peer,
                        (req.host.clone(), req.port),
                        req.method.clone(),
                        req.target.clone(),
                        req.version.clone(),
                        200,
                        stats.upstream_to_client_bytes,
                    ))
                    .await;
            }
            Err(e) => {
                // The 200 ack already went out; any failure from here is a
                // silent teardown (spec §4.4 step 4, §4.5).
                self.log_error(peer, &req, &ProxyError::UpstreamIo(e)).await;
            }
        }
    }

    async fn handle_forward(&self, mut client: TcpStream, peer: SocketAddr, req: ParsedRequest) {
        match forward::forward(&mut client, peer, &req, CONNECT_TIMEOUT, IO_TIMEOUT).await {
            Ok(stats) => {
                self.logger
                    .log(LogRecord::allowed(
                        peer,
                        (req.host.clone(), req.port),
                        req.method.clone(),
                        req.target.clone(),
                        req.version.clone(),
                        stats.upstream_status.unwrap_or(0),
                        stats.bytes_to_client,
                    ))
                    .await;
            }
            Err(failure) => {
                if !failure.response_started {
                    if let Some((code, reason)) = failure.error.status_line() {
                        let _ = write_status(&mut client, code, reason, None).await;
                    }
                }
                self.log_error(peer, &req, &failure.error).await;
            }
        }
    }

    async fn respond_error_and_log(
        &self,
        stream: &mut TcpStream,
        peer: SocketAddr,
        req: Option<&ParsedRequest>,
        error: &ProxyError,
    ) {
        if let Some((code, reason)) = error.status_line() {
            let _ = write_status(stream, code, reason, Some("")).await;
        }
        let (method, target, version) = match req {
            Some(r) => (r.method.clone(), r.target.clone(), r.version.clone()),
            None => ("-".to_string(), "-".to_string(), "-".to_string()),
        };
        self.logger
            .log(LogRecord::error(
                peer,
                (String::new(), 0),
                method,
                target,
                version,
                error.reason(),
            ))
            .await;
    }

    async fn log_error(&self, peer: SocketAddr, req: &ParsedRequest, error: &ProxyError) {
        self.logger
            .log(LogRecord::error(
                peer,
                (req.host.clone(), req.port),
                req.method.clone(),
                req.target.clone(),
                req.version.clone(),
                error.reason(),
            ))
            .await;
    }
}

async fn read_request_with_deadline(stream: &mut TcpStream) -> Result<ParsedRequest, ProxyError> {
    let parse = request::read_request(stream);
    let timeout = async {
        smol::Timer::after(INITIAL_REQUEST_DEADLINE).await;
        Err(ProxyError::UpstreamTimeout)
    };
    future::or(parse, timeout).await
}

async fn accept_or_shutdown(
    listener: &TcpListener,
    shutdown: &GracefulShutdown,
) -> std::io::Result<Option<(TcpStream, SocketAddr)>> {
    let accept = async { listener.accept().await.map(Some) };
    let wait_shutdown = async {
        shutdown.wait_shutting_down().await;
        Ok(None)
    };
    future::or(accept, wait_shutdown).await
}

/// Binds the listening socket through `socket2` so the configured backlog
/// depth (spec §3, §4.5) is honored instead of relying on a fixed default.
fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::try_from(std_listener)?)
}

async fn write_status(
    stream: &mut TcpStream,
    code: u16,
    reason: &str,
    body: Option<&str>,
) -> std::io::Result<()> {
    let body = body.unwrap_or("");
    let response = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}
