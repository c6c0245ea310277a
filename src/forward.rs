//! HTTP Forwarder (spec §4.3): open upstream, rewrite absolute-form to
//! origin-form, relay request body and response as opaque streams.
//!
//! Ground: `httproxy::start::handle_client`'s non-`CONNECT` branch for the
//! overall shape (parse → forward → write response), generalized away from
//! `ureq` (which buffers the whole response in memory) to a raw streaming
//! relay over `smol::net::TcpStream`, matching the byte-copy style already
//! used for `CONNECT` tunnels (spec §4.3 steps 4-5 require streaming, not
//! buffering).

use std::net::SocketAddr;
use std::time::Duration;

use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpStream;

use crate::error::ProxyError;
use crate::request::{format_host_for_wire, ParsedRequest};
use crate::upstream::{self, read_with_timeout, write_with_timeout};

const RELAY_BUFFER: usize = 8 * 1024;

pub struct ForwardStats {
    pub upstream_status: Option<u16>,
    pub bytes_to_client: u64,
}

/// Carries enough context for the supervisor to decide whether a status
/// response can still be written (spec §7: timeouts/errors after response
/// bytes have crossed must tear down silently instead).
pub struct ForwardFailure {
    pub error: ProxyError,
    pub response_started: bool,
}

enum BodyFraming {
    None,
    ContentLength(usize),
    Chunked,
}

pub async fn forward(
    client: &mut TcpStream,
    _peer: SocketAddr,
    req: &ParsedRequest,
    connect_timeout: Duration,
    io_timeout: Duration,
) -> Result<ForwardStats, ForwardFailure> {
    let mut upstream_conn = upstream::connect(&req.host, req.port, connect_timeout)
        .await
        .map_err(|e| ForwardFailure {
            error: ProxyError::UpstreamConnect(e),
            response_started: false,
        })?;

    let start_line = build_start_line(req);
    let header_block = build_header_block(req);

    write_with_timeout(&mut upstream_conn, start_line.as_bytes(), io_timeout)
        .await
        .map_err(upstream_io_before_response)?;
    write_with_timeout(&mut upstream_conn, &header_block, io_timeout)
        .await
        .map_err(upstream_io_before_response)?;

    forward_body(client, &mut upstream_conn, req, io_timeout).await?;

    relay_response(client, &mut upstream_conn, io_timeout).await
}

fn upstream_io_before_response(e: std::io::Error) -> ForwardFailure {
    if e.kind() == std::io::ErrorKind::TimedOut {
        ForwardFailure {
            error: ProxyError::UpstreamTimeout,
            response_started: false,
        }
    } else {
        ForwardFailure {
            error: ProxyError::UpstreamIo(e),
            response_started: false,
        }
    }
}

/// Rewrites absolute-form to origin-form; origin-form and `CONNECT` (never
/// routed here) pass the target through unchanged (spec §4.3 step 2, §9:
/// "the rewrite must preserve the exact path and query bytes; do not
/// re-encode").
fn build_start_line(req: &ParsedRequest) -> String {
    let target = req.rewritten_target.as_deref().unwrap_or(&req.target);
    format!("{} {} {}\r\n", req.method, target, req.version)
}

/// Header block byte-preserved except: a single `Proxy-Connection` header
/// MAY be stripped, and `Host` MUST be present, synthesized from the URI
/// authority if the client didn't send one (spec §6, §4.3 step 2).
fn build_header_block(req: &ParsedRequest) -> Vec<u8> {
    let raw = req.header_block();
    let mut out = Vec::with_capacity(raw.len() + 32);

    if req.header("host").is_none() {
        let authority = format_host_for_wire(&req.host);
        let host_line = if req.port == 80 {
            format!("Host: {authority}\r\n")
        } else {
            format!("Host: {authority}:{}\r\n", req.port)
        };
        out.extend_from_slice(host_line.as_bytes());
    }

    for line in split_lines(raw) {
        if is_header_line(line, "proxy-connection") {
            continue;
        }
        out.extend_from_slice(line);
    }
    out
}

fn split_lines(block: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    while start < block.len() {
        let end = block[start..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| start + p + 2)
            .unwrap_or(block.len());
        lines.push(&block[start..end]);
        start = end;
    }
    lines
}

fn is_header_line(line: &[u8], name: &str) -> bool {
    match line.iter().position(|&b| b == b':') {
        Some(colon) => std::str::from_utf8(&line[..colon])
            .map(|n| n.eq_ignore_ascii_case(name))
            .unwrap_or(false),
        None => false,
    }
}

fn body_framing(req: &ParsedRequest) -> Result<BodyFraming, ForwardFailure> {
    let chunked = req
        .header("transfer-encoding")
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")));
    if chunked {
        return Ok(BodyFraming::Chunked);
    }
    match req.header("content-length") {
        Some(v) => {
            let len: usize = v.trim().parse().map_err(|_| ForwardFailure {
                error: ProxyError::MalformedRequest(format!("invalid Content-Length: {v}")),
                response_started: false,
            })?;
            Ok(BodyFraming::ContentLength(len))
        }
        None => Ok(BodyFraming::None),
    }
}

async fn forward_body(
    client: &mut TcpStream,
    upstream_conn: &mut TcpStream,
    req: &ParsedRequest,
    io_timeout: Duration,
) -> Result<(), ForwardFailure> {
    let framing = body_framing(req)?;

    // Bytes already read past the header terminator are forwarded
    // regardless of framing (spec §4.3 step 3).
    if !req.trailing.is_empty() {
        write_with_timeout(upstream_conn, &req.trailing, io_timeout)
            .await
            .map_err(upstream_io_before_response)?;
    }

    match framing {
        BodyFraming::None => Ok(()),
        BodyFraming::ContentLength(len) => {
            let mut remaining = len.saturating_sub(req.trailing.len());
            let mut buf = [0u8; RELAY_BUFFER];
            while remaining > 0 {
                let want = remaining.min(buf.len());
                let n = read_with_timeout(client, &mut buf[..want], io_timeout)
                    .await
                    .map_err(client_io_before_response)?;
                if n == 0 {
                    return Err(ForwardFailure {
                        error: ProxyError::ClientIo(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "client closed connection mid-body",
                        )),
                        response_started: false,
                    });
                }
                write_with_timeout(upstream_conn, &buf[..n], io_timeout)
                    .await
                    .map_err(upstream_io_before_response)?;
                remaining -= n;
            }
            Ok(())
        }
        BodyFraming::Chunked => {
            relay_until_chunk_terminator(client, upstream_conn, &req.trailing, io_timeout).await
        }
    }
}

fn client_io_before_response(e: std::io::Error) -> ForwardFailure {
    if e.kind() == std::io::ErrorKind::TimedOut {
        ForwardFailure {
            error: ProxyError::UpstreamTimeout,
            response_started: false,
        }
    } else {
        ForwardFailure {
            error: ProxyError::ClientIo(e),
            response_started: false,
        }
    }
}

/// Chunked bodies are relayed as opaque bytes (spec Non-goals: no
/// chunked/body re-framing), so this never decodes individual chunks.
/// Instead it scans for a terminator aligned to a chunk-size line: either
/// `0\r\n\r\n` at the very start of the body (a zero-length chunked body),
/// or `\r\n0\r\n\r\n` anywhere after (the CRLF that ends the previous
/// chunk's data, followed by the last-chunk line). This still isn't a full
/// parse, a chunk extension (`0;ext\r\n\r\n`) or chunk data that itself
/// ends in `\r\n` right before a literal `0\r\n\r\n` can still false-match,
/// but it closes the common case of the bare terminator bytes occurring
/// unaligned inside opaque chunk data.
async fn relay_until_chunk_terminator(
    client: &mut TcpStream,
    upstream_conn: &mut TcpStream,
    pre_read: &[u8],
    io_timeout: Duration,
) -> Result<(), ForwardFailure> {
    const TERMINATOR: &[u8] = b"0\r\n\r\n";
    const ALIGNED_TERMINATOR: &[u8] = b"\r\n0\r\n\r\n";
    let keep_len = ALIGNED_TERMINATOR.len() - 1;

    let mut tail: Vec<u8> = Vec::new();
    let mut still_from_body_start = true;
    tail.extend_from_slice(pre_read);
    if chunk_terminator_aligned(&tail, still_from_body_start, TERMINATOR, ALIGNED_TERMINATOR) {
        return Ok(());
    }
    if tail.len() > keep_len {
        still_from_body_start = false;
        let drop = tail.len() - keep_len;
        tail.drain(..drop);
    }

    let mut buf = [0u8; RELAY_BUFFER];
    loop {
        let n = read_with_timeout(client, &mut buf, io_timeout)
            .await
            .map_err(client_io_before_response)?;
        if n == 0 {
            return Ok(());
        }
        write_with_timeout(upstream_conn, &buf[..n], io_timeout)
            .await
            .map_err(upstream_io_before_response)?;

        tail.extend_from_slice(&buf[..n]);
        if chunk_terminator_aligned(&tail, still_from_body_start, TERMINATOR, ALIGNED_TERMINATOR) {
            return Ok(());
        }
        if tail.len() > keep_len {
            still_from_body_start = false;
            let drop = tail.len() - keep_len;
            tail.drain(..drop);
        }
    }
}

fn chunk_terminator_aligned(
    tail: &[u8],
    still_from_body_start: bool,
    terminator: &[u8],
    aligned_terminator: &[u8],
) -> bool {
    (still_from_body_start && tail.starts_with(terminator)) || contains(tail, aligned_terminator)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Relays the upstream response verbatim with a fixed-size buffer,
/// extracting the numeric status code and the response body's byte count
/// for the transaction log (spec §4.3 step 5, §6, §8 scenario S1: the log
/// record's size field is the body length, not the header bytes).
async fn relay_response(
    client: &mut TcpStream,
    upstream_conn: &mut TcpStream,
    io_timeout: Duration,
) -> Result<ForwardStats, ForwardFailure> {
    const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
    let mut buf = [0u8; RELAY_BUFFER];
    let mut header_tail: Vec<u8> = Vec::new();
    let mut headers_done = false;
    let mut body_bytes: u64 = 0;

    let n = read_with_timeout(upstream_conn, &mut buf, io_timeout)
        .await
        .map_err(upstream_io_before_response)?;
    if n == 0 {
        return Err(ForwardFailure {
            error: ProxyError::UpstreamIo(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed connection before sending a response",
            )),
            response_started: false,
        });
    }

    let status = parse_status_code(&buf[..n]);
    client
        .write_all(&buf[..n])
        .await
        .map_err(|e| ForwardFailure {
            error: ProxyError::ClientIo(e),
            response_started: false,
        })?;
    account_response_bytes(&buf[..n], &mut header_tail, &mut headers_done, &mut body_bytes, HEADER_TERMINATOR);

    loop {
        let n = match upstream_conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                return Err(ForwardFailure {
                    error: ProxyError::UpstreamIo(e),
                    response_started: true,
                });
            }
        };
        if let Err(e) = client.write_all(&buf[..n]).await {
            return Err(ForwardFailure {
                error: ProxyError::ClientIo(e),
                response_started: true,
            });
        }
        account_response_bytes(&buf[..n], &mut header_tail, &mut headers_done, &mut body_bytes, HEADER_TERMINATOR);
    }

    let _ = client.flush().await;
    Ok(ForwardStats {
        upstream_status: status,
        bytes_to_client: body_bytes,
    })
}

/// Tracks how many relayed bytes fall after the header terminator, without
/// buffering the response itself. `header_tail` holds only the bytes seen
/// so far while the terminator hasn't been found yet, bounded in practice
/// by response header size rather than body size.
fn account_response_bytes(
    chunk: &[u8],
    header_tail: &mut Vec<u8>,
    headers_done: &mut bool,
    body_bytes: &mut u64,
    terminator: &[u8],
) {
    if *headers_done {
        *body_bytes += chunk.len() as u64;
        return;
    }
    header_tail.extend_from_slice(chunk);
    if let Some(pos) = find_header_terminator(header_tail, terminator) {
        *headers_done = true;
        *body_bytes += (header_tail.len() - (pos + terminator.len())) as u64;
        header_tail.clear();
    }
}

fn find_header_terminator(haystack: &[u8], terminator: &[u8]) -> Option<usize> {
    haystack.windows(terminator.len()).position(|w| w == terminator)
}

fn parse_status_code(buf: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(&buf[..buf.len().min(32)]).ok()?;
    let mut parts = text.split_whitespace();
    let _version = parts.next()?;
    parts.next()?.parse().ok()
}
