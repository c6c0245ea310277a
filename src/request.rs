//! Request Parser (spec §4.1): read the client's request up to the header
//! terminator, tokenize start-line + headers, and derive the destination
//! `(host, port)` per spec §4.1's three cases.
//!
//! Ground: `httproxy::start::read_client_request` (buffered read-until-
//! terminator loop, `httparse` tokenizing), generalized to keep the raw
//! header bytes for byte-exact forwarding (spec §4.3 step 3) instead of
//! rebuilding a request via `ureq`.

use smol::io::AsyncReadExt;
use smol::net::TcpStream;

use crate::error::ProxyError;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    /// The raw request-target as seen on the wire (spec §3).
    pub target: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub is_connect: bool,
    /// Ordered, original-case header pairs (spec §3). Lookup helpers below
    /// are case-insensitive.
    pub headers: Vec<(String, String)>,
    /// start-line + header block + terminating empty line, byte-exact as
    /// received (spec §3's `raw_prefix`).
    pub raw_prefix: Vec<u8>,
    /// Any bytes already read from the client past the header terminator
    /// (a pipelined body, or, for `CONNECT`, the start of a TLS
    /// handshake riding the same TCP segment).
    pub trailing: Vec<u8>,
    /// True when the absolute-form URI's path/query should be substituted
    /// for the request-target on the wire to upstream (spec §4.3 step 2).
    pub rewritten_target: Option<String>,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Byte offset of the end of the start-line within `raw_prefix`.
    fn header_block_start(&self) -> usize {
        find_subslice(&self.raw_prefix, b"\r\n")
            .map(|p| p + 2)
            .or_else(|| find_subslice(&self.raw_prefix, b"\n").map(|p| p + 1))
            .unwrap_or(self.raw_prefix.len())
    }

    /// The header block (name: value lines + terminating blank line),
    /// unmodified, for byte-exact forwarding (spec §4.3 step 3).
    pub fn header_block(&self) -> &[u8] {
        &self.raw_prefix[self.header_block_start()..]
    }
}

pub async fn read_request(stream: &mut TcpStream) -> Result<ParsedRequest, ProxyError> {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut tmp = [0u8; READ_CHUNK];

    let header_end = loop {
        let n = stream
            .read(&mut tmp)
            .await
            .map_err(ProxyError::ClientIo)?;
        if n == 0 {
            return Err(ProxyError::MalformedRequest(
                "client closed connection before sending a complete request".into(),
            ));
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > MAX_HEADER_BYTES {
            return Err(ProxyError::MalformedRequest("headers too large".into()));
        }
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if let Some(pos) = find_subslice(&buf, b"\n\n") {
            break pos + 2;
        }
    };

    let raw_prefix = buf[..header_end].to_vec();
    let trailing = buf[header_end..].to_vec();

    let start_line_end = find_subslice(&raw_prefix, b"\r\n")
        .or_else(|| find_subslice(&raw_prefix, b"\n"))
        .unwrap_or(raw_prefix.len());
    let header_bytes = unfold_obs_fold(&raw_prefix[start_line_end..]);

    // httparse wants the whole start-line + headers in one buffer.
    let mut head = raw_prefix[..start_line_end].to_vec();
    if !head.ends_with(b"\r\n") && !head.ends_with(b"\n") {
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(&header_bytes);

    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut header_storage);
    match parsed
        .parse(&head)
        .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?
    {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
            return Err(ProxyError::MalformedRequest("incomplete headers".into()));
        }
    }

    let method = parsed
        .method
        .ok_or_else(|| ProxyError::MalformedRequest("missing method".into()))?
        .to_string();
    let target = parsed
        .path
        .ok_or_else(|| ProxyError::MalformedRequest("missing request-target".into()))?
        .to_string();
    let version = match parsed.version {
        Some(0) => "HTTP/1.0".to_string(),
        Some(1) => "HTTP/1.1".to_string(),
        _ => return Err(ProxyError::MalformedRequest("missing/bad version".into())),
    };

    let headers: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
        .collect();

    let is_connect = method.eq_ignore_ascii_case("CONNECT");
    let (host, port, rewritten_target) = derive_destination(&method, &target, &headers)?;

    Ok(ParsedRequest {
        method,
        target,
        version,
        host,
        port,
        is_connect,
        headers,
        raw_prefix,
        trailing,
        rewritten_target,
    })
}

/// Spec §4.1's three-case destination derivation.
fn derive_destination(
    method: &str,
    target: &str,
    headers: &[(String, String)],
) -> Result<(String, u16, Option<String>), ProxyError> {
    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_authority(target)
            .ok_or_else(|| ProxyError::MalformedRequest("malformed CONNECT authority".into()))?;
        let port = port.ok_or_else(|| {
            ProxyError::MalformedRequest("CONNECT authority missing port".into())
        })?;
        return Ok((host.to_ascii_lowercase(), port, None));
    }

    if let Some(rest) = target.strip_prefix("http://").or_else(|| target.strip_prefix("https://")) {
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = split_authority(authority)
            .ok_or_else(|| ProxyError::MalformedRequest("malformed absolute-form authority".into()))?;
        let port = port.unwrap_or(80);
        return Ok((host.to_ascii_lowercase(), port, Some(path.to_string())));
    }

    // Origin-form: destination comes from the Host header (spec §4.1 case 3).
    let host_header = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("host"))
        .map(|(_, v)| v.as_str())
        .ok_or(ProxyError::MissingHost)?;
    let (host, port) =
        split_authority(host_header).ok_or_else(|| ProxyError::MissingHost)?;
    let port = port.unwrap_or(80);
    Ok((host.to_ascii_lowercase(), port, None))
}

/// Splits `host:port` or `[v6]:port` / bare `host` / bare `[v6]`. Returns
/// `None` only on structurally invalid input (e.g. unterminated bracket).
fn split_authority(authority: &str) -> Option<(&str, Option<u16>)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let after = &rest[end + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) if !p.is_empty() => Some(p.parse().ok()?),
            Some(_) => return None,
            None => None,
        };
        return Some((host, port));
    }

    match authority.rfind(':') {
        // More than one ':' with no brackets means an unbracketed IPv6
        // literal with no port. Treat the whole thing as host.
        Some(idx) if authority[..idx].contains(':') => Some((authority, None)),
        Some(idx) => {
            let host = &authority[..idx];
            let port_str = &authority[idx + 1..];
            if port_str.is_empty() {
                return None;
            }
            let port = port_str.parse().ok()?;
            Some((host, Some(port)))
        }
        None => Some((authority, None)),
    }
}

/// Rebrackets an IPv6 literal for use in a `Host` header or authority
/// string; leaves hostnames and IPv4 literals untouched (spec §4.1).
pub fn format_host_for_wire(host: &str) -> String {
    if host.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Joins obs-folded header continuation lines (spec §4.1: "leading
/// whitespace continuation is joined to the previous value").
fn unfold_obs_fold(headers: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(headers.len());
    let mut i = 0;
    while i < headers.len() {
        let line_end = find_subslice(&headers[i..], b"\r\n")
            .map(|p| i + p)
            .unwrap_or(headers.len());
        let line = &headers[i..line_end];
        let next_start = (line_end + 2).min(headers.len());

        if (line.starts_with(b" ") || line.starts_with(b"\t")) && !out.is_empty() {
            // Continuation: drop the preceding CRLF we already wrote and
            // join with a single space, per RFC 7230 §3.2.4 obs-fold.
            if out.ends_with(b"\r\n") {
                out.truncate(out.len() - 2);
            }
            out.push(b' ');
            out.extend_from_slice(line.trim_ascii_start());
        } else {
            out.extend_from_slice(line);
        }
        out.extend_from_slice(b"\r\n");
        i = next_start;
    }
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
