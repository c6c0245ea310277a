//! Shared upstream-dialing helper used by both the HTTP Forwarder (§4.3
//! step 1) and the CONNECT Tunnel (§4.4 step 1).

use std::time::Duration;

use smol::future;
use smol::net::TcpStream;

pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> std::io::Result<TcpStream> {
    let dial = async { TcpStream::connect((host, port)).await };
    let timeout = async {
        smol::Timer::after(connect_timeout).await;
        Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {host}:{port} timed out after {connect_timeout:?}"),
        ))
    };
    future::or(dial, timeout).await
}

/// Races a read against the per-leg I/O deadline (spec §4.3: "Read/write
/// timeouts (default 30s) apply to both legs").
pub async fn read_with_timeout(
    stream: &mut (impl smol::io::AsyncRead + Unpin),
    buf: &mut [u8],
    timeout: Duration,
) -> std::io::Result<usize> {
    use smol::io::AsyncReadExt;
    let read = async { stream.read(buf).await };
    let expire = async {
        smol::Timer::after(timeout).await;
        Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out"))
    };
    future::or(read, expire).await
}

pub async fn write_with_timeout(
    stream: &mut (impl smol::io::AsyncWrite + Unpin),
    buf: &[u8],
    timeout: Duration,
) -> std::io::Result<()> {
    use smol::io::AsyncWriteExt;
    let write = async { stream.write_all(buf).await };
    let expire = async {
        smol::Timer::after(timeout).await;
        Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out"))
    };
    future::or(write, expire).await
}
