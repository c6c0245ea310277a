//! CONNECT Tunnel (spec §4.4): acknowledge, then relay bytes in both
//! directions until each side closes, honoring TCP half-close.
//!
//! Ground: `rproxy::start::tunnel` (the `future::race` + directional
//! `shutdown(Write)` pattern that keeps the reverse direction alive after
//! one side reaches EOF, exactly spec §9's "half-close handling" design
//! note), combined with `httproxy::start::handle_client`'s CONNECT
//! acknowledgement and pre-read trailing-byte forwarding.

use std::net::Shutdown;

use smol::future;
use smol::io::AsyncWriteExt;
use smol::net::TcpStream;

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

pub struct ConnectStats {
    pub client_to_upstream_bytes: u64,
    pub upstream_to_client_bytes: u64,
}

/// Writes the acknowledgement and pre-read trailing bytes, then relays
/// until both directions close (spec §4.4 steps 2-5). Once this returns
/// `Ok`, any failure is a silent teardown (the 200 has already gone out).
pub async fn run(
    mut client: TcpStream,
    mut upstream: TcpStream,
    pre_read: &[u8],
) -> std::io::Result<ConnectStats> {
    client.write_all(CONNECT_ESTABLISHED).await?;
    client.flush().await?;

    if !pre_read.is_empty() {
        upstream.write_all(pre_read).await?;
        upstream.flush().await?;
    }

    relay(client, upstream).await
}

async fn relay(client: TcpStream, upstream: TcpStream) -> std::io::Result<ConnectStats> {
    let client_read = client.clone();
    let client_write = client.clone();
    let upstream_read = upstream.clone();
    let upstream_write = upstream.clone();

    let mut c2u = smol::spawn(async move { smol::io::copy(client_read, upstream_write).await });
    let mut u2c = smol::spawn(async move { smol::io::copy(upstream_read, client_write).await });

    enum Finished {
        ClientToUpstream,
        UpstreamToClient,
    }

    let (finished, first) = future::race(
        async { (Finished::ClientToUpstream, (&mut c2u).await) },
        async { (Finished::UpstreamToClient, (&mut u2c).await) },
    )
    .await;

    // Half-close the finished direction's write peer rather than closing
    // the whole socket, so a TLS peer relying on FIN-then-keep-reading
    // (close_notify-style teardown) completes cleanly (spec §4.4 step 4,
    // §9 design note).
    let second = match finished {
        Finished::ClientToUpstream => {
            let _ = upstream.shutdown(Shutdown::Write);
            u2c.await
        }
        Finished::UpstreamToClient => {
            let _ = client.shutdown(Shutdown::Write);
            c2u.await
        }
    };

    let first = first?;
    let second = second?;
    let (client_to_upstream_bytes, upstream_to_client_bytes) = match finished {
        Finished::ClientToUpstream => (first, second),
        Finished::UpstreamToClient => (second, first),
    };

    Ok(ConnectStats {
        client_to_upstream_bytes,
        upstream_to_client_bytes,
    })
}
