// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Byte-transparent relay between the developer-side socket and the debug
//! server. The wire protocol is never parsed.
//!
//! Exactly one client connection is served. The session ends on the first
//! of: either copy direction finishing (EOF or error), or the spawned debug
//! server exiting. Whatever ends it, the debug server is detached and the
//! listening socket dropped before returning.

use std::io;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::copy;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::backends::{self, DebugServer};

/// Well-known port the developer-side tunnel dials.
pub const OUT_PORT: u16 = 1236;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("session socket: {0}")]
    Io(#[from] io::Error),
}

enum SessionEnd {
    ClientGone(io::Result<u64>),
    ServerGone(io::Result<u64>),
    ChildExited,
}

/// Serve one debug session, then tear everything down.
pub async fn serve(listener: TcpListener, server: &mut DebugServer) -> Result<(), ProxyError> {
    let result = relay(&listener, server).await;
    server.detach().await;
    drop(listener);
    result
}

async fn relay(listener: &TcpListener, server: &mut DebugServer) -> Result<(), ProxyError> {
    let (client, peer) = listener.accept().await?;
    info!("debug client connected from {peer}");
    let upstream = TcpStream::connect(("127.0.0.1", server.port())).await?;

    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    // Single-slot channel: only the first direction to finish is recorded.
    let (ended, mut session_end) = mpsc::channel::<SessionEnd>(1);

    let to_server = ended.clone();
    let inbound = tokio::spawn(async move {
        let outcome = copy(&mut client_read, &mut upstream_write).await;
        let _ = to_server.try_send(SessionEnd::ClientGone(outcome));
    });
    let outbound = tokio::spawn(async move {
        let outcome = copy(&mut upstream_read, &mut client_write).await;
        let _ = ended.try_send(SessionEnd::ServerGone(outcome));
    });

    let end = tokio::select! {
        Some(end) = session_end.recv() => end,
        _ = backends::wait_child(server) => SessionEnd::ChildExited,
    };
    inbound.abort();
    outbound.abort();

    match end {
        SessionEnd::ClientGone(Ok(bytes)) => {
            info!("debug client disconnected after {bytes} bytes")
        }
        SessionEnd::ServerGone(Ok(bytes)) => {
            info!("debug server closed the session after {bytes} bytes")
        }
        SessionEnd::ClientGone(Err(e)) | SessionEnd::ServerGone(Err(e)) => {
            // Indistinguishable from a hard disconnect; teardown is the same.
            warn!("session ended with i/o error: {e}")
        }
        SessionEnd::ChildExited => debug!("debug server process exited"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::process::Command;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn test_relays_bytes_and_ends_on_server_eof() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            conn.write_all(b"pong").await.unwrap();
            // Dropping the connection ends the session server-side.
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let mut server = DebugServer::in_target(upstream_port);

        let session = tokio::spawn(async move {
            serve(listener, &mut server).await.unwrap();
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_child_exit_ends_session_and_releases_listener() {
        // Upstream accepts and then sits silent; only the child's exit can
        // end this session.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_conn, _) = upstream.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let child = Command::new("true").spawn().unwrap();
        let mut server = DebugServer::spawned(upstream_port, child);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let session = tokio::spawn(async move {
            serve(listener, &mut server).await.unwrap();
        });

        let _client = TcpStream::connect(proxy_addr).await.unwrap();
        timeout(Duration::from_secs(5), session).await.unwrap().unwrap();

        // Listener was dropped with the session; new connections are refused.
        assert!(TcpStream::connect(proxy_addr).await.is_err());
    }
}
