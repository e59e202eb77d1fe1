//! Listeners and accept loops

use super::backoff::Backoff;
use super::config::TcpOptions;
use super::{conn, Shared};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};

const LISTEN_BACKLOG: u32 = 1024;

/// Bind a listener with the configured socket options. Accepted sockets
/// inherit them.
pub(crate) fn bind(addr: &str, tcp: &TcpOptions) -> io::Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(tcp.keepalive)?;
    if tcp.sndbuf > 0 {
        socket.set_send_buffer_size(u32::try_from(tcp.sndbuf).unwrap_or(u32::MAX))?;
    }
    if tcp.rcvbuf > 0 {
        socket.set_recv_buffer_size(u32::try_from(tcp.rcvbuf).unwrap_or(u32::MAX))?;
    }
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Errors after which accepting again may succeed
fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind::{ConnectionAborted, ConnectionReset, Interrupted, TimedOut, WouldBlock};

    if matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | TimedOut | WouldBlock
    ) {
        return true;
    }
    // Out of file descriptors or memory
    matches!(err.raw_os_error(), Some(12 | 23 | 24 | 105))
}

pub(crate) async fn accept_loop(shared: Arc<Shared>, listener: Arc<TcpListener>, worker: usize) {
    let mut backoff = Backoff::accept();
    loop {
        let accepted = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                backoff.reset();
                let Ok(permit) = Arc::clone(&shared.permits).try_acquire_owned() else {
                    tracing::warn!(peer = %peer, "Connection limit reached, rejecting");
                    continue;
                };
                let rn = shared.accepted.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(conn::serve(Arc::clone(&shared), stream, peer, rn, permit));
            }
            Err(e) if is_transient(&e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    worker,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Accept failed, retrying"
                );
                tokio::select! {
                    () = shared.shutdown.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                tracing::error!(worker, error = %e, "Listener failed");
                break;
            }
        }
    }
    tracing::debug!(worker, "Accept loop stopped");
}
