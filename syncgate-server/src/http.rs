//! HTTP front end
//!
//! A hyper HTTP/1 listener that routes every request through the
//! [`UpgradeHandler`]. Keep-alive is off, so each connection carries one
//! request. Its socket is the hijack capability: once hyper has written the
//! response, the connection task takes the stream and any bytes hyper read
//! past the request head back out of hyper and hands them to the handler.

use std::convert::Infallible;
use std::future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::socket::TcpSocket;
use crate::upgrade::{Hijack, Hijacked, UpgradeHandler};
use crate::worker::Launcher;

/// Listener settings
#[derive(Debug, Clone, Copy)]
pub struct HttpSettings {
    /// Time allowed for a client to send its request headers
    pub read_timeout: Duration,
}

/// Serve HTTP until `shutdown` fires
///
/// Stops accepting on shutdown, then lets connections still speaking HTTP
/// finish their current request. Hijacked connections are not tracked here.
pub async fn serve<L: Launcher>(
    listener: TcpListener,
    handler: UpgradeHandler<L>,
    settings: HttpSettings,
    shutdown: CancellationToken,
) {
    let connections = TaskTracker::new();

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, remote_addr) = match accept_result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Accept error");
                        continue;
                    }
                };

                connections.spawn(serve_connection(
                    stream,
                    remote_addr,
                    handler.clone(),
                    settings,
                    shutdown.clone(),
                ));
            }

            _ = shutdown.cancelled() => {
                info!("HTTP listener shutting down");
                break;
            }
        }
    }

    drop(listener);
    connections.close();
    connections.wait().await;
    debug!("HTTP connections finished");
}

async fn serve_connection<L: Launcher>(
    stream: TcpStream,
    remote_addr: SocketAddr,
    handler: UpgradeHandler<L>,
    settings: HttpSettings,
    shutdown: CancellationToken,
) {
    let (handover, socket) = oneshot::channel();
    let hijacker = Arc::new(Mutex::new(Some(ConnectionHijacker { socket })));

    let service = service_fn(move |req: Request<Incoming>| {
        let hijacker = hijacker.lock().take();
        future::ready(Ok::<_, Infallible>(
            handler.respond(&req, remote_addr, hijacker),
        ))
    });

    let mut conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(settings.read_timeout)
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), service);

    let mut draining = false;
    let result = loop {
        tokio::select! {
            result = future::poll_fn(|cx| conn.poll_without_shutdown(cx)) => break result,
            _ = shutdown.cancelled(), if !draining => draining = true,
        }
        Pin::new(&mut conn).graceful_shutdown();
    };

    if let Err(e) = result {
        // Clients hanging up mid-request are routine
        if !e.is_incomplete_message() {
            warn!(remote_addr = %remote_addr, error = %e, "HTTP connection error");
        }
        return;
    }

    let parts = conn.into_parts();
    drop(parts.service);

    // Nobody asked for the socket, so it closes here
    if handover.is_closed() {
        return;
    }

    let hijacked = TcpSocket::from_tokio(parts.io.into_inner()).map(|socket| Hijacked {
        socket: Box::new(socket),
        buffered: parts.read_buf,
    });
    if handover.send(hijacked).is_err() {
        debug!(remote_addr = %remote_addr, "Handoff abandoned, closing connection");
    }
}

/// Hijacks the socket of the connection a request arrived on
///
/// Resolves after hyper has flushed the response and let go of the stream.
pub struct ConnectionHijacker {
    socket: oneshot::Receiver<io::Result<Hijacked>>,
}

impl Hijack for ConnectionHijacker {
    async fn hijack(self) -> io::Result<Hijacked> {
        self.socket.await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed before the handoff",
            )
        })?
    }
}
