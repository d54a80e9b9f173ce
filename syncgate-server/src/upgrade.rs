//! Upgrade handshake
//!
//! Validates an upgrade request, answers it with `101 Switching Protocols`,
//! and once the response is on the wire takes the raw socket away from the
//! HTTP layer and hands it to the [`ConnectionServer`].

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use syncgate_utils::SyncgateError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::UpgradeConfig;
use crate::server::{ConnectionId, ConnectionServer};
use crate::shutdown::InFlight;
use crate::socket::{HandoffSocket, SocketGuard};
use crate::worker::{DaemonLauncher, Launcher};

/// The ability to detach the raw socket from an HTTP connection
///
/// Offered by the transport for each request on a connection it can detach.
pub trait Hijack: Send + 'static {
    /// Wait for the switching response to be written, then take the socket
    fn hijack(self) -> impl Future<Output = io::Result<Hijacked>> + Send;
}

/// A socket detached from the HTTP layer
pub struct Hijacked {
    pub socket: Box<dyn HandoffSocket>,
    /// Bytes the HTTP layer had already read past the request
    pub buffered: Bytes,
}

/// Reasons an upgrade request was not handed off
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("method {0} not supported")]
    MethodNotSupported(Method),

    #[error("connection does not support hijacking")]
    HijackUnsupported,

    #[error("server is shutting down")]
    ServerClosing,

    /// Raised after the 101 was sent; only logged
    #[error("hijack failed: {0}")]
    HijackFailed(#[source] io::Error),

    /// The client spoke before the handshake finished; the socket is closed
    #[error("client sent {buffered} bytes before the handshake completed")]
    ProtocolViolation { buffered: usize },
}

impl UpgradeError {
    /// Status reported for this error, if a status applies
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::MethodNotSupported(_) => Some(StatusCode::METHOD_NOT_ALLOWED),
            Self::HijackUnsupported | Self::HijackFailed(_) => {
                Some(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::ServerClosing => Some(StatusCode::SERVICE_UNAVAILABLE),
            Self::ProtocolViolation { .. } => None,
        }
    }

    /// Error response for failures detected before the handshake
    pub fn response(&self) -> Response<Full<Bytes>> {
        let status = self.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let reason = status.canonical_reason().unwrap_or("Error");

        let mut response = Response::new(Full::new(Bytes::from(format!("{reason}\n"))));
        *response.status_mut() = status;
        response
    }
}

/// Request method and protocol name of the handshake
#[derive(Debug, Clone)]
pub struct UpgradeSettings {
    pub method: Method,
    pub protocol: HeaderValue,
}

impl TryFrom<&UpgradeConfig> for UpgradeSettings {
    type Error = SyncgateError;

    fn try_from(config: &UpgradeConfig) -> Result<Self, Self::Error> {
        let method = Method::from_bytes(config.method.as_bytes()).map_err(|e| {
            SyncgateError::config(format!("invalid upgrade method '{}': {e}", config.method))
        })?;
        let protocol = HeaderValue::from_str(&config.protocol).map_err(|e| {
            SyncgateError::config(format!(
                "invalid upgrade protocol '{}': {e}",
                config.protocol
            ))
        })?;
        Ok(Self { method, protocol })
    }
}

/// Logs one request when its handling ends, whichever way it ends
struct RequestLog {
    method: Method,
    url: String,
    remote_addr: SocketAddr,
    x_forwarded_for: Option<String>,
    status: Option<StatusCode>,
    started: Instant,
}

impl RequestLog {
    fn new<B>(request: &Request<B>, remote_addr: SocketAddr) -> Self {
        Self {
            method: request.method().clone(),
            url: request.uri().to_string(),
            remote_addr,
            x_forwarded_for: request
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            status: None,
            started: Instant::now(),
        }
    }
}

impl Drop for RequestLog {
    fn drop(&mut self) {
        info!(
            method = %self.method,
            url = %self.url,
            remote_addr = %self.remote_addr,
            x_forwarded_for = self.x_forwarded_for.as_deref(),
            status = self.status.map(|s| s.as_u16()),
            duration = ?self.started.elapsed(),
            "Request"
        );
    }
}

/// An accepted upgrade
pub struct Handoff {
    /// The `101 Switching Protocols` response to send
    pub response: Response<Full<Bytes>>,
    /// Completes the hijack and forwards the socket once the response is sent
    pub task: JoinHandle<Result<ConnectionId, UpgradeError>>,
}

/// Entry point for upgrade requests
pub struct UpgradeHandler<L = DaemonLauncher> {
    server: Arc<ConnectionServer<L>>,
    settings: UpgradeSettings,
}

impl<L> Clone for UpgradeHandler<L> {
    fn clone(&self) -> Self {
        Self {
            server: Arc::clone(&self.server),
            settings: self.settings.clone(),
        }
    }
}

impl<L: Launcher> UpgradeHandler<L> {
    pub fn new(server: Arc<ConnectionServer<L>>, settings: UpgradeSettings) -> Self {
        Self { server, settings }
    }

    pub fn server(&self) -> &Arc<ConnectionServer<L>> {
        &self.server
    }

    /// Validate a request and start its handoff
    ///
    /// `hijacker` is `None` when the transport cannot detach the socket. On
    /// success one in-flight unit is already counted for the connection, so
    /// a shutdown waits for it even before the socket reaches a worker.
    pub fn handle<B, H: Hijack>(
        &self,
        request: &Request<B>,
        remote_addr: SocketAddr,
        hijacker: Option<H>,
    ) -> Result<Handoff, UpgradeError> {
        let mut log = RequestLog::new(request, remote_addr);

        if request.method() != self.settings.method {
            debug!(method = %request.method(), remote_addr = %remote_addr, "Rejecting non-upgrade request");
            let err = UpgradeError::MethodNotSupported(request.method().clone());
            log.status = err.status();
            return Err(err);
        }

        let Some(hijacker) = hijacker else {
            error!(remote_addr = %remote_addr, "Transport cannot hijack the connection");
            log.status = UpgradeError::HijackUnsupported.status();
            return Err(UpgradeError::HijackUnsupported);
        };

        let Some(reservation) = self.server.try_reserve() else {
            warn!(remote_addr = %remote_addr, "Server closing, refusing upgrade");
            log.status = UpgradeError::ServerClosing.status();
            return Err(UpgradeError::ServerClosing);
        };

        let response = self.switching_response();
        log.status = Some(response.status());

        let task = tokio::spawn(complete_handoff(
            Arc::clone(&self.server),
            hijacker,
            reservation,
            log,
        ));

        Ok(Handoff { response, task })
    }

    /// Like [`handle`](Self::handle), detaching the handoff task
    pub fn respond<B, H: Hijack>(
        &self,
        request: &Request<B>,
        remote_addr: SocketAddr,
        hijacker: Option<H>,
    ) -> Response<Full<Bytes>> {
        match self.handle(request, remote_addr, hijacker) {
            Ok(handoff) => handoff.response,
            Err(e) => e.response(),
        }
    }

    fn switching_response(&self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;

        let headers = response.headers_mut();
        // hyper strips Transfer-Encoding from a 101 before it reaches the wire
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("identity"));
        headers.insert(header::UPGRADE, self.settings.protocol.clone());
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        response
    }
}

async fn complete_handoff<L: Launcher, H: Hijack>(
    server: Arc<ConnectionServer<L>>,
    hijacker: H,
    reservation: InFlight,
    mut log: RequestLog,
) -> Result<ConnectionId, UpgradeError> {
    let Hijacked { socket, buffered } = match hijacker.hijack().await {
        Ok(hijacked) => hijacked,
        Err(e) => {
            error!(remote_addr = %log.remote_addr, error = %e, "Hijack failed");
            log.status = Some(StatusCode::INTERNAL_SERVER_ERROR);
            return Err(UpgradeError::HijackFailed(e));
        }
    };

    let socket = SocketGuard::new(socket);
    if !buffered.is_empty() {
        warn!(
            remote_addr = %log.remote_addr,
            buffered = buffered.len(),
            "Client sent data before the handshake completed, closing"
        );
        socket.close();
        return Err(UpgradeError::ProtocolViolation {
            buffered: buffered.len(),
        });
    }

    Ok(server.accept_reserved(socket, reservation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingSocket, LogCapture, StubLauncher};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing::Level;

    struct FakeHijacker {
        socket: CountingSocket,
        buffered: Bytes,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    impl FakeHijacker {
        fn new(socket: CountingSocket) -> Self {
            Self {
                socket,
                buffered: Bytes::new(),
                fail: false,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Hijack for FakeHijacker {
        async fn hijack(self) -> io::Result<Hijacked> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection reset"));
            }
            Ok(Hijacked {
                socket: Box::new(self.socket),
                buffered: self.buffered,
            })
        }
    }

    fn remote() -> SocketAddr {
        "192.0.2.7:40000".parse().unwrap()
    }

    fn request(method: &str) -> Request<()> {
        Request::builder()
            .method(Method::from_bytes(method.as_bytes()).unwrap())
            .uri("/module")
            .header("x-forwarded-for", "198.51.100.1")
            .body(())
            .unwrap()
    }

    fn handler(launcher: StubLauncher) -> UpgradeHandler<StubLauncher> {
        UpgradeHandler::new(
            Arc::new(ConnectionServer::new(launcher)),
            UpgradeSettings::try_from(&UpgradeConfig::default()).unwrap(),
        )
    }

    /// The status of the single request log line
    fn logged_status(capture: &LogCapture) -> Option<String> {
        let requests = capture.named("Request");
        assert_eq!(requests.len(), 1, "expected one request log: {requests:?}");
        assert_eq!(requests[0].level, Level::INFO);
        requests[0].field("status").map(str::to_string)
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            UpgradeError::MethodNotSupported(Method::GET).status(),
            Some(StatusCode::METHOD_NOT_ALLOWED)
        );
        assert_eq!(
            UpgradeError::HijackUnsupported.status(),
            Some(StatusCode::INTERNAL_SERVER_ERROR)
        );
        assert_eq!(
            UpgradeError::ServerClosing.status(),
            Some(StatusCode::SERVICE_UNAVAILABLE)
        );
        assert_eq!(UpgradeError::ProtocolViolation { buffered: 3 }.status(), None);
        assert_eq!(
            UpgradeError::ServerClosing.response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_settings_from_config() {
        let settings = UpgradeSettings::try_from(&UpgradeConfig::default()).unwrap();
        assert_eq!(settings.method.as_str(), "RSYNC");
        assert_eq!(settings.protocol, "rsync");

        let bad = UpgradeConfig {
            method: "NOT A METHOD".into(),
            ..Default::default()
        };
        assert!(UpgradeSettings::try_from(&bad).is_err());
    }

    #[tokio::test]
    async fn test_wrong_method_is_405_without_hijack() {
        let handler = handler(StubLauncher::exiting(0, Duration::ZERO));
        let hijacker = FakeHijacker::new(CountingSocket::stream());
        let calls = Arc::clone(&hijacker.calls);

        let err = handler
            .handle(&request("GET"), remote(), Some(hijacker))
            .err()
            .unwrap();

        assert!(matches!(err, UpgradeError::MethodNotSupported(_)));
        assert_eq!(err.response().status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(handler.server().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_missing_capability_is_500() {
        let handler = handler(StubLauncher::exiting(0, Duration::ZERO));

        let err = handler
            .handle::<_, FakeHijacker>(&request("RSYNC"), remote(), None)
            .err()
            .unwrap();

        assert!(matches!(err, UpgradeError::HijackUnsupported));
        assert_eq!(handler.server().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_valid_upgrade_hands_off_once() {
        let launcher = StubLauncher::exiting(0, Duration::ZERO);
        let launches = launcher.calls();
        let handler = handler(launcher);

        let socket = CountingSocket::stream();
        let closes = socket.closes();
        let hijacker = FakeHijacker::new(socket);
        let hijacks = Arc::clone(&hijacker.calls);

        let handoff = handler
            .handle(&request("RSYNC"), remote(), Some(hijacker))
            .unwrap();

        let response = &handoff.response;
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()[header::UPGRADE], "rsync");
        assert_eq!(response.headers()[header::CONNECTION], "upgrade");
        assert_eq!(response.headers()[header::TRANSFER_ENCODING], "identity");

        handoff.task.await.unwrap().unwrap();
        handler.server().shutdown().await;

        assert_eq!(hijacks.load(Ordering::SeqCst), 1);
        assert_eq!(launches.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_presend_bytes_close_without_worker() {
        let launcher = StubLauncher::exiting(0, Duration::ZERO);
        let launches = launcher.calls();
        let handler = handler(launcher);

        let socket = CountingSocket::stream();
        let closes = socket.closes();
        let mut hijacker = FakeHijacker::new(socket);
        hijacker.buffered = Bytes::from_static(b"@RSYNCD: 31.0\n");

        let handoff = handler
            .handle(&request("RSYNC"), remote(), Some(hijacker))
            .unwrap();
        let result = handoff.task.await.unwrap();

        assert!(matches!(
            result,
            Err(UpgradeError::ProtocolViolation { buffered: 14 })
        ));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(launches.load(Ordering::SeqCst), 0);
        assert_eq!(handler.server().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_hijack_failure_releases_reservation() {
        let handler = handler(StubLauncher::exiting(0, Duration::ZERO));
        let mut hijacker = FakeHijacker::new(CountingSocket::stream());
        hijacker.fail = true;

        let handoff = handler
            .handle(&request("RSYNC"), remote(), Some(hijacker))
            .unwrap();
        let result = handoff.task.await.unwrap();

        assert!(matches!(result, Err(UpgradeError::HijackFailed(_))));
        assert_eq!(handler.server().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_closing_server_is_503_without_hijack() {
        let handler = handler(StubLauncher::exiting(0, Duration::ZERO));
        handler.server().shutdown().await;

        let hijacker = FakeHijacker::new(CountingSocket::stream());
        let calls = Arc::clone(&hijacker.calls);

        let response = handler.respond(&request("RSYNC"), remote(), Some(hijacker));

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_request_logged_once_for_rejections() {
        let handler = handler(StubLauncher::exiting(0, Duration::ZERO));

        let capture = LogCapture::default();
        {
            let _guard = capture.install();
            let hijacker = FakeHijacker::new(CountingSocket::stream());
            handler.respond(&request("GET"), remote(), Some(hijacker));
        }
        assert_eq!(logged_status(&capture).as_deref(), Some("405"));

        let capture = LogCapture::default();
        {
            let _guard = capture.install();
            handler.respond::<_, FakeHijacker>(&request("RSYNC"), remote(), None);
        }
        assert_eq!(logged_status(&capture).as_deref(), Some("500"));
        let unsupported = capture.named("Transport cannot hijack the connection");
        assert_eq!(unsupported.len(), 1);
        assert_eq!(unsupported[0].level, Level::ERROR);

        handler.server().shutdown().await;
        let capture = LogCapture::default();
        {
            let _guard = capture.install();
            let hijacker = FakeHijacker::new(CountingSocket::stream());
            handler.respond(&request("RSYNC"), remote(), Some(hijacker));
        }
        assert_eq!(logged_status(&capture).as_deref(), Some("503"));
        let refused = capture.named("Server closing, refusing upgrade");
        assert_eq!(refused.len(), 1);
        assert_eq!(refused[0].level, Level::WARN);
    }

    #[tokio::test]
    async fn test_request_logged_once_after_handoff() {
        let handler = handler(StubLauncher::exiting(0, Duration::ZERO));
        let capture = LogCapture::default();
        let _guard = capture.install();

        let hijacker = FakeHijacker::new(CountingSocket::stream());
        let handoff = handler
            .handle(&request("RSYNC"), remote(), Some(hijacker))
            .unwrap();
        // Nothing is logged until the handoff ends
        assert!(capture.named("Request").is_empty());
        handoff.task.await.unwrap().unwrap();

        assert_eq!(logged_status(&capture).as_deref(), Some("101"));
        let logged = capture.named("Request");
        assert_eq!(logged[0].field("method"), Some("RSYNC"));
        assert_eq!(logged[0].field("url"), Some("/module"));
        assert_eq!(logged[0].field("x_forwarded_for"), Some("198.51.100.1"));
        assert!(logged[0].field("duration").is_some());
        handler.server().shutdown().await;
    }

    #[tokio::test]
    async fn test_request_logged_once_on_hijack_failure() {
        let handler = handler(StubLauncher::exiting(0, Duration::ZERO));
        let capture = LogCapture::default();
        let _guard = capture.install();

        let mut hijacker = FakeHijacker::new(CountingSocket::stream());
        hijacker.fail = true;
        let handoff = handler
            .handle(&request("RSYNC"), remote(), Some(hijacker))
            .unwrap();
        handoff.task.await.unwrap().unwrap_err();

        assert_eq!(logged_status(&capture).as_deref(), Some("500"));
        let failed = capture.named("Hijack failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].level, Level::ERROR);
    }

    #[tokio::test]
    async fn test_request_logged_once_on_protocol_violation() {
        let handler = handler(StubLauncher::exiting(0, Duration::ZERO));
        let capture = LogCapture::default();
        let _guard = capture.install();

        let mut hijacker = FakeHijacker::new(CountingSocket::stream());
        hijacker.buffered = Bytes::from_static(b"@RSYNCD");
        let handoff = handler
            .handle(&request("RSYNC"), remote(), Some(hijacker))
            .unwrap();
        handoff.task.await.unwrap().unwrap_err();

        // The 101 was already written
        assert_eq!(logged_status(&capture).as_deref(), Some("101"));
        let violation = capture.named("Client sent data before the handshake completed, closing");
        assert_eq!(violation.len(), 1);
        assert_eq!(violation[0].level, Level::WARN);
        assert_eq!(violation[0].field("buffered"), Some("7"));
    }
}
