//! Test doubles shared by the unit tests

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::Registry;

use crate::socket::HandoffSocket;
use crate::worker::{Launcher, WorkerError};

pub const TEST_REMOTE_ADDR: &str = "192.0.2.7:40000";

/// A socket that only counts how often it is closed
#[derive(Debug, Clone)]
pub struct CountingSocket {
    closes: Arc<AtomicUsize>,
    stream: bool,
    fail_close: bool,
}

impl CountingSocket {
    pub fn stream() -> Self {
        Self {
            closes: Arc::new(AtomicUsize::new(0)),
            stream: true,
            fail_close: false,
        }
    }

    /// A socket the daemon cannot use, like an upgraded TLS stream
    pub fn non_stream() -> Self {
        Self {
            stream: false,
            ..Self::stream()
        }
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn closes(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

impl HandoffSocket for CountingSocket {
    fn remote_addr(&self) -> String {
        TEST_REMOTE_ADDR.to_string()
    }

    fn child_stdin(&self) -> Result<Stdio, WorkerError> {
        if self.stream {
            Ok(Stdio::null())
        } else {
            Err(WorkerError::NotStream {
                remote_addr: self.remote_addr(),
                kind: "counting",
            })
        }
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            Err(io::Error::other("close failed"))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Exit { code: i32, after: Duration },
    FailToStart,
    HangUntilKilled,
}

/// A launcher that pretends to run the daemon
#[derive(Debug, Clone)]
pub struct StubLauncher {
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
}

impl StubLauncher {
    fn with(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Exits with `code` after `after`
    pub fn exiting(code: i32, after: Duration) -> Self {
        Self::with(Behavior::Exit { code, after })
    }

    pub fn failing_to_start() -> Self {
        Self::with(Behavior::FailToStart)
    }

    /// Runs until the kill switch fires, then reports SIGKILL
    pub fn hanging_until_killed() -> Self {
        Self::with(Behavior::HangUntilKilled)
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Launcher for StubLauncher {
    async fn launch(
        &self,
        stdin: Stdio,
        kill: CancellationToken,
    ) -> Result<ExitStatus, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        drop(stdin);

        match self.behavior {
            Behavior::Exit { code, after } => {
                tokio::time::sleep(after).await;
                Ok(ExitStatus::from_raw(code << 8))
            }
            Behavior::FailToStart => Err(WorkerError::Launch {
                program: "stub".into(),
                source: io::ErrorKind::NotFound.into(),
            }),
            Behavior::HangUntilKilled => {
                kill.cancelled().await;
                Ok(ExitStatus::from_raw(libc::SIGKILL))
            }
        }
    }
}

/// One log event seen by [`LogCapture`]
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: HashMap<String, String>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: HashMap<String, String>,
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{value:?}"));
        }
    }
}

/// Records every event emitted on the current thread while installed
#[derive(Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    /// Install as the thread's default subscriber until the guard drops
    ///
    /// Tasks spawned on a current-thread runtime log here too.
    pub fn install(&self) -> DefaultGuard {
        tracing::subscriber::set_default(Registry::default().with(self.clone()))
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    /// Events whose message is exactly `message`
    pub fn named(&self, message: &str) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.message == message)
            .cloned()
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        self.events.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}
