//! Session-0 Watcher (§2). Polls the active console session id and emits a
//! transition event whenever it changes — the host process itself always
//! runs in session 0, but capture/input must follow whichever session is
//! currently attached to the physical console (or RDP session) across
//! logon/lock/switch-user transitions. No teacher or example file implements
//! this directly; grounded on this crate's own `monitor.rs`/`capture.rs`
//! "platform poll behind a small trait, fake for tests" shape.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::info;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTransition {
    pub previous: u32,
    pub current: u32,
}

pub trait ConsoleSessionSource: Send + Sync {
    fn active_session_id(&self) -> u32;
}

#[cfg(windows)]
pub struct WindowsConsoleSessionSource;

#[cfg(windows)]
impl ConsoleSessionSource for WindowsConsoleSessionSource {
    fn active_session_id(&self) -> u32 {
        unsafe { windows::Win32::System::RemoteDesktop::WTSGetActiveConsoleSessionId() }
    }
}

/// In-memory fake: the active id is settable from test code via `set`, for
/// non-Windows builds the only implementation.
pub struct FakeConsoleSessionSource {
    current: std::sync::atomic::AtomicU32,
}

impl FakeConsoleSessionSource {
    pub fn new(initial: u32) -> Self {
        Self { current: std::sync::atomic::AtomicU32::new(initial) }
    }

    pub fn set(&self, id: u32) {
        self.current.store(id, std::sync::atomic::Ordering::Relaxed);
    }
}

impl ConsoleSessionSource for FakeConsoleSessionSource {
    fn active_session_id(&self) -> u32 {
        self.current.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl<T: ConsoleSessionSource + ?Sized> ConsoleSessionSource for std::sync::Arc<T> {
    fn active_session_id(&self) -> u32 {
        (**self).active_session_id()
    }
}

#[cfg(windows)]
pub type PlatformConsoleSessionSource = WindowsConsoleSessionSource;
#[cfg(not(windows))]
pub type PlatformConsoleSessionSource = FakeConsoleSessionSource;

/// Polls `source` every [`POLL_INTERVAL`] and pushes a [`SessionTransition`]
/// onto `events_tx` whenever the active session id changes. Runs until
/// `shutdown` observes `true`.
pub async fn run_session0_watcher(
    source: impl ConsoleSessionSource,
    events_tx: mpsc::Sender<SessionTransition>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut current = source.active_session_id();
    while !*shutdown.borrow() {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = shutdown.changed() => break,
        }

        let observed = source.active_session_id();
        if observed != current {
            info!(previous = current, current = observed, "active console session changed");
            let _ = events_tx.send(SessionTransition { previous: current, current: observed }).await;
            current = observed;
        }
    }
}
