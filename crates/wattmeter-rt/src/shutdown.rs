//! ---
//! wm_section: "01-core-functionality"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Process-wide shutdown request flag with async wake-up."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    /// Raised from code rather than a signal, e.g. a fatal link loss.
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Requested => "requested",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Default)]
struct Inner {
    requested: AtomicBool,
    reason: Mutex<Option<ShutdownReason>>,
    notify: Notify,
}

/// Cloneable handle onto a single shutdown request.
///
/// The request is sticky: once triggered it stays set, and every later
/// call to [`ShutdownCoordinator::wait`] returns immediately.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the first request only.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        {
            let mut slot = self.inner.reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.inner.requested.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.inner.reason.lock()
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Registers SIGINT and SIGTERM handlers and forwards the first one
    /// received into this coordinator. Registration errors surface here so
    /// the caller can refuse to start.
    #[cfg(unix)]
    pub fn listen_for_signals(&self) -> std::io::Result<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let coordinator = self.clone();
        Ok(tokio::spawn(async move {
            let reason = tokio::select! {
                _ = interrupt.recv() => ShutdownReason::Interrupt,
                _ = terminate.recv() => ShutdownReason::Terminate,
                _ = coordinator.wait() => return,
            };
            if coordinator.trigger(reason) {
                info!(%reason, "shutdown signal received");
            }
        }))
    }

    #[cfg(not(unix))]
    pub fn listen_for_signals(&self) -> std::io::Result<JoinHandle<()>> {
        let coordinator = self.clone();
        Ok(tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(err) = result {
                        tracing::error!(error = %err, "ctrl-c handler failed");
                        return;
                    }
                }
                _ = coordinator.wait() => return,
            }
            if coordinator.trigger(ShutdownReason::Interrupt) {
                info!(reason = %ShutdownReason::Interrupt, "shutdown signal received");
            }
        }))
    }
}
