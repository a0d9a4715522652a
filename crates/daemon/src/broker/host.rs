//! Hooks into whatever hosts the broker process.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Actions the broker delegates to its host.
pub trait HostEnvironment: Send + Sync {
    /// Bring the session list in front of the user.
    fn present_session_list(&self);

    /// Keep the machine awake while sessions run, or stop doing so.
    fn set_wake_lock(&self, held: bool);

    /// The broker is terminating; tear down the surrounding service.
    fn stop_service(&self);
}

/// Host that only logs. Used by the standalone daemon.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHost;

impl HostEnvironment for LoggingHost {
    fn present_session_list(&self) {
        tracing::info!("session list requested");
    }

    fn set_wake_lock(&self, held: bool) {
        tracing::info!(held, "wake lock changed");
    }

    fn stop_service(&self) {
        tracing::info!("service stop requested");
    }
}

/// Host recording every call, for tests and embedding.
#[derive(Debug, Default)]
pub struct RecordingHost {
    pub presented: AtomicUsize,
    pub wake_lock: AtomicBool,
    pub stopped: AtomicBool,
}

impl HostEnvironment for RecordingHost {
    fn present_session_list(&self) {
        self.presented.fetch_add(1, Ordering::SeqCst);
    }

    fn set_wake_lock(&self, held: bool) {
        self.wake_lock.store(held, Ordering::SeqCst);
    }

    fn stop_service(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
