//! Connection watchdog.
//!
//! A single-shot timer bounding the lifetime of a connection. When it fires
//! it posts [`CentralEvent::WatchdogExpired`] into the central event channel;
//! the state machine decides whether that session still exists.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::gatt::events::{CentralEvent, SessionId};

/// Single-shot timer that requests a forced disconnect on expiry.
#[derive(Debug, Default)]
pub struct ConnectionWatchdog {
    armed: Option<(SessionId, JoinHandle<()>)>,
}

impl ConnectionWatchdog {
    /// Create a disarmed watchdog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the watchdog for `session`, replacing any previous timer.
    pub fn arm(
        &mut self,
        session: SessionId,
        timeout: Duration,
        events: mpsc::UnboundedSender<CentralEvent>,
    ) {
        self.disarm();

        debug!("Arming connection watchdog for session {} ({:?})", session, timeout);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            trace!("Connection watchdog fired for session {}", session);
            // The receiver is gone once the reader shuts down
            let _ = events.send(CentralEvent::WatchdogExpired { session });
        });

        self.armed = Some((session, handle));
    }

    /// Cancel the pending timer, if any.
    pub fn disarm(&mut self) {
        if let Some((session, handle)) = self.armed.take() {
            trace!("Disarming connection watchdog for session {}", session);
            handle.abort();
        }
    }

    /// The session the watchdog is armed for, if it has not fired yet.
    pub fn armed_for(&self) -> Option<SessionId> {
        self.armed
            .as_ref()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(session, _)| *session)
    }
}

impl Drop for ConnectionWatchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}
