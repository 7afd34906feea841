//! Session lifecycle state.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Lifecycle of one server session.
///
/// `NotStarted → Starting → Initialized → ShuttingDown → Terminated`, with a
/// shortcut to `Terminated` from any state when the process dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Starting,
    Initialized,
    ShuttingDown,
    Terminated,
}

impl SessionState {
    #[must_use]
    pub fn is_ready(self) -> bool {
        self == Self::Initialized
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Terminated
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Initialized => "initialized",
            Self::ShuttingDown => "shutting down",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable session state.
///
/// Every component that can end a session (receive loop, exit watcher,
/// `shutdown`) holds a clone. `Terminated` is absorbing.
#[derive(Debug, Clone)]
pub(crate) struct SessionCell {
    tx: Arc<watch::Sender<SessionState>>,
}

impl SessionCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::NotStarted);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Move from `from` to `to`. Returns `false` (and changes nothing) when
    /// the current state is not `from` or the session already terminated.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == from && !state.is_terminal() {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Unconditionally end the session. Returns `true` on the first call.
    pub fn terminate(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = SessionState::Terminated;
                true
            }
        })
    }

    /// Resolve once the session reaches `Terminated`.
    pub async fn terminated(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn transitions_only_from_expected_state() {
        let cell = SessionCell::new();
        assert!(!cell.transition(SessionState::Starting, SessionState::Initialized));
        assert_eq!(cell.get(), SessionState::NotStarted);
        assert!(cell.transition(SessionState::NotStarted, SessionState::Starting));
        assert!(cell.transition(SessionState::Starting, SessionState::Initialized));
        assert!(cell.get().is_ready());
    }

    #[test]
    fn terminated_is_absorbing() {
        let cell = SessionCell::new();
        assert!(cell.terminate());
        assert!(!cell.terminate());
        assert!(!cell.transition(SessionState::Terminated, SessionState::Starting));
        assert!(!cell.transition(SessionState::NotStarted, SessionState::Starting));
        assert_eq!(cell.get(), SessionState::Terminated);
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(SessionState::ShuttingDown.to_string(), "shutting down");
        assert_eq!(SessionState::Initialized.to_string(), "initialized");
    }

    #[tokio::test]
    async fn terminated_wakes_waiters() {
        let cell = SessionCell::new();
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.terminated().await })
        };
        cell.transition(SessionState::NotStarted, SessionState::Starting);
        cell.terminate();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
