//! Wallet-side single-session state machine.
//!
//! State transitions:
//!   Idle -> Handshaking      (inbound connection admitted)
//!   Handshaking -> Active    (handshake complete)
//!   Active -> Closing        (channel closing)
//!   any -> Idle              (lease released)
//!
//! A connection arriving in any state other than Idle is refused with
//! `SessionBusy`. The gate is owned by the listening endpoint and handed to
//! the accept path; there is no process-wide instance.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Locally assigned id of an admitted session.
pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Handshaking,
    Active(SessionId),
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Handshaking => f.write_str("handshaking"),
            SessionState::Active(id) => write!(f, "active({id})"),
            SessionState::Closing => f.write_str("closing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session busy ({state})")]
pub struct SessionBusy {
    pub state: SessionState,
}

#[derive(Debug)]
pub struct SessionGate {
    state: watch::Sender<SessionState>,
    next_id: AtomicU64,
}

impl SessionGate {
    pub fn new() -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Idle);
        Arc::new(Self {
            state,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Admit a new session if idle.
    pub fn try_begin(self: &Arc<Self>) -> Result<SessionLease, SessionBusy> {
        let mut current = SessionState::Idle;
        let admitted = self.state.send_if_modified(|state| {
            current = *state;
            if *state == SessionState::Idle {
                *state = SessionState::Handshaking;
                true
            } else {
                false
            }
        });
        if !admitted {
            return Err(SessionBusy { state: current });
        }
        Ok(SessionLease {
            gate: self.clone(),
            session_id: self.next_id.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Wait until the gate is idle again. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let idle = tokio::time::timeout(timeout, rx.wait_for(|s| *s == SessionState::Idle))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        idle
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

/// Admission of one session. Dropping it returns the gate to `Idle`.
#[derive(Debug)]
pub struct SessionLease {
    gate: Arc<SessionGate>,
    session_id: SessionId,
}

impl SessionLease {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Handshaking -> Active.
    pub fn activate(&self) {
        if !self
            .gate
            .transition(SessionState::Handshaking, SessionState::Active(self.session_id))
        {
            tracing::warn!(session = self.session_id, state = %self.gate.state(), "activate from unexpected state");
        }
    }

    /// Active -> Closing.
    pub fn begin_close(&self) {
        self.gate.transition(
            SessionState::Active(self.session_id),
            SessionState::Closing,
        );
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.gate.state.send_replace(SessionState::Idle);
        tracing::debug!(session = self.session_id, "session released");
    }
}
