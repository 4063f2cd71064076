use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::{error::FailureReason, quality::Mode};

/// The playback session negotiated for one broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastSession {
    pub channel_id: String,
    /// JWT handed out by the control server, `None` until connected.
    pub control_token: Option<String>,
    pub user_id: Option<String>,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
}

impl BroadcastSession {
    pub fn new(channel_id: impl Into<String>, mode: Mode) -> Self {
        Self {
            channel_id: channel_id.into(),
            control_token: None,
            user_id: None,
            mode,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    WaitingForLive,
    Negotiating,
    Downloading,
    QualityFallback,
    Stopping,
    Stopped,
    Failed(FailureReason),
}

impl AcquisitionState {
    /// States that own a [`BroadcastSession`].
    pub fn requires_session(&self) -> bool {
        matches!(
            self,
            Self::Negotiating | Self::Downloading | Self::QualityFallback
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }

    fn can_become(&self, next: &AcquisitionState) -> bool {
        use AcquisitionState::*;

        if matches!(next, Failed(_)) {
            return !self.is_terminal();
        }
        match self {
            Idle => matches!(next, WaitingForLive | Negotiating | Stopping),
            WaitingForLive => matches!(next, Negotiating | Stopping),
            Negotiating => matches!(next, Negotiating | Downloading | QualityFallback | Stopping),
            QualityFallback => matches!(next, Negotiating | Downloading | Stopping),
            Downloading => matches!(next, Negotiating | Stopping),
            Stopping => matches!(next, Stopped),
            Stopped | Failed(_) => false,
        }
    }
}

/// Owns the current state and session, and publishes every transition.
pub struct StateTracker {
    state: watch::Sender<AcquisitionState>,
    history: Vec<AcquisitionState>,
    session: Option<BroadcastSession>,
}

impl StateTracker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(AcquisitionState::Idle);
        Self {
            state,
            history: vec![AcquisitionState::Idle],
            session: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AcquisitionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> AcquisitionState {
        *self.state.borrow()
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn history(&self) -> &[AcquisitionState] {
        &self.history
    }

    pub fn session(&self) -> Option<&BroadcastSession> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut BroadcastSession> {
        self.session.as_mut()
    }

    /// Starts negotiating with a fresh session.
    pub fn begin(&mut self, session: BroadcastSession) {
        self.session = Some(session);
        self.transition(AcquisitionState::Negotiating);
    }

    /// Moves to `next`. Leaving the session states discards the session.
    pub fn transition(&mut self, next: AcquisitionState) {
        let current = self.state();
        if !current.can_become(&next) {
            log::error!("Unexpected state transition {current:?} -> {next:?}");
            debug_assert!(false, "unexpected state transition {current:?} -> {next:?}");
        }

        if !next.requires_session() {
            self.session = None;
        }
        if next.requires_session() != self.session.is_some() {
            log::error!("State {next:?} entered with session {:?}", self.session);
            debug_assert!(false, "session does not match state {next:?}");
        }

        log::debug!("{current:?} -> {next:?}");
        self.history.push(next);
        self.state.send_replace(next);
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}
