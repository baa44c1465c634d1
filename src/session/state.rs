use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReason {
    /// The transport never opened.
    Connection(String),
    /// The server sent an `error` event.
    Server(String),
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReason::Connection(reason) => write!(f, "connection error: {reason}"),
            ErrorReason::Server(message) => write!(f, "server error: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Completed,
    Errored {
        reason: ErrorReason,
    },
    Stopped,
}

/// Inputs that can move a session between states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Start,
    Opened,
    OpenFailed(String),
    CompletionLogged,
    ServerError(String),
    Stop,
    Closed,
}

impl SessionStatus {
    /// The state reached from `self` on `trigger`, or `None` when the trigger
    /// does not apply here.
    #[must_use]
    pub fn next(&self, trigger: &Trigger) -> Option<SessionStatus> {
        use SessionStatus::{Completed, Connecting, Errored, Idle, Stopped, Streaming};

        match (self, trigger) {
            (Idle | Completed | Errored { .. } | Stopped, Trigger::Start) => Some(Connecting),
            (Connecting, Trigger::Opened) => Some(Streaming),
            (Connecting, Trigger::OpenFailed(reason)) => Some(Errored {
                reason: ErrorReason::Connection(reason.clone()),
            }),
            (Streaming, Trigger::CompletionLogged) => Some(Completed),
            (Streaming, Trigger::ServerError(message)) => Some(Errored {
                reason: ErrorReason::Server(message.clone()),
            }),
            (Connecting | Streaming, Trigger::Stop) => Some(Stopped),
            // The transport cannot tell a finished server from a dropped
            // network, so an unannounced close is treated as a silent stop.
            (Connecting | Streaming, Trigger::Closed) => Some(Idle),
            _ => None,
        }
    }

    /// Whether a connection is (or is about to be) live.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Connecting | SessionStatus::Streaming)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Errored { .. } | SessionStatus::Stopped
        )
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Streaming => "streaming",
            SessionStatus::Completed => "completed",
            SessionStatus::Errored { .. } => "errored",
            SessionStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Errored { reason } => write!(f, "errored ({reason})"),
            other => f.write_str(other.label()),
        }
    }
}
