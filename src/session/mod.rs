mod log;
mod state;

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::model::SessionConfig;
use crate::prompt_history::PromptHistory;
use crate::protocol::{self, COMPLETION_SENTINEL, ServerEvent};
use crate::store::ResultStore;
use crate::transport::{Connection, Transport, TransportError, TransportEvent};

pub use log::{LogLine, LogSink};
pub use state::{ErrorReason, SessionStatus, Trigger};

pub const STOPPED_BY_USER: &str = "Simulation stopped by user.";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to encode session configuration")]
    Encode(#[from] serde_json::Error),
    #[error("failed to open connection")]
    Connection(#[from] TransportError),
}

/// Owns the live connection and folds its events into the session stores.
///
/// At most one connection exists at a time; it is present exactly while the
/// status is `Connecting` or `Streaming`.
pub struct SessionController<T: Transport> {
    transport: T,
    connection: Option<Connection>,
    status: SessionStatus,
    config: Option<SessionConfig>,
    results: ResultStore,
    prompts: PromptHistory,
    log: LogSink,
    protocol_errors: usize,
}

impl<T: Transport> SessionController<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            connection: None,
            status: SessionStatus::Idle,
            config: None,
            results: ResultStore::new(),
            prompts: PromptHistory::new(),
            log: LogSink::default(),
            protocol_errors: 0,
        }
    }

    /// Start a fresh session, replacing whatever ran before.
    ///
    /// # Errors
    ///
    /// Returns an error, without touching the current session, when the
    /// configuration is invalid. Returns [`SessionError::Connection`] when the
    /// transport refuses to open; the session is then `Errored`.
    pub fn start(&mut self, config: SessionConfig) -> Result<(), SessionError> {
        config.validate().map_err(SessionError::InvalidConfig)?;
        let payload = config.wire_payload()?;

        if self.connection.is_some() {
            debug!("closing previous connection before restart");
            self.stop();
        }

        self.results.clear();
        self.prompts.clear();
        self.log.clear();
        self.protocol_errors = 0;
        self.apply(&Trigger::Start);

        info!(
            model = %config.model_name,
            max_cycles = config.max_cycles,
            batch_size = config.batch_size,
            "starting simulation session"
        );
        self.config = Some(config);

        match self.transport.open(payload) {
            Ok(connection) => {
                self.connection = Some(connection);
                Ok(())
            }
            Err(err) => {
                self.fail_connection(&err.to_string());
                Err(err.into())
            }
        }
    }

    /// Cancel the running session. Does nothing unless one is active.
    pub fn stop(&mut self) {
        if !self.status.is_active() {
            return;
        }
        self.release();
        self.log.push(STOPPED_BY_USER);
        self.apply(&Trigger::Stop);
        info!("simulation stopped by user");
    }

    /// Handle every notification already queued, without blocking.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.connection.as_ref().and_then(Connection::try_next) {
            self.handle_transport_event(event);
            handled += 1;
        }
        handled
    }

    /// Block up to `timeout` for the next notification, then drain the rest.
    pub fn wait(&mut self, timeout: Duration) -> usize {
        let Some(event) = self
            .connection
            .as_ref()
            .and_then(|connection| connection.next_timeout(timeout))
        else {
            return 0;
        };
        self.handle_transport_event(event);
        1 + self.pump()
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.apply(&Trigger::Opened) {
                    info!("session streaming");
                }
            }
            TransportEvent::Message(frame) => {
                if self.status == SessionStatus::Streaming {
                    self.dispatch_frame(&frame);
                } else {
                    debug!(status = %self.status, "ignoring frame outside streaming");
                }
            }
            TransportEvent::Failed(reason) => {
                if self.status == SessionStatus::Connecting {
                    self.fail_connection(&reason);
                }
            }
            TransportEvent::Closed => {
                if self.apply(&Trigger::Closed) {
                    info!("connection closed without a final event");
                }
                self.release();
            }
        }
    }

    fn dispatch_frame(&mut self, frame: &str) {
        match protocol::decode(frame) {
            Ok(event) => self.dispatch(event),
            Err(err) => {
                self.protocol_errors += 1;
                warn!(error = %err, "dropping malformed event");
            }
        }
    }

    /// Apply one decoded server event. Ignored unless the session is streaming.
    pub fn dispatch(&mut self, event: ServerEvent) {
        if self.status != SessionStatus::Streaming {
            debug!(kind = event.kind(), "ignoring event outside streaming");
            return;
        }

        match event {
            ServerEvent::Log { message } => {
                let finished = message.contains(COMPLETION_SENTINEL);
                self.log.push(message);
                if finished {
                    self.apply(&Trigger::CompletionLogged);
                    self.release();
                    info!(results = self.results.len(), "simulation complete");
                }
            }
            ServerEvent::Result(result) => {
                debug!(
                    cycle = result.cycle,
                    score = result.score,
                    passed = result.passed,
                    "scenario result"
                );
                self.results.append(result);
            }
            ServerEvent::Optimization(entry) => {
                debug!(cycle = entry.cycle, "prompt revised");
                self.prompts.append(entry);
            }
            ServerEvent::Error { message } => {
                warn!(%message, "server reported an error");
                self.log.push(format!("ERROR: {message}"));
                self.apply(&Trigger::ServerError(message));
                self.release();
            }
            ServerEvent::Unknown => debug!("ignoring unknown event type"),
        }
    }

    fn fail_connection(&mut self, reason: &str) {
        warn!(%reason, "connection failed");
        self.log.push(format!("ERROR: connection failed: {reason}"));
        self.apply(&Trigger::OpenFailed(reason.to_string()));
        self.release();
    }

    fn apply(&mut self, trigger: &Trigger) -> bool {
        match self.status.next(trigger) {
            Some(next) => {
                debug!(from = %self.status, to = %next, "session transition");
                self.status = next;
                true
            }
            None => false,
        }
    }

    /// Drop the connection if there is one. Safe to call repeatedly.
    fn release(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }

    #[must_use]
    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status.is_active()
    }

    #[must_use]
    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    #[must_use]
    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    #[must_use]
    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    #[must_use]
    pub fn prompts(&self) -> &PromptHistory {
        &self.prompts
    }

    #[must_use]
    pub fn log(&self) -> &LogSink {
        &self.log
    }

    #[must_use]
    pub fn protocol_errors(&self) -> usize {
        self.protocol_errors
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T: Transport> Drop for SessionController<T> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests;
