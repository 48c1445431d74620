//! Client side of the reconnection protocol, free of any I/O.
//!
//! ```text
//! Connected --(transport lost | maintenance)--> Disconnected
//! Disconnected --schedule--> Waiting(delay) | GaveUp
//! Waiting --backoff elapsed--> Reconnecting
//! Reconnecting --resume accepted--> Connected
//! Reconnecting --token rejected--> ReAuth
//! Reconnecting --attempt failed--> Disconnected
//! Connected --(evicted | session expired)--> ReAuth
//! ReAuth --logged in--> Connected
//! ```

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tracing::debug;

/// Backoff parameters for resuming a dropped session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: usize,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_attempts: 6,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts);
        if self.jitter {
            builder.with_jitter().build()
        } else {
            builder.build()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Disconnected,
    Waiting { attempt: usize, delay: Duration },
    Reconnecting { attempt: usize },
    /// The session is gone; only a fresh login gets back in
    ReAuth,
    /// Every attempt failed
    GaveUp,
}

impl ClientState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ReAuth | Self::GaveUp)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    TransportLost,
    /// The worker announced it is draining
    Maintenance { reconnect_after: Duration },
    BackoffElapsed,
    ResumeAccepted,
    TokenRejected,
    AttemptFailed,
    /// Evicted by a newer login or told the token is no longer valid
    SessionEnded,
    LoggedIn,
}

pub struct ReconnectMachine {
    policy: ReconnectPolicy,
    state: ClientState,
    backoff: Option<ExponentialBackoff>,
    attempts: usize,
    /// Lower bound for the next wait, set by a maintenance notice
    hint: Option<Duration>,
}

impl ReconnectMachine {
    /// Starts in `Connected`: the machine is created after the first login.
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ClientState::Connected,
            backoff: None,
            attempts: 0,
            hint: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ClientState {
        self.state
    }

    #[must_use]
    pub const fn attempts(&self) -> usize {
        self.attempts
    }

    /// Leave `Disconnected`: wait for the next backoff delay, or give up once
    /// the attempts are used up.
    pub fn schedule(&mut self) -> ClientState {
        if self.state != ClientState::Disconnected {
            return self.state;
        }

        let policy = self.policy;
        let next = self.backoff.get_or_insert_with(|| policy.backoff()).next();
        self.state = match next {
            Some(delay) => {
                self.attempts += 1;
                let delay = self.hint.take().map_or(delay, |hint| hint.max(delay));
                ClientState::Waiting {
                    attempt: self.attempts,
                    delay,
                }
            }
            None => ClientState::GaveUp,
        };
        self.state
    }

    /// Apply a signal. Signals that make no sense in the current state are
    /// ignored.
    pub fn handle(&mut self, signal: Signal) -> ClientState {
        let next = match (self.state, signal) {
            (ClientState::Connected, Signal::TransportLost) => Some(ClientState::Disconnected),
            (ClientState::Connected, Signal::Maintenance { reconnect_after }) => {
                self.hint = Some(reconnect_after);
                Some(ClientState::Disconnected)
            }
            (ClientState::Waiting { attempt, .. }, Signal::BackoffElapsed) => {
                Some(ClientState::Reconnecting { attempt })
            }
            (ClientState::Reconnecting { .. }, Signal::ResumeAccepted)
            | (ClientState::ReAuth | ClientState::GaveUp, Signal::LoggedIn) => {
                self.reset();
                Some(ClientState::Connected)
            }
            (ClientState::Reconnecting { .. }, Signal::TokenRejected)
            | (ClientState::Connected, Signal::SessionEnded) => Some(ClientState::ReAuth),
            (ClientState::Reconnecting { .. }, Signal::AttemptFailed) => {
                Some(ClientState::Disconnected)
            }
            _ => None,
        };

        match next {
            Some(state) => self.state = state,
            None => debug!(state = ?self.state, signal = ?signal, "Ignoring signal"),
        }
        self.state
    }

    fn reset(&mut self) {
        self.backoff = None;
        self.attempts = 0;
        self.hint = None;
    }
}
