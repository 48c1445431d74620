//! Network driver that follows [`ReconnectMachine`] across worker restarts.

use std::time::Duration;

use chatfleet_core::models::{ChatMessage, Identity};
use chatfleet_core::protocol::{ClientCodec, ClientFrame, RejectReason, ServerFrame};
use chatfleet_core::{Error, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::state::{ClientState, ReconnectMachine, ReconnectPolicy, Signal};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Address of the worker fleet (usually a load balancer)
    pub server: String,
    pub policy: ReconnectPolicy,
    pub max_frame_bytes: usize,
    /// Upper bound on connecting plus the handshake
    pub handshake_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:5000".to_string(),
            policy: ReconnectPolicy::default(),
            max_frame_bytes: 64 * 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Create the account instead of logging in
    pub signup: bool,
}

impl Credentials {
    fn frame(&self) -> ClientFrame {
        let username = self.username.clone();
        let password = self.password.clone();
        if self.signup {
            ClientFrame::Signup { username, password }
        } else {
            ClientFrame::Login { username, password }
        }
    }
}

/// What the application sees from [`ResilientClient::next_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientUpdate {
    Frame(ServerFrame),
    /// The worker is going away; a reconnect follows
    Maintenance { reconnect_after: Duration },
    /// The session was resumed, possibly on another worker
    Reconnected { pending: Vec<ChatMessage> },
    /// The session ended for good; log in again
    LoginRequired,
    /// Could not reconnect, please log in again
    GaveUp,
    /// This login was taken over by a newer one
    Evicted,
}

type Transport = Framed<TcpStream, ClientCodec>;

pub struct ResilientClient {
    options: ClientOptions,
    machine: ReconnectMachine,
    transport: Option<Transport>,
    identity: Identity,
    token: String,
}

impl ResilientClient {
    /// Connect and log in. Returns the client and the messages that were
    /// queued while the user was offline.
    pub async fn connect(
        options: ClientOptions,
        credentials: &Credentials,
    ) -> Result<(Self, Vec<ChatMessage>)> {
        let (transport, identity, token, pending) =
            handshake(&options, credentials.frame()).await?;
        info!(username = %identity.username, "Logged in");

        let client = Self {
            machine: ReconnectMachine::new(options.policy),
            options,
            transport: Some(transport),
            identity,
            token,
        };
        Ok((client, pending))
    }

    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Current session token, replaced on every login.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub const fn state(&self) -> ClientState {
        self.machine.state()
    }

    /// Log in again after the session was lost.
    pub async fn login(&mut self, credentials: &Credentials) -> Result<Vec<ChatMessage>> {
        let (transport, identity, token, pending) =
            handshake(&self.options, credentials.frame()).await?;
        self.transport = Some(transport);
        self.identity = identity;
        self.token = token;
        self.machine.handle(Signal::LoggedIn);
        Ok(pending)
    }

    /// Send a frame. A broken transport is reported on the next
    /// [`Self::next_update`] call, which reconnects.
    pub async fn send(&mut self, frame: ClientFrame) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(Error::Protocol("Not connected".to_string()));
        };
        if let Err(e) = transport.send(frame).await {
            warn!(error = %e, "Send failed, connection lost");
            self.transport = None;
            return Err(e);
        }
        Ok(())
    }

    /// Wait for the next server frame. Transport loss and maintenance
    /// notices are handled here by resuming the session.
    ///
    /// Cancel safe: a reconnect interrupted by dropping the future carries
    /// on with the next attempt on the following call.
    pub async fn next_update(&mut self) -> ClientUpdate {
        if self.machine.state().is_terminal() {
            return self.terminal_update();
        }

        let Some(transport) = self.transport.as_mut() else {
            self.machine.handle(Signal::TransportLost);
            return self.reconnect().await;
        };

        match transport.next().await {
            Some(Ok(Ok(ServerFrame::Maintenance { reconnect_after_ms }))) => {
                let reconnect_after = Duration::from_millis(reconnect_after_ms);
                info!(?reconnect_after, "Server entering maintenance");
                self.transport = None;
                self.machine.handle(Signal::Maintenance { reconnect_after });
                ClientUpdate::Maintenance { reconnect_after }
            }
            Some(Ok(Ok(ServerFrame::Evicted))) => {
                info!("Session taken over by another login");
                self.transport = None;
                self.machine.handle(Signal::SessionEnded);
                ClientUpdate::Evicted
            }
            Some(Ok(Ok(ServerFrame::Rejected {
                reason: RejectReason::InvalidToken,
                ..
            }))) => {
                info!("Session expired, login required");
                self.transport = None;
                self.machine.handle(Signal::SessionEnded);
                ClientUpdate::LoginRequired
            }
            Some(Ok(Ok(frame))) => ClientUpdate::Frame(frame),
            Some(Ok(Err(e))) => {
                debug!(error = %e, "Ignoring undecodable frame");
                ClientUpdate::Frame(ServerFrame::error(format!("Undecodable frame: {e}")))
            }
            Some(Err(e)) => {
                warn!(error = %e, "Connection lost");
                self.transport = None;
                self.machine.handle(Signal::TransportLost);
                self.reconnect().await
            }
            None => {
                warn!("Connection closed by server");
                self.transport = None;
                self.machine.handle(Signal::TransportLost);
                self.reconnect().await
            }
        }
    }

    /// Close the connection after a logout.
    pub async fn logout(mut self) -> Result<()> {
        self.send(ClientFrame::Logout).await?;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await?;
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> ClientUpdate {
        // A previous call was dropped mid-attempt
        if matches!(self.machine.state(), ClientState::Reconnecting { .. }) {
            self.machine.handle(Signal::AttemptFailed);
        }

        loop {
            let (attempt, delay) = match self.machine.schedule() {
                ClientState::Waiting { attempt, delay } => (attempt, delay),
                _ => return self.terminal_update(),
            };
            info!(attempt, ?delay, "Reconnecting after backoff");
            tokio::time::sleep(delay).await;
            self.machine.handle(Signal::BackoffElapsed);

            let resume = ClientFrame::Resume {
                token: self.token.clone(),
            };
            match handshake(&self.options, resume).await {
                Ok((transport, identity, token, pending)) => {
                    info!(attempt, flushed = pending.len(), "Session resumed");
                    self.transport = Some(transport);
                    self.identity = identity;
                    self.token = token;
                    self.machine.handle(Signal::ResumeAccepted);
                    return ClientUpdate::Reconnected { pending };
                }
                Err(Error::InvalidToken) => {
                    info!("Session expired, login required");
                    self.machine.handle(Signal::TokenRejected);
                    return ClientUpdate::LoginRequired;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    self.machine.handle(Signal::AttemptFailed);
                }
            }
        }
    }

    fn terminal_update(&self) -> ClientUpdate {
        match self.machine.state() {
            ClientState::GaveUp => ClientUpdate::GaveUp,
            _ => ClientUpdate::LoginRequired,
        }
    }
}

/// Open a transport and run one login, signup or resume exchange.
async fn handshake(
    options: &ClientOptions,
    frame: ClientFrame,
) -> Result<(Transport, Identity, String, Vec<ChatMessage>)> {
    tokio::time::timeout(options.handshake_timeout, open_session(options, frame))
        .await
        .map_err(|_| Error::Protocol("Handshake timed out".to_string()))?
}

async fn open_session(
    options: &ClientOptions,
    frame: ClientFrame,
) -> Result<(Transport, Identity, String, Vec<ChatMessage>)> {
    let stream = TcpStream::connect(options.server.as_str()).await?;
    stream.set_nodelay(true)?;
    let mut transport = Framed::new(stream, ClientCodec::new(options.max_frame_bytes));
    transport.send(frame).await?;

    loop {
        match transport.next().await {
            Some(Ok(Ok(ServerFrame::Accepted {
                identity,
                token,
                pending,
            }))) => {
                let pending = read_pending(&mut transport, pending).await?;
                return Ok((transport, identity, token, pending));
            }
            Some(Ok(Ok(ServerFrame::Rejected { reason, message }))) => {
                return Err(match reason {
                    RejectReason::InvalidToken => Error::InvalidToken,
                    RejectReason::InvalidCredentials => Error::Authentication(message),
                    RejectReason::Draining | RejectReason::Unavailable => Error::Protocol(message),
                });
            }
            Some(Ok(Ok(other))) => debug!(frame = ?other, "Ignoring frame during handshake"),
            Some(Ok(Err(e))) => return Err(e.into()),
            Some(Err(e)) => return Err(e),
            None => {
                return Err(Error::Protocol(
                    "Connection closed during handshake".to_string(),
                ))
            }
        }
    }
}

/// Read the queued messages announced by an acceptance.
async fn read_pending(transport: &mut Transport, count: usize) -> Result<Vec<ChatMessage>> {
    let mut pending = Vec::new();
    while pending.len() < count {
        match transport.next().await {
            Some(Ok(Ok(ServerFrame::Message(message)))) => pending.push(message),
            Some(Ok(Ok(other))) => {
                return Err(Error::Protocol(format!(
                    "Expected a queued message, got {other:?}"
                )))
            }
            Some(Ok(Err(e))) => return Err(e.into()),
            Some(Err(e)) => return Err(e),
            None => {
                return Err(Error::Protocol(
                    "Connection closed while flushing queued messages".to_string(),
                ))
            }
        }
    }
    Ok(pending)
}
