//! Client wire protocol: one JSON object per line.

use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::models::{ChatMessage, Identity};
use crate::Error;

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Login { username: String, password: String },
    Signup { username: String, password: String },
    /// Reattach to an existing session without credentials
    Resume { token: String },
    Send { to: String, body: String },
    /// Archived conversation with another user, newest `limit` messages
    History {
        with: String,
        #[serde(default)]
        limit: Option<usize>,
    },
    Heartbeat,
    ListOnline,
    Logout,
}

/// Why a login, signup or resume was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The token is unknown, expired or superseded. Log in again.
    InvalidToken,
    InvalidCredentials,
    /// The worker is shutting down. Try another one.
    Draining,
    /// Shared state is unreachable. Retrying may help.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Handed to the recipient's connection
    Delivered,
    /// Saved for an offline recipient
    Queued,
}

/// Frames sent by workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Accepted {
        identity: Identity,
        token: String,
        /// Number of queued messages that follow right after this frame as
        /// `message` frames, oldest first
        pending: usize,
    },
    Rejected {
        reason: RejectReason,
        message: String,
    },
    Message(ChatMessage),
    Sent {
        to: String,
        message_id: String,
        status: DeliveryStatus,
    },
    Online {
        users: Vec<String>,
    },
    /// Archived messages between the user and `with`, oldest first
    History {
        with: String,
        messages: Vec<ChatMessage>,
    },
    /// The worker is draining; reconnect after the given delay.
    Maintenance {
        reconnect_after_ms: u64,
    },
    /// A newer login for the same user took over this connection.
    Evicted,
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        Self::Rejected {
            reason,
            message: message.into(),
        }
    }

    /// Length of the encoded line without its newline.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        serde_json::to_string(self).map_or(usize::MAX, |line| line.len())
    }

    /// A history frame holding the newest of `messages` that fit in
    /// `max_frame_bytes`.
    #[must_use]
    pub fn history(
        with: impl Into<String>,
        messages: Vec<ChatMessage>,
        max_frame_bytes: usize,
    ) -> Self {
        let mut frame = Self::History {
            with: with.into(),
            messages,
        };
        while frame.encoded_len() > max_frame_bytes {
            let Self::History { messages, .. } = &mut frame else {
                break;
            };
            if messages.is_empty() {
                break;
            }
            messages.remove(0);
        }
        frame
    }
}

/// Newline-delimited JSON codec.
///
/// Decoding yields `Ok(Err(_))` for a line that is not a valid frame, so a
/// connection can answer with an error frame and keep reading. Oversized
/// lines and I/O failures end the stream. Both ends share the same limit, so
/// encoding refuses lines the peer would reject and writes nothing.
pub struct JsonLinesCodec<In, Out> {
    lines: LinesCodec,
    max_frame_bytes: usize,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> JsonLinesCodec<In, Out> {
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_frame_bytes),
            max_frame_bytes,
            _marker: PhantomData,
        }
    }

    fn parse(line: Option<String>) -> Option<Result<In, serde_json::Error>>
    where
        In: DeserializeOwned,
    {
        line.map(|line| serde_json::from_str(line.trim()))
    }
}

/// Codec used by workers.
pub type ServerCodec = JsonLinesCodec<ClientFrame, ServerFrame>;
/// Codec used by clients.
pub type ClientCodec = JsonLinesCodec<ServerFrame, ClientFrame>;

fn map_lines_error(err: LinesCodecError) -> Error {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            Error::Protocol("Frame exceeds maximum length".to_string())
        }
        LinesCodecError::Io(e) => Error::Io(e),
    }
}

impl<In: DeserializeOwned, Out> Decoder for JsonLinesCodec<In, Out> {
    type Item = Result<In, serde_json::Error>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode(src).map_err(map_lines_error)? {
                Some(line) if line.trim().is_empty() => continue,
                line => return Ok(Self::parse(line)),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode_eof(src).map_err(map_lines_error)? {
                Some(line) if line.trim().is_empty() => continue,
                line => return Ok(Self::parse(line)),
            }
        }
    }
}

impl<In, Out: Serialize> Encoder<Out> for JsonLinesCodec<In, Out> {
    type Error = Error;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&item)?;
        if line.len() > self.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                len: line.len(),
                max: self.max_frame_bytes,
            });
        }
        self.lines.encode(line, dst).map_err(map_lines_error)
    }
}
