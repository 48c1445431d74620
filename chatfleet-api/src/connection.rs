//! One client connection: handshake, then a reader loop and a writer task
//! joined by a bounded outgoing queue.

use std::net::SocketAddr;
use std::time::Duration;

use chatfleet_cluster::ConnectionHandle;
use chatfleet_core::models::{ChatMessage, Identity, PresenceEntry};
use chatfleet_core::protocol::{ClientFrame, RejectReason, ServerCodec, ServerFrame};
use chatfleet_core::service::DEFAULT_HISTORY_LIMIT;
use chatfleet_core::Error;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::context::WorkerContext;

type FrameSink = SplitSink<Framed<TcpStream, ServerCodec>, ServerFrame>;
type FrameStream = SplitStream<Framed<TcpStream, ServerCodec>>;

/// Serve a client until it disconnects, logs out or is closed by the worker.
pub async fn handle_connection(ctx: WorkerContext, stream: TcpStream, peer: SocketAddr) {
    let span = tracing::info_span!("connection", peer = %peer, worker_id = %ctx.worker_id);
    async move {
        let framed = Framed::new(stream, ServerCodec::new(ctx.settings.max_frame_bytes));
        let (mut sink, mut frames) = framed.split();

        let Some((identity, token)) = authenticate(&ctx, &mut sink, &mut frames).await else {
            debug!("Connection closed before authentication");
            return;
        };

        if let Err(e) = serve(&ctx, sink, frames, identity, token).await {
            debug!(error = %e, "Connection ended with error");
        }
    }
    .instrument(span)
    .await;
}

/// Read frames until a login, signup or resume succeeds.
async fn authenticate(
    ctx: &WorkerContext,
    sink: &mut FrameSink,
    frames: &mut FrameStream,
) -> Option<(Identity, String)> {
    while let Some(item) = frames.next().await {
        let frame = match item {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                sink.send(ServerFrame::error(format!("Malformed frame: {e}")))
                    .await
                    .ok()?;
                continue;
            }
            Err(e) => {
                debug!(error = %e, "Read failed during handshake");
                return None;
            }
        };

        if !ctx.lifecycle.is_active() {
            let _ = sink
                .send(ServerFrame::rejected(
                    RejectReason::Draining,
                    "Server is shutting down, connect to another server",
                ))
                .await;
            return None;
        }

        let result = match frame {
            ClientFrame::Login { username, password } => {
                login(ctx, &username, &password, false).await
            }
            ClientFrame::Signup { username, password } => {
                login(ctx, &username, &password, true).await
            }
            ClientFrame::Resume { token } => ctx
                .sessions
                .validate(&token)
                .await
                .map(|identity| (identity, token)),
            _ => {
                sink.send(ServerFrame::error("Log in first")).await.ok()?;
                continue;
            }
        };

        match result {
            Ok(accepted) => return Some(accepted),
            Err(e) => {
                let (reason, message) = rejection(&e);
                debug!(error = %e, reason = ?reason, "Handshake rejected");
                sink.send(ServerFrame::rejected(reason, message)).await.ok()?;
            }
        }
    }
    None
}

async fn login(
    ctx: &WorkerContext,
    username: &str,
    password: &str,
    signup: bool,
) -> chatfleet_core::Result<(Identity, String)> {
    let identity = if signup {
        ctx.verifier.register(username, password).await?
    } else {
        ctx.verifier.verify(username, password).await?
    };
    let token = ctx.sessions.issue(&identity).await?;
    Ok((identity, token))
}

fn rejection(err: &Error) -> (RejectReason, String) {
    match err {
        Error::InvalidToken => (
            RejectReason::InvalidToken,
            "Session expired, please log in again".to_string(),
        ),
        Error::Authentication(message) => (RejectReason::InvalidCredentials, message.clone()),
        e if e.is_retryable() => (
            RejectReason::Unavailable,
            "Service temporarily unavailable, try again".to_string(),
        ),
        e => (RejectReason::Unavailable, e.to_string()),
    }
}

async fn serve(
    ctx: &WorkerContext,
    mut sink: FrameSink,
    mut frames: FrameStream,
    identity: Identity,
    token: String,
) -> chatfleet_core::Result<()> {
    let username = identity.username.clone();
    let settings = &ctx.settings;

    // The local handle exists before presence so a drain that starts during
    // the rest of the handshake closes this connection too
    let entry = PresenceEntry::new(&username, &ctx.worker_id, Some(identity.user_id));
    let (tx, rx) = mpsc::channel(settings.outgoing_queue_capacity);
    let cancel = CancellationToken::new();
    let handle = ConnectionHandle::new(entry.clone(), tx.clone(), cancel.clone());
    let connection_id = handle.connection_id.clone();
    ctx.connections.register(handle);

    if !ctx.lifecycle.is_active() {
        ctx.connections.unregister(&username, &connection_id);
        let rejected = ServerFrame::rejected(
            RejectReason::Draining,
            "Server is shutting down, connect to another server",
        );
        let _ = write_frame(&mut sink, rejected, settings.write_timeout, &cancel).await;
        return Ok(());
    }

    if let Err(e) = ctx.presence.register_entry(entry.clone()).await {
        ctx.connections.unregister(&username, &connection_id);
        let (reason, message) = rejection(&e);
        let rejected = ServerFrame::rejected(reason, message);
        let _ = write_frame(&mut sink, rejected, settings.write_timeout, &cancel).await;
        return Err(e);
    }

    let result = match flush_pending(ctx, &mut sink, &cancel, identity, &token).await {
        Ok(flushed) => {
            info!(
                username = %username,
                connection_id = %connection_id,
                flushed,
                "Client accepted"
            );
            let writer = tokio::spawn(
                write_loop(sink, rx, cancel.clone(), settings.write_timeout).in_current_span(),
            );

            // Messages queued after the first read but before the connection
            // was registered locally
            match ctx.router.take_pending(&username).await {
                Ok(late) => {
                    for message in late {
                        let message_id = message.message_id.clone();
                        if tx.send(ServerFrame::Message(message)).await.is_err() {
                            break;
                        }
                        ctx.router.mark_flushed(&username, &message_id);
                    }
                }
                Err(e) => {
                    warn!(error = %e, username = %username, "Failed to read pending messages");
                }
            }

            let result = read_loop(ctx, &mut frames, &tx, &cancel, &username, &token).await;
            cancel.cancel();
            drop(tx);
            let _ = writer.await;
            result
        }
        Err(e) => Err(e),
    };

    // Presence goes first so a draining worker never sees the connection
    // gone while its entry is still in the store
    cancel.cancel();
    if let Err(e) = ctx.presence.unregister_if_owned(&entry).await {
        warn!(error = %e, username = %username, "Failed to remove presence entry");
    }
    ctx.connections.unregister(&username, &connection_id);

    info!(username = %username, connection_id = %connection_id, "Client disconnected");
    result
}

/// Send the acceptance followed by every queued message, one frame each.
/// Messages not written are put back in the pending queue.
async fn flush_pending(
    ctx: &WorkerContext,
    sink: &mut FrameSink,
    cancel: &CancellationToken,
    identity: Identity,
    token: &str,
) -> chatfleet_core::Result<usize> {
    let settings = &ctx.settings;
    let username = identity.username.clone();

    let mut pending = ctx.router.take_pending(&username).await.unwrap_or_else(|e| {
        warn!(error = %e, username = %username, "Failed to read pending messages");
        Vec::new()
    });
    pending.retain(|message| {
        let len = ServerFrame::Message(message.clone()).encoded_len();
        if len > settings.max_frame_bytes {
            warn!(
                username = %username,
                message_id = %message.message_id,
                len,
                "Dropping queued message larger than a frame"
            );
            return false;
        }
        true
    });

    let accepted = ServerFrame::Accepted {
        identity,
        token: token.to_string(),
        pending: pending.len(),
    };
    if let Err(e) = write_frame(sink, accepted, settings.write_timeout, cancel).await {
        requeue(ctx, &username, pending).await;
        return Err(e);
    }

    let mut written = 0;
    let mut failure = None;
    for message in &pending {
        let frame = ServerFrame::Message(message.clone());
        if let Err(e) = write_frame(sink, frame, settings.write_timeout, cancel).await {
            failure = Some(e);
            break;
        }
        ctx.router.mark_flushed(&username, &message.message_id);
        written += 1;
    }

    if let Some(e) = failure {
        requeue(ctx, &username, pending.split_off(written)).await;
        return Err(e);
    }
    Ok(written)
}

async fn requeue(ctx: &WorkerContext, username: &str, messages: Vec<ChatMessage>) {
    let count = messages.len();
    if let Err(e) = ctx.router.requeue(username, messages).await {
        warn!(error = %e, username = %username, count, "Failed to requeue unsent messages");
    }
}

/// Write one frame, giving up when the connection is closed or the client
/// stops reading.
async fn write_frame(
    sink: &mut FrameSink,
    frame: ServerFrame,
    timeout: Duration,
    cancel: &CancellationToken,
) -> chatfleet_core::Result<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Protocol("Connection closed".to_string())),
        sent = tokio::time::timeout(timeout, sink.send(frame)) => match sent {
            Ok(result) => result,
            Err(_) => Err(Error::Protocol(format!(
                "Client accepted no data for {}s",
                timeout.as_secs()
            ))),
        },
    }
}

async fn read_loop(
    ctx: &WorkerContext,
    frames: &mut FrameStream,
    tx: &mpsc::Sender<ServerFrame>,
    cancel: &CancellationToken,
    username: &str,
    token: &str,
) -> chatfleet_core::Result<()> {
    let max_frame_bytes = ctx.settings.max_frame_bytes;
    loop {
        let item = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            item = frames.next() => item,
        };

        let frame = match item {
            None => return Ok(()),
            Some(Err(e)) => return Err(e),
            Some(Ok(Err(e))) => {
                reply(tx, ServerFrame::error(format!("Malformed frame: {e}"))).await?;
                continue;
            }
            Some(Ok(Ok(frame))) => frame,
        };

        match frame {
            ClientFrame::Send { to, body } => {
                // The recipient has to be able to decode the message frame
                let len = ServerFrame::Message(ChatMessage::new(username, body.as_str()))
                    .encoded_len();
                if len > max_frame_bytes {
                    reply(tx, ServerFrame::error(format!("Message to {to} too long"))).await?;
                    continue;
                }

                let frame = match ctx.router.send(username, &to, &body).await {
                    Ok(receipt) => ServerFrame::Sent {
                        to,
                        message_id: receipt.message_id,
                        status: receipt.outcome.status(),
                    },
                    Err(e) => {
                        warn!(error = %e, to = %to, "Failed to route message");
                        ServerFrame::error(format!("Message to {to} not sent: {e}"))
                    }
                };
                reply(tx, frame).await?;
            }
            ClientFrame::History { with, limit } => {
                let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
                let frame = match ctx.router.history(username, &with, limit).await {
                    Ok(messages) => ServerFrame::history(with, messages, max_frame_bytes),
                    Err(e) => ServerFrame::error(format!("Could not load history: {e}")),
                };
                reply(tx, frame).await?;
            }
            ClientFrame::Heartbeat => {
                if let Err(e) = ctx.presence.heartbeat(username).await {
                    warn!(error = %e, "Failed to refresh presence");
                }
                match ctx.sessions.validate(token).await {
                    Ok(_) => {}
                    Err(Error::InvalidToken) => {
                        info!(username = %username, "Session no longer valid, closing connection");
                        reply(
                            tx,
                            ServerFrame::rejected(
                                RejectReason::InvalidToken,
                                "Session expired, please log in again",
                            ),
                        )
                        .await?;
                        return Ok(());
                    }
                    Err(e) => warn!(error = %e, "Failed to renew session"),
                }
            }
            ClientFrame::ListOnline => {
                let frame = match ctx.presence.list_online().await {
                    Ok(users) => ServerFrame::Online { users },
                    Err(e) => ServerFrame::error(format!("Could not list online users: {e}")),
                };
                reply(tx, frame).await?;
            }
            ClientFrame::Logout => {
                if let Err(e) = ctx.sessions.revoke(token).await {
                    warn!(error = %e, "Failed to revoke session");
                }
                return Ok(());
            }
            ClientFrame::Login { .. } | ClientFrame::Signup { .. } | ClientFrame::Resume { .. } => {
                reply(tx, ServerFrame::error("Already logged in")).await?;
            }
        }
    }
}

async fn reply(tx: &mpsc::Sender<ServerFrame>, frame: ServerFrame) -> chatfleet_core::Result<()> {
    tx.send(frame)
        .await
        .map_err(|_| Error::Protocol("Connection writer closed".to_string()))
}

async fn write_loop(
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<ServerFrame>,
    cancel: CancellationToken,
    timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => match tokio::time::timeout(timeout, sink.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(Error::FrameTooLarge { len, max })) => {
                        warn!(len, max, "Dropping frame the client cannot decode");
                    }
                    Ok(Err(e)) => {
                        debug!(error = %e, "Write failed");
                        cancel.cancel();
                        return;
                    }
                    Err(_) => {
                        info!(timeout_secs = timeout.as_secs(), "Client stopped reading, closing");
                        cancel.cancel();
                        return;
                    }
                },
                None => break,
            },
            () = cancel.cancelled() => break,
        }
    }

    // Frames queued before the close, such as a final eviction notice
    while let Ok(frame) = rx.try_recv() {
        match tokio::time::timeout(timeout, sink.send(frame)).await {
            Ok(Ok(()) | Err(Error::FrameTooLarge { .. })) => {}
            _ => break,
        }
    }
    let _ = tokio::time::timeout(timeout, sink.close()).await;
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_mapping() {
        assert_eq!(rejection(&Error::InvalidToken).0, RejectReason::InvalidToken);
        assert_eq!(
            rejection(&Error::Authentication("bad".to_string())),
            (RejectReason::InvalidCredentials, "bad".to_string())
        );
        assert_eq!(
            rejection(&Error::TransientStore("down".to_string())).0,
            RejectReason::Unavailable
        );
    }
}
