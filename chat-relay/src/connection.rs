//! Lifecycle of one accepted connection.
//!
//! `Connected -> Active -> Closing -> Closed`: the session is registered and
//! announced, its read loop publishes every inbound message, and when the
//! stream ends (or the session is cancelled) it is evicted, announced as
//! gone, and its forwarder is stopped. The forwarder is the only writer to
//! the socket.

use std::{io, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Framing,
    envelope::{Announcement, Envelope},
    error::{RelayError, Result},
    registry::{Registry, RenameError},
    relay::RelayState,
    session::{Inbox, Session, delivery_queue, trim_terminator},
};

/// Runs a session over `reader`/`writer` until the peer goes away or
/// `cancel` fires. Teardown happens on every exit path; the returned error
/// only reports why the read side stopped.
pub async fn handle_connection<R, W>(
    reader: R,
    writer: W,
    addr: String,
    state: &RelayState,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbox, inbox) = delivery_queue(state.config.queue);
    let session = Arc::new(Session::new(state.next_id(), addr, outbox, cancel));
    let forwarder = tokio::spawn(forward(
        inbox,
        writer,
        session.cancellation().clone(),
        session.addr().to_string(),
    ));

    let name = session.name();
    state.registry.insert(name.clone(), Arc::clone(&session));
    info!(peer = %session.addr(), "client joined");
    let joined = Envelope::announcement(session.addr(), &name, Announcement::Joined);
    let outcome = match state
        .broadcaster
        .publish_except(joined.to_string(), session.id())
        .await
    {
        Ok(()) => read_loop(reader, &session, state).await,
        Err(err) => Err(err),
    };

    teardown(&session, state).await;
    if let Err(err) = forwarder.await {
        debug!(peer = %session.addr(), error = ?err, "forwarder task failed");
    }
    outcome
}

async fn teardown(session: &Session, state: &RelayState) {
    let name = session.name();
    state.registry.evict(&name, session.id());

    let left = Envelope::announcement(session.addr(), &name, Announcement::Left);
    if let Err(err) = state.broadcaster.publish(left.to_string()).await {
        debug!(peer = %session.addr(), error = %err, "could not announce departure");
    }

    info!(peer = %session.addr(), %name, "client left");
    session.close();
}

async fn read_loop<R>(reader: R, session: &Session, state: &RelayState) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let result = match state.config.framing {
        Framing::Chunk => read_chunks(reader, session, state).await,
        Framing::Lines => read_lines(reader, session, state).await,
    };

    match result {
        Err(RelayError::Io(err)) if is_disconnect(&err) => {
            debug!(peer = %session.addr(), error = %err, "connection dropped by peer");
            Ok(())
        }
        other => other,
    }
}

/// Every read is one message.
async fn read_chunks<R>(mut reader: R, session: &Session, state: &RelayState) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; state.config.read_buffer.max(1)];
    let cancel = session.cancellation();

    loop {
        let read = select! {
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read(&mut buf) => read?,
        };
        if read == 0 {
            return Ok(());
        }

        let text = String::from_utf8_lossy(trim_terminator(&buf[..read]));
        handle_inbound(&text, session, state).await?;
    }
}

/// Messages are `\n`-terminated lines, reassembled across reads.
///
/// A line longer than `max_line` bytes is published in `max_line`-sized
/// pieces so one client cannot make the relay buffer without limit.
async fn read_lines<R>(reader: R, session: &Session, state: &RelayState) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let max_line = state.config.max_line.max(1);
    let mut line = Vec::new();
    let cancel = session.cancellation();

    loop {
        line.clear();
        let mut limited = (&mut reader).take(max_line as u64);
        let read = select! {
            _ = cancel.cancelled() => return Ok(()),
            read = limited.read_until(b'\n', &mut line) => read?,
        };
        if read == 0 {
            return Ok(());
        }

        let text = String::from_utf8_lossy(trim_terminator(&line));
        handle_inbound(&text, session, state).await?;
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

async fn handle_inbound(text: &str, session: &Session, state: &RelayState) -> Result<()> {
    if state.config.commands {
        if let Some(command) = InboundCommand::parse(text) {
            run_command(command, session, state.registry.as_ref());
            return Ok(());
        }
    }

    let name = session.name();
    let envelope = Envelope::new(session.addr(), &name, text);
    state.broadcaster.publish(envelope.to_string()).await
}

/// In-band commands understood when `commands` is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundCommand<'a> {
    Rename(&'a str),
    Who,
}

impl<'a> InboundCommand<'a> {
    fn parse(text: &'a str) -> Option<Self> {
        if text == "who" {
            return Some(InboundCommand::Who);
        }
        text.strip_prefix("rename|")
            .map(|name| InboundCommand::Rename(name.trim()))
    }
}

/// Replies go straight onto the caller's own queue, bypassing the room.
fn run_command(command: InboundCommand<'_>, session: &Session, registry: &dyn Registry) {
    match command {
        InboundCommand::Who => {
            for peer in registry.snapshot() {
                let name = peer.name();
                let line = Envelope::announcement(peer.addr(), &name, Announcement::Online);
                reply(session, line.to_string());
            }
        }
        InboundCommand::Rename(new_name) => {
            if new_name.is_empty() {
                reply(session, "name cannot be empty".to_string());
                return;
            }
            match registry.rename(&session.name(), new_name, session.id()) {
                Ok(()) => {
                    info!(peer = %session.addr(), name = %new_name, "client renamed");
                    reply(session, format!("renamed to {new_name}"));
                }
                Err(err @ RenameError::NameTaken(_)) => reply(session, err.to_string()),
                Err(err @ RenameError::NotRegistered(_)) => {
                    debug!(peer = %session.addr(), error = %err, "rename from a displaced session");
                    reply(session, err.to_string());
                }
            }
        }
    }
}

fn reply(session: &Session, line: String) {
    if let Err(err) = session.push(Arc::from(line)) {
        debug!(peer = %session.addr(), error = %err, "dropping private reply");
    }
}

/// Drains the session's delivery queue into the socket, one line at a time.
async fn forward<W>(mut inbox: Inbox, mut writer: W, cancel: CancellationToken, peer: String)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = select! {
            _ = cancel.cancelled() => break,
            next = inbox.recv() => match next {
                Some(line) => line,
                None => break,
            },
        };

        let written = select! {
            _ = cancel.cancelled() => break,
            written = write_line(&mut writer, &line) => written,
        };
        if let Err(err) = written {
            debug!(peer = %peer, error = ?err, "failed to deliver line to client");
            // the read side may be blocked on a half-dead socket; wake it up
            cancel.cancel();
            break;
        }
    }

    if let Err(err) = writer.shutdown().await {
        if !is_disconnect(&err) && err.kind() != io::ErrorKind::NotConnected {
            warn!(peer = %peer, error = ?err, "failed to shut down client writer");
        }
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
