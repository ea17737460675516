//! Per-client state shared between the reader, the forwarder and the registry.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;

pub type SessionId = u64;

/// A formatted line waiting in a delivery queue. Shared so one broadcast is
/// allocated once no matter how many sessions receive it.
pub type Line = Arc<str>;

/// One connected client.
///
/// The socket itself lives in the session's reader and forwarder tasks; this
/// struct holds what other components may touch: identity, the sending side
/// of the delivery queue and the cancellation token that ends both tasks.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    addr: String,
    name: RwLock<String>,
    outbox: Outbox,
    cancel: CancellationToken,
}

impl Session {
    /// Creates a session whose display name starts out as its address.
    pub fn new(id: SessionId, addr: String, outbox: Outbox, cancel: CancellationToken) -> Self {
        Self {
            id,
            name: RwLock::new(addr.clone()),
            addr,
            outbox,
            cancel,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Only the registry calls this, while holding its own lock, so the key
    /// and the name never disagree.
    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    /// Places `line` on this session's delivery queue without waiting.
    pub fn push(&self, line: Line) -> Result<(), PushError> {
        self.outbox.push(line)
    }

    /// Ends the session: its read loop tears down and its forwarder exits.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("delivery queue is full")]
    Full,
    #[error("delivery queue is closed")]
    Closed,
}

/// Sending half of a session's delivery queue.
#[derive(Debug)]
pub enum Outbox {
    Bounded(mpsc::Sender<Line>),
    Unbounded(mpsc::UnboundedSender<Line>),
}

impl Outbox {
    fn push(&self, line: Line) -> Result<(), PushError> {
        match self {
            Outbox::Bounded(tx) => tx.try_send(line).map_err(|err| match err {
                TrySendError::Full(_) => PushError::Full,
                TrySendError::Closed(_) => PushError::Closed,
            }),
            Outbox::Unbounded(tx) => tx.send(line).map_err(|_| PushError::Closed),
        }
    }
}

/// Receiving half of a session's delivery queue, owned by its forwarder.
#[derive(Debug)]
pub enum Inbox {
    Bounded(mpsc::Receiver<Line>),
    Unbounded(mpsc::UnboundedReceiver<Line>),
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Line> {
        match self {
            Inbox::Bounded(rx) => rx.recv().await,
            Inbox::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Takes the next line if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Line> {
        match self {
            Inbox::Bounded(rx) => rx.try_recv().ok(),
            Inbox::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

pub fn delivery_queue(config: QueueConfig) -> (Outbox, Inbox) {
    match config.capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (Outbox::Bounded(tx), Inbox::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Outbox::Unbounded(tx), Inbox::Unbounded(rx))
        }
    }
}

/// Strips exactly one trailing line terminator (`\n` or `\r\n`) if present.
///
/// Input without a terminator comes back untouched.
pub fn trim_terminator(bytes: &[u8]) -> &[u8] {
    match bytes.strip_suffix(b"\n") {
        Some(rest) => rest.strip_suffix(b"\r").unwrap_or(rest),
        None => bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;

    fn session_with(queue: QueueConfig) -> (Session, Inbox) {
        let (outbox, inbox) = delivery_queue(queue);
        let session = Session::new(
            7,
            "127.0.0.1:4000".into(),
            outbox,
            CancellationToken::new(),
        );
        (session, inbox)
    }

    #[test]
    fn name_defaults_to_address() {
        let (session, _inbox) = session_with(QueueConfig::unbounded());
        assert_eq!(session.name(), "127.0.0.1:4000");
        assert_eq!(session.addr(), "127.0.0.1:4000");
        session.set_name("alice");
        assert_eq!(session.name(), "alice");
        assert_eq!(session.addr(), "127.0.0.1:4000");
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let (session, mut inbox) = session_with(QueueConfig::unbounded());
        for line in ["one", "two", "three"] {
            session.push(Arc::from(line)).expect("push");
        }
        assert_eq!(inbox.recv().await.as_deref(), Some("one"));
        assert_eq!(inbox.recv().await.as_deref(), Some("two"));
        assert_eq!(inbox.recv().await.as_deref(), Some("three"));
    }

    #[test]
    fn bounded_queue_reports_full_then_closed() {
        let (session, inbox) = session_with(QueueConfig::bounded(1, OverflowPolicy::Drop));
        session.push(Arc::from("first")).expect("first fits");
        assert_eq!(session.push(Arc::from("second")), Err(PushError::Full));
        drop(inbox);
        assert_eq!(session.push(Arc::from("third")), Err(PushError::Closed));
    }

    #[test]
    fn close_fires_the_token() {
        let (session, _inbox) = session_with(QueueConfig::unbounded());
        assert!(!session.is_closed());
        session.close();
        assert!(session.is_closed());
        assert!(session.cancellation().is_cancelled());
    }

    #[test]
    fn trims_one_terminator() {
        assert_eq!(trim_terminator(b"hello\n"), b"hello");
        assert_eq!(trim_terminator(b"hello\r\n"), b"hello");
        assert_eq!(trim_terminator(b"hello\n\n"), b"hello\n");
        assert_eq!(trim_terminator(b"\n"), b"");
    }

    #[test]
    fn keeps_unterminated_input() {
        assert_eq!(trim_terminator(b"hello"), b"hello");
        assert_eq!(trim_terminator(b"hello\r"), b"hello\r");
        assert_eq!(trim_terminator(b""), b"");
    }
}
