//! Single serialization point for everything sent to the room.
//!
//! Every [`Broadcaster`] clone feeds one mpsc channel, and exactly one
//! [`Dispatcher`] drains it. Because that loop is the only consumer, every
//! session's delivery queue receives broadcasts in the same relative order.
//! The dispatcher never touches a socket: it only pushes onto delivery
//! queues, so a slow client can stall nobody but itself.

use std::sync::Arc;

use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::{OverflowPolicy, RelayConfig},
    error::{RelayError, Result},
    registry::Registry,
    session::{Line, PushError, Session, SessionId},
};

/// One item on the publish intake.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub line: Line,
    /// A session that should not receive this line.
    pub skip: Option<SessionId>,
}

#[derive(Clone)]
pub struct Broadcaster {
    intake: mpsc::Sender<Outbound>,
}

impl Broadcaster {
    pub fn new(registry: Arc<dyn Registry>, config: &RelayConfig) -> (Self, Dispatcher) {
        let (intake, queue) = mpsc::channel(config.publish_capacity.max(1));
        let dispatcher = Dispatcher {
            queue,
            registry,
            overflow: config.queue.overflow,
        };
        (Self { intake }, dispatcher)
    }

    /// Queues `line` for every session registered when it is dispatched.
    pub async fn publish(&self, line: impl Into<String>) -> Result<()> {
        self.submit(Outbound {
            line: Arc::from(line.into()),
            skip: None,
        })
        .await
    }

    /// Like [`publish`](Self::publish) but leaves out session `skip`.
    pub async fn publish_except(&self, line: impl Into<String>, skip: SessionId) -> Result<()> {
        self.submit(Outbound {
            line: Arc::from(line.into()),
            skip: Some(skip),
        })
        .await
    }

    async fn submit(&self, outbound: Outbound) -> Result<()> {
        self.intake
            .send(outbound)
            .await
            .map_err(|_| RelayError::DispatcherClosed)
    }
}

pub struct Dispatcher {
    queue: mpsc::Receiver<Outbound>,
    registry: Arc<dyn Registry>,
    overflow: OverflowPolicy,
}

impl Dispatcher {
    /// Drains the intake until `shutdown` fires or every broadcaster is gone.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            select! {
                _ = shutdown.cancelled() => break,
                next = self.queue.recv() => match next {
                    Some(outbound) => {
                        self.deliver(&outbound);
                    }
                    None => break,
                },
            }
        }
        debug!("broadcast dispatcher stopped");
    }

    /// Fans one line out to the current registry snapshot. Returns how many
    /// queues accepted it.
    fn deliver(&self, outbound: &Outbound) -> usize {
        let mut delivered = 0;
        for session in self.registry.snapshot() {
            if outbound.skip == Some(session.id()) {
                continue;
            }
            match session.push(Arc::clone(&outbound.line)) {
                Ok(()) => delivered += 1,
                Err(PushError::Full) => self.overflowed(&session),
                Err(PushError::Closed) => {
                    debug!(peer = %session.addr(), "skipping session that is shutting down");
                }
            }
        }
        delivered
    }

    fn overflowed(&self, session: &Session) {
        match self.overflow {
            OverflowPolicy::Drop => {
                warn!(peer = %session.addr(), "delivery queue full, dropping message");
            }
            OverflowPolicy::Disconnect => {
                if self.registry.evict(&session.name(), session.id()) {
                    warn!(peer = %session.addr(), "delivery queue full, disconnecting client");
                }
                session.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        config::QueueConfig,
        registry::RenameError,
        session::{Inbox, delivery_queue},
    };

    /// Registry stand-in that records evictions instead of keying by name.
    #[derive(Default)]
    struct FakeRegistry {
        sessions: Mutex<Vec<Arc<Session>>>,
        evicted: Mutex<Vec<SessionId>>,
    }

    impl FakeRegistry {
        fn with(sessions: Vec<Arc<Session>>) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(sessions),
                evicted: Mutex::default(),
            })
        }
    }

    impl Registry for FakeRegistry {
        fn insert(&self, _key: String, session: Arc<Session>) -> Option<Arc<Session>> {
            self.sessions.lock().push(session);
            None
        }

        fn remove(&self, _key: &str) -> Option<Arc<Session>> {
            None
        }

        fn evict(&self, _key: &str, id: SessionId) -> bool {
            let mut sessions = self.sessions.lock();
            let before = sessions.len();
            sessions.retain(|session| session.id() != id);
            self.evicted.lock().push(id);
            sessions.len() != before
        }

        fn rename(
            &self,
            from: &str,
            _to: &str,
            _id: SessionId,
        ) -> std::result::Result<(), RenameError> {
            Err(RenameError::NotRegistered(from.to_string()))
        }

        fn snapshot(&self) -> Vec<Arc<Session>> {
            self.sessions.lock().clone()
        }

        fn len(&self) -> usize {
            self.sessions.lock().len()
        }
    }

    fn session(id: SessionId, queue: QueueConfig) -> (Arc<Session>, Inbox) {
        let (outbox, inbox) = delivery_queue(queue);
        let session = Session::new(
            id,
            format!("127.0.0.1:{}", 4000 + id),
            outbox,
            CancellationToken::new(),
        );
        (Arc::new(session), inbox)
    }

    async fn next(inbox: &mut Inbox) -> String {
        let line = timeout(Duration::from_secs(1), inbox.recv())
            .await
            .expect("timed out waiting for a line")
            .expect("queue closed");
        line.to_string()
    }

    #[tokio::test]
    async fn every_session_sees_publishes_in_order() {
        let (one, mut inbox_one) = session(1, QueueConfig::unbounded());
        let (two, mut inbox_two) = session(2, QueueConfig::unbounded());
        let registry = FakeRegistry::with(vec![one, two]);
        let (broadcaster, dispatcher) = Broadcaster::new(registry, &RelayConfig::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(shutdown.clone()));

        let other = broadcaster.clone();
        broadcaster.publish("m1").await.expect("publish m1");
        other.publish("m2").await.expect("publish m2");
        broadcaster.publish("m3").await.expect("publish m3");

        for inbox in [&mut inbox_one, &mut inbox_two] {
            assert_eq!(next(inbox).await, "m1");
            assert_eq!(next(inbox).await, "m2");
            assert_eq!(next(inbox).await, "m3");
        }

        shutdown.cancel();
        task.await.expect("dispatcher task");
    }

    #[tokio::test]
    async fn publish_except_skips_one_session() {
        let (one, mut inbox_one) = session(1, QueueConfig::unbounded());
        let (two, mut inbox_two) = session(2, QueueConfig::unbounded());
        let registry = FakeRegistry::with(vec![one, two]);
        let (broadcaster, dispatcher) = Broadcaster::new(registry, &RelayConfig::default());
        tokio::spawn(dispatcher.run(CancellationToken::new()));

        broadcaster
            .publish_except("joined", 1)
            .await
            .expect("publish");
        broadcaster.publish("after").await.expect("publish");

        assert_eq!(next(&mut inbox_one).await, "after");
        assert_eq!(next(&mut inbox_two).await, "joined");
        assert_eq!(next(&mut inbox_two).await, "after");
    }

    #[test]
    fn full_queue_with_drop_policy_keeps_the_session() {
        let (slow, mut slow_inbox) = session(1, QueueConfig::bounded(1, OverflowPolicy::Drop));
        let (fast, _fast_inbox) = session(2, QueueConfig::unbounded());
        let registry = FakeRegistry::with(vec![Arc::clone(&slow), fast]);
        let config = RelayConfig::default().with_queue(QueueConfig::bounded(1, OverflowPolicy::Drop));
        let (_broadcaster, dispatcher) = Broadcaster::new(registry.clone(), &config);

        let outbound = |text: &str| Outbound {
            line: Arc::from(text),
            skip: None,
        };
        assert_eq!(dispatcher.deliver(&outbound("first")), 2);
        assert_eq!(dispatcher.deliver(&outbound("second")), 1);

        assert!(!slow.is_closed());
        assert_eq!(registry.len(), 2);
        assert!(registry.evicted.lock().is_empty());
        assert_eq!(slow_inbox.try_recv().as_deref(), Some("first"));
        assert_eq!(slow_inbox.try_recv().as_deref(), None);
    }

    #[test]
    fn full_queue_with_disconnect_policy_evicts_and_closes() {
        let queue = QueueConfig::bounded(1, OverflowPolicy::Disconnect);
        let (slow, _slow_inbox) = session(1, queue);
        let (fast, _fast_inbox) = session(2, QueueConfig::unbounded());
        let registry = FakeRegistry::with(vec![Arc::clone(&slow), fast]);
        let config = RelayConfig::default().with_queue(queue);
        let (_broadcaster, dispatcher) = Broadcaster::new(registry.clone(), &config);

        let outbound = |text: &str| Outbound {
            line: Arc::from(text),
            skip: None,
        };
        dispatcher.deliver(&outbound("first"));
        dispatcher.deliver(&outbound("second"));

        assert!(slow.is_closed());
        assert_eq!(*registry.evicted.lock(), vec![1]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn closed_queues_are_skipped() {
        let (gone, inbox) = session(1, QueueConfig::unbounded());
        drop(inbox);
        let registry = FakeRegistry::with(vec![gone]);
        let (_broadcaster, dispatcher) = Broadcaster::new(registry.clone(), &RelayConfig::default());

        let delivered = dispatcher.deliver(&Outbound {
            line: Arc::from("hello"),
            skip: None,
        });
        assert_eq!(delivered, 0);
        assert!(registry.evicted.lock().is_empty());
    }

    #[tokio::test]
    async fn publish_fails_once_dispatcher_stops() {
        let registry = FakeRegistry::with(Vec::new());
        let (broadcaster, dispatcher) = Broadcaster::new(registry, &RelayConfig::default());
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        dispatcher.run(shutdown).await;

        let result = broadcaster.publish("too late").await;
        assert!(matches!(result, Err(RelayError::DispatcherClosed)));
    }
}
