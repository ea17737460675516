use std::{
    future::{self, Future},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    broadcast::{Broadcaster, Dispatcher},
    config::RelayConfig,
    connection::handle_connection,
    error::{RelayError, Result},
    registry::{Registry, SessionRegistry},
    session::SessionId,
};

/// Binds `addr` and relays until the process exits.
///
/// This is the library entry point for embedding the relay; it only
/// returns when binding fails.
pub async fn start(addr: &str, config: RelayConfig) -> Result<()> {
    serve_until(addr, config, future::pending()).await
}

/// Binds `addr`, logs the listening address and relays until `shutdown`
/// resolves.
pub async fn serve_until<F>(addr: &str, config: RelayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let relay = Relay::bind(addr, config).await?;
    info!("relay listening on {}", relay.local_addr()?);
    relay.run_until(shutdown).await
}

/// Resolves on ctrl-c, or right away if the handler cannot be installed.
pub async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
}

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
    dispatcher: Dispatcher,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self::with_registry(listener, config, Arc::new(SessionRegistry::new()))
    }

    pub fn with_registry(
        listener: TcpListener,
        config: RelayConfig,
        registry: Arc<dyn Registry>,
    ) -> Self {
        let (state, dispatcher) = RelayState::new(registry, config);
        Self {
            listener,
            state,
            dispatcher,
        }
    }

    pub async fn bind(addr: &str, config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self::new(listener, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<dyn Registry> {
        Arc::clone(&self.state.registry)
    }

    /// Accepts connections until `shutdown` resolves, then cancels every
    /// session, waits for their teardown and stops the dispatcher.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            state,
            dispatcher,
        } = self;

        let dispatcher_stop = CancellationToken::new();
        let dispatch = tokio::spawn(dispatcher.run(dispatcher_stop.clone()));
        let sessions_stop = CancellationToken::new();
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &sessions_stop, &mut sessions);
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    session_finished(joined);
                }
            }
        }

        info!("relay shutting down");
        drop(listener);
        sessions_stop.cancel();
        while let Some(joined) = sessions.join_next().await {
            session_finished(joined);
        }
        dispatcher_stop.cancel();
        if let Err(err) = dispatch.await {
            warn!(error = ?err, "dispatcher task panicked");
        }

        Ok(())
    }
}

/// Reaps one session task. Returns `false` if it panicked or was aborted.
fn session_finished(joined: std::result::Result<(), JoinError>) -> bool {
    match joined {
        Ok(()) => true,
        Err(err) => {
            warn!(error = ?err, "session task panicked");
            false
        }
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RelayState>,
    stop: &CancellationToken,
    sessions: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, state, stop.child_token(), sessions),
        Err(err) => {
            let err = RelayError::Accept(err);
            warn!(error = %err, "accept failed, still listening");
        }
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<RelayState>,
    cancel: CancellationToken,
    sessions: &mut JoinSet<()>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = ?err, "could not disable nagle");
    }

    let state = Arc::clone(state);
    sessions.spawn(async move {
        let (reader, writer) = stream.into_split();
        if let Err(err) = handle_connection(reader, writer, peer.to_string(), &state, cancel).await
        {
            warn!(peer = %peer, error = %err, "client connection closed with error");
        }
    });
}

/// State every session task shares.
pub struct RelayState {
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) broadcaster: Broadcaster,
    pub(crate) config: RelayConfig,
    next_id: AtomicU64,
}

impl RelayState {
    pub(crate) fn new(registry: Arc<dyn Registry>, config: RelayConfig) -> (Arc<Self>, Dispatcher) {
        let (broadcaster, dispatcher) = Broadcaster::new(Arc::clone(&registry), &config);
        let state = Arc::new(Self {
            registry,
            broadcaster,
            config,
            next_id: AtomicU64::new(1),
        });
        (state, dispatcher)
    }

    pub(crate) fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
