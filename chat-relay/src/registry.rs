//! Membership registry: display name to live [`Session`].
//!
//! Components receive the registry as an `Arc<dyn Registry>` rather than
//! reaching for global state, so the broadcaster can be tested against a
//! fake.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::warn;

use crate::session::{Session, SessionId};

pub trait Registry: Send + Sync {
    /// Adds `session` under `key`, returning whatever was displaced.
    ///
    /// Collisions are not rejected: the newcomer silently takes the slot.
    fn insert(&self, key: String, session: Arc<Session>) -> Option<Arc<Session>>;

    /// Deletes `key`. Absent keys are a no-op.
    fn remove(&self, key: &str) -> Option<Arc<Session>>;

    /// Deletes `key` only while it still maps to session `id`.
    ///
    /// Teardown uses this so a session whose slot was taken over by a
    /// same-named newcomer does not remove the newcomer.
    fn evict(&self, key: &str, id: SessionId) -> bool;

    /// Moves session `id` from `from` to `to` and updates its display name.
    fn rename(&self, from: &str, to: &str, id: SessionId) -> Result<(), RenameError>;

    /// Every registered session at one instant.
    fn snapshot(&self) -> Vec<Arc<Session>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenameError {
    #[error("name {0} is already in use")]
    NameTaken(String),
    #[error("session is not registered under {0}")]
    NotRegistered(String),
}

/// [`Registry`] backed by a `HashMap` behind a single reader/writer lock.
///
/// Each operation holds the lock for exactly its own duration and never
/// across an `.await`.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Registry for SessionRegistry {
    fn insert(&self, key: String, session: Arc<Session>) -> Option<Arc<Session>> {
        let displaced = self.sessions.write().insert(key.clone(), session);
        if let Some(previous) = &displaced {
            warn!(
                name = %key,
                displaced = %previous.addr(),
                "name collision, previous session no longer receives broadcasts"
            );
        }
        displaced
    }

    fn remove(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.write().remove(key)
    }

    fn evict(&self, key: &str, id: SessionId) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(key) {
            Some(session) if session.id() == id => {
                sessions.remove(key);
                true
            }
            _ => false,
        }
    }

    fn rename(&self, from: &str, to: &str, id: SessionId) -> Result<(), RenameError> {
        let mut sessions = self.sessions.write();

        let owned = matches!(sessions.get(from), Some(session) if session.id() == id);
        if !owned {
            return Err(RenameError::NotRegistered(from.to_string()));
        }
        if from == to {
            return Ok(());
        }
        if sessions.contains_key(to) {
            return Err(RenameError::NameTaken(to.to_string()));
        }

        if let Some(session) = sessions.remove(from) {
            session.set_name(to);
            sessions.insert(to.to_string(), session);
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.sessions.read().len()
    }
}
