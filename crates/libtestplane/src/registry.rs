use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pool::SessionPool;
use crate::proxy::TestHostProxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live sessions by id.
///
/// One instance is built at startup and shared by everything that creates or
/// looks up sessions. Tests build their own.
pub struct SessionRegistry<P> {
    sessions: Mutex<HashMap<SessionId, Arc<SessionPool<P>>>>,
}

impl<P: TestHostProxy> SessionRegistry<P> {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<SessionPool<P>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `pool` under `id`. Never overwrites: returns false if `id` is
    /// taken or does not belong to `pool`.
    pub fn add_session(&self, id: SessionId, pool: Arc<SessionPool<P>>) -> bool {
        if pool.id() != id {
            warn!(session_id = %id, pool_id = %pool.id(), "session id does not match pool");
            return false;
        }
        let mut sessions = self.lock();
        if sessions.contains_key(&id) {
            warn!(session_id = %id, "session already registered");
            return false;
        }
        sessions.insert(id, pool);
        debug!(session_id = %id, "session registered");
        true
    }

    pub fn remove_session(&self, id: &SessionId) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            debug!(session_id = %id, "session unregistered");
        }
        removed
    }

    pub fn get_session(&self, id: &SessionId) -> Option<Arc<SessionPool<P>>> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<P: TestHostProxy> Default for SessionRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
