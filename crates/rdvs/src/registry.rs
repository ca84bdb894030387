use rdv_common::{ConnectionId, Role};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Commands deliverable to a connection task through its outbound channel.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A serialized envelope to write as a text frame.
    Envelope(String),
    /// Close the connection (used for cascading teardown).
    Close,
}

/// Handle to a registered connection.
///
/// The relay holds these in the registry and uses them only to enqueue
/// outbound commands and to compare identity; the WebSocket itself is
/// owned by the connection's task.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    /// Identifier of the connection this handle belongs to.
    pub id: ConnectionId,
    /// Channel into the connection task that owns the WebSocket sink.
    pub tx: mpsc::Sender<Outbound>,
}

/// Outcome of admitting a connection: its identity and arbitrated role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Identifier assigned to the connection.
    pub id: ConnectionId,
    /// Role decided at connect time, immutable thereafter.
    pub role: Role,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: ConnectionId,
    admin: Option<PeerHandle>,
    users: HashMap<ConnectionId, PeerHandle>,
    admin_key: Option<Value>,
}

/// Session registry: id allocator, admin slot, user table and admin key
/// cache behind a single mutex.
///
/// Every operation is one critical section, which is what keeps role
/// arbitration atomic when connects race: two connections can never both
/// observe an empty admin slot.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a connection: allocates the next identifier, assigns
    /// [`Role::Admin`] iff the admin slot is empty ([`Role::User`]
    /// otherwise) and installs the session, all in one critical section.
    pub fn admit(&self, tx: mpsc::Sender<Outbound>) -> Admission {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let handle = PeerHandle { id, tx };
        let role = if inner.admin.is_none() {
            inner.admin = Some(handle);
            Role::Admin
        } else {
            inner.users.insert(id, handle);
            Role::User
        };
        Admission { id, role }
    }

    /// Installs an admin session. First write wins: returns `false` and
    /// leaves the slot untouched when an admin is already registered, in
    /// which case the caller is expected to close the rejected connection.
    pub fn register_admin(&self, handle: PeerHandle) -> bool {
        let mut inner = self.lock();
        if inner.admin.is_some() {
            return false;
        }
        inner.admin = Some(handle);
        true
    }

    /// Installs a user session. Ids are unique by construction, so the
    /// insert is unconditional.
    pub fn register_user(&self, handle: PeerHandle) {
        self.lock().users.insert(handle.id, handle);
    }

    /// Removes a user session. Returns whether an entry was present.
    pub fn remove_user(&self, id: ConnectionId) -> bool {
        self.lock().users.remove(&id).is_some()
    }

    /// Clears the admin slot iff it is held by `id`. Returns whether the
    /// slot was cleared.
    pub fn remove_admin(&self, id: ConnectionId) -> bool {
        let mut inner = self.lock();
        match &inner.admin {
            Some(handle) if handle.id == id => {
                inner.admin = None;
                true
            }
            _ => false,
        }
    }

    /// Empties the user table, returning the evicted handles so the
    /// caller can notify each one before disposal.
    pub fn clear_all_users(&self) -> Vec<PeerHandle> {
        self.lock().users.drain().map(|(_, handle)| handle).collect()
    }

    /// Looks up a user's handle by identifier.
    #[must_use]
    pub fn lookup_user(&self, id: ConnectionId) -> Option<PeerHandle> {
        self.lock().users.get(&id).cloned()
    }

    /// Handle of the current admin, when one is connected.
    #[must_use]
    pub fn admin_handle(&self) -> Option<PeerHandle> {
        self.lock().admin.clone()
    }

    /// Number of registered users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.lock().users.len()
    }

    /// Caches the admin key iff none is cached yet. Returns whether the
    /// write took effect (first write wins).
    pub fn set_key_if_absent(&self, key: Value) -> bool {
        let mut inner = self.lock();
        if inner.admin_key.is_some() {
            return false;
        }
        inner.admin_key = Some(key);
        true
    }

    /// The cached admin key, when present.
    #[must_use]
    pub fn admin_key(&self) -> Option<Value> {
        self.lock().admin_key.clone()
    }

    /// Drops the cached admin key. Invoked during admin teardown only
    /// when key retention is disabled.
    pub fn clear_key(&self) {
        self.lock().admin_key = None;
    }
}
