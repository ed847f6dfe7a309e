//! The registry table and its fan-out helpers.
//!
//! # Concurrency note
//!
//! Writes (`add`, `remove`) come only from the owning instance's accept and
//! close paths and are serialized by the lock. Reads never hold the lock
//! while sending: iteration works on a point-in-time snapshot of the
//! entries, so a connection closing mid-broadcast cannot invalidate the
//! iteration. Closed entries in the snapshot are skipped.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use mapcast_transport::{Connection, ConnectionId, TransportError};

/// Keyed table of live connections.
pub struct ConnectionRegistry<C: Connection> {
    connections: RwLock<HashMap<ConnectionId, Arc<C>>>,
}

impl<C: Connection> ConnectionRegistry<C> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts `conn` under `id`, replacing (and returning) any previous
    /// entry with the same id.
    pub fn add(&self, id: ConnectionId, conn: Arc<C>) -> Option<Arc<C>> {
        let previous = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, conn);
        if previous.is_some() {
            tracing::debug!(%id, "replaced existing registry entry");
        }
        previous
    }

    /// Removes the entry for `id`. Removing an absent id is a no-op and
    /// returns `None`.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<C>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Returns the connection registered under `id`.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<C>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A point-in-time copy of the current entries, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<C>> {
        let mut conns: Vec<Arc<C>> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        conns.sort_by_key(|conn| conn.id());
        conns
    }

    /// Calls `f` for every entry of a snapshot that is still open.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<C>)) {
        for conn in self.snapshot() {
            if !conn.is_open() {
                continue;
            }
            f(&conn);
        }
    }

    /// Sends `payload` to every registered connection.
    ///
    /// A failed send is logged and does not stop delivery to the rest.
    /// Returns the number of connections the payload was queued for.
    pub fn broadcast(&self, payload: &str) -> usize {
        let mut delivered = 0;
        self.for_each(|conn| match conn.send_text(payload) {
            Ok(()) => delivered += 1,
            Err(e) => {
                tracing::warn!(
                    conn_id = %conn.id(),
                    error = %e,
                    "broadcast send failed"
                );
            }
        });
        tracing::debug!(delivered, "broadcast");
        delivered
    }

    /// Sends `payload` to the connection registered under `id`.
    ///
    /// # Errors
    /// Returns [`TransportError::ConnectionClosed`] if `id` is not
    /// registered, or whatever the connection's send returns.
    pub fn send(
        &self,
        id: ConnectionId,
        payload: &str,
    ) -> Result<(), TransportError> {
        let conn = self
            .get(id)
            .ok_or_else(|| TransportError::ConnectionClosed(id.to_string()))?;
        conn.send_text(payload)
    }

    /// Closes every registered connection. Entries stay registered until
    /// their close path removes them.
    ///
    /// Returns how many connections were actually closed by this call.
    pub fn close_all(&self) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|conn| conn.close())
            .count()
    }
}

impl<C: Connection> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
