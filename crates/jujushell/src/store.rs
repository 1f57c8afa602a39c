//! In-memory connection bookkeeping.
//!
//! Tracks, per container address, how many sessions are currently attached
//! and when the connection count last changed. Entries survive their last
//! connection going away, so the garbage collector can tell a container
//! that has been idle for days from one that was never used; the collector
//! calls [`InMemory::forget`] once it removes a container.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

/// Connection information for one container address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    /// Number of currently established connections.
    pub num_connections: usize,
    /// When the connection count last changed.
    pub last_connection: DateTime<Utc>,
}

/// A store keeping connection information in memory.
#[derive(Default)]
pub struct InMemory {
    db: Mutex<HashMap<String, Info>>,
}

impl InMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection for the given id. Multiple connections may
    /// share an id.
    pub fn add_conn(&self, id: &str) {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let info = db.entry(id.to_string()).or_insert_with(|| Info {
            num_connections: 0,
            last_connection: Utc::now(),
        });
        info.num_connections += 1;
        info.last_connection = Utc::now();
    }

    /// Drop one connection for the given id. The entry itself is kept, even
    /// at zero connections, so the time of the last detach stays known.
    pub fn remove_conn(&self, id: &str) {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(info) = db.get_mut(id) {
            info.num_connections = info.num_connections.saturating_sub(1);
            info.last_connection = Utc::now();
        }
    }

    /// Forget everything about the given id.
    pub fn forget(&self, id: &str) {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.remove(id);
    }

    /// Connection information for the given id. Unknown ids report zero
    /// connections made just now.
    pub fn info(&self, id: &str) -> Info {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.get(id).cloned().unwrap_or_else(|| Info {
            num_connections: 0,
            last_connection: Utc::now(),
        })
    }

    /// Rewind an entry's last connection time; timers cannot be faked
    /// through the wall clock.
    #[cfg(test)]
    pub fn backdate(&self, id: &str, days: i64) {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(info) = db.get_mut(id) {
            info.last_connection -= chrono::Duration::days(days);
        }
    }
}
