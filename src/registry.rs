//! Connection Registry
//!
//! Durable record of the open connections to one scheduler repository.
//! Connections may live in different processes, so the count is kept in
//! `connections.json` and only changed while the repository lock is held.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::persist;

/// Opaque connection identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One open connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub pid: u32,
    pub opened_at: DateTime<Utc>,
}

/// Registry contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    connections: Vec<ConnectionRecord>,
}

impl RegistryState {
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn records(&self) -> &[ConnectionRecord] {
        &self.connections
    }

    /// Record a new connection owned by `pid`
    pub fn register(&mut self, pid: u32) -> ConnectionId {
        let id = ConnectionId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        self.connections.push(ConnectionRecord {
            id,
            pid,
            opened_at: Utc::now(),
        });
        id
    }

    pub fn unregister(&mut self, id: ConnectionId) -> Option<ConnectionRecord> {
        let pos = self.connections.iter().position(|c| c.id == id)?;
        Some(self.connections.remove(pos))
    }

    /// Drop connections whose process is gone, returning them
    pub fn prune_dead(&mut self, alive: impl Fn(u32) -> bool) -> Vec<ConnectionRecord> {
        let (live, dead): (Vec<_>, Vec<_>) = self.connections.drain(..).partition(|c| alive(c.pid));
        self.connections = live;
        dead
    }
}

/// Durable home of the registry
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    path: PathBuf,
}

impl ConnectionRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<RegistryState> {
        Ok(persist::read_json(&self.path)?.unwrap_or_default())
    }

    pub fn save(&self, state: &RegistryState) -> Result<()> {
        persist::write_json(&self.path, state)
    }

    /// Number of connections currently recorded
    pub fn count(&self) -> Result<usize> {
        Ok(self.load()?.count())
    }
}
