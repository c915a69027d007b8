//! Capacity ledger
//!
//! Tracks how much media capacity every registered server has and how much
//! of it placed rooms consume. A room of `p` peers costs `p * (p - 1) * 2`
//! units (every peer consumes audio and video from every other peer); a
//! server offers 500 units per media worker.
//!
//! The per-server `consumed_units` counter is authoritative. Room entries are
//! an audit trail that remembers what each placement cost so it can be
//! credited back exactly once.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use self::memory::MemoryLedger;
pub use self::redis::RedisLedger;

/// Capacity units offered by one media worker
pub const UNITS_PER_WORKER: u64 = 500;

/// Capacity units a room of `peer_count` peers consumes
#[must_use]
pub fn units(peer_count: u32) -> u64 {
    let p = u64::from(peer_count);
    p * p.saturating_sub(1) * 2
}

/// Capacity units offered by `worker_count` workers
#[must_use]
pub fn capacity_for(worker_count: u32) -> u64 {
    u64::from(worker_count) * UNITS_PER_WORKER
}

/// A media server known to the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub server_id: String,
    pub base_url: String,
    pub worker_count: u32,
    pub capacity_units: u64,
    pub consumed_units: u64,
    pub active_room_count: u64,
    pub healthy: bool,
    pub registered_at: DateTime<Utc>,
}

impl ServerRecord {
    #[must_use]
    pub fn new(server_id: String, base_url: String, worker_count: u32) -> Self {
        Self {
            server_id,
            base_url,
            worker_count,
            capacity_units: capacity_for(worker_count),
            consumed_units: 0,
            active_room_count: 0,
            healthy: true,
            registered_at: Utc::now(),
        }
    }

    /// Units still free on this server
    #[must_use]
    pub fn available_units(&self) -> u64 {
        self.capacity_units.saturating_sub(self.consumed_units)
    }
}

/// What a placed room cost, keyed by `(server_id, room_id)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomLedgerEntry {
    pub server_id: String,
    pub room_id: String,
    pub peer_count: u32,
    pub placed_at: DateTime<Utc>,
}

/// Result of a conditional debit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Debit {
    /// Units were taken and the room entry written
    Applied,
    /// The server does not have enough free units; nothing changed
    Insufficient { available: u64 },
}

/// Shared capacity bookkeeping
///
/// Every mutation is a single atomic step, so concurrent schedulers never
/// push a server past its capacity and a room is never credited twice.
#[async_trait]
pub trait CapacityLedger: Send + Sync {
    /// Insert or reset a server record
    ///
    /// Consumed units and the room count go back to zero, the server's room
    /// entries are dropped and the server is marked healthy.
    async fn register_server(&self, server_id: &str, base_url: &str, worker_count: u32) -> Result<ServerRecord>;

    /// All servers, in registration order
    async fn servers(&self) -> Result<Vec<ServerRecord>>;

    /// Take `units(peer_count)` from a server and record the room
    ///
    /// Fails with `ServerNotFound` for unknown servers. A leftover entry for
    /// the same room is credited back as part of the same step.
    async fn debit(&self, server_id: &str, room_id: &str, peer_count: u32) -> Result<Debit>;

    /// Credit back a room's units and drop its entry
    ///
    /// Returns the credited units, or `None` when no entry exists.
    async fn reclaim(&self, server_id: &str, room_id: &str) -> Result<Option<u64>>;

    /// Record the outcome of a liveness check
    async fn set_healthy(&self, server_id: &str, healthy: bool) -> Result<()>;

    /// Look up the entry for a placed room
    async fn room(&self, server_id: &str, room_id: &str) -> Result<Option<RoomLedgerEntry>>;
}
