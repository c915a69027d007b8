//! In-process ledger for a single balancer instance

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{units, CapacityLedger, Debit, RoomLedgerEntry, ServerRecord};
use crate::error::{Error, Result};

#[derive(Default)]
struct LedgerState {
    servers: Vec<ServerRecord>,
    rooms: HashMap<(String, String), RoomLedgerEntry>,
}

impl LedgerState {
    fn server_mut(&mut self, server_id: &str) -> Option<&mut ServerRecord> {
        self.servers.iter_mut().find(|s| s.server_id == server_id)
    }
}

/// Ledger kept behind one lock
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CapacityLedger for MemoryLedger {
    async fn register_server(&self, server_id: &str, base_url: &str, worker_count: u32) -> Result<ServerRecord> {
        let mut state = self.state.lock();
        state.rooms.retain(|(sid, _), _| sid != server_id);

        let fresh = ServerRecord::new(server_id.to_string(), base_url.to_string(), worker_count);
        if let Some(existing) = state.server_mut(server_id) {
            let registered_at = existing.registered_at;
            *existing = ServerRecord { registered_at, ..fresh };
            return Ok(existing.clone());
        }
        state.servers.push(fresh.clone());
        Ok(fresh)
    }

    async fn servers(&self) -> Result<Vec<ServerRecord>> {
        Ok(self.state.lock().servers.clone())
    }

    async fn debit(&self, server_id: &str, room_id: &str, peer_count: u32) -> Result<Debit> {
        let mut state = self.state.lock();
        let key = (server_id.to_string(), room_id.to_string());
        let stale = state.rooms.get(&key).map(|entry| units(entry.peer_count));

        let server = state
            .server_mut(server_id)
            .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))?;
        let consumed = server.consumed_units.saturating_sub(stale.unwrap_or(0));
        let available = server.capacity_units.saturating_sub(consumed);
        let requested = units(peer_count);
        if available < requested {
            return Ok(Debit::Insufficient { available });
        }

        server.consumed_units = consumed + requested;
        if stale.is_none() {
            server.active_room_count += 1;
        }
        state.rooms.insert(
            key,
            RoomLedgerEntry {
                server_id: server_id.to_string(),
                room_id: room_id.to_string(),
                peer_count,
                placed_at: Utc::now(),
            },
        );
        Ok(Debit::Applied)
    }

    async fn reclaim(&self, server_id: &str, room_id: &str) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        let Some(entry) = state.rooms.remove(&(server_id.to_string(), room_id.to_string())) else {
            return Ok(None);
        };

        let credited = units(entry.peer_count);
        if let Some(server) = state.server_mut(server_id) {
            server.consumed_units = server.consumed_units.saturating_sub(credited);
            server.active_room_count = server.active_room_count.saturating_sub(1);
        }
        Ok(Some(credited))
    }

    async fn set_healthy(&self, server_id: &str, healthy: bool) -> Result<()> {
        let mut state = self.state.lock();
        let server = state
            .server_mut(server_id)
            .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))?;
        server.healthy = healthy;
        Ok(())
    }

    async fn room(&self, server_id: &str, room_id: &str) -> Result<Option<RoomLedgerEntry>> {
        let state = self.state.lock();
        Ok(state
            .rooms
            .get(&(server_id.to_string(), room_id.to_string()))
            .cloned())
    }
}
