//! Redis-backed ledger shared by every balancer instance
//!
//! Records are JSON values; each mutation is one Lua script so it runs as a
//! single atomic step on the Redis side.
//!
//! Keys (all under the configured prefix):
//! - `servers`: set of registered server ids
//! - `server:{id}`: the `ServerRecord`
//! - `server:{id}:rooms`: set of room ids placed on that server
//! - `room:{serverId}:{roomId}`: the `RoomLedgerEntry`

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Script};
use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{timeout, Duration};

use super::{units, CapacityLedger, Debit, RoomLedgerEntry, ServerRecord};
use crate::error::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

const REGISTER_SCRIPT: &str = r"
local record = cjson.decode(ARGV[1])
local existing = redis.call('GET', KEYS[2])
if existing then
    record['registeredAt'] = cjson.decode(existing)['registeredAt']
end

for _, room_id in ipairs(redis.call('SMEMBERS', KEYS[3])) do
    redis.call('DEL', ARGV[3] .. room_id)
end
redis.call('DEL', KEYS[3])

local encoded = cjson.encode(record)
redis.call('SET', KEYS[2], encoded)
redis.call('SADD', KEYS[1], ARGV[2])
return encoded
";

// Returns {1, 0} when applied, {0, available} when short, {-1, 0} for unknown servers
const DEBIT_SCRIPT: &str = r"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return {-1, 0}
end
local server = cjson.decode(raw)

local consumed = server['consumedUnits']
local stale = redis.call('GET', KEYS[2])
if stale then
    local p = cjson.decode(stale)['peerCount']
    consumed = math.max(consumed - p * (p - 1) * 2, 0)
end

local requested = tonumber(ARGV[3])
local available = math.max(server['capacityUnits'] - consumed, 0)
if available < requested then
    return {0, available}
end

server['consumedUnits'] = consumed + requested
if not stale then
    server['activeRoomCount'] = server['activeRoomCount'] + 1
end
redis.call('SET', KEYS[1], cjson.encode(server))
redis.call('SET', KEYS[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[2])
return {1, 0}
";

const RECLAIM_SCRIPT: &str = r"
local entry = redis.call('GET', KEYS[2])
if not entry then
    return -1
end
local p = cjson.decode(entry)['peerCount']
local credited = p * (p - 1) * 2

local raw = redis.call('GET', KEYS[1])
if raw then
    local server = cjson.decode(raw)
    server['consumedUnits'] = math.max(server['consumedUnits'] - credited, 0)
    server['activeRoomCount'] = math.max(server['activeRoomCount'] - 1, 0)
    redis.call('SET', KEYS[1], cjson.encode(server))
end

redis.call('DEL', KEYS[2])
redis.call('SREM', KEYS[3], ARGV[1])
return credited
";

const HEALTH_SCRIPT: &str = r"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return 0
end
local server = cjson.decode(raw)
server['healthy'] = ARGV[1] == '1'
redis.call('SET', KEYS[1], cjson.encode(server))
return 1
";

/// Ledger stored in Redis
pub struct RedisLedger {
    client: Client,
    key_prefix: String,
    register: Script,
    debit: Script,
    reclaim: Script,
    health: Script,
}

impl RedisLedger {
    pub fn new(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Failed to connect to Redis: {e}")))?;

        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
            register: Script::new(REGISTER_SCRIPT),
            debit: Script::new(DEBIT_SCRIPT),
            reclaim: Script::new(RECLAIM_SCRIPT),
            health: Script::new(HEALTH_SCRIPT),
        })
    }

    fn servers_key(&self) -> String {
        format!("{}servers", self.key_prefix)
    }

    fn server_key(&self, server_id: &str) -> String {
        format!("{}server:{server_id}", self.key_prefix)
    }

    fn server_rooms_key(&self, server_id: &str) -> String {
        format!("{}server:{server_id}:rooms", self.key_prefix)
    }

    fn room_key_prefix(&self, server_id: &str) -> String {
        format!("{}room:{server_id}:", self.key_prefix)
    }

    fn room_key(&self, server_id: &str, room_id: &str) -> String {
        format!("{}{room_id}", self.room_key_prefix(server_id))
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))?
        .map_err(|e| Error::Database(format!("Redis connection failed: {e}")))
    }
}

#[async_trait]
impl CapacityLedger for RedisLedger {
    async fn register_server(&self, server_id: &str, base_url: &str, worker_count: u32) -> Result<ServerRecord> {
        let mut conn = self.connection().await?;

        let record = ServerRecord::new(server_id.to_string(), base_url.to_string(), worker_count);
        let record_json = serde_json::to_string(&record)
            .map_err(|e| Error::Serialization(format!("Failed to serialize server record: {e}")))?;

        let stored: String = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.register
                .key(self.servers_key())
                .key(self.server_key(server_id))
                .key(self.server_rooms_key(server_id))
                .arg(&record_json)
                .arg(server_id)
                .arg(self.room_key_prefix(server_id))
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis register script timed out".to_string()))?
        .map_err(|e| Error::Database(format!("Redis register script failed: {e}")))?;

        serde_json::from_str(&stored)
            .map_err(|e| Error::Serialization(format!("Failed to parse server record: {e}")))
    }

    async fn servers(&self) -> Result<Vec<ServerRecord>> {
        let mut conn = self.connection().await?;

        let ids: Vec<String> = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            ::redis::cmd("SMEMBERS")
                .arg(self.servers_key())
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis SMEMBERS timed out".to_string()))?
        .map_err(|e| Error::Database(format!("Redis SMEMBERS failed: {e}")))?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.server_key(id)).collect();
        let values: Vec<Option<String>> = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            ::redis::cmd("MGET").arg(&keys).query_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis MGET timed out".to_string()))?
        .map_err(|e| Error::Database(format!("Redis MGET failed: {e}")))?;

        let mut records = Vec::with_capacity(values.len());
        for value in values.into_iter().flatten() {
            match serde_json::from_str::<ServerRecord>(&value) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable server record"),
            }
        }
        records.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.server_id.cmp(&b.server_id))
        });
        Ok(records)
    }

    async fn debit(&self, server_id: &str, room_id: &str, peer_count: u32) -> Result<Debit> {
        let mut conn = self.connection().await?;

        let entry = RoomLedgerEntry {
            server_id: server_id.to_string(),
            room_id: room_id.to_string(),
            peer_count,
            placed_at: Utc::now(),
        };
        let entry_json = serde_json::to_string(&entry)
            .map_err(|e| Error::Serialization(format!("Failed to serialize room entry: {e}")))?;

        let (status, available): (i64, i64) = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.debit
                .key(self.server_key(server_id))
                .key(self.room_key(server_id, room_id))
                .key(self.server_rooms_key(server_id))
                .arg(&entry_json)
                .arg(room_id)
                .arg(units(peer_count))
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis debit script timed out".to_string()))?
        .map_err(|e| Error::Database(format!("Redis debit script failed: {e}")))?;

        match status {
            1 => Ok(Debit::Applied),
            0 => Ok(Debit::Insufficient {
                available: u64::try_from(available).unwrap_or(0),
            }),
            _ => Err(Error::ServerNotFound(server_id.to_string())),
        }
    }

    async fn reclaim(&self, server_id: &str, room_id: &str) -> Result<Option<u64>> {
        let mut conn = self.connection().await?;

        let credited: i64 = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.reclaim
                .key(self.server_key(server_id))
                .key(self.room_key(server_id, room_id))
                .key(self.server_rooms_key(server_id))
                .arg(room_id)
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis reclaim script timed out".to_string()))?
        .map_err(|e| Error::Database(format!("Redis reclaim script failed: {e}")))?;

        Ok(u64::try_from(credited).ok())
    }

    async fn set_healthy(&self, server_id: &str, healthy: bool) -> Result<()> {
        let mut conn = self.connection().await?;

        let found: i64 = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.health
                .key(self.server_key(server_id))
                .arg(if healthy { "1" } else { "0" })
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis health script timed out".to_string()))?
        .map_err(|e| Error::Database(format!("Redis health script failed: {e}")))?;

        if found == 0 {
            return Err(Error::ServerNotFound(server_id.to_string()));
        }
        Ok(())
    }

    async fn room(&self, server_id: &str, room_id: &str) -> Result<Option<RoomLedgerEntry>> {
        let mut conn = self.connection().await?;

        let value: Option<String> = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            ::redis::cmd("GET")
                .arg(self.room_key(server_id, room_id))
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis GET timed out".to_string()))?
        .map_err(|e| Error::Database(format!("Redis GET failed: {e}")))?;

        value
            .map(|v| {
                serde_json::from_str(&v)
                    .map_err(|e| Error::Serialization(format!("Failed to parse room entry: {e}")))
            })
            .transpose()
    }
}
