// Redis implementation of the store contract
//
// Layout under `<ns>`:
//   <ns>:rev        revision counter
//   <ns>:data       hash of key -> JSON KeyValue envelope
//   <ns>:events     stream of changes, entry id `<revision>-0`
//   <ns>:leases     sorted set of lease id -> deadline (server clock, ms)
//   <ns>:lease_ttl  hash of lease id -> ttl seconds
//   <ns>:lease:<id> set of keys attached to a lease
//
// Each operation is one Lua script, so it is atomic and observes a single
// revision. Expired leases are reaped at the start of every script.

use super::{
    key_matches, GetResponse, KeyValue, KvStore, LeaseId, Revision, StoreEvent, StoreEventType,
    WatchResponse, WatchStream,
};
use crate::config::StoreConfig;
use crate::errors::StoreError;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

const PRELUDE: &str = r#"
if redis.replicate_commands then redis.replicate_commands() end
local ns = ARGV[1]
local history = tonumber(ARGV[2])

local function now_ms()
  local t = redis.call('TIME')
  return tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
end

local function next_rev()
  return redis.call('INCR', ns .. ':rev')
end

local function append(rev, kind, key, kv, prev)
  redis.call('XADD', ns .. ':events', 'MAXLEN', '~', history, rev .. '-0',
    'type', kind, 'key', key, 'kv', kv, 'prev', prev)
end

local function remove_key(key)
  local cur = redis.call('HGET', ns .. ':data', key)
  if not cur then return 0 end
  redis.call('HDEL', ns .. ':data', key)
  local old = cjson.decode(cur)
  if old.lease ~= 0 then
    redis.call('SREM', ns .. ':lease:' .. old.lease, key)
  end
  local rev = next_rev()
  local tomb = cjson.encode({key = key, value = '', create_revision = 0, mod_revision = rev, lease = 0})
  append(rev, 'delete', key, tomb, cur)
  return 1
end

local function drop_lease(id)
  local set = ns .. ':lease:' .. id
  local keys = redis.call('SMEMBERS', set)
  table.sort(keys)
  for _, key in ipairs(keys) do
    local cur = redis.call('HGET', ns .. ':data', key)
    if cur and tostring(cjson.decode(cur).lease) == tostring(id) then
      remove_key(key)
    end
  end
  redis.call('DEL', set)
  redis.call('ZREM', ns .. ':leases', id)
  redis.call('HDEL', ns .. ':lease_ttl', id)
end

local function reap()
  local expired = redis.call('ZRANGEBYSCORE', ns .. ':leases', '-inf', now_ms())
  for _, id in ipairs(expired) do
    drop_lease(id)
  end
end

local function write(key, value, lease, absent_only)
  local prev = redis.call('HGET', ns .. ':data', key)
  if prev and absent_only then return -1 end
  if lease ~= 0 and not redis.call('ZSCORE', ns .. ':leases', lease) then return -2 end
  local create = nil
  if prev then
    local old = cjson.decode(prev)
    create = old.create_revision
    if old.lease ~= 0 and old.lease ~= lease then
      redis.call('SREM', ns .. ':lease:' .. old.lease, key)
    end
  end
  local rev = next_rev()
  if not create then create = rev end
  local kv = cjson.encode({key = key, value = value, create_revision = create, mod_revision = rev, lease = lease})
  redis.call('HSET', ns .. ':data', key, kv)
  if lease ~= 0 then
    redis.call('SADD', ns .. ':lease:' .. lease, key)
  end
  append(rev, 'put', key, kv, prev or '')
  return rev
end

reap()
"#;

const PUT_BODY: &str = r#"
return write(ARGV[3], ARGV[4], tonumber(ARGV[5]), ARGV[6] == '1')
"#;

const RANGE_BODY: &str = r#"
local target = ARGV[3]
local exact = ARGV[4] == '1'
local flat = redis.call('HGETALL', ns .. ':data')
local out = {}
for i = 1, #flat, 2 do
  local k = flat[i]
  if (exact and k == target) or ((not exact) and string.sub(k, 1, #target) == target) then
    table.insert(out, flat[i + 1])
  end
end
local rev = tonumber(redis.call('GET', ns .. ':rev') or '0')
return {rev, out}
"#;

const DELETE_BODY: &str = r#"
local target = ARGV[3]
local exact = ARGV[4] == '1'
if exact then
  return remove_key(target)
end
local keys = redis.call('HKEYS', ns .. ':data')
table.sort(keys)
local deleted = 0
for _, k in ipairs(keys) do
  if string.sub(k, 1, #target) == target then
    deleted = deleted + remove_key(k)
  end
end
return deleted
"#;

const GRANT_BODY: &str = r#"
local ttl = tonumber(ARGV[3])
local id = redis.call('INCR', ns .. ':lease_seq')
redis.call('ZADD', ns .. ':leases', now_ms() + ttl * 1000, id)
redis.call('HSET', ns .. ':lease_ttl', id, ttl)
return id
"#;

const KEEPALIVE_BODY: &str = r#"
local ttl = redis.call('HGET', ns .. ':lease_ttl', ARGV[3])
if not ttl then return 0 end
redis.call('ZADD', ns .. ':leases', now_ms() + tonumber(ttl) * 1000, ARGV[3])
return 1
"#;

const REVOKE_BODY: &str = r#"
if not redis.call('ZSCORE', ns .. ':leases', ARGV[3]) then return 0 end
drop_lease(ARGV[3])
return 1
"#;

const WATCH_BATCH: usize = 256;

struct Scripts {
    put: Script,
    range: Script,
    delete: Script,
    grant: Script,
    keep_alive: Script,
    revoke: Script,
}

impl Scripts {
    fn new() -> Self {
        let build = |body: &str| Script::new(&format!("{}{}", PRELUDE, body));
        Self {
            put: build(PUT_BODY),
            range: build(RANGE_BODY),
            delete: build(DELETE_BODY),
            grant: build(GRANT_BODY),
            keep_alive: build(KEEPALIVE_BODY),
            revoke: build(REVOKE_BODY),
        }
    }
}

/// Store backed by a single Redis server
pub struct RedisStore {
    manager: ConnectionManager,
    namespace: String,
    history_limit: usize,
    poll_interval: Duration,
    scripts: Scripts,
}

impl RedisStore {
    /// Connect to Redis and verify the connection
    #[instrument(skip(config), fields(redis_url = %config.url, namespace = %config.namespace))]
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        info!("Connecting Redis store");

        let client = Client::open(config.url.as_str()).map_err(|e| {
            StoreError::ConnectionFailed(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            StoreError::ConnectionFailed(format!("Failed to create connection manager: {}", e))
        })?;

        let store = Self {
            manager,
            namespace: config.namespace.clone(),
            history_limit: config.history_limit,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            scripts: Scripts::new(),
        };
        store.health_check().await?;

        info!("Redis store connected");
        Ok(store)
    }

    /// Health check - verify Redis connection is working
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let response: String = redis::cmd("PING").query_async(&mut conn).await?;
        if response != "PONG" {
            return Err(StoreError::Backend(format!(
                "Unexpected PING response: {}",
                response
            )));
        }
        Ok(())
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.namespace, suffix)
    }

    async fn range(&self, target: &str, exact: bool) -> Result<GetResponse, StoreError> {
        let mut conn = self.manager.clone();
        let (revision, raw): (i64, Vec<String>) = self
            .scripts
            .range
            .arg(&self.namespace)
            .arg(self.history_limit)
            .arg(target)
            .arg(if exact { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        let mut kvs = raw
            .iter()
            .map(|item| serde_json::from_str::<KeyValue>(item))
            .collect::<Result<Vec<_>, _>>()?;
        kvs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(GetResponse { kvs, revision })
    }

    async fn write(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
        absent_only: bool,
    ) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();
        let lease_id = lease.unwrap_or(0);
        let result: i64 = self
            .scripts
            .put
            .arg(&self.namespace)
            .arg(self.history_limit)
            .arg(key)
            .arg(value)
            .arg(lease_id)
            .arg(if absent_only { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        if result == -2 {
            return Err(StoreError::LeaseNotFound(lease_id));
        }
        Ok(result)
    }

    async fn remove(&self, target: &str, exact: bool) -> Result<u64, StoreError> {
        let mut conn = self.manager.clone();
        let deleted: u64 = self
            .scripts
            .delete
            .arg(&self.namespace)
            .arg(self.history_limit)
            .arg(target)
            .arg(if exact { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted)
    }

    async fn lease_call(&self, script: &Script, arg: i64) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();
        let result: i64 = script
            .arg(&self.namespace)
            .arg(self.history_limit)
            .arg(arg)
            .invoke_async(&mut conn)
            .await?;
        Ok(result)
    }
}

/// Decode one stream entry into a store event
fn parse_entry(id: &str, fields: &HashMap<String, String>) -> Result<StoreEvent, StoreError> {
    let revision: Revision = id
        .split('-')
        .next()
        .and_then(|rev| rev.parse().ok())
        .ok_or_else(|| StoreError::Backend(format!("Malformed stream id: {}", id)))?;

    let event_type = match fields.get("type").map(String::as_str) {
        Some("put") => StoreEventType::Put,
        Some("delete") => StoreEventType::Delete,
        other => {
            return Err(StoreError::Backend(format!(
                "Unknown event type {:?} at revision {}",
                other, revision
            )))
        }
    };

    let kv: KeyValue = serde_json::from_str(fields.get("kv").map(String::as_str).unwrap_or(""))?;
    let prev_kv = match fields.get("prev").map(String::as_str) {
        None | Some("") => None,
        Some(raw) => Some(serde_json::from_str::<KeyValue>(raw)?),
    };

    Ok(StoreEvent {
        event_type,
        kv,
        prev_kv,
    })
}

fn revision_of(id: &str) -> Option<Revision> {
    id.split('-').next().and_then(|rev| rev.parse().ok())
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        Ok(self.range(key, true).await?.kvs.into_iter().next())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse, StoreError> {
        self.range(prefix, false).await
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StoreError> {
        self.write(key, value, lease, false).await
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, StoreError> {
        Ok(self.write(key, value, lease, true).await? > 0)
    }

    async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        self.remove(key, true).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        self.remove(prefix, false).await
    }

    async fn grant(&self, ttl_seconds: i64) -> Result<LeaseId, StoreError> {
        self.lease_call(&self.scripts.grant, ttl_seconds.max(1)).await
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<(), StoreError> {
        match self.lease_call(&self.scripts.keep_alive, lease).await? {
            1 => Ok(()),
            _ => Err(StoreError::LeaseNotFound(lease)),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        match self.lease_call(&self.scripts.revoke, lease).await? {
            1 => Ok(()),
            _ => Err(StoreError::LeaseNotFound(lease)),
        }
    }

    #[instrument(skip(self))]
    async fn watch(
        &self,
        key: &str,
        from_revision: Revision,
        prefix: bool,
    ) -> Result<WatchStream, StoreError> {
        let mut conn = self.manager.clone();
        let current: Option<i64> = conn.get(self.key("rev")).await?;
        let mut next = if from_revision <= 0 {
            current.unwrap_or(0) + 1
        } else {
            from_revision
        };

        let (tx, rx) = mpsc::channel(64);
        let events_key = self.key("events");
        let target = key.to_string();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    return;
                }

                let entries: Result<Vec<(String, HashMap<String, String>)>, redis::RedisError> =
                    redis::cmd("XRANGE")
                        .arg(&events_key)
                        .arg(format!("{}-0", next))
                        .arg("+")
                        .arg("COUNT")
                        .arg(WATCH_BATCH)
                        .query_async(&mut conn)
                        .await;

                let entries = match entries {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(error = %e, key = %target, "Redis watch poll failed");
                        let _ = tx.send(Err(StoreError::from(e))).await;
                        return;
                    }
                };

                if entries.is_empty() {
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }

                if let Some(first) = entries.first().and_then(|(id, _)| revision_of(id)) {
                    if first > next {
                        let _ = tx
                            .send(Err(StoreError::Compacted {
                                requested: next,
                                compacted: first - 1,
                            }))
                            .await;
                        return;
                    }
                }

                let mut events = Vec::with_capacity(entries.len());
                for (id, fields) in &entries {
                    match parse_entry(id, fields) {
                        Ok(event) => {
                            next = event.revision() + 1;
                            if key_matches(&event.kv.key, &target, prefix) {
                                events.push(event);
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }

                if !events.is_empty() {
                    debug!(count = events.len(), key = %target, "Redis watch batch");
                    if tx.send(Ok(WatchResponse { events })).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}
