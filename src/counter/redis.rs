//! Redis pending counter
//!
//! The whole check-and-set lives in one Lua script so concurrent admissions
//! for the same account serialise on the backend, not in the client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use rust_decimal::Decimal;

use crate::counter::traits::{BoundedAdd, PendingCounter};
use crate::counter::{from_minor, to_minor};
use crate::models::LedgerError;

/// Bounded add: returns `{accepted, total, reason}`. All values are minor
/// units; the script never sees fractional numbers.
const ADD_BOUNDED_LUA: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local delta = tonumber(ARGV[1])
local ceiling = tonumber(ARGV[2])

local candidate = current + delta
if candidate > ceiling then
    return {0, current, 'overspend'}
end
if candidate < 0 then
    return {0, current, 'negative'}
end

redis.call('SET', KEYS[1], candidate)
redis.call('EXPIRE', KEYS[1], ARGV[3])
return {1, candidate, 'ok'}
"#;

/// Subtract flooring at zero, refreshing the TTL.
const SUBTRACT_LUA: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local next = current - tonumber(ARGV[1])
if next < 0 then
    next = 0
end
redis.call('SET', KEYS[1], next)
redis.call('EXPIRE', KEYS[1], ARGV[2])
return next
"#;

pub struct RedisPendingCounter {
    conn: MultiplexedConnection,
    key_prefix: String,
    key_ttl_secs: u64,
    add_script: Script,
    subtract_script: Script,
}

impl RedisPendingCounter {
    pub async fn connect(url: &str, key_prefix: &str, key_ttl_secs: u64) -> Result<Self> {
        let client = redis::Client::open(url).context("parse redis url")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("connect to redis")?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            key_ttl_secs,
            add_script: Script::new(ADD_BOUNDED_LUA),
            subtract_script: Script::new(SUBTRACT_LUA),
        })
    }

    fn key(&self, account_id: &str) -> String {
        counter_key(&self.key_prefix, account_id)
    }
}

/// Per-account key layout: `<prefix>:pending:<account_id>`.
fn counter_key(prefix: &str, account_id: &str) -> String {
    format!("{}:pending:{}", prefix, account_id)
}

fn unavailable(e: redis::RedisError) -> LedgerError {
    LedgerError::CounterUnavailable(e.to_string())
}

#[async_trait]
impl PendingCounter for RedisPendingCounter {
    async fn get(&self, account_id: &str) -> Result<Decimal, LedgerError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(self.key(account_id)).await.map_err(unavailable)?;
        Ok(from_minor(value.unwrap_or(0)))
    }

    async fn add_bounded(
        &self,
        account_id: &str,
        delta: Decimal,
        ceiling: Decimal,
    ) -> Result<BoundedAdd, LedgerError> {
        let mut conn = self.conn.clone();
        let (accepted, total, reason): (i64, i64, String) = self
            .add_script
            .key(self.key(account_id))
            .arg(to_minor(delta)?)
            .arg(to_minor(ceiling)?)
            .arg(self.key_ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(BoundedAdd { accepted: accepted == 1, new_total: from_minor(total), reason })
    }

    async fn subtract(&self, account_id: &str, amount: Decimal) -> Result<(), LedgerError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .subtract_script
            .key(self.key(account_id))
            .arg(to_minor(amount)?)
            .arg(self.key_ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn clear(&self, account_id: &str) -> Result<(), LedgerError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(self.key(account_id)).await.map_err(unavailable)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(unavailable)?;
        Ok(())
    }
}
