use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::PaymentError;
use crate::models::webhook::DeadLetter;
use crate::redis_client::RedisClient;

/// Журнал уже принятых событий шлюза. Присутствие записи - единственный
/// признак того, что событие нужно пропустить.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Атомарно записывает событие. `false`, если оно уже было записано.
    /// При ошибке ничего не записано.
    async fn claim(&self, event_id: &str) -> Result<bool, PaymentError>;

    async fn is_claimed(&self, event_id: &str) -> Result<bool, PaymentError>;

    /// Откат захвата, чтобы повторная доставка шлюзом обработала событие заново.
    async fn release(&self, event_id: &str) -> Result<(), PaymentError>;

    /// Удаляет записи старше `older_than`, возвращает их количество.
    async fn sweep(&self, older_than: Duration) -> Result<u64, PaymentError>;

    async fn dead_letter(&self, entry: &DeadLetter) -> Result<(), PaymentError>;
}

const EVENT_KEY_PREFIX: &str = "webhook:event:";
const INDEX_KEY: &str = "webhook:events:index";
pub const DEAD_LETTER_KEY: &str = "webhook:dead_letter";

// SET NX EX и ZADD одним шагом; 1 - захвачено, 0 - уже было
const CLAIM_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
    redis.call('ZADD', KEYS[2], ARGV[1], ARGV[3])
    return 1
end
return 0
"#;

fn event_key(event_id: &str) -> String {
    format!("{EVENT_KEY_PREFIX}{event_id}")
}

#[derive(Clone)]
pub struct RedisLedger {
    redis: RedisClient,
    retention: Duration,
}

impl RedisLedger {
    pub fn new(redis: RedisClient, retention: Duration) -> Self {
        Self { redis, retention }
    }
}

#[async_trait]
impl IdempotencyLedger for RedisLedger {
    async fn claim(&self, event_id: &str) -> Result<bool, PaymentError> {
        let mut conn = self.redis.conn.clone();
        let now = Utc::now().timestamp();

        // Ключ без записи в индексе остался бы захваченным после ошибки,
        // поэтому оба шага идут одним скриптом
        let claimed: i64 = redis::Script::new(CLAIM_SCRIPT)
            .key(event_key(event_id))
            .key(INDEX_KEY)
            .arg(now)
            .arg(self.retention.as_secs().max(1))
            .arg(event_id)
            .invoke_async(&mut conn)
            .await?;

        if claimed == 0 {
            debug!("Event {} already claimed", event_id);
            return Ok(false);
        }
        Ok(true)
    }

    async fn is_claimed(&self, event_id: &str) -> Result<bool, PaymentError> {
        let mut conn = self.redis.conn.clone();
        let exists: bool = conn.exists(event_key(event_id)).await?;
        Ok(exists)
    }

    async fn release(&self, event_id: &str) -> Result<(), PaymentError> {
        let mut conn = self.redis.conn.clone();
        let mut pipe = redis::pipe();
        pipe.del(event_key(event_id)).ignore();
        pipe.zrem(INDEX_KEY, event_id).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn sweep(&self, older_than: Duration) -> Result<u64, PaymentError> {
        let mut conn = self.redis.conn.clone();
        let cutoff = Utc::now().timestamp() - older_than.as_secs() as i64;

        let stale: Vec<String> = conn.zrangebyscore(INDEX_KEY, "-inf", cutoff).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        for event_id in &stale {
            pipe.del(event_key(event_id)).ignore();
        }
        pipe.zrembyscore(INDEX_KEY, "-inf", cutoff).ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        info!("Swept {} processed webhook events from the ledger", stale.len());
        Ok(stale.len() as u64)
    }

    async fn dead_letter(&self, entry: &DeadLetter) -> Result<(), PaymentError> {
        let payload =
            serde_json::to_string(entry).map_err(|e| PaymentError::Ledger(format!("dead letter encoding: {e}")))?;
        let mut conn = self.redis.conn.clone();
        let _: i64 = conn.lpush(DEAD_LETTER_KEY, payload).await?;
        error!(
            "Webhook event {} ({}) moved to dead letter: {}",
            entry.event_id, entry.event_type, entry.reason
        );
        Ok(())
    }
}
