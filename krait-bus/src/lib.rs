//! Durable append-only event log over Redis Streams.
//!
//! Each record is a single `data` field holding the envelope JSON, so the
//! envelope structure survives the stream's flat field/value model. Delivery
//! is at-least-once: the group bookmark only advances on ack, and consumers
//! rely on business idempotency downstream.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Value};
use thiserror::Error;
use tracing::{debug, warn};

use krait_core::events::{topics, DeadLetter, Envelope};
use krait_core::ids;

pub mod lock;

pub use lock::{PlanLock, PlanLockGuard};

/// Convenience alias for bus results.
pub type BusResult<T> = Result<T, BusError>;

/// Errors surfaced by the event-log adapter.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("malformed stream record {id}: {reason}")]
    Malformed { id: String, reason: String },
}

/// One delivered record, pending ack.
#[derive(Clone, Debug)]
pub struct StreamRecord {
    pub topic: String,
    pub record_id: String,
    pub envelope: Envelope,
}

/// Raw record that failed envelope decoding; routed to the DLQ by the caller.
#[derive(Clone, Debug)]
pub struct MalformedRecord {
    pub topic: String,
    pub record_id: String,
    pub raw: serde_json::Value,
    pub reason: String,
}

/// A read batch: decoded records plus the ones that failed validation.
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub records: Vec<StreamRecord>,
    pub malformed: Vec<MalformedRecord>,
}

/// Abstract event-log surface so tests can run against an in-memory fake.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> BusResult<String>;
    async fn consume(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> BusResult<ReadBatch>;
    async fn ack(&self, topic: &str, group: &str, record_id: &str) -> BusResult<()>;
    async fn ensure_group(&self, topic: &str, group: &str) -> BusResult<()>;
    async fn pending_count(&self, topic: &str, group: &str) -> BusResult<u64>;
    async fn group_lag(&self, topic: &str, group: &str) -> BusResult<u64>;
}

/// Redis Streams implementation of [`EventLog`].
#[derive(Clone)]
pub struct RedisEventLog {
    conn: ConnectionManager,
}

impl RedisEventLog {
    /// Connect to the Redis instance backing the event log.
    pub async fn connect(redis_url: &str) -> BusResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Build directly from an existing managed connection.
    #[must_use]
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Push a record that could not be handled onto the dead-letter topic.
    /// The caller still acks the original so the consumer does not wedge.
    pub async fn publish_dead_letter(
        &self,
        source_topic: &str,
        record_id: &str,
        reason: &str,
        raw: serde_json::Value,
    ) -> BusResult<String> {
        let letter = DeadLetter {
            source_topic: source_topic.to_string(),
            message_id: record_id.to_string(),
            reason: reason.to_string(),
            raw,
        };
        let envelope = Envelope::new("execution-service", &letter)?;
        warn!(
            topic = source_topic,
            record_id,
            reason,
            "routing message to dead-letter topic"
        );
        self.publish(topics::DLQ, &envelope).await
    }

    fn decode_record(topic: &str, record_id: &str, fields: &[(String, Value)]) -> ReadBatch {
        let mut batch = ReadBatch::default();
        let data = fields.iter().find_map(|(name, value)| {
            if name == "data" || name == "json" {
                value_to_string(value)
            } else {
                None
            }
        });
        let Some(data) = data else {
            batch.malformed.push(MalformedRecord {
                topic: topic.to_string(),
                record_id: record_id.to_string(),
                raw: fields_to_json(fields),
                reason: "missing data field".into(),
            });
            return batch;
        };
        match serde_json::from_str::<Envelope>(&data) {
            Ok(envelope) => batch.records.push(StreamRecord {
                topic: topic.to_string(),
                record_id: record_id.to_string(),
                envelope,
            }),
            Err(err) => batch.malformed.push(MalformedRecord {
                topic: topic.to_string(),
                record_id: record_id.to_string(),
                raw: serde_json::Value::String(data),
                reason: err.to_string(),
            }),
        }
        batch
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

fn fields_to_json(fields: &[(String, Value)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in fields {
        map.insert(
            name.clone(),
            serde_json::Value::String(value_to_string(value).unwrap_or_default()),
        );
    }
    serde_json::Value::Object(map)
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> BusResult<String> {
        let data = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(topic, "*", &[("data", data.as_str())]).await?;
        debug!(topic, event_id = %envelope.event_id, record_id = %id, "published");
        Ok(id)
    }

    async fn consume(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> BusResult<ReadBatch> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);
        let reply: StreamReadReply = conn.xread_options(&[topic], &[">"], &opts).await?;

        let mut batch = ReadBatch::default();
        for key in reply.keys {
            for entry in key.ids {
                let fields: Vec<(String, Value)> = entry.map.into_iter().collect();
                let mut decoded = Self::decode_record(topic, &entry.id, &fields);
                batch.records.append(&mut decoded.records);
                batch.malformed.append(&mut decoded.malformed);
            }
        }
        Ok(batch)
    }

    async fn ack(&self, topic: &str, group: &str, record_id: &str) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(topic, group, &[record_id]).await?;
        Ok(())
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let created: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(topic, group, "0-0").await;
        match created {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn pending_count(&self, topic: &str, group: &str) -> BusResult<u64> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XPENDING")
            .arg(topic)
            .arg(group)
            .query_async(&mut conn)
            .await?;
        // XPENDING summary form: [count, min-id, max-id, consumers]
        if let Value::Bulk(items) = reply {
            if let Some(Value::Int(count)) = items.first() {
                return Ok(*count as u64);
            }
        }
        Ok(0)
    }

    async fn group_lag(&self, topic: &str, group: &str) -> BusResult<u64> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(topic)
            .query_async(&mut conn)
            .await?;
        let Value::Bulk(groups) = reply else {
            return Ok(0);
        };
        for entry in groups {
            let Value::Bulk(pairs) = entry else { continue };
            let mut name = None;
            let mut lag = 0u64;
            let mut iter = pairs.iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                match value_to_string(k).as_deref() {
                    Some("name") => name = value_to_string(v),
                    Some("lag") => {
                        if let Value::Int(n) = v {
                            lag = (*n).max(0) as u64;
                        }
                    }
                    _ => {}
                }
            }
            if name.as_deref() == Some(group) {
                return Ok(lag);
            }
        }
        Ok(0)
    }
}

/// Build an envelope for an outbound event, stamping service identity.
pub fn envelope_for<T: serde::Serialize>(service: &str, payload: &T) -> BusResult<Envelope> {
    Ok(Envelope::new(service, payload)?)
}

/// Compute consumer lag in milliseconds against an envelope timestamp.
#[must_use]
pub fn envelope_lag_ms(envelope: &Envelope) -> i64 {
    (ids::now_ms() - envelope.ts_ms).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_field(json: &str) -> Vec<(String, Value)> {
        vec![("data".to_string(), Value::Data(json.as_bytes().to_vec()))]
    }

    #[test]
    fn decode_record_accepts_valid_envelope() {
        let json = serde_json::json!({
            "event_id": "e1",
            "ts_ms": 1,
            "service": "strategy-service",
            "payload": {"symbol": "BTCUSDT"}
        })
        .to_string();
        let batch = RedisEventLog::decode_record("stream:trade_plan", "1-0", &data_field(&json));
        assert_eq!(batch.records.len(), 1);
        assert!(batch.malformed.is_empty());
        assert_eq!(batch.records[0].envelope.event_id, "e1");
    }

    #[test]
    fn decode_record_flags_invalid_json() {
        let batch = RedisEventLog::decode_record("stream:trade_plan", "1-0", &data_field("{not json"));
        assert!(batch.records.is_empty());
        assert_eq!(batch.malformed.len(), 1);
        assert_eq!(batch.malformed[0].record_id, "1-0");
    }

    #[test]
    fn decode_record_flags_missing_data_field() {
        let fields = vec![("type".to_string(), Value::Data(b"trade_plan".to_vec()))];
        let batch = RedisEventLog::decode_record("stream:trade_plan", "2-0", &fields);
        assert_eq!(batch.malformed.len(), 1);
        assert_eq!(batch.malformed[0].reason, "missing data field");
    }

    #[test]
    fn envelope_lag_is_non_negative() {
        let env = Envelope::new("test", &serde_json::json!({})).unwrap();
        assert!(envelope_lag_ms(&env) >= 0);
        let future = Envelope {
            ts_ms: ids::now_ms() + 60_000,
            ..env
        };
        assert_eq!(envelope_lag_ms(&future), 0);
    }
}
