use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info};

use super::scripts::Scripts;
use crate::{
    Backoff, ConnectionEvent, JobId, JobRecord, JobState, LeasedJob, NewJob, QueueError,
    QueueResult, QueueStats, StalledSweep, TerminalState,
    backend::{QueueBackend, STALLED_LIMIT_REASON},
    config::RedisSettings,
    types::{self, LeaseToken},
};

/// Key names of one queue
struct QueueKeys {
    base: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{}:{}", prefix, queue),
        }
    }

    fn id(&self) -> String {
        format!("{}:id", self.base)
    }

    fn wait(&self) -> String {
        format!("{}:wait", self.base)
    }

    fn delayed(&self) -> String {
        format!("{}:delayed", self.base)
    }

    fn active(&self) -> String {
        format!("{}:active", self.base)
    }

    fn completed(&self) -> String {
        format!("{}:completed", self.base)
    }

    fn failed(&self) -> String {
        format!("{}:failed", self.base)
    }

    fn paused(&self) -> String {
        format!("{}:paused", self.base)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.base)
    }

    fn terminal(&self, state: TerminalState) -> String {
        match state {
            TerminalState::Completed => self.completed(),
            TerminalState::Failed => self.failed(),
        }
    }
}

/// Redis-backed store. Every state transition is one Lua script, so a job
/// can only be claimed by one slot across all processes sharing the server.
///
/// The connection is opened lazily and then kept by `ConnectionManager`,
/// which reconnects on its own; failures are reported as `Transport` errors
/// and `ConnectionEvent::Error` rather than tearing anything down.
pub struct RedisBackend {
    client: redis::Client,
    manager: Mutex<Option<ConnectionManager>>,
    prefix: String,
    scripts: Scripts,
    events: broadcast::Sender<ConnectionEvent>,
}

impl RedisBackend {
    /// Build a backend without connecting. Fails only on malformed settings.
    pub fn new(settings: &RedisSettings, events: broadcast::Sender<ConnectionEvent>) -> QueueResult<Self> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(settings.host.clone(), settings.port),
            redis: redis::RedisConnectionInfo {
                db: settings.db,
                password: settings.password.clone(),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)
            .map_err(|e| QueueError::Config(format!("invalid redis settings: {}", e)))?;

        Ok(Self {
            client,
            manager: Mutex::new(None),
            prefix: settings.key_prefix.clone(),
            scripts: Scripts::load(),
            events,
        })
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys::new(&self.prefix, queue)
    }

    async fn conn(&self) -> QueueResult<ConnectionManager> {
        let mut slot = self.manager.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        match self.client.get_connection_manager().await {
            Ok(conn) => {
                info!("Connected to Redis");
                let _ = self.events.send(ConnectionEvent::Connected);
                *slot = Some(conn.clone());
                Ok(conn)
            }
            Err(e) => Err(self.transport(e)),
        }
    }

    /// Report a store failure and turn it into a queue error
    fn transport(&self, err: RedisError) -> QueueError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            error!("Redis connection error: {}", err);
            let _ = self.events.send(ConnectionEvent::Error(err.to_string()));
        }
        QueueError::Transport(err.to_string())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn keep_arg(keep: Option<usize>) -> i64 {
    keep.map(|k| k as i64).unwrap_or(-1)
}

/// Split a status-first script reply into its status and field map
fn owner_reply(job_id: &JobId, reply: Vec<String>) -> QueueResult<HashMap<String, String>> {
    let mut items = reply.into_iter();
    match items.next().as_deref() {
        Some("ok") => {
            let mut fields = HashMap::new();
            while let (Some(k), Some(v)) = (items.next(), items.next()) {
                fields.insert(k, v);
            }
            Ok(fields)
        }
        Some("missing") => Err(QueueError::JobNotFound(job_id.clone())),
        Some("lost") => Err(QueueError::LeaseLost(job_id.clone())),
        other => Err(QueueError::Internal(format!("unexpected script reply: {:?}", other))),
    }
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> QueueResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| QueueError::Serialization(format!("job hash is missing '{}'", name)))
}

fn number<T: FromStr>(fields: &HashMap<String, String>, name: &str) -> QueueResult<T> {
    field(fields, name)?
        .parse()
        .map_err(|_| QueueError::Serialization(format!("job hash field '{}' is not a number", name)))
}

fn timestamp(fields: &HashMap<String, String>, name: &str) -> QueueResult<Option<DateTime<Utc>>> {
    match fields.get(name) {
        None => Ok(None),
        Some(raw) => {
            let millis: i64 = raw
                .parse()
                .map_err(|_| QueueError::Serialization(format!("job hash field '{}' is not a timestamp", name)))?;
            DateTime::<Utc>::from_timestamp_millis(millis).map(Some).ok_or_else(|| {
                QueueError::Serialization(format!("job hash field '{}' is out of range", name))
            })
        }
    }
}

/// Rebuild a snapshot from a job hash
pub(crate) fn record_from_fields(queue: &str, fields: &HashMap<String, String>) -> QueueResult<JobRecord> {
    let state = JobState::from_str(field(fields, "state")?).map_err(QueueError::Serialization)?;
    let backoff: Backoff = serde_json::from_str(field(fields, "backoff")?)?;
    let return_value = fields
        .get("return_value")
        .map(|raw| serde_json::from_str::<Value>(raw))
        .transpose()?;

    Ok(JobRecord {
        id: JobId::from(field(fields, "id")?),
        queue: queue.to_string(),
        payload: serde_json::from_str(field(fields, "payload")?)?,
        priority: number(fields, "priority")?,
        delay_ms: number(fields, "delay")?,
        max_attempts: number(fields, "max_attempts")?,
        backoff,
        state,
        progress: number(fields, "progress")?,
        attempts_made: number(fields, "attempts_made")?,
        stalled_count: number(fields, "stalled_count")?,
        created_at: timestamp(fields, "created_at")?
            .ok_or_else(|| QueueError::Serialization("job hash is missing 'created_at'".to_string()))?,
        ready_at: timestamp(fields, "ready_at")?,
        processed_on: timestamp(fields, "processed_on")?,
        finished_on: timestamp(fields, "finished_on")?,
        failed_reason: fields.get("failed_reason").cloned(),
        return_value,
    })
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn enqueue(&self, queue: &str, job: NewJob) -> QueueResult<JobRecord> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let fields: HashMap<String, String> = self
            .scripts
            .enqueue
            .key(keys.id())
            .key(keys.wait())
            .key(keys.delayed())
            .arg(keys.job_prefix())
            .arg(serde_json::to_string(&job.payload)?)
            .arg(job.priority)
            .arg(types::millis(job.delay))
            .arg(job.max_attempts)
            .arg(serde_json::to_string(&job.backoff)?)
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.transport(e))?;

        record_from_fields(queue, &fields)
    }

    async fn claim(&self, queue: &str, lease: Duration) -> QueueResult<Option<LeasedJob>> {
        let keys = self.keys(queue);
        let token = LeaseToken::new();
        let mut conn = self.conn().await?;

        let fields: HashMap<String, String> = self
            .scripts
            .claim
            .key(keys.wait())
            .key(keys.delayed())
            .key(keys.active())
            .key(keys.paused())
            .arg(keys.job_prefix())
            .arg(now_millis())
            .arg(types::millis(lease))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.transport(e))?;

        if fields.is_empty() {
            return Ok(None);
        }

        let record = record_from_fields(queue, &fields)?;
        let lease_until = timestamp(&fields, "lease_until")?
            .ok_or_else(|| QueueError::Serialization("claimed job has no lease".to_string()))?;

        Ok(Some(LeasedJob {
            record,
            lease_token: token,
            lease_until,
        }))
    }

    async fn extend_lease(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        lease: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let reply: Vec<String> = self
            .scripts
            .extend_lease
            .key(keys.active())
            .arg(keys.job_prefix())
            .arg(job_id.as_str())
            .arg(token.as_str())
            .arg(now_millis())
            .arg(types::millis(lease))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.transport(e))?;

        match reply.as_slice() {
            [status, until] if status == "ok" => until
                .parse::<i64>()
                .ok()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .ok_or_else(|| QueueError::Serialization("bad lease expiry".to_string())),
            _ => owner_reply(job_id, reply).and_then(|_| {
                Err(QueueError::Internal("lease extension returned no expiry".to_string()))
            }),
        }
    }

    async fn holds_lease(&self, queue: &str, job_id: &JobId, token: &LeaseToken) -> QueueResult<bool> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let (state, held): (Option<String>, Option<String>) = conn
            .hget(format!("{}{}", keys.job_prefix(), job_id), &["state", "lease_token"][..])
            .await
            .map_err(|e| self.transport(e))?;

        Ok(state.as_deref() == Some("active") && held.as_deref() == Some(token.as_str()))
    }

    async fn update_progress(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        progress: u8,
    ) -> QueueResult<JobRecord> {
        if progress > 100 {
            return Err(QueueError::ProgressOutOfRange { value: progress.into() });
        }

        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let reply: Vec<String> = self
            .scripts
            .update_progress
            .arg(keys.job_prefix())
            .arg(job_id.as_str())
            .arg(token.as_str())
            .arg(progress as u32)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.transport(e))?;

        if let [status, current] = reply.as_slice() {
            if status == "regressed" {
                return Err(QueueError::ProgressRegressed {
                    job_id: job_id.clone(),
                    current: current.parse().unwrap_or(0),
                    value: progress,
                });
            }
        }

        record_from_fields(queue, &owner_reply(job_id, reply)?)
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        return_value: Value,
        keep: Option<usize>,
    ) -> QueueResult<JobRecord> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let reply: Vec<String> = self
            .scripts
            .complete
            .key(keys.active())
            .key(keys.completed())
            .arg(keys.job_prefix())
            .arg(job_id.as_str())
            .arg(token.as_str())
            .arg(now_millis())
            .arg(serde_json::to_string(&return_value)?)
            .arg(keep_arg(keep))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.transport(e))?;

        record_from_fields(queue, &owner_reply(job_id, reply)?)
    }

    async fn fail(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        keep: Option<usize>,
    ) -> QueueResult<JobRecord> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let reply: Vec<String> = self
            .scripts
            .fail
            .key(keys.active())
            .key(keys.delayed())
            .key(keys.wait())
            .key(keys.failed())
            .arg(keys.job_prefix())
            .arg(job_id.as_str())
            .arg(token.as_str())
            .arg(now_millis())
            .arg(error)
            .arg(retry_at.map(|at| at.timestamp_millis()).unwrap_or(-1))
            .arg(keep_arg(keep))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.transport(e))?;

        record_from_fields(queue, &owner_reply(job_id, reply)?)
    }

    async fn release(&self, queue: &str, job_id: &JobId, token: &LeaseToken) -> QueueResult<bool> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let released: i64 = self
            .scripts
            .release
            .key(keys.active())
            .key(keys.wait())
            .arg(keys.job_prefix())
            .arg(job_id.as_str())
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.transport(e))?;

        Ok(released == 1)
    }

    async fn requeue_stalled(
        &self,
        queue: &str,
        max_stalled: u32,
        keep_failed: Option<usize>,
    ) -> QueueResult<StalledSweep> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let (requeued, failed): (Vec<String>, Vec<String>) = self
            .scripts
            .requeue_stalled
            .key(keys.active())
            .key(keys.wait())
            .key(keys.failed())
            .arg(keys.job_prefix())
            .arg(now_millis())
            .arg(max_stalled)
            .arg(keep_arg(keep_failed))
            .arg(STALLED_LIMIT_REASON)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.transport(e))?;

        Ok(StalledSweep {
            requeued: requeued.into_iter().map(JobId::from).collect(),
            failed: failed.into_iter().map(JobId::from).collect(),
        })
    }

    async fn get(&self, queue: &str, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let fields: HashMap<String, String> = conn
            .hgetall(format!("{}{}", keys.job_prefix(), job_id))
            .await
            .map_err(|e| self.transport(e))?;

        if fields.is_empty() {
            return Ok(None);
        }
        record_from_fields(queue, &fields).map(Some)
    }

    async fn remove(&self, queue: &str, job_id: &JobId) -> QueueResult<bool> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let removed: i64 = self
            .scripts
            .remove
            .key(keys.wait())
            .key(keys.delayed())
            .key(keys.active())
            .key(keys.completed())
            .key(keys.failed())
            .arg(keys.job_prefix())
            .arg(job_id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.transport(e))?;

        Ok(removed > 0)
    }

    async fn pause(&self, queue: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(self.keys(queue).paused(), 1)
            .await
            .map_err(|e| self.transport(e))
    }

    async fn resume(&self, queue: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.keys(queue).paused())
            .await
            .map_err(|e| self.transport(e))
    }

    async fn is_paused(&self, queue: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        conn.exists(self.keys(queue).paused())
            .await
            .map_err(|e| self.transport(e))
    }

    async fn clean(
        &self,
        queue: &str,
        state: TerminalState,
        cutoff: Option<DateTime<Utc>>,
    ) -> QueueResult<usize> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        // Exclusive bound: only jobs finished strictly before the cutoff
        let max = match cutoff {
            Some(cutoff) => format!("({}", cutoff.timestamp_millis()),
            None => "+inf".to_string(),
        };

        let removed: usize = self
            .scripts
            .clean
            .key(keys.terminal(state))
            .arg(keys.job_prefix())
            .arg(max)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.transport(e))?;

        Ok(removed)
    }

    async fn counts(&self, queue: &str) -> QueueResult<QueueStats> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        // One MULTI/EXEC so every count reflects the same instant
        let (waiting, active, completed, failed, delayed, paused): (u64, u64, u64, u64, u64, bool) =
            redis::pipe()
                .atomic()
                .zcard(keys.wait())
                .zcard(keys.active())
                .zcard(keys.completed())
                .zcard(keys.failed())
                .zcard(keys.delayed())
                .exists(keys.paused())
                .query_async(&mut conn)
                .await
                .map_err(|e| self.transport(e))?;

        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
            paused,
        })
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.transport(e))?;
        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        self.manager.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn base_fields() -> Vec<(&'static str, &'static str)> {
        vec![
            ("id", "7"),
            ("score", "30064771079"),
            ("payload", r#"{"to":"a@example.com"}"#),
            ("priority", "7"),
            ("delay", "0"),
            ("max_attempts", "3"),
            ("backoff", r#"{"type":"exponential","delay":2000}"#),
            ("state", "active"),
            ("progress", "50"),
            ("attempts_made", "1"),
            ("stalled_count", "0"),
            ("created_at", "1700000000000"),
            ("processed_on", "1700000000500"),
            ("lease_token", "t"),
            ("lease_until", "1700000030500"),
        ]
    }

    #[test]
    fn job_hash_decodes_into_a_snapshot() {
        let record = record_from_fields("email", &hash(&base_fields())).unwrap();

        assert_eq!(record.id, JobId::from("7"));
        assert_eq!(record.queue, "email");
        assert_eq!(record.state, JobState::Active);
        assert_eq!(record.progress, 50);
        assert_eq!(record.backoff, Backoff::exponential(Duration::from_millis(2000)));
        assert_eq!(record.payload["to"], "a@example.com");
        assert_eq!(
            record.processed_on,
            DateTime::<Utc>::from_timestamp_millis(1_700_000_000_500)
        );
        assert!(record.finished_on.is_none());
        assert!(record.failed_reason.is_none());
    }

    #[test]
    fn missing_field_is_a_serialization_error() {
        let fields: Vec<_> = base_fields().into_iter().filter(|(k, _)| *k != "state").collect();
        let err = record_from_fields("email", &hash(&fields)).unwrap_err();
        assert!(matches!(err, QueueError::Serialization(_)));
    }

    #[test]
    fn out_of_range_timestamp_is_a_serialization_error() {
        let fields: Vec<_> = base_fields()
            .into_iter()
            .map(|(k, v)| if k == "processed_on" { (k, "9223372036854775807") } else { (k, v) })
            .collect();
        let err = record_from_fields("email", &hash(&fields)).unwrap_err();
        assert!(matches!(err, QueueError::Serialization(_)));
    }

    #[test]
    fn owner_replies_map_to_errors() {
        let id = JobId::from("3");
        assert!(matches!(
            owner_reply(&id, vec!["lost".to_string()]),
            Err(QueueError::LeaseLost(_))
        ));
        assert!(matches!(
            owner_reply(&id, vec!["missing".to_string()]),
            Err(QueueError::JobNotFound(_))
        ));

        let fields = owner_reply(&id, vec!["ok".into(), "state".into(), "completed".into()]).unwrap();
        assert_eq!(fields.get("state").map(String::as_str), Some("completed"));
    }

    #[test]
    fn keys_share_the_queue_namespace() {
        let keys = QueueKeys::new("jobq", "email");
        assert_eq!(keys.wait(), "jobq:email:wait");
        assert_eq!(keys.job_prefix(), "jobq:email:job:");
        assert_eq!(keys.terminal(TerminalState::Failed), "jobq:email:failed");
    }
}
