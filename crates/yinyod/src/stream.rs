//! Event stream adapter: an append-only, per-run, ordered log of events
//! with backend-assigned monotonic ids and blocking tail reads.
//!
//! The cluster deployment uses Redis streams (XADD assigns the id, XREAD
//! blocks for the next entry). The in-memory backend keeps a `Vec` per run
//! and wakes tailing readers through a watch channel.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use yinyo_core::Event;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("event stream was deleted")]
    Deleted,
    #[error("event stream error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StreamError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(format!("event encoding: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

/// Capability interface over the per-run event log.
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Append an event, assigning its canonical id. Returns the stamped
    /// event.
    async fn add(&self, run_id: &str, event: Event) -> Result<Event>;

    /// Block until an event strictly newer than `last_id` is available and
    /// return it. `"0"` reads from the beginning.
    async fn get(&self, run_id: &str, last_id: &str) -> Result<Event>;

    /// Drop the entire stream for a run. Missing streams are not an error.
    async fn delete(&self, run_id: &str) -> Result<()>;
}

const EVENT_FIELD: &str = "json";

/// Redis-streams backend.
///
/// Blocking reads open their own connection so an XREAD BLOCK never stalls
/// the shared multiplexed connection used for appends.
#[derive(Clone)]
pub struct RedisEventStream {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
}

impl std::fmt::Debug for RedisEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEventStream").finish_non_exhaustive()
    }
}

impl RedisEventStream {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { client, conn })
    }
}

/// Shape of an XREAD reply: stream key -> entries of (id, field pairs).
type XReadReply = Option<Vec<(String, Vec<(String, Vec<(String, String)>)>)>>;

#[async_trait]
impl EventStream for RedisEventStream {
    async fn add(&self, run_id: &str, event: Event) -> Result<Event> {
        let json = serde_json::to_string(&event)?;
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(run_id)
            .arg("*")
            .arg(EVENT_FIELD)
            .arg(&json)
            .query_async(&mut conn)
            .await?;
        Ok(event.with_id(id))
    }

    async fn get(&self, run_id: &str, last_id: &str) -> Result<Event> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StreamError::from)?;
        loop {
            let reply: XReadReply = redis::cmd("XREAD")
                .arg("BLOCK")
                .arg(0)
                .arg("COUNT")
                .arg(1)
                .arg("STREAMS")
                .arg(run_id)
                .arg(last_id)
                .query_async(&mut conn)
                .await?;

            let Some(streams) = reply else {
                continue;
            };
            for (_key, entries) in streams {
                if let Some((id, fields)) = entries.into_iter().next() {
                    let json = fields
                        .into_iter()
                        .find(|(name, _)| name == EVENT_FIELD)
                        .map(|(_, value)| value)
                        .ok_or_else(|| {
                            StreamError::Backend("stream entry without event payload".to_string())
                        })?;
                    let event: Event = serde_json::from_str(&json)?;
                    return Ok(event.with_id(id));
                }
            }
        }
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(run_id)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryStreamState {
    events: Vec<Event>,
    tx: watch::Sender<usize>,
}

impl MemoryStreamState {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            events: Vec::new(),
            tx,
        }
    }
}

/// In-memory backend used by tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryEventStream {
    streams: Mutex<HashMap<String, MemoryStreamState>>,
}

impl MemoryEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a run's events, for assertions in tests.
    pub async fn events(&self, run_id: &str) -> Vec<Event> {
        self.streams
            .lock()
            .await
            .get(run_id)
            .map(|state| state.events.clone())
            .unwrap_or_default()
    }
}

fn parse_id(id: &str) -> u64 {
    id.parse().unwrap_or(0)
}

#[async_trait]
impl EventStream for MemoryEventStream {
    async fn add(&self, run_id: &str, event: Event) -> Result<Event> {
        let mut streams = self.streams.lock().await;
        let state = streams
            .entry(run_id.to_string())
            .or_insert_with(MemoryStreamState::new);
        let id = state.events.len() as u64 + 1;
        let stamped = event.with_id(id.to_string());
        state.events.push(stamped.clone());
        state.tx.send_replace(state.events.len());
        Ok(stamped)
    }

    async fn get(&self, run_id: &str, last_id: &str) -> Result<Event> {
        let after = parse_id(last_id);
        let mut rx = {
            let mut streams = self.streams.lock().await;
            let state = streams
                .entry(run_id.to_string())
                .or_insert_with(MemoryStreamState::new);
            if let Some(event) = state
                .events
                .iter()
                .find(|event| parse_id(&event.id) > after)
            {
                return Ok(event.clone());
            }
            state.tx.subscribe()
        };

        loop {
            rx.changed().await.map_err(|_| StreamError::Deleted)?;
            let streams = self.streams.lock().await;
            let Some(state) = streams.get(run_id) else {
                return Err(StreamError::Deleted);
            };
            if let Some(event) = state
                .events
                .iter()
                .find(|event| parse_id(&event.id) > after)
            {
                return Ok(event.clone());
            }
        }
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        self.streams.lock().await.remove(run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use yinyo_core::Stage;

    fn start_event() -> Event {
        Event::start(Utc::now(), Stage::Build)
    }

    #[tokio::test]
    async fn add_assigns_strictly_increasing_ids() {
        let stream = MemoryEventStream::new();
        let mut previous = 0;
        for _ in 0..5 {
            let stamped = stream.add("run-abc", start_event()).await.unwrap();
            let id = stamped.id.parse::<u64>().unwrap();
            assert!(id > previous);
            previous = id;
        }
    }

    #[tokio::test]
    async fn ids_are_scoped_per_run() {
        let stream = MemoryEventStream::new();
        let a = stream.add("run-a", start_event()).await.unwrap();
        let b = stream.add("run-b", start_event()).await.unwrap();
        assert_eq!(a.id, "1");
        assert_eq!(b.id, "1");
    }

    #[tokio::test]
    async fn get_returns_events_in_append_order() {
        let stream = MemoryEventStream::new();
        stream
            .add("run-abc", Event::first(Utc::now()))
            .await
            .unwrap();
        stream.add("run-abc", start_event()).await.unwrap();
        stream.add("run-abc", Event::last(Utc::now())).await.unwrap();

        let mut last_id = "0".to_string();
        let mut seen = Vec::new();
        loop {
            let event = stream.get("run-abc", &last_id).await.unwrap();
            last_id.clone_from(&event.id);
            let is_last = event.is_last();
            seen.push(event);
            if is_last {
                break;
            }
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].id, "1");
        assert_eq!(seen[2].id, "3");
    }

    #[tokio::test]
    async fn get_blocks_until_an_event_arrives() {
        let stream = Arc::new(MemoryEventStream::new());
        let reader = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.get("run-abc", "0").await })
        };
        // Give the reader time to register before the append.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        stream.add("run-abc", start_event()).await.unwrap();
        let event = reader.await.unwrap().unwrap();
        assert_eq!(event.id, "1");
    }

    #[tokio::test]
    async fn two_readers_see_identical_sequences() {
        let stream = Arc::new(MemoryEventStream::new());
        for _ in 0..10 {
            stream.add("run-abc", start_event()).await.unwrap();
        }
        stream.add("run-abc", Event::last(Utc::now())).await.unwrap();

        let mut sequences = Vec::new();
        for _ in 0..2 {
            let stream = Arc::clone(&stream);
            let handle = tokio::spawn(async move {
                let mut last_id = "0".to_string();
                let mut ids = Vec::new();
                loop {
                    let event = stream.get("run-abc", &last_id).await.unwrap();
                    last_id.clone_from(&event.id);
                    let is_last = event.is_last();
                    ids.push(event.id);
                    if is_last {
                        break;
                    }
                }
                ids
            });
            sequences.push(handle.await.unwrap());
        }
        assert_eq!(sequences[0], sequences[1]);
        assert_eq!(sequences[0].len(), 11);
    }

    #[tokio::test]
    async fn delete_wakes_blocked_readers_with_an_error() {
        let stream = Arc::new(MemoryEventStream::new());
        stream.add("run-abc", start_event()).await.unwrap();
        let reader = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.get("run-abc", "1").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stream.delete("run-abc").await.unwrap();
        assert!(matches!(
            reader.await.unwrap(),
            Err(StreamError::Deleted)
        ));
    }
}
