//! Key-value repository port and an in-process reference implementation.
//!
//! This is the lowest layer of the durability stack: a plain async
//! get/set/delete store with batch variants, carrying no knowledge of
//! [`AgentState`](crate::cloudllm::state::AgentState) shapes. The
//! [`AgentStateRepository`](crate::cloudllm::state::AgentStateRepository)
//! builds whole-object replace semantics on top of this port.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::cloudllm::errors::Result;

/// Async key-value store abstraction. A production binding (Redis, etc.) is
/// an external collaborator; this crate ships the port plus
/// [`InMemoryKeyValueRepository`].
#[async_trait]
pub trait KeyValueRepository: Send + Sync {
    /// Store `value` under `key`, replacing any prior value.
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Fetch the value stored under `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove the value stored under `key`, if any.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Store every `(key, value)` pair. Not required to be atomic across
    /// keys; callers needing atomicity serialize through a single logical
    /// key (see the agent-state repository).
    async fn batch_set(&self, entries: Vec<(String, String)>) -> Result<()> {
        for (key, value) in entries {
            self.set(&key, value).await?;
        }
        Ok(())
    }

    /// Fetch values for each key in `keys`, preserving order; `None` where
    /// absent.
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Remove every key in `keys`.
    async fn batch_delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }
}

/// Concurrent, in-process [`KeyValueRepository`] backed by a sharded
/// [`DashMap`]. Unrelated keys never contend with one another; the only
/// coarse-grained lock in the system is the per-task mutex the agent-state
/// repository layers on top (see `crate::cloudllm::state`).
#[derive(Default)]
pub struct InMemoryKeyValueRepository {
    entries: DashMap<String, String>,
}

impl InMemoryKeyValueRepository {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Wrap `self` in an `Arc` for sharing across activities.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl KeyValueRepository for InMemoryKeyValueRepository {
    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
