//! Agent State Service (C3): fine-grained per-thread message operations and
//! keyed context/artifact operations, each a load→mutate→save round-trip
//! against the [`AgentStateRepository`] serialized per task id by a keyed
//! mutex (see [`TaskLocks`]).

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cloudllm::errors::{AgentexError, Result};
use crate::cloudllm::state::{AgentState, AgentStateRepository, Artifact, Message};

/// Keyed set of per-task mutexes. Unrelated task ids never contend; a lock
/// is lazily created on first use and held only for the duration of a
/// single repository save round-trip, per the shared-resource policy.
#[derive(Default)]
struct TaskLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TaskLocks {
    fn lock_for(&self, task_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Per-task, per-thread and per-context-key operations over a task's
/// [`AgentState`], backed by an [`AgentStateRepository`].
pub struct AgentStateService {
    repository: Arc<AgentStateRepository>,
    locks: TaskLocks,
}

impl AgentStateService {
    pub fn new(repository: Arc<AgentStateRepository>) -> Self {
        Self {
            repository,
            locks: TaskLocks::default(),
        }
    }

    async fn with_state<F, T>(&self, task_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut AgentState) -> Result<T> + Send,
        T: Send,
    {
        let lock = self.locks.lock_for(task_id);
        let _guard = lock.lock().await;
        let mut state = self.repository.load(task_id).await?;
        let result = f(&mut state)?;
        self.repository.save(task_id, &state).await?;
        Ok(result)
    }

    // ---- Threads (C3a) --------------------------------------------------

    pub async fn get_messages(&self, task_id: &str, thread_name: &str) -> Result<Vec<Message>> {
        self.with_state(task_id, |state| {
            Ok(state.thread_mut(thread_name).messages.clone())
        })
        .await
    }

    pub async fn get_message_by_index(
        &self,
        task_id: &str,
        thread_name: &str,
        index: i64,
    ) -> Result<Option<Message>> {
        self.with_state(task_id, |state| {
            Ok(index_in_bounds(state.thread_mut(thread_name).messages.len(), index)
                .map(|i| state.thread_mut(thread_name).messages[i].clone()))
        })
        .await
    }

    pub async fn batch_get_messages_by_indices(
        &self,
        task_id: &str,
        thread_name: &str,
        indices: &[i64],
    ) -> Result<Vec<Option<Message>>> {
        self.with_state(task_id, |state| {
            let messages = &state.thread_mut(thread_name).messages;
            Ok(indices
                .iter()
                .map(|&i| index_in_bounds(messages.len(), i).map(|i| messages[i].clone()))
                .collect())
        })
        .await
    }

    pub async fn append_message(
        &self,
        task_id: &str,
        thread_name: &str,
        message: Message,
    ) -> Result<Vec<Message>> {
        self.with_state(task_id, |state| {
            let thread = state.thread_mut(thread_name);
            thread.messages.push(message);
            Ok(thread.messages.clone())
        })
        .await
    }

    /// Appends `message` unless a `Tool` message with the same
    /// `tool_call_id` is already present in the thread, in which case it
    /// replaces that entry in place. Used by the take-action activity so a
    /// retried tool call leaves at most one, final tool message per
    /// `tool_call_id` rather than accumulating one per attempt (§4.9, §8).
    pub async fn upsert_tool_message(
        &self,
        task_id: &str,
        thread_name: &str,
        message: Message,
    ) -> Result<Vec<Message>> {
        self.with_state(task_id, |state| {
            let thread = state.thread_mut(thread_name);
            let call_id = match &message {
                Message::Tool { tool_call_id, .. } => Some(tool_call_id.clone()),
                _ => None,
            };
            let existing = call_id.as_ref().and_then(|id| {
                thread.messages.iter().position(|m| matches!(
                    m,
                    Message::Tool { tool_call_id, .. } if tool_call_id == id
                ))
            });
            match existing {
                Some(i) => thread.messages[i] = message,
                None => thread.messages.push(message),
            }
            Ok(thread.messages.clone())
        })
        .await
    }

    pub async fn batch_append_messages(
        &self,
        task_id: &str,
        thread_name: &str,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>> {
        self.with_state(task_id, |state| {
            let thread = state.thread_mut(thread_name);
            thread.messages.extend(messages);
            Ok(thread.messages.clone())
        })
        .await
    }

    /// Out-of-range indices are a silent no-op, per the source contract.
    pub async fn override_message(
        &self,
        task_id: &str,
        thread_name: &str,
        index: i64,
        message: Message,
    ) -> Result<()> {
        self.with_state(task_id, |state| {
            let thread = state.thread_mut(thread_name);
            if let Some(i) = index_in_bounds(thread.messages.len(), index) {
                thread.messages[i] = message;
            }
            Ok(())
        })
        .await
    }

    pub async fn batch_override_messages(
        &self,
        task_id: &str,
        thread_name: &str,
        overrides: HashMap<i64, Message>,
    ) -> Result<()> {
        self.with_state(task_id, |state| {
            let thread = state.thread_mut(thread_name);
            for (index, message) in overrides {
                if let Some(i) = index_in_bounds(thread.messages.len(), index) {
                    thread.messages[i] = message;
                }
            }
            Ok(())
        })
        .await
    }

    /// Indices are resolved against the evolving list, in the iteration
    /// order the caller's map supplies — matching the source's semantics
    /// for `batch_insert_messages`.
    pub async fn insert_message(
        &self,
        task_id: &str,
        thread_name: &str,
        index: usize,
        message: Message,
    ) -> Result<()> {
        self.with_state(task_id, |state| {
            let thread = state.thread_mut(thread_name);
            let i = index.min(thread.messages.len());
            thread.messages.insert(i, message);
            Ok(())
        })
        .await
    }

    pub async fn batch_insert_messages(
        &self,
        task_id: &str,
        thread_name: &str,
        inserts: Vec<(usize, Message)>,
    ) -> Result<()> {
        self.with_state(task_id, |state| {
            let thread = state.thread_mut(thread_name);
            for (index, message) in inserts {
                let i = index.min(thread.messages.len());
                thread.messages.insert(i, message);
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_message(&self, task_id: &str, thread_name: &str, index: i64) -> Result<()> {
        self.with_state(task_id, |state| {
            let thread = state.thread_mut(thread_name);
            if let Some(i) = index_in_bounds(thread.messages.len(), index) {
                thread.messages.remove(i);
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_all_messages(&self, task_id: &str, thread_name: &str) -> Result<()> {
        self.with_state(task_id, |state| {
            state.thread_mut(thread_name).messages.clear();
            Ok(())
        })
        .await
    }

    pub async fn delete_thread(&self, task_id: &str, thread_name: &str) -> Result<()> {
        self.with_state(task_id, |state| {
            state.threads.remove(thread_name);
            Ok(())
        })
        .await
    }

    // ---- Context (C3b) --------------------------------------------------

    pub async fn get_all_context(
        &self,
        task_id: &str,
    ) -> Result<HashMap<String, serde_json::Value>> {
        self.with_state(task_id, |state| Ok(state.context.clone()))
            .await
    }

    pub async fn get_value(
        &self,
        task_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        self.with_state(task_id, |state| Ok(state.context.get(key).cloned()))
            .await
    }

    pub async fn batch_get_values(
        &self,
        task_id: &str,
        keys: &[String],
    ) -> Result<Vec<Option<serde_json::Value>>> {
        self.with_state(task_id, |state| {
            Ok(keys.iter().map(|k| state.context.get(k).cloned()).collect())
        })
        .await
    }

    pub async fn set_value(
        &self,
        task_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.with_state(task_id, |state| {
            state.context.insert(key.to_string(), value);
            Ok(())
        })
        .await
    }

    pub async fn batch_set_value(
        &self,
        task_id: &str,
        entries: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        self.with_state(task_id, |state| {
            state.context.extend(entries);
            Ok(())
        })
        .await
    }

    pub async fn delete_value(&self, task_id: &str, key: &str) -> Result<()> {
        self.with_state(task_id, |state| {
            state.context.remove(key);
            Ok(())
        })
        .await
    }

    pub async fn batch_delete_value(&self, task_id: &str, keys: &[String]) -> Result<()> {
        self.with_state(task_id, |state| {
            for key in keys {
                state.context.remove(key);
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_all_context(&self, task_id: &str) -> Result<()> {
        self.with_state(task_id, |state| {
            state.context.clear();
            Ok(())
        })
        .await
    }

    // ---- Artifacts (C3b, map-by-name canonical form) --------------------

    pub async fn get_artifact(&self, task_id: &str, name: &str) -> Result<Option<Artifact>> {
        self.with_state(task_id, |state| Ok(state.artifacts()?.remove(name)))
            .await
    }

    pub async fn get_artifacts(&self, task_id: &str) -> Result<HashMap<String, Artifact>> {
        self.with_state(task_id, |state| state.artifacts()).await
    }

    /// Insert `artifact` into the map-by-name artifact store. Rejects a
    /// duplicate name with `ClientError` unless `overwrite` is set.
    pub async fn set_artifact(
        &self,
        task_id: &str,
        artifact: Artifact,
        overwrite: bool,
    ) -> Result<()> {
        self.with_state(task_id, |state| {
            let mut artifacts = state.artifacts()?;
            if !overwrite && artifacts.contains_key(&artifact.name) {
                return Err(AgentexError::client(format!(
                    "artifact '{}' already exists",
                    artifact.name
                )));
            }
            artifacts.insert(artifact.name.clone(), artifact);
            state.set_artifacts(artifacts);
            Ok(())
        })
        .await
    }

    pub async fn batch_set_artifacts(
        &self,
        task_id: &str,
        new_artifacts: Vec<Artifact>,
        overwrite: bool,
    ) -> Result<()> {
        self.with_state(task_id, |state| {
            let mut artifacts = state.artifacts()?;
            if !overwrite {
                if let Some(dup) = new_artifacts
                    .iter()
                    .find(|a| artifacts.contains_key(&a.name))
                {
                    return Err(AgentexError::client(format!(
                        "artifact '{}' already exists",
                        dup.name
                    )));
                }
            }
            for artifact in new_artifacts {
                artifacts.insert(artifact.name.clone(), artifact);
            }
            state.set_artifacts(artifacts);
            Ok(())
        })
        .await
    }

    pub async fn delete_artifact(&self, task_id: &str, name: &str) -> Result<()> {
        self.with_state(task_id, |state| {
            let mut artifacts = state.artifacts()?;
            artifacts.remove(name);
            state.set_artifacts(artifacts);
            Ok(())
        })
        .await
    }

    pub async fn batch_delete_artifacts(&self, task_id: &str, names: &[String]) -> Result<()> {
        self.with_state(task_id, |state| {
            let mut artifacts = state.artifacts()?;
            for name in names {
                artifacts.remove(name);
            }
            state.set_artifacts(artifacts);
            Ok(())
        })
        .await
    }
}

/// `None` for an out-of-range index, mirroring the `get_message_by_index`
/// boundary contract (negative or `>= len` both yield "not found").
fn index_in_bounds(len: usize, index: i64) -> Option<usize> {
    if index < 0 {
        return None;
    }
    let i = index as usize;
    if i < len {
        Some(i)
    } else {
        None
    }
}
