//! In-memory store.

use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use agent_relay_core::{
    CasOutcome, StoreError, VersionedStore,
    traits::clamp_page,
    types::{Machine, Message, PushKeys, PushSubscription, Session, User, new_id, now_millis},
};
use async_trait::async_trait;
use serde_json::Value;

/// In-memory store implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    machines: HashMap<String, Machine>,
    messages: HashMap<String, Vec<Message>>,
    users: Vec<User>,
    push: Vec<PushSubscription>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn session_in<'a>(
    inner: &'a mut Inner,
    id: &str,
    namespace: &str,
) -> Result<&'a mut Session, StoreError> {
    inner
        .sessions
        .get_mut(id)
        .filter(|s| s.namespace == namespace)
        .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
}

fn machine_in<'a>(
    inner: &'a mut Inner,
    id: &str,
    namespace: &str,
) -> Result<&'a mut Machine, StoreError> {
    inner
        .machines
        .get_mut(id)
        .filter(|m| m.namespace == namespace)
        .ok_or_else(|| StoreError::NotFound(format!("machine {id}")))
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn get_or_create_session(
        &self,
        tag: &str,
        metadata: Value,
        agent_state: Option<Value>,
        namespace: &str,
    ) -> Result<Session, StoreError> {
        let mut inner = self.write()?;

        let existing = inner
            .sessions
            .values()
            .filter(|s| s.tag == tag && s.namespace == namespace)
            .max_by_key(|s| s.created_at);
        if let Some(session) = existing {
            return Ok(session.clone());
        }

        let timestamp = now_millis();
        let session = Session {
            id: new_id(),
            tag: tag.to_string(),
            namespace: namespace.to_string(),
            created_at: timestamp,
            updated_at: timestamp,
            metadata,
            metadata_version: 1,
            agent_state,
            agent_state_version: 1,
            todos: None,
            todos_updated_at: None,
            active: false,
            active_at: timestamp,
            seq: 0,
            thinking: false,
        };
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.read()?.sessions.get(id).cloned())
    }

    async fn list_sessions(&self, namespace: Option<&str>) -> Result<Vec<Session>, StoreError> {
        let inner = self.read()?;
        let mut result: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| namespace.is_none_or(|ns| s.namespace == ns))
            .cloned()
            .collect();

        // Sort by updated_at descending
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(result)
    }

    async fn update_session_metadata(
        &self,
        id: &str,
        metadata: Value,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Value>, StoreError> {
        let mut inner = self.write()?;
        let session = session_in(&mut inner, id, namespace)?;

        if session.metadata_version != expected_version {
            return Ok(CasOutcome::Mismatch {
                version: session.metadata_version,
                value: session.metadata.clone(),
            });
        }
        session.metadata = metadata;
        session.metadata_version += 1;
        session.seq += 1;
        session.updated_at = now_millis();
        Ok(CasOutcome::Applied {
            version: session.metadata_version,
            value: session.metadata.clone(),
        })
    }

    async fn update_session_agent_state(
        &self,
        id: &str,
        agent_state: Option<Value>,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Option<Value>>, StoreError> {
        let mut inner = self.write()?;
        let session = session_in(&mut inner, id, namespace)?;

        if session.agent_state_version != expected_version {
            return Ok(CasOutcome::Mismatch {
                version: session.agent_state_version,
                value: session.agent_state.clone(),
            });
        }
        session.agent_state = agent_state;
        session.agent_state_version += 1;
        session.seq += 1;
        session.updated_at = now_millis();
        Ok(CasOutcome::Applied {
            version: session.agent_state_version,
            value: session.agent_state.clone(),
        })
    }

    async fn set_session_todos(
        &self,
        id: &str,
        todos: Value,
        updated_at: i64,
        namespace: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        let session = session_in(&mut inner, id, namespace)?;

        if session.todos_updated_at.is_some_and(|at| at >= updated_at) {
            return Ok(false);
        }
        session.todos = Some(todos);
        session.todos_updated_at = Some(updated_at);
        session.seq += 1;
        session.updated_at = now_millis();
        Ok(true)
    }

    async fn set_session_activity(
        &self,
        id: &str,
        active: bool,
        active_at: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        session.active = active;
        session.active_at = active_at;
        Ok(())
    }

    async fn delete_session(&self, id: &str, namespace: &str) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        if session_in(&mut inner, id, namespace).is_err() {
            return Ok(false);
        }
        inner.sessions.remove(id);
        inner.messages.remove(id);
        Ok(true)
    }

    async fn get_or_create_machine(
        &self,
        id: &str,
        metadata: Value,
        daemon_state: Option<Value>,
        namespace: &str,
    ) -> Result<Machine, StoreError> {
        let mut inner = self.write()?;

        if let Some(machine) = inner.machines.get(id) {
            if machine.namespace != namespace {
                return Err(StoreError::NotFound(format!("machine {id}")));
            }
            return Ok(machine.clone());
        }

        let timestamp = now_millis();
        let machine = Machine {
            id: id.to_string(),
            namespace: namespace.to_string(),
            created_at: timestamp,
            updated_at: timestamp,
            metadata,
            metadata_version: 1,
            daemon_state,
            daemon_state_version: 1,
            active: false,
            active_at: timestamp,
            seq: 0,
        };
        inner.machines.insert(machine.id.clone(), machine.clone());
        Ok(machine)
    }

    async fn get_machine(&self, id: &str) -> Result<Option<Machine>, StoreError> {
        Ok(self.read()?.machines.get(id).cloned())
    }

    async fn list_machines(&self, namespace: Option<&str>) -> Result<Vec<Machine>, StoreError> {
        let inner = self.read()?;
        let mut result: Vec<Machine> = inner
            .machines
            .values()
            .filter(|m| namespace.is_none_or(|ns| m.namespace == ns))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(result)
    }

    async fn update_machine_metadata(
        &self,
        id: &str,
        metadata: Value,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Value>, StoreError> {
        let mut inner = self.write()?;
        let machine = machine_in(&mut inner, id, namespace)?;

        if machine.metadata_version != expected_version {
            return Ok(CasOutcome::Mismatch {
                version: machine.metadata_version,
                value: machine.metadata.clone(),
            });
        }
        machine.metadata = metadata;
        machine.metadata_version += 1;
        machine.seq += 1;
        machine.updated_at = now_millis();
        Ok(CasOutcome::Applied {
            version: machine.metadata_version,
            value: machine.metadata.clone(),
        })
    }

    async fn update_machine_daemon_state(
        &self,
        id: &str,
        daemon_state: Option<Value>,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Option<Value>>, StoreError> {
        let mut inner = self.write()?;
        let machine = machine_in(&mut inner, id, namespace)?;

        if machine.daemon_state_version != expected_version {
            return Ok(CasOutcome::Mismatch {
                version: machine.daemon_state_version,
                value: machine.daemon_state.clone(),
            });
        }
        machine.daemon_state = daemon_state;
        machine.daemon_state_version += 1;
        machine.seq += 1;
        machine.updated_at = now_millis();
        Ok(CasOutcome::Applied {
            version: machine.daemon_state_version,
            value: machine.daemon_state.clone(),
        })
    }

    async fn set_machine_activity(
        &self,
        id: &str,
        active: bool,
        active_at: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let machine = inner
            .machines
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("machine {id}")))?;
        machine.active = active;
        machine.active_at = active_at;
        Ok(())
    }

    async fn add_message(
        &self,
        session_id: &str,
        content: Value,
        local_id: Option<&str>,
    ) -> Result<Message, StoreError> {
        let mut inner = self.write()?;
        if !inner.sessions.contains_key(session_id) {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }

        let log = inner.messages.entry(session_id.to_string()).or_default();
        if let Some(local_id) = local_id {
            if let Some(existing) = log.iter().find(|m| m.local_id.as_deref() == Some(local_id)) {
                return Ok(existing.clone());
            }
        }

        let seq = log.last().map_or(0, |m| m.seq) + 1;
        let message = Message {
            id: new_id(),
            session_id: session_id.to_string(),
            content,
            created_at: now_millis(),
            seq,
            local_id: local_id.map(str::to_string),
        };
        log.push(message.clone());

        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.seq += 1;
            session.updated_at = message.created_at;
        }
        Ok(message)
    }

    async fn get_messages(
        &self,
        session_id: &str,
        limit: i64,
        before_seq: Option<i64>,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.read()?;
        let Some(log) = inner.messages.get(session_id) else {
            return Ok(Vec::new());
        };
        let limit = usize::try_from(clamp_page(limit)).unwrap_or(1);

        let eligible: Vec<&Message> = log
            .iter()
            .filter(|m| before_seq.is_none_or(|cursor| m.seq < cursor))
            .collect();
        let start = eligible.len().saturating_sub(limit);
        Ok(eligible[start..].iter().map(|m| (*m).clone()).collect())
    }

    async fn get_messages_after(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.read()?;
        let limit = usize::try_from(clamp_page(limit)).unwrap_or(1);
        Ok(inner
            .messages
            .get(session_id)
            .map(|log| {
                log.iter()
                    .filter(|m| m.seq > after_seq)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_or_create_user(
        &self,
        platform: &str,
        platform_user_id: &str,
        namespace: &str,
    ) -> Result<User, StoreError> {
        let mut inner = self.write()?;
        if let Some(user) = inner
            .users
            .iter()
            .find(|u| u.platform == platform && u.platform_user_id == platform_user_id)
        {
            return Ok(user.clone());
        }

        let user = User {
            id: new_id(),
            platform: platform.to_string(),
            platform_user_id: platform_user_id.to_string(),
            namespace: namespace.to_string(),
            created_at: now_millis(),
        };
        inner.users.push(user.clone());
        Ok(user)
    }

    async fn get_user(
        &self,
        platform: &str,
        platform_user_id: &str,
    ) -> Result<Option<User>, StoreError> {
        Ok(self
            .read()?
            .users
            .iter()
            .find(|u| u.platform == platform && u.platform_user_id == platform_user_id)
            .cloned())
    }

    async fn add_push_subscription(
        &self,
        namespace: &str,
        endpoint: &str,
        keys: PushKeys,
    ) -> Result<PushSubscription, StoreError> {
        let mut inner = self.write()?;
        if let Some(existing) = inner
            .push
            .iter_mut()
            .find(|p| p.namespace == namespace && p.endpoint == endpoint)
        {
            existing.keys = keys;
            return Ok(existing.clone());
        }

        let subscription = PushSubscription {
            id: new_id(),
            namespace: namespace.to_string(),
            endpoint: endpoint.to_string(),
            keys,
            created_at: now_millis(),
        };
        inner.push.push(subscription.clone());
        Ok(subscription)
    }

    async fn remove_push_subscription(
        &self,
        namespace: &str,
        endpoint: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        let before = inner.push.len();
        inner
            .push
            .retain(|p| !(p.namespace == namespace && p.endpoint == endpoint));
        Ok(inner.push.len() != before)
    }

    async fn list_push_subscriptions(
        &self,
        namespace: &str,
    ) -> Result<Vec<PushSubscription>, StoreError> {
        Ok(self
            .read()?
            .push
            .iter()
            .filter(|p| p.namespace == namespace)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_namespace_isolation() {
        let store = MemoryStore::new();
        let session = store
            .get_or_create_session("tag", json!({}), None, "team-a")
            .await
            .unwrap();

        let err = store
            .update_session_metadata(&session.id, json!({"x": 1}), 1, "team-b")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!store.delete_session(&session.id, "team-b").await.unwrap());
    }

    #[tokio::test]
    async fn test_older_todos_are_ignored() {
        let store = MemoryStore::new();
        let session = store
            .get_or_create_session("tag", json!({}), None, "default")
            .await
            .unwrap();

        assert!(store.set_session_todos(&session.id, json!([1]), 20, "default").await.unwrap());
        assert!(!store.set_session_todos(&session.id, json!([2]), 10, "default").await.unwrap());

        let stored = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.todos, Some(json!([1])));
        assert_eq!(stored.todos_updated_at, Some(20));
    }
}
