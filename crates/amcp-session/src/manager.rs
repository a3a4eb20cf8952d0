use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use amcp_core::id::{self, Prefix};
use amcp_core::EventBus;
use amcp_types::{AgentSpec, Event, EventKind, SessionInfo, SessionStatus};

use crate::queue::QueueManager;
use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("maximum sessions limit reached: {0}")]
    MaxSessions(usize),
}

/// Owns every session and its queue; the single writer of session lifecycle
/// events. Agents receive `Arc<Mutex<Session>>` handles and ids, never
/// references back into the manager.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    queues: Arc<QueueManager>,
    bus: Arc<EventBus>,
    max_sessions: usize,
    history_dir: Option<PathBuf>,
}

impl SessionManager {
    pub fn new(bus: Arc<EventBus>, max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            queues: Arc::new(QueueManager::new()),
            bus,
            max_sessions,
            history_dir: None,
        }
    }

    /// Enable the advisory JSONL history mirror under this directory.
    pub fn with_history_dir(mut self, dir: PathBuf) -> Self {
        self.history_dir = Some(dir);
        self
    }

    pub fn queues(&self) -> Arc<QueueManager> {
        Arc::clone(&self.queues)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub async fn create(&self, cwd: String, spec: AgentSpec) -> Result<SessionInfo, SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(SessionError::MaxSessions(self.max_sessions));
        }

        let session_id = id::create(Prefix::Session);
        let mut session = Session::new(session_id.clone(), cwd, spec);
        if let Some(dir) = &self.history_dir {
            session.history_path = Some(dir.join(format!("{session_id}.jsonl")));
        }
        let info = session.info(0);

        sessions.insert(session_id.clone(), Arc::new(Mutex::new(session)));
        drop(sessions);

        self.bus
            .emit(Event::for_session(
                EventKind::SessionCreated,
                session_id,
                serde_json::json!({"agent_name": info.agent_name, "cwd": info.cwd}),
            ))
            .await;

        Ok(info)
    }

    pub async fn get(&self, session_id: &str) -> Result<Arc<Mutex<Session>>, SessionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn info(&self, session_id: &str) -> Result<SessionInfo, SessionError> {
        let handle = self.get(session_id).await?;
        let queued = self.queues.queued_count(session_id).await;
        let session = handle.lock().await;
        Ok(session.info(queued))
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let handles: Vec<Arc<Mutex<Session>>> =
            self.sessions.read().await.values().cloned().collect();

        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            let session = handle.lock().await;
            let queued = self.queues.queued_count(&session.id).await;
            infos.push(session.info(queued));
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_count(&self) -> usize {
        let handles: Vec<Arc<Mutex<Session>>> =
            self.sessions.read().await.values().cloned().collect();
        let mut active = 0;
        for handle in handles {
            if handle.lock().await.status == SessionStatus::Busy {
                active += 1;
            }
        }
        active
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        let removed = self.sessions.write().await.remove(session_id);
        if removed.is_none() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        self.queues.remove(session_id).await;
        self.bus.clear_session(session_id).await;
        self.bus
            .emit(Event::for_session(
                EventKind::SessionDeleted,
                session_id,
                serde_json::json!({}),
            ))
            .await;
        Ok(())
    }

    /// Update a session's status and broadcast the change.
    pub async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<(), SessionError> {
        let handle = self.get(session_id).await?;
        {
            let mut session = handle.lock().await;
            session.set_status(status);
        }
        self.bus
            .emit(Event::for_session(
                EventKind::SessionStatusChanged,
                session_id,
                serde_json::json!({"status": status.as_str()}),
            ))
            .await;
        Ok(())
    }

    pub async fn adjust_connected_clients(&self, session_id: &str, delta: i64) {
        if let Ok(handle) = self.get(session_id).await {
            let mut session = handle.lock().await;
            let current = session.connected_clients as i64;
            session.connected_clients = (current + delta).max(0) as usize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amcp_types::default_agent_spec;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(EventBus::new()), 10)
    }

    #[tokio::test]
    async fn create_get_delete_round_trip() {
        let manager = manager();
        let info = manager
            .create("/tmp".to_string(), default_agent_spec())
            .await
            .unwrap();
        assert!(info.id.starts_with("ses_"));
        assert_eq!(info.status, SessionStatus::Idle);

        assert!(manager.get(&info.id).await.is_ok());
        assert_eq!(manager.list().await.len(), 1);

        manager.delete(&info.id).await.unwrap();
        assert!(matches!(
            manager.get(&info.id).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn max_sessions_enforced() {
        let manager = SessionManager::new(Arc::new(EventBus::new()), 1);
        manager
            .create("/tmp".to_string(), default_agent_spec())
            .await
            .unwrap();
        let err = manager
            .create("/tmp".to_string(), default_agent_spec())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MaxSessions(1)));
    }

    #[tokio::test]
    async fn lifecycle_events_are_emitted() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe_channel();
        let manager = SessionManager::new(bus, 10);

        let info = manager
            .create("/tmp".to_string(), default_agent_spec())
            .await
            .unwrap();
        let created = rx.recv().await.unwrap();
        assert_eq!(created.kind, EventKind::SessionCreated);
        assert_eq!(created.session_id.as_deref(), Some(info.id.as_str()));

        manager
            .set_status(&info.id, SessionStatus::Busy)
            .await
            .unwrap();
        let changed = rx.recv().await.unwrap();
        assert_eq!(changed.kind, EventKind::SessionStatusChanged);
        assert_eq!(changed.payload["status"], "busy");

        manager.delete(&info.id).await.unwrap();
        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.kind, EventKind::SessionDeleted);
    }

    #[tokio::test]
    async fn delete_clears_queue_state() {
        let manager = manager();
        let info = manager
            .create("/tmp".to_string(), default_agent_spec())
            .await
            .unwrap();

        let queues = manager.queues();
        queues
            .enqueue(amcp_types::QueuedMessage::new(
                &info.id,
                "pending",
                amcp_types::Priority::Normal,
            ))
            .await;
        assert_eq!(queues.queued_count(&info.id).await, 1);

        manager.delete(&info.id).await.unwrap();
        assert_eq!(queues.queued_count(&info.id).await, 0);
    }
}
