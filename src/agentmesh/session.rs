//! Per-conversation session memory.
//!
//! A session holds one conversation's turn history and a key→value
//! scratchpad workspace, bounded by a TTL. Appends are rejected once the
//! session is no longer Active or its expiry has passed. Cleanup marks
//! expired sessions rather than deleting them, so listings can still
//! account for them; deletion is explicit.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Speaker of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
    Tool,
}

/// One turn of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<Value>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// A turn stamped with the current time.
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
    Expired,
    Archived,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Closed => write!(f, "closed"),
            SessionStatus::Expired => write!(f, "expired"),
            SessionStatus::Archived => write!(f, "archived"),
        }
    }
}

/// One conversation's context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub user_id: Option<String>,
    pub status: SessionStatus,
    pub history: Vec<ChatMessage>,
    pub workspace: HashMap<String, Value>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// True once the wall clock passed `expires_at`.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Errors raised by session operations.
#[derive(Debug, Clone)]
pub enum SessionError {
    NotFound(String),
    Expired(String),
    /// The session exists but is not Active.
    NotActive { id: String, status: SessionStatus },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotFound(id) => write!(f, "session not found: {}", id),
            SessionError::Expired(id) => write!(f, "session expired: {}", id),
            SessionError::NotActive { id, status } => {
                write!(f, "session {} is {}, not active", id, status)
            }
        }
    }
}

impl Error for SessionError {}

/// Filters for [`SessionManager::list`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<SessionStatus>,
}

/// Owns every session.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create an Active session with the given TTL.
    pub async fn create(
        &self,
        agent_id: impl Into<String>,
        user_id: Option<String>,
        ttl: Duration,
    ) -> Session {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            user_id,
            status: SessionStatus::Active,
            history: Vec::new(),
            workspace: HashMap::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1)),
        };
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        session
    }

    /// Fetch a session; expired ones fail (and are marked Expired).
    pub async fn get(&self, id: &str) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if session.status == SessionStatus::Active && session.is_expired() {
            session.status = SessionStatus::Expired;
        }
        if session.status == SessionStatus::Expired {
            return Err(SessionError::Expired(id.to_string()));
        }
        Ok(session.clone())
    }

    /// Append one turn. Fails unless the session is Active and unexpired.
    pub async fn append(&self, id: &str, message: ChatMessage) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if session.is_expired() {
            session.status = SessionStatus::Expired;
            return Err(SessionError::Expired(id.to_string()));
        }
        if session.status != SessionStatus::Active {
            return Err(SessionError::NotActive {
                id: id.to_string(),
                status: session.status,
            });
        }
        session.history.push(message);
        session.updated_at = Utc::now();
        Ok(())
    }

    /// Write one workspace key.
    pub async fn set_workspace(
        &self,
        id: &str,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if session.is_expired() {
            session.status = SessionStatus::Expired;
            return Err(SessionError::Expired(id.to_string()));
        }
        session.workspace.insert(key.into(), value);
        session.updated_at = Utc::now();
        Ok(())
    }

    /// Read one workspace key.
    pub async fn get_workspace(&self, id: &str, key: &str) -> Result<Option<Value>, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Ok(session.workspace.get(key).cloned())
    }

    /// The turn history, optionally limited to the most recent `limit`
    /// turns.
    pub async fn get_history(
        &self,
        id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let history = &session.history;
        Ok(match limit {
            Some(limit) if history.len() > limit => {
                history[history.len() - limit..].to_vec()
            }
            _ => history.clone(),
        })
    }

    /// A bounded view of the history: when it exceeds `limit`, the first
    /// message (typically the system turn) plus the last `limit - 1`
    /// messages.
    pub async fn summarize_history(
        &self,
        id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let history = &session.history;
        if history.len() <= limit || limit == 0 {
            return Ok(history.clone());
        }
        let mut out = Vec::with_capacity(limit);
        out.push(history[0].clone());
        let tail = limit - 1;
        out.extend_from_slice(&history[history.len() - tail..]);
        Ok(out)
    }

    /// Transition the session to Closed.
    pub async fn close(&self, id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.status = SessionStatus::Closed;
        session.updated_at = Utc::now();
        Ok(())
    }

    /// Remove the session entirely.
    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        self.sessions
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Mark every over-TTL Active session Expired; returns how many.
    pub async fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut marked = 0;
        for session in sessions.values_mut() {
            if session.status == SessionStatus::Active && session.is_expired() {
                session.status = SessionStatus::Expired;
                marked += 1;
            }
        }
        marked
    }

    /// Filtered listing with offset + limit, newest first.
    pub async fn list(
        &self,
        filter: SessionFilter,
        offset: usize,
        limit: usize,
    ) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut matches: Vec<Session> = sessions
            .values()
            .filter(|session| {
                if let Some(agent_id) = &filter.agent_id {
                    if &session.agent_id != agent_id {
                        return false;
                    }
                }
                if let Some(user_id) = &filter.user_id {
                    if session.user_id.as_ref() != Some(user_id) {
                        return false;
                    }
                }
                if let Some(status) = filter.status {
                    if session.status != status {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        matches.into_iter().skip(offset).take(limit).collect()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
