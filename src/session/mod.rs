//! Session lifecycle tracking for coordinated executions
//!
//! One [`AgentSession`] records the end-to-end lifecycle of a
//! coordination round: status transitions, one snapshot per agent
//! attempt, and cost/token/duration rollups. All mutation goes through
//! the [`SessionManager`], whose owning task linearizes writes per
//! session; everything else sees copies.

pub mod store;

pub use store::{InMemorySessionStore, SessionStore, StoreError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Lifecycle status of a session.
///
/// Terminal states (`Completed`, `Failed`, `Cancelled`) are final: any
/// later transition attempt fails with [`SessionError::AlreadyTerminal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Started,
    Executing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Legal state-machine edges. Cancellation and failure are reachable
    /// from any non-terminal state; the forward chain is strict.
    fn can_transition_to(&self, next: SessionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            SessionStatus::Created => false,
            SessionStatus::Started => *self == SessionStatus::Created,
            SessionStatus::Executing => {
                *self == SessionStatus::Started || *self == SessionStatus::Paused
            }
            SessionStatus::Paused => *self == SessionStatus::Executing,
            SessionStatus::Completed => {
                *self == SessionStatus::Executing || *self == SessionStatus::Paused
            }
            SessionStatus::Failed | SessionStatus::Cancelled => true,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Created => "created",
            SessionStatus::Started => "started",
            SessionStatus::Executing => "executing",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Immutable record of one agent's single attempt within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSessionSnapshot {
    pub agent_id: String,

    /// Attempt number for this agent within the session, starting at 1
    pub attempt: u32,

    pub started_at: DateTime<Utc>,

    pub ended_at: Option<DateTime<Utc>>,

    pub cost_usd: f64,

    pub tokens: u32,

    pub succeeded: bool,

    pub error: Option<String>,
}

impl AgentSessionSnapshot {
    /// Snapshot for a completed attempt. The attempt number is assigned
    /// by the manager on append.
    pub fn finished(
        agent_id: impl Into<String>,
        started_at: DateTime<Utc>,
        succeeded: bool,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            attempt: 0,
            started_at,
            ended_at: Some(Utc::now()),
            cost_usd: 0.0,
            tokens: 0,
            succeeded,
            error: None,
        }
    }

    pub fn with_cost(mut self, cost_usd: f64, tokens: u32) -> Self {
        self.cost_usd = cost_usd;
        self.tokens = tokens;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// The execution record for one coordinated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: String,

    pub status: SessionStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Ended timestamp, set on terminal transition
    pub ended_at: Option<DateTime<Utc>>,

    /// Agents participating in this session
    pub agents_involved: Vec<String>,

    /// One entry per agent attempt, append-only
    pub snapshots: Vec<AgentSessionSnapshot>,

    /// Free-form metadata recorded at creation
    pub metadata: HashMap<String, String>,

    /// Failure or cancellation reason, when terminal and unsuccessful
    pub failure_reason: Option<String>,
}

impl AgentSession {
    pub fn new(session_id: String, agents_involved: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            status: SessionStatus::Created,
            created_at: now,
            updated_at: now,
            ended_at: None,
            agents_involved,
            snapshots: Vec::new(),
            metadata: HashMap::new(),
            failure_reason: None,
        }
    }

    /// Cost/token/duration rollups, computable at any lifecycle point.
    pub fn statistics(&self) -> SessionStatistics {
        let mut per_agent: Vec<AgentBreakdown> = Vec::new();
        for snapshot in &self.snapshots {
            let entry = match per_agent
                .iter_mut()
                .find(|b| b.agent_id == snapshot.agent_id)
            {
                Some(entry) => entry,
                None => {
                    per_agent.push(AgentBreakdown {
                        agent_id: snapshot.agent_id.clone(),
                        attempts: 0,
                        successes: 0,
                        failures: 0,
                        cost_usd: 0.0,
                        tokens: 0,
                    });
                    per_agent.last_mut().expect("just pushed")
                }
            };
            entry.attempts += 1;
            if snapshot.succeeded {
                entry.successes += 1;
            } else {
                entry.failures += 1;
            }
            entry.cost_usd += snapshot.cost_usd;
            entry.tokens += snapshot.tokens;
        }

        let end = self.ended_at.unwrap_or_else(Utc::now);
        let duration_ms = (end - self.created_at).num_milliseconds().max(0) as u64;

        SessionStatistics {
            session_id: self.session_id.clone(),
            status: self.status,
            total_cost_usd: per_agent.iter().map(|b| b.cost_usd).sum(),
            total_tokens: per_agent.iter().map(|b| b.tokens).sum(),
            duration_ms,
            per_agent,
        }
    }
}

/// Per-agent rollup within [`SessionStatistics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentBreakdown {
    pub agent_id: String,
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub cost_usd: f64,
    pub tokens: u32,
}

/// Cost/token/duration rollups for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub session_id: String,
    pub status: SessionStatus,
    pub total_cost_usd: f64,
    pub total_tokens: u32,
    pub duration_ms: u64,
    pub per_agent: Vec<AgentBreakdown>,
}

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{session_id}' not found")]
    NotFound { session_id: String },

    #[error("session '{session_id}' is already terminal ({status})")]
    AlreadyTerminal {
        session_id: String,
        status: SessionStatus,
    },

    #[error("invalid transition {from} -> {to} for session '{session_id}'")]
    InvalidTransition {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("session manager unavailable")]
    Unavailable,
}

enum Command {
    Create {
        metadata: HashMap<String, String>,
        agents: Vec<String>,
        reply: oneshot::Sender<String>,
    },
    Transition {
        session_id: String,
        to: SessionStatus,
        reason: Option<String>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Record {
        session_id: String,
        snapshot: AgentSessionSnapshot,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Get {
        session_id: String,
        reply: oneshot::Sender<Result<AgentSession, SessionError>>,
    },
    Statistics {
        session_id: String,
        reply: oneshot::Sender<Result<SessionStatistics, SessionError>>,
    },
}

/// Handle to the session-owning task.
///
/// Cloneable; all clones talk to the same owner. The owning task is the
/// only writer to session state, so snapshot appends and transitions
/// are linearized per session without locks on shared fields.
#[derive(Clone)]
pub struct SessionManager {
    tx: mpsc::Sender<Command>,
}

impl SessionManager {
    /// Spawn the owning task. The store is written at creation and at
    /// terminal transitions only; store failures are logged, not fatal.
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(Self::run(rx, store));
        Self { tx }
    }

    async fn run(mut rx: mpsc::Receiver<Command>, store: Arc<dyn SessionStore>) {
        let mut sessions: HashMap<String, AgentSession> = HashMap::new();

        while let Some(command) = rx.recv().await {
            match command {
                Command::Create {
                    metadata,
                    agents,
                    reply,
                } => {
                    let session_id = uuid::Uuid::new_v4().to_string();
                    let mut session = AgentSession::new(session_id.clone(), agents);
                    session.metadata = metadata;

                    if let Err(e) = store.put(&session).await {
                        tracing::warn!(session_id = %session_id, error = %e, "Session store put failed at creation");
                    }
                    sessions.insert(session_id.clone(), session);
                    let _ = reply.send(session_id);
                }
                Command::Transition {
                    session_id,
                    to,
                    reason,
                    reply,
                } => {
                    let result =
                        Self::apply_transition(&mut sessions, &store, &session_id, to, reason)
                            .await;
                    let _ = reply.send(result);
                }
                Command::Record {
                    session_id,
                    mut snapshot,
                    reply,
                } => {
                    let result = match sessions.get_mut(&session_id) {
                        None => Err(SessionError::NotFound { session_id }),
                        Some(session) if session.status.is_terminal() => {
                            Err(SessionError::AlreadyTerminal {
                                session_id,
                                status: session.status,
                            })
                        }
                        Some(session) => {
                            snapshot.attempt = session
                                .snapshots
                                .iter()
                                .filter(|s| s.agent_id == snapshot.agent_id)
                                .count() as u32
                                + 1;
                            session.snapshots.push(snapshot);
                            session.updated_at = Utc::now();
                            Ok(())
                        }
                    };
                    let _ = reply.send(result);
                }
                Command::Get { session_id, reply } => {
                    let result = sessions
                        .get(&session_id)
                        .cloned()
                        .ok_or(SessionError::NotFound { session_id });
                    let _ = reply.send(result);
                }
                Command::Statistics { session_id, reply } => {
                    let result = sessions
                        .get(&session_id)
                        .map(|s| s.statistics())
                        .ok_or(SessionError::NotFound { session_id });
                    let _ = reply.send(result);
                }
            }
        }
    }

    async fn apply_transition(
        sessions: &mut HashMap<String, AgentSession>,
        store: &Arc<dyn SessionStore>,
        session_id: &str,
        to: SessionStatus,
        reason: Option<String>,
    ) -> Result<(), SessionError> {
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;

        if session.status.is_terminal() {
            return Err(SessionError::AlreadyTerminal {
                session_id: session_id.to_string(),
                status: session.status,
            });
        }
        if !session.status.can_transition_to(to) {
            return Err(SessionError::InvalidTransition {
                session_id: session_id.to_string(),
                from: session.status,
                to,
            });
        }

        let from = session.status;
        session.status = to;
        session.updated_at = Utc::now();
        if to.is_terminal() {
            session.ended_at = Some(session.updated_at);
            session.failure_reason = reason;

            metrics::counter!(
                "cohort_sessions_total",
                "status" => to.to_string(),
            )
            .increment(1);

            if let Err(e) = store.put(session).await {
                tracing::warn!(session_id = %session_id, error = %e, "Session store put failed at terminal transition");
            }
        }

        tracing::debug!(
            session_id = %session_id,
            from = %from,
            to = %to,
            "Session transition"
        );
        Ok(())
    }

    /// Create a session. Returns its id.
    pub async fn create_session(
        &self,
        metadata: HashMap<String, String>,
        agents: Vec<String>,
    ) -> Result<String, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Create {
                metadata,
                agents,
                reply,
            })
            .await
            .map_err(|_| SessionError::Unavailable)?;
        rx.await.map_err(|_| SessionError::Unavailable)
    }

    async fn transition(
        &self,
        session_id: &str,
        to: SessionStatus,
        reason: Option<String>,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Transition {
                session_id: session_id.to_string(),
                to,
                reason,
                reply,
            })
            .await
            .map_err(|_| SessionError::Unavailable)?;
        rx.await.map_err(|_| SessionError::Unavailable)?
    }

    pub async fn start(&self, session_id: &str) -> Result<(), SessionError> {
        self.transition(session_id, SessionStatus::Started, None).await
    }

    pub async fn mark_executing(&self, session_id: &str) -> Result<(), SessionError> {
        self.transition(session_id, SessionStatus::Executing, None)
            .await
    }

    pub async fn pause(&self, session_id: &str) -> Result<(), SessionError> {
        self.transition(session_id, SessionStatus::Paused, None).await
    }

    pub async fn resume(&self, session_id: &str) -> Result<(), SessionError> {
        self.transition(session_id, SessionStatus::Executing, None)
            .await
    }

    pub async fn complete(&self, session_id: &str) -> Result<(), SessionError> {
        self.transition(session_id, SessionStatus::Completed, None)
            .await
    }

    pub async fn fail(&self, session_id: &str, reason: impl Into<String>) -> Result<(), SessionError> {
        self.transition(session_id, SessionStatus::Failed, Some(reason.into()))
            .await
    }

    pub async fn cancel(&self, session_id: &str, reason: impl Into<String>) -> Result<(), SessionError> {
        self.transition(session_id, SessionStatus::Cancelled, Some(reason.into()))
            .await
    }

    /// Append one agent attempt snapshot. Never overwrites: recording
    /// the same agent again creates a new snapshot with the next
    /// attempt number.
    pub async fn record_agent_result(
        &self,
        session_id: &str,
        snapshot: AgentSessionSnapshot,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Record {
                session_id: session_id.to_string(),
                snapshot,
                reply,
            })
            .await
            .map_err(|_| SessionError::Unavailable)?;
        rx.await.map_err(|_| SessionError::Unavailable)?
    }

    /// Copy of the current session record.
    pub async fn get(&self, session_id: &str) -> Result<AgentSession, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Get {
                session_id: session_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| SessionError::Unavailable)?;
        rx.await.map_err(|_| SessionError::Unavailable)?
    }

    /// Rollups from accumulated snapshots, valid mid-execution.
    pub async fn statistics(&self, session_id: &str) -> Result<SessionStatistics, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Statistics {
                session_id: session_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| SessionError::Unavailable)?;
        rx.await.map_err(|_| SessionError::Unavailable)?
    }
}
