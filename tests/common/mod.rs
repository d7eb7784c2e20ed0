//! Shared test fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use cohort::agent::{AgentDefinition, AgentResult, DispatchError, Task, WorkerBackend};
use cohort::context::ContextValue;

/// Programmed behavior for one agent in a [`StubWorker`].
#[derive(Clone)]
pub enum Behavior {
    /// Succeed with this value and confidence
    Value(ContextValue, f64),

    /// Succeed after a delay
    Delayed(Duration, ContextValue, f64),

    /// Fail the first `n` attempts, then succeed with the value
    FlakyUntil(u32, ContextValue),

    /// Fail every attempt
    AlwaysFail(String),

    /// Never return within any reasonable deadline
    Hang,

    /// Succeed with the task payload echoed back as the result value
    EchoTask,
}

/// Deterministic in-memory worker backend.
///
/// Unconfigured agents echo their own id as a string result.
pub struct StubWorker {
    behaviors: Mutex<HashMap<String, Behavior>>,
    attempts: Mutex<HashMap<String, u32>>,
    invocations: AtomicU32,
}

impl StubWorker {
    pub fn new() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            invocations: AtomicU32::new(0),
        }
    }

    pub fn with_behavior(self, agent_id: &str, behavior: Behavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), behavior);
        self
    }

    pub fn invocation_count(&self) -> u32 {
        self.invocations.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WorkerBackend for StubWorker {
    async fn invoke(
        &self,
        agent: &AgentDefinition,
        task: &Task,
        _deadline: Duration,
    ) -> Result<AgentResult, DispatchError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&agent.agent_id)
            .cloned();

        match behavior {
            None => Ok(AgentResult::success(
                &agent.agent_id,
                ContextValue::from(agent.agent_id.as_str()),
            )
            .with_priority(agent.priority)),
            Some(Behavior::Value(value, confidence)) => {
                Ok(AgentResult::success(&agent.agent_id, value)
                    .with_confidence(confidence)
                    .with_priority(agent.priority))
            }
            Some(Behavior::Delayed(delay, value, confidence)) => {
                tokio::time::sleep(delay).await;
                Ok(AgentResult::success(&agent.agent_id, value)
                    .with_confidence(confidence)
                    .with_priority(agent.priority))
            }
            Some(Behavior::FlakyUntil(failures, value)) => {
                let attempt = {
                    let mut attempts = self.attempts.lock().unwrap();
                    let entry = attempts.entry(agent.agent_id.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if attempt <= failures {
                    Err(DispatchError::WorkerFailed {
                        agent_id: agent.agent_id.clone(),
                        reason: format!("transient failure on attempt {}", attempt),
                    })
                } else {
                    Ok(AgentResult::success(&agent.agent_id, value)
                        .with_priority(agent.priority))
                }
            }
            Some(Behavior::AlwaysFail(reason)) => Err(DispatchError::WorkerFailed {
                agent_id: agent.agent_id.clone(),
                reason,
            }),
            Some(Behavior::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(DispatchError::WorkerFailed {
                    agent_id: agent.agent_id.clone(),
                    reason: "unreachable".to_string(),
                })
            }
            Some(Behavior::EchoTask) => Ok(AgentResult::success(
                &agent.agent_id,
                ContextValue::from(task.input.clone()),
            )
            .with_priority(agent.priority)),
        }
    }
}
