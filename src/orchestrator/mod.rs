//! Top-level routing and coordination entry point
//!
//! Wires the decision tree, strategy selector, message bus, session
//! manager, conflict resolution, and aggregation together per request.
//! `route` answers "where should this task run"; `coordinate` runs a
//! full multi-agent round and reconciles the results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentDefinition, AgentResult, DispatchError, Task, WorkerBackend};
use crate::aggregate::{AggregationError, AggregationResult, AggregationStrategy, Aggregator};
use crate::bus::{AgentMessage, MessageBus, MessageKind, MessagePriority, Recipient};
use crate::config::CohortConfig;
use crate::conflict::{
    Conflict, ConflictAnalyzer, ConflictError, ConflictResolver, Resolution, ResolutionStrategy,
};
use crate::context::ExecutionContext;
use crate::routing::{
    ExecutionStrategy, RoutingDecision, RoutingTree, SelectionHints, StrategySelector,
};
use crate::session::{
    AgentSession, AgentSessionSnapshot, InMemorySessionStore, SessionError, SessionManager,
    SessionStore,
};
use crate::telemetry::{CostSink, NullSink, RoutingAnalytics, RoutingMetrics};

/// Reserved bus id the orchestrator listens on.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

/// Cascade stops at the first success at or above this confidence.
const CASCADE_CONFIDENCE: f64 = 0.8;

/// Errors from coordination rounds.
///
/// Failures that happen after session creation carry the session id so
/// callers can still query statistics and snapshots for the failed round.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("dispatch failed: {source}")]
    Dispatch {
        session_id: Option<String>,
        #[source]
        source: DispatchError,
    },

    #[error("aggregation failed (session '{session_id}'): {source}")]
    Aggregation {
        session_id: String,
        #[source]
        source: AggregationError,
    },

    #[error("conflict resolution failed (session '{session_id}'): {source}")]
    Conflict {
        session_id: String,
        #[source]
        source: ConflictError,
    },

    #[error(transparent)]
    Session(#[from] SessionError),

    /// The round was cancelled; completed snapshots remain queryable
    /// through the session manager under the carried session id.
    #[error("coordination round cancelled (session '{session_id}')")]
    Cancelled { session_id: String },
}

impl OrchestratorError {
    /// Session the failure occurred in, when one was created.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            OrchestratorError::Dispatch { session_id, .. } => session_id.as_deref(),
            OrchestratorError::Aggregation { session_id, .. }
            | OrchestratorError::Conflict { session_id, .. }
            | OrchestratorError::Cancelled { session_id } => Some(session_id),
            OrchestratorError::Session(_) => None,
        }
    }
}

/// How a round's results are reconciled. Exclusive per round: a round
/// either aggregates or resolves, never both.
#[derive(Clone, Debug)]
pub enum Reconciliation {
    Aggregate(AggregationStrategy),
    Resolve(ResolutionStrategy),
}

impl Default for Reconciliation {
    fn default() -> Self {
        Reconciliation::Aggregate(AggregationStrategy::MajorityVote)
    }
}

/// Per-round knobs for `coordinate_with_options`.
#[derive(Clone, Debug, Default)]
pub struct RoundOptions {
    /// Override the selector's strategy choice
    pub strategy: Option<ExecutionStrategy>,

    /// Result reconciliation semantics for the round
    pub reconciliation: Reconciliation,

    /// Absolute quorum for Consensus rounds; otherwise the configured
    /// fraction of dispatched agents, rounded up
    pub quorum: Option<usize>,

    /// Session metadata recorded at creation
    pub metadata: HashMap<String, String>,
}

/// Result of a coordination round.
#[derive(Debug, Clone)]
pub struct CoordinationOutcome {
    pub aggregation: AggregationResult,

    /// Present when the round went through conflict resolution
    pub resolution: Option<Resolution>,

    /// Copy of the final session record
    pub session: AgentSession,
}

/// The routing and coordination engine.
///
/// One instance owns its tree, bus, analytics, and session manager;
/// there are no process-wide registries. Construction spawns the
/// session-owning task and therefore requires a tokio runtime.
pub struct Orchestrator {
    tree: Arc<RoutingTree>,
    selector: StrategySelector,
    worker: Arc<dyn WorkerBackend>,
    sessions: SessionManager,
    bus: Arc<MessageBus>,
    analytics: Arc<RoutingAnalytics>,
    sink: Arc<dyn CostSink>,
    analyzer: ConflictAnalyzer,
    config: CohortConfig,
    round_robin_counter: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        tree: Arc<RoutingTree>,
        worker: Arc<dyn WorkerBackend>,
        config: CohortConfig,
    ) -> Self {
        Self::with_parts(
            tree,
            worker,
            config,
            StrategySelector::new(),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(NullSink),
        )
    }

    pub fn with_parts(
        tree: Arc<RoutingTree>,
        worker: Arc<dyn WorkerBackend>,
        config: CohortConfig,
        selector: StrategySelector,
        store: Arc<dyn SessionStore>,
        sink: Arc<dyn CostSink>,
    ) -> Self {
        let bus = Arc::new(MessageBus::new());
        bus.subscribe(ORCHESTRATOR_ID);
        let analyzer = ConflictAnalyzer::new(config.routing.numeric_tolerance);

        Self {
            tree,
            selector,
            worker,
            sessions: SessionManager::new(store),
            bus,
            analytics: Arc::new(RoutingAnalytics::new()),
            sink,
            analyzer,
            config,
            round_robin_counter: AtomicU64::new(0),
        }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn analytics(&self) -> &Arc<RoutingAnalytics> {
        &self.analytics
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Evaluate the routing tree for a task and emit decision telemetry.
    ///
    /// A "no viable route" outcome is returned as a decision, not an
    /// error; callers choose whether to fall back to a default agent.
    pub fn route(&self, task: &Task, ctx: &ExecutionContext) -> RoutingDecision {
        let started = Instant::now();
        let decision = self.tree.evaluate(ctx);
        let latency = started.elapsed();

        let (estimated_tokens, estimated_cost) = Self::estimate_cost(ctx);
        let hints = SelectionHints::from_context(ctx, estimated_cost, 1);
        let strategy = self.selector.select(&decision, &hints);

        self.emit_metrics(RoutingMetrics {
            task_id: task.task_id.clone(),
            decision_latency_us: latency.as_micros() as u64,
            conditions_evaluated: decision.trace.len() as u32,
            paths_evaluated: (decision.alternatives.len() + usize::from(decision.is_routed()))
                as u32,
            selected_path: decision.path_id.clone(),
            strategy: strategy.to_string(),
            estimated_cost_usd: estimated_cost,
            estimated_tokens,
        });

        decision
    }

    /// Run one coordination round over the given agents with default
    /// options and no external cancellation.
    pub async fn coordinate(
        &self,
        task: Task,
        ctx: ExecutionContext,
        agents: Vec<AgentDefinition>,
    ) -> Result<CoordinationOutcome, OrchestratorError> {
        self.coordinate_with_options(
            task,
            ctx,
            agents,
            RoundOptions::default(),
            CancellationToken::new(),
        )
        .await
    }

    /// Run one coordination round.
    ///
    /// Creates a session, dispatches per the selected strategy under the
    /// configured concurrency bound, records one snapshot per attempt,
    /// reconciles results, and drives the session to a terminal state.
    /// Cancelling the token moves the session to `Cancelled`; snapshots
    /// recorded so far stay queryable.
    pub async fn coordinate_with_options(
        &self,
        task: Task,
        ctx: ExecutionContext,
        agents: Vec<AgentDefinition>,
        options: RoundOptions,
        cancel: CancellationToken,
    ) -> Result<CoordinationOutcome, OrchestratorError> {
        if agents.is_empty() {
            return Err(OrchestratorError::Dispatch {
                session_id: None,
                source: DispatchError::NoAgents,
            });
        }

        let mut metadata = options.metadata.clone();
        metadata.insert("task_id".to_string(), task.task_id.clone());
        let agent_ids: Vec<String> = agents.iter().map(|a| a.agent_id.clone()).collect();
        let session_id = self.sessions.create_session(metadata, agent_ids).await?;
        self.sessions.start(&session_id).await?;

        // Routing decision and strategy selection
        let started = Instant::now();
        let decision = self.tree.evaluate(&ctx);
        let latency = started.elapsed();
        let (estimated_tokens, estimated_cost) = Self::estimate_cost(&ctx);
        let hints = SelectionHints::from_context(&ctx, estimated_cost, agents.len());
        let strategy = options
            .strategy
            .unwrap_or_else(|| self.selector.select(&decision, &hints));

        self.emit_metrics(RoutingMetrics {
            task_id: task.task_id.clone(),
            decision_latency_us: latency.as_micros() as u64,
            conditions_evaluated: decision.trace.len() as u32,
            paths_evaluated: (decision.alternatives.len() + usize::from(decision.is_routed()))
                as u32,
            selected_path: decision.path_id.clone(),
            strategy: strategy.to_string(),
            estimated_cost_usd: estimated_cost,
            estimated_tokens,
        });

        tracing::info!(
            session_id = %session_id,
            task_id = %task.task_id,
            strategy = %strategy,
            agents = agents.len(),
            "Coordination round started"
        );

        self.sessions.mark_executing(&session_id).await?;

        // A consumer must exist before dispatch begins
        for agent in &agents {
            self.bus.subscribe(&agent.agent_id);
        }

        let round = Arc::new(RoundContext {
            worker: self.worker.clone(),
            sessions: self.sessions.clone(),
            bus: self.bus.clone(),
            session_id: session_id.clone(),
            task: task.clone(),
            grace: Duration::from_millis(self.config.dispatch.grace_period_ms),
        });

        let dispatch = self
            .dispatch(&round, &agents, strategy, &cancel)
            .await;

        let results = match dispatch {
            Ok(results) => results,
            Err(RoundAbort::Cancelled) => {
                self.finish_cancelled(&session_id, &decision, strategy).await;
                return Err(OrchestratorError::Cancelled { session_id });
            }
        };

        metrics::counter!(
            "cohort_dispatch_total",
            "strategy" => strategy.to_string(),
        )
        .increment(results.len() as u64);

        // Strategy success criterion before reconciliation
        if strategy == ExecutionStrategy::Consensus {
            let required = options.quorum.unwrap_or_else(|| {
                (self.config.dispatch.quorum_fraction * agents.len() as f64).ceil() as usize
            });
            let received = results.iter().filter(|r| r.succeeded).count();
            if received < required {
                let missing: Vec<String> = agents
                    .iter()
                    .filter(|a| {
                        !results
                            .iter()
                            .any(|r| r.succeeded && r.agent_id == a.agent_id)
                    })
                    .map(|a| a.agent_id.clone())
                    .collect();
                let error = DispatchError::QuorumNotMet {
                    required,
                    received,
                    missing,
                };
                self.finish_failed(&session_id, &decision, strategy, error.to_string())
                    .await;
                return Err(OrchestratorError::Dispatch {
                    session_id: Some(session_id),
                    source: error,
                });
            }
        }

        // Reconcile: aggregate or resolve, exclusive per round
        let reconciled = self.reconcile(&results, &options.reconciliation, &session_id);
        let (aggregation, resolution) = match reconciled {
            Ok(pair) => pair,
            Err(e) => {
                self.finish_failed(&session_id, &decision, strategy, e.to_string())
                    .await;
                return Err(e);
            }
        };

        self.sessions.complete(&session_id).await?;
        self.record_round_outcome(&decision, strategy, true);
        self.emit_statistics(&session_id).await;

        let session = self.sessions.get(&session_id).await?;
        Ok(CoordinationOutcome {
            aggregation,
            resolution,
            session,
        })
    }

    fn reconcile(
        &self,
        results: &[AgentResult],
        reconciliation: &Reconciliation,
        session_id: &str,
    ) -> Result<(AggregationResult, Option<Resolution>), OrchestratorError> {
        match reconciliation {
            Reconciliation::Aggregate(strategy) => {
                let mut aggregation = Aggregator::aggregate(results, strategy).map_err(|e| {
                    OrchestratorError::Aggregation {
                        session_id: session_id.to_string(),
                        source: e,
                    }
                })?;
                // Attach detected disagreements for auditability
                let mut conflicts = self.analyzer.analyze("result", results);
                aggregation.conflicts.append(&mut conflicts);
                Ok((aggregation, None))
            }
            Reconciliation::Resolve(strategy) => {
                let conflicts = self.analyzer.analyze("result", results);
                let resolution =
                    ConflictResolver::resolve(results, &conflicts, strategy).map_err(|e| {
                        OrchestratorError::Conflict {
                            session_id: session_id.to_string(),
                            source: e,
                        }
                    })?;
                let aggregation =
                    Self::aggregation_from_resolution(results, &resolution, conflicts);
                Ok((aggregation, Some(resolution)))
            }
        }
    }

    /// Wrap a resolution into the round's aggregation shape.
    fn aggregation_from_resolution(
        results: &[AgentResult],
        resolution: &Resolution,
        conflicts: Vec<Conflict>,
    ) -> AggregationResult {
        let successful: Vec<&AgentResult> = results.iter().filter(|r| r.succeeded).collect();
        let winner_normalized = resolution.winner.normalized();
        let agreeing: Vec<&&AgentResult> = successful
            .iter()
            .filter(|r| r.value.normalized() == winner_normalized)
            .collect();

        let agreement_score = if successful.is_empty() {
            0.0
        } else {
            agreeing.len() as f64 / successful.len() as f64
        };
        let confidence = if agreeing.is_empty() {
            successful.iter().map(|r| r.confidence).sum::<f64>() / successful.len().max(1) as f64
        } else {
            agreeing.iter().map(|r| r.confidence).sum::<f64>() / agreeing.len() as f64
        };

        let mut alternatives = Vec::new();
        for result in &successful {
            let candidate = result.value.normalized();
            if candidate != winner_normalized && !alternatives.contains(&result.value) {
                alternatives.push(result.value.clone());
            }
        }

        AggregationResult {
            primary_result: resolution.winner.clone(),
            alternative_results: alternatives,
            agreement_score,
            strategy_used: format!("resolution:{}", resolution.strategy),
            confidence,
            conflicts,
        }
    }

    async fn dispatch(
        &self,
        round: &Arc<RoundContext>,
        agents: &[AgentDefinition],
        strategy: ExecutionStrategy,
        cancel: &CancellationToken,
    ) -> Result<Vec<AgentResult>, RoundAbort> {
        match strategy {
            ExecutionStrategy::Direct => {
                self.dispatch_sequential(round, &agents[..1], cancel, StopRule::Never)
                    .await
            }
            ExecutionStrategy::RoundRobin => {
                let index = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) as usize
                    % agents.len();
                self.dispatch_sequential(
                    round,
                    &agents[index..index + 1],
                    cancel,
                    StopRule::Never,
                )
                .await
            }
            ExecutionStrategy::Random => {
                use std::collections::hash_map::RandomState;
                use std::hash::BuildHasher;

                let random_state = RandomState::new();
                let random_value = random_state.hash_one(std::time::SystemTime::now());
                let index = (random_value as usize) % agents.len();
                self.dispatch_sequential(
                    round,
                    &agents[index..index + 1],
                    cancel,
                    StopRule::Never,
                )
                .await
            }
            ExecutionStrategy::Sequential => {
                self.dispatch_sequential(round, agents, cancel, StopRule::Never)
                    .await
            }
            ExecutionStrategy::Failover => {
                self.dispatch_sequential(round, agents, cancel, StopRule::FirstSuccess)
                    .await
            }
            ExecutionStrategy::Cascade => {
                self.dispatch_sequential(round, agents, cancel, StopRule::ConfidentSuccess)
                    .await
            }
            ExecutionStrategy::Parallel | ExecutionStrategy::Consensus => {
                self.dispatch_parallel(round, agents, cancel, false).await
            }
            ExecutionStrategy::Competitive => {
                self.dispatch_parallel(round, agents, cancel, true).await
            }
            ExecutionStrategy::Hierarchical => {
                self.dispatch_hierarchical(round, agents, cancel).await
            }
        }
    }

    async fn dispatch_sequential(
        &self,
        round: &Arc<RoundContext>,
        agents: &[AgentDefinition],
        cancel: &CancellationToken,
        stop: StopRule,
    ) -> Result<Vec<AgentResult>, RoundAbort> {
        let mut results = Vec::with_capacity(agents.len());
        for agent in agents {
            if cancel.is_cancelled() {
                return Err(RoundAbort::Cancelled);
            }

            let invocation = round.invoke_with_retries(agent.clone());
            let result = tokio::select! {
                result = invocation => result,
                _ = cancel.cancelled() => {
                    round
                        .record_snapshot(
                            AgentSessionSnapshot::finished(&agent.agent_id, Utc::now(), false)
                                .with_error("cancelled before completion"),
                        )
                        .await;
                    return Err(RoundAbort::Cancelled);
                }
            };

            let done = match stop {
                StopRule::Never => false,
                StopRule::FirstSuccess => result.succeeded,
                StopRule::ConfidentSuccess => {
                    result.succeeded && result.confidence >= CASCADE_CONFIDENCE
                }
            };
            results.push(result);
            if done {
                break;
            }
        }
        Ok(results)
    }

    /// Fan out all agents concurrently, bounded by the configured
    /// max-concurrency. With `first_wins`, the first success aborts the
    /// rest (Competitive).
    async fn dispatch_parallel(
        &self,
        round: &Arc<RoundContext>,
        agents: &[AgentDefinition],
        cancel: &CancellationToken,
        first_wins: bool,
    ) -> Result<Vec<AgentResult>, RoundAbort> {
        let semaphore = Arc::new(Semaphore::new(self.config.dispatch.max_concurrency));
        let mut join_set = JoinSet::new();

        for agent in agents {
            let round = round.clone();
            let agent = agent.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("dispatch semaphore closed");
                round.invoke_with_retries(agent).await
            });
        }

        let mut results = Vec::with_capacity(agents.len());
        let mut cancelled = false;
        let mut won = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                joined = join_set.join_next() => match joined {
                    None => break,
                    Some(Ok(result)) => {
                        let winner = first_wins && result.succeeded;
                        results.push(result);
                        if winner {
                            won = true;
                            break;
                        }
                    }
                    Some(Err(join_err)) => {
                        // A panicking worker task is isolated, not fatal
                        tracing::warn!(error = %join_err, "Worker task aborted");
                    }
                },
            }
        }

        if cancelled {
            self.drain_after_cancel(round, agents, &mut join_set, &mut results)
                .await;
            return Err(RoundAbort::Cancelled);
        }
        if won {
            join_set.abort_all();
            self.record_superseded(round, agents, &results).await;
        }
        Ok(results)
    }

    /// Lead agent first, then the remaining agents refine its output in
    /// parallel. The lead is the highest-priority agent; its value is
    /// attached to the task payload handed to the followers.
    async fn dispatch_hierarchical(
        &self,
        round: &Arc<RoundContext>,
        agents: &[AgentDefinition],
        cancel: &CancellationToken,
    ) -> Result<Vec<AgentResult>, RoundAbort> {
        let lead_index = agents
            .iter()
            .enumerate()
            .max_by_key(|(_, a)| a.priority)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let lead = &agents[lead_index];

        let mut results = self
            .dispatch_sequential(round, std::slice::from_ref(lead), cancel, StopRule::Never)
            .await?;
        let lead_result = results[0].clone();

        let followers: Vec<AgentDefinition> = agents
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != lead_index)
            .map(|(_, a)| a.clone())
            .collect();
        if followers.is_empty() {
            return Ok(results);
        }

        let refined_task = Task::with_id(
            round.task.task_id.clone(),
            serde_json::json!({
                "input": round.task.input,
                "lead_agent": lead_result.agent_id,
                "lead_result": serde_json::to_value(&lead_result.value)
                    .unwrap_or(serde_json::Value::Null),
            }),
        );
        let follower_round = Arc::new(RoundContext {
            task: refined_task,
            worker: round.worker.clone(),
            sessions: round.sessions.clone(),
            bus: round.bus.clone(),
            session_id: round.session_id.clone(),
            grace: round.grace,
        });

        let mut follower_results = self
            .dispatch_parallel(&follower_round, &followers, cancel, false)
            .await?;
        results.append(&mut follower_results);
        Ok(results)
    }

    /// Give in-flight workers the grace period to finish, then abort
    /// them. Never blocks on a worker that does not return.
    async fn drain_after_cancel(
        &self,
        round: &Arc<RoundContext>,
        agents: &[AgentDefinition],
        join_set: &mut JoinSet<AgentResult>,
        results: &mut Vec<AgentResult>,
    ) {
        let grace = Duration::from_millis(self.config.dispatch.grace_period_ms);
        let _ = tokio::time::timeout(grace, async {
            while let Some(joined) = join_set.join_next().await {
                if let Ok(result) = joined {
                    results.push(result);
                }
            }
        })
        .await;
        join_set.abort_all();

        // Agents with no recorded attempt get a cancelled snapshot
        for agent in agents {
            if !results.iter().any(|r| r.agent_id == agent.agent_id) {
                round
                    .record_snapshot(
                        AgentSessionSnapshot::finished(&agent.agent_id, Utc::now(), false)
                            .with_error("cancelled before completion"),
                    )
                    .await;
            }
        }
    }

    /// Record losers of a Competitive round that never got to finish.
    async fn record_superseded(
        &self,
        round: &Arc<RoundContext>,
        agents: &[AgentDefinition],
        results: &[AgentResult],
    ) {
        for agent in agents {
            if !results.iter().any(|r| r.agent_id == agent.agent_id) {
                round
                    .record_snapshot(
                        AgentSessionSnapshot::finished(&agent.agent_id, Utc::now(), false)
                            .with_error("superseded by competing agent"),
                    )
                    .await;
            }
        }
    }

    async fn finish_cancelled(
        &self,
        session_id: &str,
        decision: &RoutingDecision,
        strategy: ExecutionStrategy,
    ) {
        if let Err(e) = self.sessions.cancel(session_id, "round cancelled").await {
            tracing::warn!(session_id = %session_id, error = %e, "Cancel transition failed");
        }
        self.record_round_outcome(decision, strategy, false);
        self.emit_statistics(session_id).await;
    }

    async fn finish_failed(
        &self,
        session_id: &str,
        decision: &RoutingDecision,
        strategy: ExecutionStrategy,
        reason: String,
    ) {
        if let Err(e) = self.sessions.fail(session_id, reason).await {
            tracing::warn!(session_id = %session_id, error = %e, "Fail transition failed");
        }
        self.record_round_outcome(decision, strategy, false);
        self.emit_statistics(session_id).await;
    }

    fn record_round_outcome(
        &self,
        decision: &RoutingDecision,
        strategy: ExecutionStrategy,
        succeeded: bool,
    ) {
        let path = decision.path_id.as_deref().unwrap_or("unrouted");
        self.analytics
            .record_outcome(path, &strategy.to_string(), succeeded);
    }

    fn emit_metrics(&self, routing_metrics: RoutingMetrics) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            sink.record_metrics(&routing_metrics).await;
        });
    }

    async fn emit_statistics(&self, session_id: &str) {
        if let Ok(statistics) = self.sessions.statistics(session_id).await {
            let sink = self.sink.clone();
            tokio::spawn(async move {
                sink.record_statistics(&statistics).await;
            });
        }
    }

    /// Token and cost estimate for a round: input tokens plus an
    /// output heuristic of half the input, priced by the optional
    /// `cost_per_1k_tokens` metadata rate.
    fn estimate_cost(ctx: &ExecutionContext) -> (u32, f64) {
        let input = ctx.token_estimate.unwrap_or(0);
        let total = input + input / 2;
        let rate = ctx
            .metadata
            .get("cost_per_1k_tokens")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        (total, total as f64 / 1000.0 * rate)
    }
}

enum RoundAbort {
    Cancelled,
}

#[derive(Clone, Copy)]
enum StopRule {
    Never,
    FirstSuccess,
    ConfidentSuccess,
}

/// Everything a spawned worker invocation needs, shared per round.
struct RoundContext {
    worker: Arc<dyn WorkerBackend>,
    sessions: SessionManager,
    bus: Arc<MessageBus>,
    session_id: String,
    task: Task,
    grace: Duration,
}

impl RoundContext {
    /// Invoke one agent, honoring its retry budget. Every attempt is
    /// recorded as its own session snapshot; the returned result is the
    /// final attempt's outcome (a failure result when the budget is
    /// exhausted, so the round's result set stays complete).
    async fn invoke_with_retries(&self, agent: AgentDefinition) -> AgentResult {
        let attempts = agent.max_retries + 1;
        for attempt in 1..=attempts {
            let started_at = Utc::now();
            let started = Instant::now();
            let deadline = agent.timeout();

            let outcome =
                tokio::time::timeout(deadline + self.grace, self.worker.invoke(&agent, &self.task, deadline))
                    .await;
            let elapsed = started.elapsed();

            let attempt_result: Result<AgentResult, DispatchError> = match outcome {
                Err(_) => Err(DispatchError::Timeout {
                    agent_id: agent.agent_id.clone(),
                    timeout_ms: deadline.as_millis() as u64,
                }),
                Ok(result) => result,
            };

            match attempt_result {
                Ok(mut result) => {
                    result.priority = agent.priority;
                    if result.duration_ms == 0 {
                        result.duration_ms = elapsed.as_millis() as u64;
                    }
                    self.record_snapshot(
                        AgentSessionSnapshot::finished(&agent.agent_id, started_at, true)
                            .with_cost(result.cost_usd, result.tokens),
                    )
                    .await;
                    self.publish_result(&result);
                    return result;
                }
                Err(error) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        agent_id = %agent.agent_id,
                        attempt = attempt,
                        error = %error,
                        "Agent attempt failed"
                    );
                    self.record_snapshot(
                        AgentSessionSnapshot::finished(&agent.agent_id, started_at, false)
                            .with_error(error.to_string()),
                    )
                    .await;

                    if attempt == attempts {
                        let result = AgentResult::failure(&agent.agent_id, error.to_string())
                            .with_priority(agent.priority)
                            .with_duration(elapsed);
                        self.publish_result(&result);
                        return result;
                    }
                }
            }
        }
        unreachable!("retry loop always returns")
    }

    async fn record_snapshot(&self, snapshot: AgentSessionSnapshot) {
        if let Err(e) = self
            .sessions
            .record_agent_result(&self.session_id, snapshot)
            .await
        {
            // A cancelled session is already terminal when late workers land
            tracing::debug!(session_id = %self.session_id, error = %e, "Snapshot not recorded");
        }
    }

    fn publish_result(&self, result: &AgentResult) {
        let (kind, priority) = if result.succeeded {
            (MessageKind::Result, MessagePriority::Normal)
        } else {
            (MessageKind::Error, MessagePriority::High)
        };
        self.bus.publish(
            AgentMessage::new(
                &result.agent_id,
                Recipient::Agent(ORCHESTRATOR_ID.to_string()),
                kind,
                serde_json::to_value(result).unwrap_or(serde_json::Value::Null),
            )
            .with_priority(priority)
            .with_correlation_id(&self.task.task_id),
        );
    }
}
