//! End-to-end coordination tests: dispatch strategies, quorum, retries,
//! cancellation, and session outcomes.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cohort::agent::{AgentDefinition, DispatchError, Task};
use cohort::aggregate::AggregationStrategy;
use cohort::config::CohortConfig;
use cohort::conflict::ResolutionStrategy;
use cohort::context::{ContextValue, ExecutionContext};
use cohort::orchestrator::{
    CoordinationOutcome, Orchestrator, OrchestratorError, Reconciliation, RoundOptions,
    ORCHESTRATOR_ID,
};
use cohort::routing::{
    Branch, ExecutionStrategy, RoutingCondition, RoutingNode, RoutingPath, RoutingTree,
};
use cohort::session::{InMemorySessionStore, SessionStatus, SessionStore};

use common::{Behavior, StubWorker};

fn simple_tree() -> Arc<RoutingTree> {
    let mut tree = RoutingTree::new();
    tree.add_path(RoutingPath::new("path_fast", "small-model"))
        .unwrap();
    tree.add_path(RoutingPath::new("path_heavy", "large-model"))
        .unwrap();
    tree.add_node(
        RoutingNode::new("root", RoutingCondition::min_tokens(1001))
            .on_true(Branch::Path("path_heavy".into()))
            .on_false(Branch::Path("path_fast".into())),
    )
    .unwrap();
    tree.set_root("root");
    Arc::new(tree)
}

fn fast_config() -> CohortConfig {
    let mut config = CohortConfig::default();
    config.dispatch.grace_period_ms = 50;
    config
}

fn orchestrator_with(worker: StubWorker) -> Orchestrator {
    Orchestrator::new(simple_tree(), Arc::new(worker), fast_config())
}

fn options(strategy: ExecutionStrategy, reconciliation: Reconciliation) -> RoundOptions {
    RoundOptions {
        strategy: Some(strategy),
        reconciliation,
        quorum: None,
        metadata: HashMap::new(),
    }
}

async fn run(
    orchestrator: &Orchestrator,
    agents: Vec<AgentDefinition>,
    round: RoundOptions,
) -> Result<CoordinationOutcome, OrchestratorError> {
    orchestrator
        .coordinate_with_options(
            Task::new(serde_json::json!("task input")),
            ExecutionContext::new().with_token_estimate(500),
            agents,
            round,
            CancellationToken::new(),
        )
        .await
}

#[tokio::test]
async fn parallel_round_completes_and_aggregates() {
    let worker = StubWorker::new()
        .with_behavior("a", Behavior::Value(ContextValue::from("yes"), 0.9))
        .with_behavior("b", Behavior::Value(ContextValue::from("yes"), 0.8))
        .with_behavior("c", Behavior::Value(ContextValue::from("no"), 0.7));
    let orchestrator = orchestrator_with(worker);

    let agents = vec![
        AgentDefinition::new("a"),
        AgentDefinition::new("b"),
        AgentDefinition::new("c"),
    ];
    let outcome = run(
        &orchestrator,
        agents,
        options(
            ExecutionStrategy::Parallel,
            Reconciliation::Aggregate(AggregationStrategy::MajorityVote),
        ),
    )
    .await
    .unwrap();

    assert_eq!(outcome.aggregation.primary_result, ContextValue::from("yes"));
    assert_eq!(outcome.session.status, SessionStatus::Completed);
    assert_eq!(outcome.session.snapshots.len(), 3);

    let stats = outcome.session.statistics();
    assert_eq!(stats.per_agent.len(), 3);
}

/// Consensus with a full quorum requirement and one agent that never
/// responds: the round fails with a DispatchError naming the missing
/// agent, and the completed snapshots stay recorded.
#[tokio::test]
async fn consensus_quorum_miss_fails_session_keeping_snapshots() {
    let worker = StubWorker::new()
        .with_behavior("a", Behavior::Value(ContextValue::from("yes"), 0.9))
        .with_behavior("b", Behavior::Value(ContextValue::from("yes"), 0.8))
        .with_behavior("c", Behavior::Hang);
    let orchestrator = orchestrator_with(worker);

    let agents = vec![
        AgentDefinition::new("a"),
        AgentDefinition::new("b"),
        AgentDefinition::new("c").with_timeout(Duration::from_millis(50)),
    ];
    let mut round = options(
        ExecutionStrategy::Consensus,
        Reconciliation::Aggregate(AggregationStrategy::Unanimous),
    );
    round.quorum = Some(3);

    let err = run(&orchestrator, agents, round).await.unwrap_err();

    let session_id = err.session_id().expect("failure carries session").to_string();
    match &err {
        OrchestratorError::Dispatch {
            source:
                DispatchError::QuorumNotMet {
                    required,
                    received,
                    missing,
                },
            ..
        } => {
            assert_eq!(*required, 3);
            assert_eq!(*received, 2);
            assert_eq!(missing, &vec!["c".to_string()]);
        }
        other => panic!("expected quorum error, got {:?}", other),
    }

    let session = orchestrator.sessions().get(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);

    let successes: Vec<&str> = session
        .snapshots
        .iter()
        .filter(|s| s.succeeded)
        .map(|s| s.agent_id.as_str())
        .collect();
    assert_eq!(successes.len(), 2);
    assert!(successes.contains(&"a"));
    assert!(successes.contains(&"b"));

    let timed_out = session
        .snapshots
        .iter()
        .find(|s| s.agent_id == "c")
        .expect("timed-out agent has a snapshot");
    assert!(!timed_out.succeeded);
    assert!(timed_out.error.as_deref().unwrap().contains("timed out"));
}

/// Cancellation mid-round: completed results stay in statistics, the
/// session moves to Cancelled, and no aggregation is produced.
#[tokio::test]
async fn cancel_mid_round_retains_completed_results() {
    let worker = StubWorker::new()
        .with_behavior("a", Behavior::Value(ContextValue::from("done"), 0.9))
        .with_behavior("b", Behavior::Value(ContextValue::from("done"), 0.9))
        .with_behavior("c", Behavior::Hang)
        .with_behavior("d", Behavior::Hang)
        .with_behavior("e", Behavior::Hang);
    let orchestrator = Arc::new(orchestrator_with(worker));

    let agents: Vec<AgentDefinition> = ["a", "b", "c", "d", "e"]
        .iter()
        .map(|id| AgentDefinition::new(*id))
        .collect();

    let cancel = CancellationToken::new();
    let handle = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator
                .coordinate_with_options(
                    Task::new(serde_json::json!("work")),
                    ExecutionContext::new(),
                    agents,
                    options(
                        ExecutionStrategy::Parallel,
                        Reconciliation::Aggregate(AggregationStrategy::MajorityVote),
                    ),
                    cancel,
                )
                .await
        })
    };

    // Let the two fast workers land, then pull the plug
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    let session_id = match err {
        OrchestratorError::Cancelled { session_id } => session_id,
        other => panic!("expected cancellation, got {:?}", other),
    };

    let session = orchestrator.sessions().get(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);

    let stats = orchestrator.sessions().statistics(&session_id).await.unwrap();
    let successes: u32 = stats.per_agent.iter().map(|a| a.successes).sum();
    assert_eq!(successes, 2);

    // The hung workers are recorded as failed, not left dangling
    let failures: u32 = stats.per_agent.iter().map(|a| a.failures).sum();
    assert_eq!(failures, 3);
}

#[tokio::test]
async fn failover_stops_after_first_success() {
    let worker = StubWorker::new()
        .with_behavior("primary", Behavior::AlwaysFail("offline".to_string()))
        .with_behavior("backup", Behavior::Value(ContextValue::from("ok"), 0.9));
    let orchestrator = orchestrator_with(worker);

    let agents = vec![
        AgentDefinition::new("primary"),
        AgentDefinition::new("backup"),
        AgentDefinition::new("never-reached"),
    ];
    let outcome = run(
        &orchestrator,
        agents,
        options(
            ExecutionStrategy::Failover,
            Reconciliation::Aggregate(AggregationStrategy::FirstSuccess),
        ),
    )
    .await
    .unwrap();

    assert_eq!(outcome.aggregation.primary_result, ContextValue::from("ok"));
    // primary failed, backup succeeded, third never dispatched
    let dispatched: Vec<&str> = outcome
        .session
        .snapshots
        .iter()
        .map(|s| s.agent_id.as_str())
        .collect();
    assert!(dispatched.contains(&"primary"));
    assert!(dispatched.contains(&"backup"));
    assert!(!dispatched.contains(&"never-reached"));
}

#[tokio::test]
async fn retry_budget_produces_one_snapshot_per_attempt() {
    let worker = StubWorker::new()
        .with_behavior("flaky", Behavior::FlakyUntil(2, ContextValue::from("ok")));
    let orchestrator = orchestrator_with(worker);

    let agents = vec![AgentDefinition::new("flaky").with_max_retries(2)];
    let outcome = run(
        &orchestrator,
        agents,
        options(
            ExecutionStrategy::Direct,
            Reconciliation::Aggregate(AggregationStrategy::FirstSuccess),
        ),
    )
    .await
    .unwrap();

    assert_eq!(outcome.session.status, SessionStatus::Completed);
    assert_eq!(outcome.session.snapshots.len(), 3);
    assert_eq!(
        outcome
            .session
            .snapshots
            .iter()
            .map(|s| s.attempt)
            .collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(outcome.session.snapshots[2].succeeded);
}

#[tokio::test]
async fn exhausted_retries_fail_the_round_when_nothing_succeeds() {
    let worker = StubWorker::new()
        .with_behavior("doomed", Behavior::AlwaysFail("hard down".to_string()));
    let orchestrator = orchestrator_with(worker);

    let agents = vec![AgentDefinition::new("doomed").with_max_retries(1)];
    let err = run(
        &orchestrator,
        agents,
        options(
            ExecutionStrategy::Direct,
            Reconciliation::Aggregate(AggregationStrategy::FirstSuccess),
        ),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, OrchestratorError::Aggregation { .. }));
    let session_id = err.session_id().unwrap();
    let session = orchestrator.sessions().get(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.snapshots.len(), 2);
}

#[tokio::test]
async fn competitive_first_success_supersedes_slower_agents() {
    let worker = StubWorker::new()
        .with_behavior(
            "fast",
            Behavior::Delayed(
                Duration::from_millis(10),
                ContextValue::from("fast wins"),
                0.9,
            ),
        )
        .with_behavior(
            "slow",
            Behavior::Delayed(Duration::from_millis(500), ContextValue::from("slow"), 0.9),
        );
    let orchestrator = orchestrator_with(worker);

    let agents = vec![AgentDefinition::new("fast"), AgentDefinition::new("slow")];
    let outcome = run(
        &orchestrator,
        agents,
        options(
            ExecutionStrategy::Competitive,
            Reconciliation::Aggregate(AggregationStrategy::FirstSuccess),
        ),
    )
    .await
    .unwrap();

    assert_eq!(
        outcome.aggregation.primary_result,
        ContextValue::from("fast wins")
    );
    let superseded = outcome
        .session
        .snapshots
        .iter()
        .find(|s| s.agent_id == "slow")
        .unwrap();
    assert!(!superseded.succeeded);
    assert!(superseded.error.as_deref().unwrap().contains("superseded"));
}

#[tokio::test]
async fn cascade_stops_at_confident_result() {
    let worker = StubWorker::new()
        .with_behavior("tentative", Behavior::Value(ContextValue::from("maybe"), 0.5))
        .with_behavior("confident", Behavior::Value(ContextValue::from("sure"), 0.95))
        .with_behavior("unused", Behavior::Value(ContextValue::from("extra"), 0.9));
    let orchestrator = orchestrator_with(worker);

    let agents = vec![
        AgentDefinition::new("tentative"),
        AgentDefinition::new("confident"),
        AgentDefinition::new("unused"),
    ];
    let outcome = run(
        &orchestrator,
        agents,
        options(
            ExecutionStrategy::Cascade,
            Reconciliation::Resolve(ResolutionStrategy::ConfidenceBased),
        ),
    )
    .await
    .unwrap();

    assert_eq!(outcome.aggregation.primary_result, ContextValue::from("sure"));
    assert_eq!(outcome.session.snapshots.len(), 2);
}

#[tokio::test]
async fn hierarchical_followers_see_lead_result() {
    let worker = StubWorker::new()
        .with_behavior("lead", Behavior::Value(ContextValue::from("draft"), 0.9))
        .with_behavior("reviewer", Behavior::EchoTask);
    let orchestrator = orchestrator_with(worker);

    let agents = vec![
        AgentDefinition::new("lead").with_priority(10),
        AgentDefinition::new("reviewer").with_priority(1),
    ];
    let outcome = run(
        &orchestrator,
        agents,
        options(
            ExecutionStrategy::Hierarchical,
            Reconciliation::Aggregate(AggregationStrategy::FirstSuccess),
        ),
    )
    .await
    .unwrap();

    // Reviewer echoed its task, which carries the lead's value
    let reviewer_result = outcome
        .session
        .snapshots
        .iter()
        .find(|s| s.agent_id == "reviewer")
        .unwrap();
    assert!(reviewer_result.succeeded);

    let echoed = outcome
        .aggregation
        .alternative_results
        .iter()
        .chain(std::iter::once(&outcome.aggregation.primary_result))
        .find_map(|v| v.as_map());
    let echoed = echoed.expect("reviewer echoed a map payload");
    assert_eq!(echoed.get("lead_result"), Some(&ContextValue::from("draft")));
    assert_eq!(echoed.get("lead_agent"), Some(&ContextValue::from("lead")));
}

#[tokio::test]
async fn confidence_resolution_round_prefers_confident_dissenter() {
    let worker = StubWorker::new()
        .with_behavior("a", Behavior::Value(ContextValue::from("yes"), 0.6))
        .with_behavior("b", Behavior::Value(ContextValue::from("yes"), 0.6))
        .with_behavior("c", Behavior::Value(ContextValue::from("no"), 0.9));
    let orchestrator = orchestrator_with(worker);

    let agents = vec![
        AgentDefinition::new("a"),
        AgentDefinition::new("b"),
        AgentDefinition::new("c"),
    ];
    let outcome = run(
        &orchestrator,
        agents,
        options(
            ExecutionStrategy::Parallel,
            Reconciliation::Resolve(ResolutionStrategy::ConfidenceBased),
        ),
    )
    .await
    .unwrap();

    assert_eq!(outcome.aggregation.primary_result, ContextValue::from("no"));
    let resolution = outcome.resolution.unwrap();
    assert_eq!(resolution.winning_agent.as_deref(), Some("c"));
    assert_eq!(resolution.losers.len(), 2);
}

#[tokio::test]
async fn round_publishes_result_messages_to_orchestrator_mailbox() {
    let worker = StubWorker::new();
    let orchestrator = orchestrator_with(worker);

    let agents = vec![AgentDefinition::new("a"), AgentDefinition::new("b")];
    let outcome = run(
        &orchestrator,
        agents,
        options(
            ExecutionStrategy::Parallel,
            Reconciliation::Aggregate(AggregationStrategy::Concat),
        ),
    )
    .await;
    // Concat over scalar strings fails; messages were still published
    assert!(outcome.is_err());

    let messages = orchestrator.bus().drain(ORCHESTRATOR_ID);
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.correlation_id.is_some()));
}

#[tokio::test]
async fn analytics_track_round_outcomes() {
    let worker = StubWorker::new();
    let orchestrator = orchestrator_with(worker);

    run(
        &orchestrator,
        vec![AgentDefinition::new("a")],
        options(
            ExecutionStrategy::Direct,
            Reconciliation::Aggregate(AggregationStrategy::FirstSuccess),
        ),
    )
    .await
    .unwrap();

    assert_eq!(
        orchestrator.analytics().path_success_rate("path_fast"),
        Some(1.0)
    );
    assert_eq!(
        orchestrator.analytics().strategy_success_rate("direct"),
        Some(1.0)
    );
}

#[tokio::test]
async fn terminal_sessions_persist_to_store() {
    let store = Arc::new(InMemorySessionStore::new());
    let orchestrator = Orchestrator::with_parts(
        simple_tree(),
        Arc::new(StubWorker::new()),
        fast_config(),
        cohort::routing::StrategySelector::new(),
        store.clone(),
        Arc::new(cohort::telemetry::NullSink),
    );

    let outcome = run(
        &orchestrator,
        vec![AgentDefinition::new("a")],
        options(
            ExecutionStrategy::Direct,
            Reconciliation::Aggregate(AggregationStrategy::FirstSuccess),
        ),
    )
    .await
    .unwrap();

    let stored = store
        .get(&outcome.session.session_id)
        .await
        .unwrap()
        .expect("terminal session persisted");
    assert_eq!(stored.status, SessionStatus::Completed);
}
