//! Integration tests for result reconciliation: aggregation strategies
//! and conflict resolution over the same inputs.

use cohort::agent::AgentResult;
use cohort::aggregate::{AggregationStrategy, Aggregator};
use cohort::conflict::{
    ConflictAnalyzer, ConflictResolver, ConflictSeverity, ResolutionStrategy,
};
use cohort::context::ContextValue;

fn split_vote_results() -> Vec<AgentResult> {
    vec![
        AgentResult::success("a", ContextValue::from("yes")).with_confidence(0.6),
        AgentResult::success("b", ContextValue::from("yes")).with_confidence(0.6),
        AgentResult::success("c", ContextValue::from("no")).with_confidence(0.9),
    ]
}

#[test]
fn majority_vote_and_confidence_resolution_disagree_by_design() {
    let results = split_vote_results();

    // MajorityVote aggregation: the two "yes" agents win
    let aggregation =
        Aggregator::aggregate(&results, &AggregationStrategy::MajorityVote).unwrap();
    assert_eq!(aggregation.primary_result, ContextValue::from("yes"));
    assert!((aggregation.agreement_score - 2.0 / 3.0).abs() < 1e-9);

    // ConfidenceBased resolution on the same inputs: "no" wins at 0.9
    let analyzer = ConflictAnalyzer::default();
    let conflicts = analyzer.analyze("answer", &results);
    assert!(!conflicts.is_empty());

    let resolution =
        ConflictResolver::resolve(&results, &conflicts, &ResolutionStrategy::ConfidenceBased)
            .unwrap();
    assert_eq!(resolution.winner, ContextValue::from("no"));
    assert_eq!(resolution.winning_agent.as_deref(), Some("c"));

    // Losers are auditable
    let loser_ids: Vec<&str> = resolution
        .losers
        .iter()
        .map(|l| l.agent_id.as_str())
        .collect();
    assert!(loser_ids.contains(&"a"));
    assert!(loser_ids.contains(&"b"));
}

#[test]
fn severity_ranking_orders_mismatch_kinds() {
    let analyzer = ConflictAnalyzer::new(0.1);

    let type_mismatch = analyzer
        .compare(&ContextValue::Number(1.0), &ContextValue::from("1"))
        .unwrap();
    let numeric = analyzer
        .compare(&ContextValue::Number(1.0), &ContextValue::Number(2.0))
        .unwrap();
    let case_only = analyzer
        .compare(&ContextValue::from("Yes"), &ContextValue::from("yes"))
        .unwrap();

    assert_eq!(type_mismatch, ConflictSeverity::High);
    assert_eq!(numeric, ConflictSeverity::Medium);
    assert_eq!(case_only, ConflictSeverity::Low);
    assert!(type_mismatch > numeric);
    assert!(numeric > case_only);
}

#[test]
fn singleton_aggregation_unchanged_for_every_strategy() {
    let cases: Vec<(AggregationStrategy, ContextValue)> = vec![
        (AggregationStrategy::FirstSuccess, ContextValue::from("v")),
        (AggregationStrategy::MajorityVote, ContextValue::from("v")),
        (AggregationStrategy::Unanimous, ContextValue::from("v")),
        (AggregationStrategy::Average, ContextValue::Number(7.5)),
        (
            AggregationStrategy::Concat,
            ContextValue::List(vec![ContextValue::from("v")]),
        ),
        (
            AggregationStrategy::Merge,
            ContextValue::from(serde_json::json!({"k": "v"})),
        ),
    ];

    for (strategy, value) in cases {
        let single = vec![AgentResult::success("a", value.clone()).with_confidence(0.7)];
        let once = Aggregator::aggregate(&single, &strategy).unwrap();
        assert_eq!(once.primary_result, value, "strategy {}", strategy);

        // Re-aggregating the aggregate of a singleton changes nothing
        let again = vec![AgentResult::success("a", once.primary_result.clone())
            .with_confidence(0.7)];
        let twice = Aggregator::aggregate(&again, &strategy).unwrap();
        assert_eq!(twice.primary_result, once.primary_result);
        assert_eq!(twice.agreement_score, 1.0);
    }
}

#[test]
fn failed_results_excluded_from_agreement() {
    let results = vec![
        AgentResult::success("a", ContextValue::from("yes")).with_confidence(0.8),
        AgentResult::failure("b", "timed out"),
        AgentResult::success("c", ContextValue::from("yes")).with_confidence(0.6),
    ];
    let aggregation =
        Aggregator::aggregate(&results, &AggregationStrategy::MajorityVote).unwrap();
    // Two successful results, both agreeing
    assert_eq!(aggregation.agreement_score, 1.0);
}

#[test]
fn merge_collision_survives_into_resolution() {
    let results = vec![
        AgentResult::success(
            "low",
            ContextValue::from(serde_json::json!({"lang": "rust", "tabs": true})),
        )
        .with_priority(1),
        AgentResult::success(
            "high",
            ContextValue::from(serde_json::json!({"lang": "go", "ci": "green"})),
        )
        .with_priority(5),
    ];

    // Aggregation-side merge keeps first writer and reports the collision
    let aggregation = Aggregator::aggregate(&results, &AggregationStrategy::Merge).unwrap();
    assert_eq!(aggregation.conflicts.len(), 1);
    assert_eq!(aggregation.conflicts[0].field, "lang");

    // Resolver-side merge gives colliding keys to the higher priority
    let conflicts = ConflictAnalyzer::default().analyze("result", &results);
    let resolution =
        ConflictResolver::resolve(&results, &conflicts, &ResolutionStrategy::Merge).unwrap();
    let merged = resolution.winner.as_map().unwrap();
    assert_eq!(merged.get("lang"), Some(&ContextValue::from("go")));
    assert_eq!(merged.get("tabs"), Some(&ContextValue::Bool(true)));
    assert_eq!(merged.get("ci"), Some(&ContextValue::from("green")));
}
