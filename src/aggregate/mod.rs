//! Result aggregation across agents
//!
//! Combines the results of one coordination round into a single logical
//! result. Aggregation never panics on heterogeneous input: strategies
//! with type requirements surface an [`AggregationError`] instead.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::agent::AgentResult;
use crate::conflict::{Conflict, ConflictParty, ConflictSeverity};
use crate::context::{ContextValue, ValueKind};

/// Reducer signature for custom aggregation.
pub type CustomReducer =
    Arc<dyn Fn(&[AgentResult]) -> Result<ContextValue, String> + Send + Sync>;

/// How a round's results are combined.
#[derive(Clone)]
pub enum AggregationStrategy {
    /// First non-error, non-empty value wins
    FirstSuccess,
    /// Most frequent normalized value wins; ties broken by cumulative confidence
    MajorityVote,
    /// Fails unless every successful result is equal
    Unanimous,
    /// Arithmetic mean; numeric results only
    Average,
    /// List results concatenated in per-agent order
    Concat,
    /// Map results shallow-merged; key collisions become conflicts
    Merge,
    /// Caller-supplied reducer, invoked with panic recovery
    Custom(CustomReducer),
}

impl std::fmt::Debug for AggregationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AggregationStrategy::FirstSuccess => "FirstSuccess",
            AggregationStrategy::MajorityVote => "MajorityVote",
            AggregationStrategy::Unanimous => "Unanimous",
            AggregationStrategy::Average => "Average",
            AggregationStrategy::Concat => "Concat",
            AggregationStrategy::Merge => "Merge",
            AggregationStrategy::Custom(_) => "Custom",
        })
    }
}

impl std::fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AggregationStrategy::FirstSuccess => "first_success",
            AggregationStrategy::MajorityVote => "majority_vote",
            AggregationStrategy::Unanimous => "unanimous",
            AggregationStrategy::Average => "average",
            AggregationStrategy::Concat => "concat",
            AggregationStrategy::Merge => "merge",
            AggregationStrategy::Custom(_) => "custom",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for AggregationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "first_success" => Ok(AggregationStrategy::FirstSuccess),
            "majority_vote" => Ok(AggregationStrategy::MajorityVote),
            "unanimous" => Ok(AggregationStrategy::Unanimous),
            "average" => Ok(AggregationStrategy::Average),
            "concat" => Ok(AggregationStrategy::Concat),
            "merge" => Ok(AggregationStrategy::Merge),
            _ => Err(format!("Unknown aggregation strategy: {}", s)),
        }
    }
}

/// Final reconciled value for one coordination round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationResult {
    /// The winning value
    pub primary_result: ContextValue,

    /// Distinct non-primary values, in first-seen order
    pub alternative_results: Vec<ContextValue>,

    /// Fraction of successful results that agree with the primary
    pub agreement_score: f64,

    /// Strategy that produced this result
    pub strategy_used: String,

    /// Mean confidence of the results backing the primary value
    pub confidence: f64,

    /// Conflicts surfaced during aggregation (Merge key collisions)
    pub conflicts: Vec<Conflict>,
}

/// Errors from aggregation.
#[derive(Debug, Error)]
pub enum AggregationError {
    /// The round produced no results at all
    #[error("no results to aggregate")]
    NoResults,

    /// Every result in the round failed
    #[error("no successful results to aggregate")]
    NoSuccessfulResults,

    /// A strategy with type requirements saw an incompatible value
    #[error("strategy '{strategy}' requires {expected:?} values, agent '{agent_id}' returned {found:?}")]
    TypeMismatch {
        strategy: String,
        agent_id: String,
        expected: ValueKind,
        found: ValueKind,
    },

    /// Unanimous aggregation saw disagreement
    #[error("unanimity violated: {distinct} distinct values among {total} results")]
    UnanimityViolated { distinct: usize, total: usize },

    /// The custom reducer returned an error or panicked
    #[error("custom reducer failed: {reason}")]
    CustomFailed { reason: String },
}

/// Combines per-agent results into one [`AggregationResult`].
pub struct Aggregator;

impl Aggregator {
    /// Aggregate a round's results under the given strategy.
    pub fn aggregate(
        results: &[AgentResult],
        strategy: &AggregationStrategy,
    ) -> Result<AggregationResult, AggregationError> {
        if results.is_empty() {
            return Err(AggregationError::NoResults);
        }
        let successful: Vec<&AgentResult> = results.iter().filter(|r| r.succeeded).collect();
        if successful.is_empty() {
            return Err(AggregationError::NoSuccessfulResults);
        }

        let outcome = match strategy {
            AggregationStrategy::FirstSuccess => Self::first_success(&successful),
            AggregationStrategy::MajorityVote => Self::majority_vote(&successful),
            AggregationStrategy::Unanimous => Self::unanimous(&successful)?,
            AggregationStrategy::Average => Self::average(&successful)?,
            AggregationStrategy::Concat => Self::concat(&successful)?,
            AggregationStrategy::Merge => Self::merge(&successful)?,
            AggregationStrategy::Custom(reducer) => Self::custom(&successful, reducer)?,
        };

        let (primary, conflicts) = outcome;
        let agreement = Self::agreement_score(&successful, &primary);
        let confidence = Self::backing_confidence(&successful, &primary);
        let alternatives = Self::alternatives(&successful, &primary);

        tracing::debug!(
            strategy = %strategy,
            agreement = agreement,
            results = successful.len(),
            "Aggregation completed"
        );

        Ok(AggregationResult {
            primary_result: primary,
            alternative_results: alternatives,
            agreement_score: agreement,
            strategy_used: strategy.to_string(),
            confidence,
            conflicts,
        })
    }

    fn first_success(successful: &[&AgentResult]) -> (ContextValue, Vec<Conflict>) {
        let winner = successful
            .iter()
            .find(|r| !r.value.is_empty())
            .or_else(|| successful.first())
            .expect("caller verified non-empty");
        (winner.value.clone(), Vec::new())
    }

    fn majority_vote(successful: &[&AgentResult]) -> (ContextValue, Vec<Conflict>) {
        // Group by normalized value, keep first-seen representative
        let mut groups: Vec<(ContextValue, ContextValue, usize, f64)> = Vec::new();
        for result in successful {
            let normalized = result.value.normalized();
            match groups.iter_mut().find(|(key, ..)| *key == normalized) {
                Some((_, _, count, cumulative)) => {
                    *count += 1;
                    *cumulative += result.confidence;
                }
                None => groups.push((normalized, result.value.clone(), 1, result.confidence)),
            }
        }

        let winner = groups
            .iter()
            .max_by(|a, b| {
                a.2.cmp(&b.2)
                    .then(a.3.partial_cmp(&b.3).unwrap_or(std::cmp::Ordering::Equal))
            })
            .expect("caller verified non-empty");
        (winner.1.clone(), Vec::new())
    }

    fn unanimous(
        successful: &[&AgentResult],
    ) -> Result<(ContextValue, Vec<Conflict>), AggregationError> {
        let distinct = successful
            .iter()
            .map(|r| r.value.normalized())
            .fold(Vec::new(), |mut acc: Vec<ContextValue>, v| {
                if !acc.contains(&v) {
                    acc.push(v);
                }
                acc
            })
            .len();
        if distinct > 1 {
            return Err(AggregationError::UnanimityViolated {
                distinct,
                total: successful.len(),
            });
        }
        Ok((successful[0].value.clone(), Vec::new()))
    }

    fn average(
        successful: &[&AgentResult],
    ) -> Result<(ContextValue, Vec<Conflict>), AggregationError> {
        let mut sum = 0.0;
        for result in successful {
            match result.value.as_number() {
                Some(n) => sum += n,
                None => {
                    return Err(AggregationError::TypeMismatch {
                        strategy: "average".to_string(),
                        agent_id: result.agent_id.clone(),
                        expected: ValueKind::Number,
                        found: result.value.kind(),
                    })
                }
            }
        }
        Ok((
            ContextValue::Number(sum / successful.len() as f64),
            Vec::new(),
        ))
    }

    fn concat(
        successful: &[&AgentResult],
    ) -> Result<(ContextValue, Vec<Conflict>), AggregationError> {
        let mut combined = Vec::new();
        for result in successful {
            match result.value.as_list() {
                Some(items) => combined.extend(items.iter().cloned()),
                None => {
                    return Err(AggregationError::TypeMismatch {
                        strategy: "concat".to_string(),
                        agent_id: result.agent_id.clone(),
                        expected: ValueKind::List,
                        found: result.value.kind(),
                    })
                }
            }
        }
        Ok((ContextValue::List(combined), Vec::new()))
    }

    fn merge(
        successful: &[&AgentResult],
    ) -> Result<(ContextValue, Vec<Conflict>), AggregationError> {
        let mut merged: BTreeMap<String, ContextValue> = BTreeMap::new();
        // First provider of each key, for conflict attribution
        let mut provenance: BTreeMap<String, String> = BTreeMap::new();
        let mut conflicts = Vec::new();

        for result in successful {
            let Some(map) = result.value.as_map() else {
                return Err(AggregationError::TypeMismatch {
                    strategy: "merge".to_string(),
                    agent_id: result.agent_id.clone(),
                    expected: ValueKind::Map,
                    found: result.value.kind(),
                });
            };
            for (key, value) in map {
                match merged.get(key) {
                    None => {
                        merged.insert(key.clone(), value.clone());
                        provenance.insert(key.clone(), result.agent_id.clone());
                    }
                    Some(existing) if existing == value => {}
                    Some(existing) => {
                        // Collision is reported, not silently overwritten
                        let severity = if existing.kind() != value.kind() {
                            ConflictSeverity::High
                        } else {
                            ConflictSeverity::Medium
                        };
                        conflicts.push(Conflict {
                            field: key.clone(),
                            participants: vec![
                                ConflictParty {
                                    agent_id: provenance[key].clone(),
                                    value: existing.clone(),
                                },
                                ConflictParty {
                                    agent_id: result.agent_id.clone(),
                                    value: value.clone(),
                                },
                            ],
                            severity,
                        });
                    }
                }
            }
        }
        Ok((ContextValue::Map(merged), conflicts))
    }

    fn custom(
        successful: &[&AgentResult],
        reducer: &CustomReducer,
    ) -> Result<(ContextValue, Vec<Conflict>), AggregationError> {
        let owned: Vec<AgentResult> = successful.iter().map(|r| (*r).clone()).collect();
        match catch_unwind(AssertUnwindSafe(|| (reducer.as_ref())(&owned))) {
            Ok(Ok(value)) => Ok((value, Vec::new())),
            Ok(Err(reason)) => Err(AggregationError::CustomFailed { reason }),
            Err(_) => {
                tracing::warn!("Custom reducer panicked");
                Err(AggregationError::CustomFailed {
                    reason: "reducer panicked".to_string(),
                })
            }
        }
    }

    /// (results equal to primary) / (total successful results).
    fn agreement_score(successful: &[&AgentResult], primary: &ContextValue) -> f64 {
        let normalized = primary.normalized();
        let agreeing = successful
            .iter()
            .filter(|r| r.value.normalized() == normalized)
            .count();
        agreeing as f64 / successful.len() as f64
    }

    fn backing_confidence(successful: &[&AgentResult], primary: &ContextValue) -> f64 {
        let normalized = primary.normalized();
        let backing: Vec<f64> = successful
            .iter()
            .filter(|r| r.value.normalized() == normalized)
            .map(|r| r.confidence)
            .collect();
        if backing.is_empty() {
            // Derived value (average/concat/merge/custom): mean of all inputs
            successful.iter().map(|r| r.confidence).sum::<f64>() / successful.len() as f64
        } else {
            backing.iter().sum::<f64>() / backing.len() as f64
        }
    }

    fn alternatives(successful: &[&AgentResult], primary: &ContextValue) -> Vec<ContextValue> {
        let normalized = primary.normalized();
        let mut seen: Vec<ContextValue> = Vec::new();
        let mut out: Vec<ContextValue> = Vec::new();
        for result in successful {
            let candidate = result.value.normalized();
            if candidate != normalized && !seen.contains(&candidate) {
                seen.push(candidate);
                out.push(result.value.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(agent: &str, value: ContextValue, confidence: f64) -> AgentResult {
        AgentResult::success(agent, value).with_confidence(confidence)
    }

    #[test]
    fn first_success_skips_failures_and_empty() {
        let results = vec![
            AgentResult::failure("a", "down"),
            result("b", ContextValue::Null, 0.9),
            result("c", ContextValue::from("answer"), 0.8),
        ];
        let agg = Aggregator::aggregate(&results, &AggregationStrategy::FirstSuccess).unwrap();
        assert_eq!(agg.primary_result, ContextValue::from("answer"));
    }

    #[test]
    fn majority_vote_scenario() {
        // Three agents: yes/yes/no with confidences 0.6/0.6/0.9
        let results = vec![
            result("a", ContextValue::from("yes"), 0.6),
            result("b", ContextValue::from("yes"), 0.6),
            result("c", ContextValue::from("no"), 0.9),
        ];
        let agg = Aggregator::aggregate(&results, &AggregationStrategy::MajorityVote).unwrap();
        assert_eq!(agg.primary_result, ContextValue::from("yes"));
        assert!((agg.agreement_score - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(agg.alternative_results, vec![ContextValue::from("no")]);
    }

    #[test]
    fn majority_vote_tie_breaks_by_cumulative_confidence() {
        let results = vec![
            result("a", ContextValue::from("yes"), 0.4),
            result("b", ContextValue::from("no"), 0.9),
        ];
        let agg = Aggregator::aggregate(&results, &AggregationStrategy::MajorityVote).unwrap();
        assert_eq!(agg.primary_result, ContextValue::from("no"));
    }

    #[test]
    fn majority_vote_groups_case_insensitively() {
        let results = vec![
            result("a", ContextValue::from("Yes"), 0.5),
            result("b", ContextValue::from("yes"), 0.5),
            result("c", ContextValue::from("no"), 0.9),
        ];
        let agg = Aggregator::aggregate(&results, &AggregationStrategy::MajorityVote).unwrap();
        // First-seen representative of the winning group
        assert_eq!(agg.primary_result, ContextValue::from("Yes"));
        assert!((agg.agreement_score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn unanimous_accepts_agreement() {
        let results = vec![
            result("a", ContextValue::from("yes"), 0.5),
            result("b", ContextValue::from("yes"), 0.7),
        ];
        let agg = Aggregator::aggregate(&results, &AggregationStrategy::Unanimous).unwrap();
        assert_eq!(agg.primary_result, ContextValue::from("yes"));
        assert_eq!(agg.agreement_score, 1.0);
    }

    #[test]
    fn unanimous_rejects_disagreement() {
        let results = vec![
            result("a", ContextValue::from("yes"), 0.5),
            result("b", ContextValue::from("no"), 0.7),
        ];
        let err = Aggregator::aggregate(&results, &AggregationStrategy::Unanimous).unwrap_err();
        assert!(matches!(
            err,
            AggregationError::UnanimityViolated {
                distinct: 2,
                total: 2
            }
        ));
    }

    #[test]
    fn unanimous_ignores_failed_results() {
        let results = vec![
            result("a", ContextValue::from("yes"), 0.5),
            AgentResult::failure("b", "timeout"),
            result("c", ContextValue::from("yes"), 0.7),
        ];
        assert!(Aggregator::aggregate(&results, &AggregationStrategy::Unanimous).is_ok());
    }

    #[test]
    fn average_of_numbers() {
        let results = vec![
            result("a", ContextValue::Number(1.0), 0.5),
            result("b", ContextValue::Number(2.0), 0.5),
            result("c", ContextValue::Number(6.0), 0.5),
        ];
        let agg = Aggregator::aggregate(&results, &AggregationStrategy::Average).unwrap();
        assert_eq!(agg.primary_result, ContextValue::Number(3.0));
    }

    #[test]
    fn average_rejects_non_numeric() {
        let results = vec![
            result("a", ContextValue::Number(1.0), 0.5),
            result("b", ContextValue::from("two"), 0.5),
        ];
        let err = Aggregator::aggregate(&results, &AggregationStrategy::Average).unwrap_err();
        match err {
            AggregationError::TypeMismatch {
                agent_id, found, ..
            } => {
                assert_eq!(agent_id, "b");
                assert_eq!(found, ValueKind::String);
            }
            other => panic!("expected TypeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn concat_preserves_per_agent_order() {
        let results = vec![
            result(
                "a",
                ContextValue::List(vec![ContextValue::from("a1"), ContextValue::from("a2")]),
                0.5,
            ),
            result("b", ContextValue::List(vec![ContextValue::from("b1")]), 0.5),
        ];
        let agg = Aggregator::aggregate(&results, &AggregationStrategy::Concat).unwrap();
        assert_eq!(
            agg.primary_result,
            ContextValue::List(vec![
                ContextValue::from("a1"),
                ContextValue::from("a2"),
                ContextValue::from("b1"),
            ])
        );
    }

    #[test]
    fn concat_rejects_non_lists() {
        let results = vec![result("a", ContextValue::from("scalar"), 0.5)];
        let err = Aggregator::aggregate(&results, &AggregationStrategy::Concat).unwrap_err();
        assert!(matches!(err, AggregationError::TypeMismatch { .. }));
    }

    #[test]
    fn merge_reports_collisions_as_conflicts() {
        let results = vec![
            result(
                "a",
                ContextValue::from(serde_json::json!({"x": 1, "shared": "a"})),
                0.5,
            ),
            result(
                "b",
                ContextValue::from(serde_json::json!({"y": 2, "shared": "b"})),
                0.5,
            ),
        ];
        let agg = Aggregator::aggregate(&results, &AggregationStrategy::Merge).unwrap();
        let merged = agg.primary_result.as_map().unwrap();
        assert!(merged.contains_key("x"));
        assert!(merged.contains_key("y"));
        // First writer kept; collision surfaced
        assert_eq!(merged.get("shared"), Some(&ContextValue::from("a")));
        assert_eq!(agg.conflicts.len(), 1);
        assert_eq!(agg.conflicts[0].field, "shared");
    }

    #[test]
    fn merge_equal_values_do_not_conflict() {
        let results = vec![
            result("a", ContextValue::from(serde_json::json!({"k": "v"})), 0.5),
            result("b", ContextValue::from(serde_json::json!({"k": "v"})), 0.5),
        ];
        let agg = Aggregator::aggregate(&results, &AggregationStrategy::Merge).unwrap();
        assert!(agg.conflicts.is_empty());
    }

    #[test]
    fn custom_reducer_runs() {
        let reducer: CustomReducer = Arc::new(|results| {
            Ok(ContextValue::Number(results.len() as f64))
        });
        let results = vec![
            result("a", ContextValue::from("x"), 0.5),
            result("b", ContextValue::from("y"), 0.5),
        ];
        let agg =
            Aggregator::aggregate(&results, &AggregationStrategy::Custom(reducer)).unwrap();
        assert_eq!(agg.primary_result, ContextValue::Number(2.0));
    }

    #[test]
    fn panicking_reducer_is_contained() {
        let reducer: CustomReducer = Arc::new(|_| panic!("reducer bug"));
        let results = vec![result("a", ContextValue::from("x"), 0.5)];
        let err =
            Aggregator::aggregate(&results, &AggregationStrategy::Custom(reducer)).unwrap_err();
        assert!(matches!(err, AggregationError::CustomFailed { .. }));
    }

    #[test]
    fn empty_input_errors() {
        let err = Aggregator::aggregate(&[], &AggregationStrategy::FirstSuccess).unwrap_err();
        assert!(matches!(err, AggregationError::NoResults));
    }

    #[test]
    fn all_failed_errors() {
        let results = vec![AgentResult::failure("a", "down")];
        let err = Aggregator::aggregate(&results, &AggregationStrategy::FirstSuccess).unwrap_err();
        assert!(matches!(err, AggregationError::NoSuccessfulResults));
    }

    #[test]
    fn singleton_aggregation_is_idempotent() {
        let single = vec![result("a", ContextValue::from("only"), 0.8)];
        let strategies: Vec<AggregationStrategy> = vec![
            AggregationStrategy::FirstSuccess,
            AggregationStrategy::MajorityVote,
            AggregationStrategy::Unanimous,
        ];
        for strategy in &strategies {
            let once = Aggregator::aggregate(&single, strategy).unwrap();
            let rewrapped = vec![result("a", once.primary_result.clone(), 0.8)];
            let twice = Aggregator::aggregate(&rewrapped, strategy).unwrap();
            assert_eq!(once.primary_result, twice.primary_result);
            assert_eq!(twice.agreement_score, 1.0);
        }
    }

    #[test]
    fn singleton_idempotence_for_container_strategies() {
        let list = ContextValue::List(vec![ContextValue::from("x")]);
        let once = Aggregator::aggregate(
            &[result("a", list.clone(), 0.8)],
            &AggregationStrategy::Concat,
        )
        .unwrap();
        assert_eq!(once.primary_result, list);

        let map = ContextValue::from(serde_json::json!({"k": "v"}));
        let once = Aggregator::aggregate(
            &[result("a", map.clone(), 0.8)],
            &AggregationStrategy::Merge,
        )
        .unwrap();
        assert_eq!(once.primary_result, map);

        let number = ContextValue::Number(4.0);
        let once = Aggregator::aggregate(
            &[result("a", number.clone(), 0.8)],
            &AggregationStrategy::Average,
        )
        .unwrap();
        assert_eq!(once.primary_result, number);
    }

    #[test]
    fn strategy_from_str() {
        assert!(matches!(
            "majority_vote".parse::<AggregationStrategy>().unwrap(),
            AggregationStrategy::MajorityVote
        ));
        assert!("bogus".parse::<AggregationStrategy>().is_err());
    }
}
