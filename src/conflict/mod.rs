//! Conflict detection and resolution across agent results
//!
//! The analyzer compares results pairwise and emits typed conflicts with
//! a ranked severity; the resolver then picks a single winning value and
//! keeps an audit record of which agents lost and why.

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

use crate::agent::AgentResult;
use crate::context::ContextValue;

/// Ranked conflict severity. Type mismatches outrank value disagreements,
/// which outrank case-only string differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    /// Strings equal ignoring case and surrounding whitespace
    Low,
    /// Same type, different value (numeric beyond tolerance included)
    Medium,
    /// Different value types entirely
    High,
}

/// One participant in a detected conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictParty {
    pub agent_id: String,
    pub value: ContextValue,
}

/// A detected disagreement between two agent results for the same field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Logical field the disagreement is about
    pub field: String,

    /// The two disagreeing parties
    pub participants: Vec<ConflictParty>,

    pub severity: ConflictSeverity,
}

/// Detects disagreements between agent results.
///
/// Comparison is symmetric: `compare(a, b)` and `compare(b, a)` report
/// the same severity.
#[derive(Debug, Clone, Copy)]
pub struct ConflictAnalyzer {
    /// Numeric values within this absolute tolerance are considered equal
    pub tolerance: f64,
}

impl Default for ConflictAnalyzer {
    fn default() -> Self {
        Self { tolerance: 1e-9 }
    }
}

impl ConflictAnalyzer {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    /// Compare two values; `None` means no conflict.
    pub fn compare(&self, a: &ContextValue, b: &ContextValue) -> Option<ConflictSeverity> {
        if a.kind() != b.kind() {
            return Some(ConflictSeverity::High);
        }

        match (a, b) {
            (ContextValue::Number(x), ContextValue::Number(y)) => {
                if (x - y).abs() > self.tolerance {
                    Some(ConflictSeverity::Medium)
                } else {
                    None
                }
            }
            (ContextValue::String(x), ContextValue::String(y)) => {
                if x == y {
                    None
                } else if x.trim().eq_ignore_ascii_case(y.trim()) {
                    Some(ConflictSeverity::Low)
                } else {
                    Some(ConflictSeverity::Medium)
                }
            }
            _ => {
                if a == b {
                    None
                } else {
                    Some(ConflictSeverity::Medium)
                }
            }
        }
    }

    /// Pairwise analysis across all successful results for one field.
    pub fn analyze(&self, field: &str, results: &[AgentResult]) -> Vec<Conflict> {
        let successful: Vec<&AgentResult> = results.iter().filter(|r| r.succeeded).collect();
        let mut conflicts = Vec::new();

        for (i, a) in successful.iter().enumerate() {
            for b in successful.iter().skip(i + 1) {
                if let Some(severity) = self.compare(&a.value, &b.value) {
                    conflicts.push(Conflict {
                        field: field.to_string(),
                        participants: vec![
                            ConflictParty {
                                agent_id: a.agent_id.clone(),
                                value: a.value.clone(),
                            },
                            ConflictParty {
                                agent_id: b.agent_id.clone(),
                                value: b.value.clone(),
                            },
                        ],
                        severity,
                    });
                }
            }
        }

        if !conflicts.is_empty() {
            tracing::debug!(
                field = %field,
                conflicts = conflicts.len(),
                "Conflicts detected among agent results"
            );
        }
        conflicts
    }
}

/// Reducer signature for custom resolution.
pub type CustomResolver =
    Arc<dyn Fn(&[AgentResult]) -> Result<ContextValue, String> + Send + Sync>;

/// How a set of conflicting results is reduced to one winner.
#[derive(Clone)]
pub enum ResolutionStrategy {
    /// Highest agent definition priority wins
    PriorityBased,
    /// Highest reported confidence wins
    ConfidenceBased,
    /// Plurality of normalized values wins; ties fall back to priority
    Voting,
    /// Map values: non-colliding keys merged, collisions go to priority
    Merge,
    /// Caller-supplied reducer, invoked with panic recovery
    Custom(CustomResolver),
}

impl std::fmt::Debug for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ResolutionStrategy::PriorityBased => "PriorityBased",
            ResolutionStrategy::ConfidenceBased => "ConfidenceBased",
            ResolutionStrategy::Voting => "Voting",
            ResolutionStrategy::Merge => "Merge",
            ResolutionStrategy::Custom(_) => "Custom",
        })
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResolutionStrategy::PriorityBased => "priority_based",
            ResolutionStrategy::ConfidenceBased => "confidence_based",
            ResolutionStrategy::Voting => "voting",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Custom(_) => "custom",
        };
        write!(f, "{}", name)
    }
}

/// Why an agent's value lost resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionLoss {
    pub agent_id: String,
    pub value: ContextValue,
    pub reason: String,
}

/// Outcome of conflict resolution: one winner plus an audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    /// The single winning value
    pub winner: ContextValue,

    /// Agent the winning value came from, when attributable to one
    pub winning_agent: Option<String>,

    /// Agents whose values lost, with reasons
    pub losers: Vec<ResolutionLoss>,

    /// Strategy that produced this resolution
    pub strategy: String,
}

/// Errors from conflict resolution.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// No successful results were available to resolve among
    #[error("no successful results to resolve")]
    NoCandidates,

    /// The strategy could not produce a single winner
    #[error("unresolvable conflict: {reason}")]
    Unresolvable {
        reason: String,
        conflicts: Vec<Conflict>,
    },
}

/// Applies a [`ResolutionStrategy`] to conflicting results.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve a round's results given the conflicts the analyzer found.
    ///
    /// With no conflicts the resolver is a pass-through: the first
    /// successful value wins and nothing is recorded as lost.
    pub fn resolve(
        results: &[AgentResult],
        conflicts: &[Conflict],
        strategy: &ResolutionStrategy,
    ) -> Result<Resolution, ConflictError> {
        let successful: Vec<&AgentResult> = results.iter().filter(|r| r.succeeded).collect();
        let first = successful.first().ok_or(ConflictError::NoCandidates)?;

        if conflicts.is_empty() {
            return Ok(Resolution {
                winner: first.value.clone(),
                winning_agent: Some(first.agent_id.clone()),
                losers: Vec::new(),
                strategy: "pass_through".to_string(),
            });
        }

        match strategy {
            ResolutionStrategy::PriorityBased => Ok(Self::by_key(&successful, strategy, |r| {
                (r.priority, 0.0)
            })),
            ResolutionStrategy::ConfidenceBased => Ok(Self::by_key(&successful, strategy, |r| {
                (0, r.confidence)
            })),
            ResolutionStrategy::Voting => Ok(Self::by_vote(&successful)),
            ResolutionStrategy::Merge => Self::by_merge(&successful, conflicts),
            ResolutionStrategy::Custom(reducer) => {
                let owned: Vec<AgentResult> = successful.iter().map(|r| (*r).clone()).collect();
                match catch_unwind(AssertUnwindSafe(|| (reducer.as_ref())(&owned))) {
                    Ok(Ok(winner)) => Ok(Resolution {
                        winner,
                        winning_agent: None,
                        losers: Vec::new(),
                        strategy: "custom".to_string(),
                    }),
                    Ok(Err(reason)) => Err(ConflictError::Unresolvable {
                        reason,
                        conflicts: conflicts.to_vec(),
                    }),
                    Err(_) => {
                        tracing::warn!("Custom resolver panicked");
                        Err(ConflictError::Unresolvable {
                            reason: "custom resolver panicked".to_string(),
                            conflicts: conflicts.to_vec(),
                        })
                    }
                }
            }
        }
    }

    /// Winner by maximal `(priority, confidence)` key; losers audited.
    fn by_key(
        successful: &[&AgentResult],
        strategy: &ResolutionStrategy,
        key: impl Fn(&AgentResult) -> (i32, f64),
    ) -> Resolution {
        let winner = successful
            .iter()
            .max_by(|a, b| {
                let (pa, ca) = key(a);
                let (pb, cb) = key(b);
                pa.cmp(&pb)
                    .then(ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal))
            })
            .expect("caller verified non-empty");

        let losers = successful
            .iter()
            .filter(|r| r.agent_id != winner.agent_id)
            .map(|r| ResolutionLoss {
                agent_id: r.agent_id.clone(),
                value: r.value.clone(),
                reason: match strategy {
                    ResolutionStrategy::PriorityBased => format!(
                        "priority {} below winner '{}' at {}",
                        r.priority, winner.agent_id, winner.priority
                    ),
                    _ => format!(
                        "confidence {} below winner '{}' at {}",
                        r.confidence, winner.agent_id, winner.confidence
                    ),
                },
            })
            .collect();

        Resolution {
            winner: winner.value.clone(),
            winning_agent: Some(winner.agent_id.clone()),
            losers,
            strategy: strategy.to_string(),
        }
    }

    /// Plurality of normalized values; ties fall back to priority.
    fn by_vote(successful: &[&AgentResult]) -> Resolution {
        let mut groups: Vec<(ContextValue, Vec<&AgentResult>)> = Vec::new();
        for &result in successful {
            let normalized = result.value.normalized();
            match groups.iter_mut().find(|(key, _)| *key == normalized) {
                Some((_, members)) => members.push(result),
                None => groups.push((normalized, vec![result])),
            }
        }

        let top_count = groups.iter().map(|(_, m)| m.len()).max().unwrap_or(0);
        let tied: Vec<&(ContextValue, Vec<&AgentResult>)> = groups
            .iter()
            .filter(|(_, m)| m.len() == top_count)
            .collect();

        let winning_group = if tied.len() == 1 {
            tied[0]
        } else {
            // Tie: the group holding the highest-priority agent wins
            tied.iter()
                .max_by_key(|(_, members)| members.iter().map(|r| r.priority).max())
                .copied()
                .expect("caller verified non-empty")
        };

        let representative = winning_group.1[0];
        let winner_ids: Vec<&str> = winning_group
            .1
            .iter()
            .map(|r| r.agent_id.as_str())
            .collect();

        let losers = successful
            .iter()
            .filter(|r| !winner_ids.contains(&r.agent_id.as_str()))
            .map(|r| ResolutionLoss {
                agent_id: r.agent_id.clone(),
                value: r.value.clone(),
                reason: format!("outvoted {} to {}", top_count, successful.len() - top_count),
            })
            .collect();

        Resolution {
            winner: representative.value.clone(),
            winning_agent: Some(representative.agent_id.clone()),
            losers,
            strategy: "voting".to_string(),
        }
    }

    /// Merge map values key by key; colliding keys go to the
    /// highest-priority agent.
    fn by_merge(
        successful: &[&AgentResult],
        conflicts: &[Conflict],
    ) -> Result<Resolution, ConflictError> {
        let mut merged = std::collections::BTreeMap::new();
        // (agent_id, priority) that supplied each key so far
        let mut provenance: std::collections::BTreeMap<String, (String, i32)> =
            std::collections::BTreeMap::new();
        let mut losers = Vec::new();

        for result in successful {
            let Some(map) = result.value.as_map() else {
                return Err(ConflictError::Unresolvable {
                    reason: format!(
                        "merge resolution requires map values, agent '{}' returned {:?}",
                        result.agent_id,
                        result.value.kind()
                    ),
                    conflicts: conflicts.to_vec(),
                });
            };

            for (key, value) in map {
                match provenance.get(key) {
                    None => {
                        provenance.insert(key.clone(), (result.agent_id.clone(), result.priority));
                        merged.insert(key.clone(), value.clone());
                    }
                    Some((holder, holder_priority)) => {
                        if merged.get(key) == Some(value) {
                            continue;
                        }
                        if result.priority > *holder_priority {
                            losers.push(ResolutionLoss {
                                agent_id: holder.clone(),
                                value: merged[key].clone(),
                                reason: format!(
                                    "key '{}' taken by higher-priority agent '{}'",
                                    key, result.agent_id
                                ),
                            });
                            provenance
                                .insert(key.clone(), (result.agent_id.clone(), result.priority));
                            merged.insert(key.clone(), value.clone());
                        } else {
                            losers.push(ResolutionLoss {
                                agent_id: result.agent_id.clone(),
                                value: value.clone(),
                                reason: format!(
                                    "key '{}' held by higher-priority agent '{}'",
                                    key, holder
                                ),
                            });
                        }
                    }
                }
            }
        }

        Ok(Resolution {
            winner: ContextValue::Map(merged),
            winning_agent: None,
            losers,
            strategy: "merge".to_string(),
        })
    }
}
