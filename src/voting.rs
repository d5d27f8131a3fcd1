//! Weighted voting across role outputs.
//!
//! The primary path scores every fulfilled output on confidence, length,
//! structure, and completeness, normalizes the scores into weights, and
//! picks the arg-max with a deterministic lexicographic tie-break. When the
//! primary path cannot produce a winner the engine walks the voting
//! fallback chain; `first_available` is the terminal rule and always
//! succeeds on non-empty input.

use crate::error::EnsembleError;
use crate::fallback::{FallbackManager, VotingStrategy};
use crate::role::{Role, RoleOutput};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Preferred content length band for scoring.
const LENGTH_BAND: std::ops::RangeInclusive<usize> = 50..=2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consensus {
    High,
    Moderate,
    Low,
    SimpleMajority,
    HighestConfidence,
    WeightedRandom,
    FirstAvailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotingResult {
    pub winner: Role,
    pub confidence: f64,
    pub consensus: Consensus,
    pub weights: BTreeMap<Role, f64>,
}

/// Score one fulfilled output. Deterministic; all components sum to at most
/// 0.85 so even a perfect answer leaves headroom between contenders.
fn score_output(output: &RoleOutput) -> f64 {
    let content = output.content.trim();
    let chars = content.chars().count();

    let confidence_component = 0.4 * output.confidence;

    let length_component = if LENGTH_BAND.contains(&chars) {
        0.25
    } else if chars < *LENGTH_BAND.start() {
        0.25 * chars as f64 / *LENGTH_BAND.start() as f64
    } else {
        0.25 * *LENGTH_BAND.end() as f64 / chars as f64
    };

    let has_list = content.lines().any(|line| {
        let line = line.trim_start();
        line.starts_with("- ")
            || line.starts_with("* ")
            || line.chars().next().is_some_and(|c| c.is_ascii_digit()) && line.contains(". ")
    });
    let has_paragraphs = content.contains("\n\n");
    let structure_component =
        0.05 * (has_list as u8 as f64) + 0.05 * (has_paragraphs as u8 as f64);

    let completeness_component = if content.ends_with("...") || content.ends_with('…') {
        0.0
    } else if content.ends_with(['.', '!', '?', '`', ')']) {
        0.1
    } else {
        0.0
    };

    confidence_component + length_component + structure_component + completeness_component
}

fn consensus_for(weight: f64) -> Consensus {
    if weight >= 0.6 {
        Consensus::High
    } else if weight >= 0.4 {
        Consensus::Moderate
    } else {
        Consensus::Low
    }
}

fn result_from_weights(
    weights: BTreeMap<Role, f64>,
    consensus: Option<Consensus>,
) -> Result<VotingResult, EnsembleError> {
    let total: f64 = weights.values().sum();
    if total <= 0.0 {
        return Err(EnsembleError::Voting { message: "all scores are zero".into() });
    }

    let weights: BTreeMap<Role, f64> =
        weights.into_iter().map(|(role, w)| (role, w / total)).collect();

    // BTreeMap iteration is ordered by role name, so keeping a strict
    // greater-than gives the lexicographically smallest winner on ties.
    let (winner, winner_weight) = weights
        .iter()
        .fold((None::<&Role>, f64::MIN), |(best, best_w), (role, &w)| {
            if w > best_w {
                (Some(role), w)
            } else {
                (best, best_w)
            }
        });
    let winner = winner
        .cloned()
        .ok_or_else(|| EnsembleError::Voting { message: "no candidates".into() })?;

    Ok(VotingResult {
        confidence: winner_weight,
        consensus: consensus.unwrap_or_else(|| consensus_for(winner_weight)),
        winner,
        weights,
    })
}

/// Primary scored vote over the fulfilled outputs.
pub fn vote(outputs: &[RoleOutput]) -> Result<VotingResult, EnsembleError> {
    let weights: BTreeMap<Role, f64> = outputs
        .iter()
        .filter(|o| o.is_fulfilled())
        .map(|o| (o.role.clone(), score_output(o)))
        .collect();

    if weights.is_empty() {
        return Err(EnsembleError::Voting { message: "no fulfilled outputs".into() });
    }
    result_from_weights(weights, None)
}

/// Run one named fallback strategy.
pub fn vote_with_strategy(
    strategy: VotingStrategy,
    outputs: &[RoleOutput],
) -> Result<VotingResult, EnsembleError> {
    let fulfilled: Vec<&RoleOutput> = outputs.iter().filter(|o| o.is_fulfilled()).collect();

    match strategy {
        VotingStrategy::HighestConfidence => {
            let weights: BTreeMap<Role, f64> =
                fulfilled.iter().map(|o| (o.role.clone(), o.confidence)).collect();
            if weights.is_empty() {
                return Err(EnsembleError::Voting { message: "no fulfilled outputs".into() });
            }
            result_from_weights(weights, Some(Consensus::HighestConfidence))
        }
        VotingStrategy::SimpleMajority => {
            if fulfilled.is_empty() {
                return Err(EnsembleError::Voting { message: "no fulfilled outputs".into() });
            }
            // Group identical (trimmed) answers; each role's weight is its
            // group's share of the fulfilled set.
            let mut groups: BTreeMap<&str, usize> = BTreeMap::new();
            for output in &fulfilled {
                *groups.entry(output.content.trim()).or_default() += 1;
            }
            let weights: BTreeMap<Role, f64> = fulfilled
                .iter()
                .map(|o| (o.role.clone(), groups[o.content.trim()] as f64))
                .collect();
            result_from_weights(weights, Some(Consensus::SimpleMajority))
        }
        VotingStrategy::WeightedRandom => {
            let total: f64 = fulfilled.iter().map(|o| o.confidence).sum();
            if fulfilled.is_empty() || total <= 0.0 {
                return Err(EnsembleError::Voting {
                    message: "no confidence mass to sample from".into(),
                });
            }
            let mut point = rand::rng().random_range(0.0..total);
            let mut winner = fulfilled[0];
            for output in &fulfilled {
                if point < output.confidence {
                    winner = output;
                    break;
                }
                point -= output.confidence;
            }
            let weights: BTreeMap<Role, f64> =
                fulfilled.iter().map(|o| (o.role.clone(), o.confidence / total)).collect();
            let winner_weight = weights[&winner.role];
            Ok(VotingResult {
                winner: winner.role.clone(),
                confidence: winner_weight,
                consensus: Consensus::WeightedRandom,
                weights,
            })
        }
        VotingStrategy::FirstAvailable => {
            // Terminal rule: works even when nothing is fulfilled. Uniform
            // weights over every role present, first role name wins.
            if outputs.is_empty() {
                return Err(EnsembleError::Voting { message: "no outputs at all".into() });
            }
            let weights: BTreeMap<Role, f64> =
                outputs.iter().map(|o| (o.role.clone(), 1.0)).collect();
            result_from_weights(weights, Some(Consensus::FirstAvailable))
        }
    }
}

/// Policy layer: primary vote with progressive fallback.
pub struct VotingEngine {
    fallbacks: Arc<FallbackManager>,
}

impl VotingEngine {
    pub fn new(fallbacks: Arc<FallbackManager>) -> Self {
        Self { fallbacks }
    }

    /// Decide a winner. `complex_allowed` is false when degradation has
    /// restricted complex voting, in which case the scored path is skipped.
    pub fn decide(&self, outputs: &[RoleOutput], complex_allowed: bool) -> Result<VotingResult, EnsembleError> {
        if complex_allowed {
            match vote(outputs) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    tracing::debug!(error = %e, "primary voting failed, walking fallback chain");
                }
            }
        }

        for alternative in self.fallbacks.voting_chain() {
            let strategy = alternative.value;
            match vote_with_strategy(strategy, outputs) {
                Ok(result) => {
                    self.fallbacks.record_outcome(
                        &format!("voting:{}", strategy.as_str()),
                        true,
                        Duration::ZERO,
                        None,
                    );
                    return Ok(result);
                }
                Err(e) => {
                    self.fallbacks.record_outcome(
                        &format!("voting:{}", strategy.as_str()),
                        false,
                        Duration::ZERO,
                        Some(&e),
                    );
                }
            }
        }

        // Health filtering can empty the chain; the terminal rule still
        // applies.
        vote_with_strategy(VotingStrategy::FirstAvailable, outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::{ProviderId, RoleBinding};

    fn fulfilled(role: &str, content: &str, confidence: f64) -> RoleOutput {
        let binding = RoleBinding::new(role, ProviderId::OpenAi, "gpt-4o");
        RoleOutput::fulfilled(&binding, content.into(), Duration::from_millis(50), 5, 10, confidence)
    }

    fn failed(role: &str) -> RoleOutput {
        let binding = RoleBinding::new(role, ProviderId::Google, "gemini-2.0-flash");
        RoleOutput::failed(&binding, "503", Duration::from_millis(10))
    }

    fn good_answer() -> String {
        format!("The answer is 4.\n\nHere is why:\n- 2 + 2 = 4\n- arithmetic is closed. {}", "Detail. ".repeat(10))
    }

    #[test]
    fn weights_sum_to_one() {
        let outputs = vec![
            fulfilled("claude", &good_answer(), 0.9),
            fulfilled("gemini", "Four.", 0.6),
            fulfilled("gpt4o", &good_answer(), 0.8),
        ];
        let result = vote(&outputs).unwrap();
        let sum: f64 = result.weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-6, "weights sum to {sum}");
        assert!(result.weights.contains_key(&result.winner));
    }

    #[test]
    fn failed_outputs_carry_no_weight() {
        let outputs = vec![fulfilled("claude", &good_answer(), 0.9), failed("gemini")];
        let result = vote(&outputs).unwrap();
        assert_eq!(result.weights.len(), 1);
        assert!(!result.weights.contains_key(&Role::new("gemini")));
    }

    #[test]
    fn higher_quality_output_wins() {
        let outputs = vec![
            fulfilled("terse", "4", 0.5),
            fulfilled("thorough", &good_answer(), 0.9),
        ];
        let result = vote(&outputs).unwrap();
        assert_eq!(result.winner, Role::new("thorough"));
        assert!(result.confidence > 0.5);
    }

    #[test]
    fn ties_break_lexicographically() {
        let outputs = vec![
            fulfilled("beta", "Same answer.", 0.7),
            fulfilled("alpha", "Same answer.", 0.7),
        ];
        let result = vote(&outputs).unwrap();
        assert_eq!(result.winner, Role::new("alpha"));
    }

    #[test]
    fn vote_is_deterministic() {
        let outputs = vec![
            fulfilled("claude", &good_answer(), 0.9),
            fulfilled("gemini", "Four.", 0.6),
        ];
        let first = vote(&outputs).unwrap();
        for _ in 0..5 {
            let again = vote(&outputs).unwrap();
            assert_eq!(again.winner, first.winner);
            assert_eq!(again.weights, first.weights);
        }
    }

    #[test]
    fn consensus_bands() {
        assert_eq!(consensus_for(0.7), Consensus::High);
        assert_eq!(consensus_for(0.45), Consensus::Moderate);
        assert_eq!(consensus_for(0.3), Consensus::Low);
    }

    #[test]
    fn no_fulfilled_outputs_errors_on_primary_path() {
        let outputs = vec![failed("claude"), failed("gemini")];
        assert!(vote(&outputs).is_err());
    }

    #[test]
    fn highest_confidence_strategy_picks_top_confidence() {
        let outputs = vec![
            fulfilled("claude", "a", 0.4),
            fulfilled("gemini", "b", 0.9),
            fulfilled("gpt4o", "c", 0.6),
        ];
        let result = vote_with_strategy(VotingStrategy::HighestConfidence, &outputs).unwrap();
        assert_eq!(result.winner, Role::new("gemini"));
        assert_eq!(result.consensus, Consensus::HighestConfidence);
        let sum: f64 = result.weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn simple_majority_groups_identical_answers() {
        let outputs = vec![
            fulfilled("a", "four", 0.5),
            fulfilled("b", "four", 0.5),
            fulfilled("c", "five", 0.9),
        ];
        let result = vote_with_strategy(VotingStrategy::SimpleMajority, &outputs).unwrap();
        assert_eq!(result.winner, Role::new("a"), "majority group wins, first role by name");
        assert_eq!(result.consensus, Consensus::SimpleMajority);
        assert!(result.weights[&Role::new("a")] > result.weights[&Role::new("c")]);
    }

    #[test]
    fn first_available_handles_all_failed() {
        let outputs = vec![failed("gemini"), failed("claude")];
        let result = vote_with_strategy(VotingStrategy::FirstAvailable, &outputs).unwrap();
        assert_eq!(result.winner, Role::new("claude"));
        assert_eq!(result.consensus, Consensus::FirstAvailable);
        let sum: f64 = result.weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn weighted_random_respects_confidence_mass() {
        let outputs = vec![fulfilled("only", "answer", 0.8)];
        let result = vote_with_strategy(VotingStrategy::WeightedRandom, &outputs).unwrap();
        assert_eq!(result.winner, Role::new("only"));

        let empty: Vec<RoleOutput> = vec![failed("a")];
        assert!(vote_with_strategy(VotingStrategy::WeightedRandom, &empty).is_err());
    }
}
