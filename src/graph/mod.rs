//! Reasoning graph core: typed thought nodes and the chains that own them.
//!
//! A [`ReasoningChain`] is a directed-acyclic graph of [`ThoughtNode`]s
//! contributed by independent agents. Edges carry a [`RelationshipKind`];
//! every kind except `parallel` participates in cycle prevention. Chains
//! expose traversal, search, path enumeration, validation, and merge.

mod chain;
mod node;

#[cfg(test)]
#[path = "chain_tests.rs"]
mod chain_tests;

pub use chain::{ChainModel, ChainSummary, NodeFilter, NodeModel, ReasoningChain};
pub use node::ThoughtNode;

pub(crate) use chain::from_epoch;

use serde::{Deserialize, Serialize};

/// Current schema version written into nodes and chain files.
pub const SCHEMA_VERSION: &str = "1.0";

/// Kind of reasoning step a thought node represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThoughtKind {
    /// A direct observation of the problem or environment.
    #[default]
    Observation,
    /// A proposed explanation to be tested.
    Hypothesis,
    /// Supporting or refuting material for a hypothesis.
    Evidence,
    /// A deduction drawn from earlier nodes.
    Inference,
    /// An open question raised during reasoning.
    Question,
    /// An answer to a previously raised question.
    Answer,
    /// A position argued for.
    Argument,
    /// A position argued against.
    Counterargument,
    /// A concrete action taken or proposed.
    Action,
    /// A final conclusion of a reasoning line.
    Conclusion,
    /// A meta-level reflection on the reasoning itself.
    Reflection,
    /// Background context injected into the chain.
    Context,
}

impl std::fmt::Display for ThoughtKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ThoughtKind::Observation => "observation",
            ThoughtKind::Hypothesis => "hypothesis",
            ThoughtKind::Evidence => "evidence",
            ThoughtKind::Inference => "inference",
            ThoughtKind::Question => "question",
            ThoughtKind::Answer => "answer",
            ThoughtKind::Argument => "argument",
            ThoughtKind::Counterargument => "counterargument",
            ThoughtKind::Action => "action",
            ThoughtKind::Conclusion => "conclusion",
            ThoughtKind::Reflection => "reflection",
            ThoughtKind::Context => "context",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ThoughtKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "observation" => Ok(ThoughtKind::Observation),
            "hypothesis" => Ok(ThoughtKind::Hypothesis),
            "evidence" => Ok(ThoughtKind::Evidence),
            "inference" => Ok(ThoughtKind::Inference),
            "question" => Ok(ThoughtKind::Question),
            "answer" => Ok(ThoughtKind::Answer),
            "argument" => Ok(ThoughtKind::Argument),
            "counterargument" => Ok(ThoughtKind::Counterargument),
            "action" => Ok(ThoughtKind::Action),
            "conclusion" => Ok(ThoughtKind::Conclusion),
            "reflection" => Ok(ThoughtKind::Reflection),
            "context" => Ok(ThoughtKind::Context),
            _ => Err(format!("Unknown thought kind: {}", s)),
        }
    }
}

/// Typed semantics of a directed edge between two thought nodes.
///
/// `Parallel` marks a non-hierarchical link and is exempt from cycle
/// checking in both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// Target is supported by the source.
    #[default]
    Supports,
    /// Target is contradicted by the source.
    Contradicts,
    /// Target extends the source's line of reasoning.
    Extends,
    /// Target questions the source.
    Questions,
    /// Target answers the source.
    Answers,
    /// Target is derived from the source.
    DerivesFrom,
    /// Target is an alternative to the source.
    AlternativeTo,
    /// Target specializes the source.
    Specializes,
    /// Target generalizes the source.
    Generalizes,
    /// Target follows the source in sequence.
    Sequence,
    /// Source and target proceed in parallel (non-hierarchical).
    Parallel,
}

impl RelationshipKind {
    /// Whether this edge kind participates in hierarchy cycle checks.
    pub fn is_hierarchical(&self) -> bool {
        !matches!(self, RelationshipKind::Parallel)
    }
}

impl std::fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RelationshipKind::Supports => "supports",
            RelationshipKind::Contradicts => "contradicts",
            RelationshipKind::Extends => "extends",
            RelationshipKind::Questions => "questions",
            RelationshipKind::Answers => "answers",
            RelationshipKind::DerivesFrom => "derives_from",
            RelationshipKind::AlternativeTo => "alternative_to",
            RelationshipKind::Specializes => "specializes",
            RelationshipKind::Generalizes => "generalizes",
            RelationshipKind::Sequence => "sequence",
            RelationshipKind::Parallel => "parallel",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RelationshipKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "supports" => Ok(RelationshipKind::Supports),
            "contradicts" => Ok(RelationshipKind::Contradicts),
            "extends" => Ok(RelationshipKind::Extends),
            "questions" => Ok(RelationshipKind::Questions),
            "answers" => Ok(RelationshipKind::Answers),
            "derives_from" => Ok(RelationshipKind::DerivesFrom),
            "alternative_to" => Ok(RelationshipKind::AlternativeTo),
            "specializes" => Ok(RelationshipKind::Specializes),
            "generalizes" => Ok(RelationshipKind::Generalizes),
            "sequence" => Ok(RelationshipKind::Sequence),
            "parallel" => Ok(RelationshipKind::Parallel),
            _ => Err(format!("Unknown relationship kind: {}", s)),
        }
    }
}

/// Visit order for [`ReasoningChain::traverse`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalOrder {
    /// Explicit-stack depth-first walk along child edges.
    #[default]
    DepthFirst,
    /// Queue-based breadth-first walk along child edges.
    BreadthFirst,
    /// All nodes sorted by creation time ascending (edges ignored).
    Chronological,
    /// All nodes sorted by creation time descending (edges ignored).
    ReverseChronological,
    /// Nodes with a confidence value, sorted descending.
    Confidence,
}

impl std::fmt::Display for TraversalOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TraversalOrder::DepthFirst => "depth_first",
            TraversalOrder::BreadthFirst => "breadth_first",
            TraversalOrder::Chronological => "chronological",
            TraversalOrder::ReverseChronological => "reverse_chronological",
            TraversalOrder::Confidence => "confidence",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TraversalOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "depth_first" => Ok(TraversalOrder::DepthFirst),
            "breadth_first" => Ok(TraversalOrder::BreadthFirst),
            "chronological" => Ok(TraversalOrder::Chronological),
            "reverse_chronological" => Ok(TraversalOrder::ReverseChronological),
            "confidence" => Ok(TraversalOrder::Confidence),
            _ => Err(format!("Unknown traversal order: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_thought_kind_round_trip() {
        for kind in [
            ThoughtKind::Observation,
            ThoughtKind::Hypothesis,
            ThoughtKind::Evidence,
            ThoughtKind::Inference,
            ThoughtKind::Question,
            ThoughtKind::Answer,
            ThoughtKind::Argument,
            ThoughtKind::Counterargument,
            ThoughtKind::Action,
            ThoughtKind::Conclusion,
            ThoughtKind::Reflection,
            ThoughtKind::Context,
        ] {
            assert_eq!(ThoughtKind::from_str(&kind.to_string()), Ok(kind));
        }
        assert!(ThoughtKind::from_str("daydream").is_err());
    }

    #[test]
    fn test_relationship_kind_round_trip() {
        for kind in [
            RelationshipKind::Supports,
            RelationshipKind::Contradicts,
            RelationshipKind::Extends,
            RelationshipKind::Questions,
            RelationshipKind::Answers,
            RelationshipKind::DerivesFrom,
            RelationshipKind::AlternativeTo,
            RelationshipKind::Specializes,
            RelationshipKind::Generalizes,
            RelationshipKind::Sequence,
            RelationshipKind::Parallel,
        ] {
            assert_eq!(RelationshipKind::from_str(&kind.to_string()), Ok(kind));
        }
    }

    #[test]
    fn test_only_parallel_is_non_hierarchical() {
        assert!(!RelationshipKind::Parallel.is_hierarchical());
        assert!(RelationshipKind::Supports.is_hierarchical());
        assert!(RelationshipKind::Sequence.is_hierarchical());
    }

    #[test]
    fn test_traversal_order_from_str() {
        assert_eq!(
            TraversalOrder::from_str("breadth_first"),
            Ok(TraversalOrder::BreadthFirst)
        );
        assert!(TraversalOrder::from_str("sideways").is_err());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&RelationshipKind::DerivesFrom).unwrap();
        assert_eq!(json, "\"derives_from\"");
        let json = serde_json::to_string(&ThoughtKind::Counterargument).unwrap();
        assert_eq!(json, "\"counterargument\"");
    }
}
