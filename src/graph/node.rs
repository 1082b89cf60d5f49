//! A single typed thought contributed by one agent.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{RelationshipKind, ThoughtKind, SCHEMA_VERSION};
use crate::error::{ChainError, ChainResult};

/// One typed reasoning step with authorship, optional confidence, and typed
/// edges to other nodes in the same chain.
///
/// A node only stores ids, never references to its owning chain or peers,
/// which makes it safe to copy between chains during merge. Structural
/// fields (`parent_ids`, `child_ids`, `relationships`) are maintained by
/// [`ReasoningChain`](super::ReasoningChain) operations; the id-set and the
/// relationship map are always mutated together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtNode {
    /// Unique node identifier within its chain.
    pub id: String,
    /// Kind of reasoning step.
    pub kind: ThoughtKind,
    /// Opaque structured payload authored by the agent.
    pub content: serde_json::Value,
    /// Id of the agent that contributed this node.
    pub author_id: String,
    /// When the node was created.
    pub created_at: DateTime<Utc>,
    /// Optional confidence in [0.0, 1.0].
    pub confidence: Option<f64>,
    /// Opaque key-value metadata.
    pub metadata: serde_json::Value,
    /// Ids of parent nodes in the owning chain.
    pub parent_ids: BTreeSet<String>,
    /// Ids of child nodes in the owning chain.
    pub child_ids: BTreeSet<String>,
    /// Relationship kind per connected node id (parents and children).
    pub relationships: BTreeMap<String, RelationshipKind>,
    /// Schema version this node was created under.
    pub schema_version: String,
}

impl ThoughtNode {
    /// Create a new thought node with a generated id.
    ///
    /// Fails with a validation error if `content` is not a non-empty JSON
    /// object or `author_id` is empty.
    pub fn new(
        kind: ThoughtKind,
        content: serde_json::Value,
        author_id: impl Into<String>,
    ) -> ChainResult<Self> {
        let author_id = author_id.into();
        validate_content(&content)?;
        if author_id.trim().is_empty() {
            return Err(ChainError::Validation {
                reason: "author_id must not be empty".to_string(),
            });
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content,
            author_id,
            created_at: Utc::now(),
            confidence: None,
            metadata: serde_json::json!({}),
            parent_ids: BTreeSet::new(),
            child_ids: BTreeSet::new(),
            relationships: BTreeMap::new(),
            schema_version: SCHEMA_VERSION.to_string(),
        })
    }

    /// Use an explicit id instead of the generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the confidence, validating the [0.0, 1.0] range.
    pub fn with_confidence(mut self, confidence: f64) -> ChainResult<Self> {
        validate_confidence(confidence)?;
        self.confidence = Some(confidence);
        Ok(self)
    }

    /// Set metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Record `parent_id` as a parent with the given relationship.
    pub fn add_parent(&mut self, parent_id: impl Into<String>, kind: RelationshipKind) {
        let parent_id = parent_id.into();
        self.relationships.insert(parent_id.clone(), kind);
        self.parent_ids.insert(parent_id);
    }

    /// Record `child_id` as a child with the given relationship.
    pub fn add_child(&mut self, child_id: impl Into<String>, kind: RelationshipKind) {
        let child_id = child_id.into();
        self.relationships.insert(child_id.clone(), kind);
        self.child_ids.insert(child_id);
    }

    /// Remove `parent_id` from the parent set, dropping the relationship
    /// entry unless the id is still connected as a child.
    pub fn remove_parent(&mut self, parent_id: &str) {
        self.parent_ids.remove(parent_id);
        if !self.child_ids.contains(parent_id) {
            self.relationships.remove(parent_id);
        }
    }

    /// Remove `child_id` from the child set, dropping the relationship
    /// entry unless the id is still connected as a parent.
    pub fn remove_child(&mut self, child_id: &str) {
        self.child_ids.remove(child_id);
        if !self.parent_ids.contains(child_id) {
            self.relationships.remove(child_id);
        }
    }

    /// Relationship kind toward the given node, if connected.
    pub fn relationship_to(&self, other_id: &str) -> Option<RelationshipKind> {
        self.relationships.get(other_id).copied()
    }

    /// Replace the content payload, re-validating it.
    pub fn update_content(&mut self, content: serde_json::Value) -> ChainResult<()> {
        validate_content(&content)?;
        self.content = content;
        Ok(())
    }

    /// Replace the confidence, re-validating the range. `None` clears it.
    pub fn update_confidence(&mut self, confidence: Option<f64>) -> ChainResult<()> {
        if let Some(c) = confidence {
            validate_confidence(c)?;
        }
        self.confidence = confidence;
        Ok(())
    }

    /// Case-insensitive keyword match against the rendered content.
    pub fn content_matches(&self, keyword: &str) -> bool {
        self.content
            .to_string()
            .to_lowercase()
            .contains(&keyword.to_lowercase())
    }
}

fn validate_content(content: &serde_json::Value) -> ChainResult<()> {
    match content.as_object() {
        Some(map) if !map.is_empty() => Ok(()),
        Some(_) => Err(ChainError::Validation {
            reason: "content must not be empty".to_string(),
        }),
        None => Err(ChainError::Validation {
            reason: "content must be a JSON object".to_string(),
        }),
    }
}

fn validate_confidence(confidence: f64) -> ChainResult<()> {
    if !(0.0..=1.0).contains(&confidence) || confidence.is_nan() {
        return Err(ChainError::Validation {
            reason: format!("confidence must be within [0.0, 1.0], got {}", confidence),
        });
    }
    Ok(())
}
