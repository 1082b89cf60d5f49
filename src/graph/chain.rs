//! An owned reasoning graph of thought nodes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::node::ThoughtNode;
use super::{RelationshipKind, ThoughtKind, TraversalOrder, SCHEMA_VERSION};
use crate::error::{ChainError, ChainResult};

/// Filter for [`ReasoningChain::find_nodes`]. All supplied fields are
/// conjunctive.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    /// Match only nodes of this kind.
    pub kind: Option<ThoughtKind>,
    /// Match only nodes by this author.
    pub author_id: Option<String>,
    /// Minimum confidence (nodes without confidence are excluded).
    pub min_confidence: Option<f64>,
    /// Maximum confidence (nodes without confidence are excluded).
    pub max_confidence: Option<f64>,
    /// Case-insensitive keyword matched against the rendered content.
    pub keyword: Option<String>,
}

impl NodeFilter {
    /// Create an empty filter matching every node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a thought kind.
    pub fn with_kind(mut self, kind: ThoughtKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Restrict to an author.
    pub fn with_author(mut self, author_id: impl Into<String>) -> Self {
        self.author_id = Some(author_id.into());
        self
    }

    /// Restrict to a minimum confidence.
    pub fn with_min_confidence(mut self, min: f64) -> Self {
        self.min_confidence = Some(min);
        self
    }

    /// Restrict to a maximum confidence.
    pub fn with_max_confidence(mut self, max: f64) -> Self {
        self.max_confidence = Some(max);
        self
    }

    /// Restrict to a content keyword.
    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    fn matches(&self, node: &ThoughtNode) -> bool {
        if let Some(kind) = self.kind {
            if node.kind != kind {
                return false;
            }
        }
        if let Some(author) = &self.author_id {
            if &node.author_id != author {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            match node.confidence {
                Some(c) if c >= min => {}
                _ => return false,
            }
        }
        if let Some(max) = self.max_confidence {
            match node.confidence {
                Some(c) if c <= max => {}
                _ => return false,
            }
        }
        if let Some(keyword) = &self.keyword {
            if !node.content_matches(keyword) {
                return false;
            }
        }
        true
    }
}

/// Lightweight display summary of a chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainSummary {
    /// Chain id.
    pub chain_id: String,
    /// Chain name.
    pub name: String,
    /// Total node count.
    pub node_count: usize,
    /// Current root ids.
    pub root_ids: Vec<String>,
    /// Current leaf ids.
    pub leaf_ids: Vec<String>,
    /// Node count per thought kind.
    pub kind_counts: BTreeMap<String, usize>,
}

/// One owned graph of thought nodes representing a single reasoning process.
///
/// The chain owns every structural invariant: parent/child symmetry with
/// matching relationships, root/leaf bookkeeping, and acyclicity through
/// every relationship kind except `parallel`. All invariants hold after
/// every public mutation and are recomputable via [`Self::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningChain {
    /// Unique chain identifier.
    pub id: String,
    /// Human-readable name, unique within a manager.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Opaque key-value metadata.
    pub metadata: serde_json::Value,
    /// When the chain was created.
    pub created_at: DateTime<Utc>,
    /// When the chain was last mutated.
    pub updated_at: DateTime<Utc>,
    /// Owned nodes keyed by id.
    nodes: HashMap<String, ThoughtNode>,
    /// Ids of nodes with no parent in this chain.
    root_ids: BTreeSet<String>,
    /// Ids of nodes with no child in this chain.
    leaf_ids: BTreeSet<String>,
    /// Schema version this chain was created under.
    pub schema_version: String,
}

impl ReasoningChain {
    /// Create an empty chain.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            nodes: HashMap::new(),
            root_ids: BTreeSet::new(),
            leaf_ids: BTreeSet::new(),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    /// Use an explicit chain id instead of the generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set chain metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Number of nodes in the chain.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the chain has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether a node with this id is present.
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Borrow a node by id.
    pub fn get_node(&self, node_id: &str) -> Option<&ThoughtNode> {
        self.nodes.get(node_id)
    }

    /// Current root ids (nodes with no parent in this chain).
    pub fn root_ids(&self) -> &BTreeSet<String> {
        &self.root_ids
    }

    /// Current leaf ids (nodes with no child in this chain).
    pub fn leaf_ids(&self) -> &BTreeSet<String> {
        &self.leaf_ids
    }

    /// Iterate all nodes in arbitrary order.
    pub fn nodes(&self) -> impl Iterator<Item = &ThoughtNode> {
        self.nodes.values()
    }

    /// Add a node to the chain, optionally wiring it under an existing
    /// parent.
    ///
    /// Adding an id that is already present is a no-op and returns the
    /// existing id. A `parent_id` must already exist in the chain and must
    /// be accompanied by a `relationship`.
    pub fn add_node(
        &mut self,
        mut node: ThoughtNode,
        parent_id: Option<&str>,
        relationship: Option<RelationshipKind>,
    ) -> ChainResult<String> {
        if self.nodes.contains_key(&node.id) {
            debug!(chain_id = %self.id, node_id = %node.id, "Node already present, skipping add");
            return Ok(node.id);
        }

        if let Some(parent_id) = parent_id {
            if !self.nodes.contains_key(parent_id) {
                return Err(ChainError::NodeNotFound {
                    node_id: parent_id.to_string(),
                });
            }
            let relationship = relationship.ok_or_else(|| ChainError::InvalidArgument {
                reason: format!("relationship required when attaching under parent {}", parent_id),
            })?;

            node.add_parent(parent_id, relationship);
            let node_id = node.id.clone();
            if let Some(parent) = self.nodes.get_mut(parent_id) {
                parent.add_child(node_id, relationship);
            }
            // The parent just gained a child, so it cannot be a leaf.
            self.leaf_ids.remove(parent_id);
        } else {
            self.root_ids.insert(node.id.clone());
        }

        let node_id = node.id.clone();
        self.leaf_ids.insert(node_id.clone());
        self.nodes.insert(node_id.clone(), node);
        self.touch();

        debug!(chain_id = %self.id, node_id = %node_id, parent = ?parent_id, "Node added");
        Ok(node_id)
    }

    /// Remove a node, detaching it from all parents and children.
    ///
    /// With `reconnect_orphans`, each child left parentless is rewired
    /// directly to every former parent of the removed node, carrying the
    /// relationship the removed node held toward that parent. Otherwise such
    /// children become roots. Returns whether the node was present.
    pub fn remove_node(&mut self, node_id: &str, reconnect_orphans: bool) -> bool {
        let node = match self.nodes.remove(node_id) {
            Some(node) => node,
            None => return false,
        };

        let former_parents: Vec<(String, RelationshipKind)> = node
            .parent_ids
            .iter()
            .filter_map(|pid| node.relationship_to(pid).map(|rel| (pid.clone(), rel)))
            .collect();
        let former_children: Vec<String> = node.child_ids.iter().cloned().collect();

        for (parent_id, _) in &former_parents {
            if let Some(parent) = self.nodes.get_mut(parent_id) {
                parent.remove_child(node_id);
            }
        }
        for child_id in &former_children {
            if let Some(child) = self.nodes.get_mut(child_id) {
                child.remove_parent(node_id);
            }
        }

        for child_id in &former_children {
            let orphaned = self
                .nodes
                .get(child_id)
                .map(|c| c.parent_ids.is_empty())
                .unwrap_or(false);
            if !orphaned {
                continue;
            }
            if reconnect_orphans && !former_parents.is_empty() {
                for (parent_id, rel) in &former_parents {
                    self.wire(parent_id, child_id, *rel);
                }
            } else {
                self.root_ids.insert(child_id.clone());
            }
        }

        for (parent_id, _) in &former_parents {
            let childless = self
                .nodes
                .get(parent_id)
                .map(|p| p.child_ids.is_empty())
                .unwrap_or(false);
            if childless {
                self.leaf_ids.insert(parent_id.clone());
            }
        }

        self.root_ids.remove(node_id);
        self.leaf_ids.remove(node_id);
        self.touch();

        debug!(
            chain_id = %self.id,
            node_id = %node_id,
            reconnect_orphans,
            "Node removed"
        );
        true
    }

    /// Add a typed relationship from `source` to `target`.
    ///
    /// Returns `Ok(false)` without mutating if either id is absent. Unless
    /// the kind is `parallel`, a reachability check from `target` back to
    /// `source` rejects relationships that would close a hierarchy cycle.
    pub fn add_relationship(
        &mut self,
        source: &str,
        target: &str,
        kind: RelationshipKind,
    ) -> ChainResult<bool> {
        if !self.nodes.contains_key(source) || !self.nodes.contains_key(target) {
            warn!(
                chain_id = %self.id,
                source, target, "Relationship endpoints missing, skipping"
            );
            return Ok(false);
        }

        if kind.is_hierarchical() && self.is_reachable(target, source) {
            return Err(ChainError::CycleDetected {
                source: source.to_string(),
                target: target.to_string(),
            });
        }

        self.wire(source, target, kind);
        self.touch();
        debug!(chain_id = %self.id, source, target, kind = %kind, "Relationship added");
        Ok(true)
    }

    /// Remove the relationship from `source` to `target`, restoring root or
    /// leaf status if the removal orphans either side. Returns whether an
    /// edge was removed.
    pub fn remove_relationship(&mut self, source: &str, target: &str) -> bool {
        let connected = self
            .nodes
            .get(source)
            .map(|s| s.child_ids.contains(target))
            .unwrap_or(false);
        if !connected {
            return false;
        }

        if let Some(s) = self.nodes.get_mut(source) {
            s.remove_child(target);
            if s.child_ids.is_empty() {
                self.leaf_ids.insert(source.to_string());
            }
        }
        if let Some(t) = self.nodes.get_mut(target) {
            t.remove_parent(source);
            if t.parent_ids.is_empty() {
                self.root_ids.insert(target.to_string());
            }
        }
        self.touch();
        true
    }

    /// Visit nodes in the requested order.
    ///
    /// Graph orders walk child edges from all roots, or from `start_id`
    /// when given, visiting every reachable node at most once. The filter
    /// suppresses nodes from the output without halting the walk.
    /// Chronological and confidence orders ignore edges entirely.
    pub fn traverse<'a>(
        &'a self,
        order: TraversalOrder,
        start_id: Option<&str>,
        filter: Option<&dyn Fn(&ThoughtNode) -> bool>,
    ) -> ChainResult<Vec<&'a ThoughtNode>> {
        if let Some(start) = start_id {
            if !self.nodes.contains_key(start) {
                return Err(ChainError::InvalidArgument {
                    reason: format!("traversal start node does not exist: {}", start),
                });
            }
        }

        let keep = |node: &ThoughtNode| filter.map(|f| f(node)).unwrap_or(true);

        let seeds: Vec<String> = match start_id {
            Some(start) => vec![start.to_string()],
            None => self.root_ids.iter().cloned().collect(),
        };

        let mut out = Vec::new();
        match order {
            TraversalOrder::DepthFirst => {
                let mut visited: HashSet<&str> = HashSet::new();
                let mut stack: Vec<&str> = seeds.iter().rev().map(String::as_str).collect();
                while let Some(id) = stack.pop() {
                    if !visited.insert(id) {
                        continue;
                    }
                    if let Some(node) = self.nodes.get(id) {
                        if keep(node) {
                            out.push(node);
                        }
                        // Reverse push so the smallest child id pops first.
                        for child in node.child_ids.iter().rev() {
                            if !visited.contains(child.as_str()) {
                                stack.push(child);
                            }
                        }
                    }
                }
            }
            TraversalOrder::BreadthFirst => {
                let mut visited: HashSet<&str> = HashSet::new();
                let mut queue: VecDeque<&str> = VecDeque::new();
                for seed in &seeds {
                    if visited.insert(seed) {
                        queue.push_back(seed);
                    }
                }
                while let Some(id) = queue.pop_front() {
                    if let Some(node) = self.nodes.get(id) {
                        if keep(node) {
                            out.push(node);
                        }
                        for child in &node.child_ids {
                            if visited.insert(child) {
                                queue.push_back(child);
                            }
                        }
                    }
                }
            }
            TraversalOrder::Chronological | TraversalOrder::ReverseChronological => {
                let mut all: Vec<&ThoughtNode> = self.nodes.values().filter(|n| keep(n)).collect();
                all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                if order == TraversalOrder::ReverseChronological {
                    all.reverse();
                }
                out = all;
            }
            TraversalOrder::Confidence => {
                let mut scored: Vec<&ThoughtNode> = self
                    .nodes
                    .values()
                    .filter(|n| n.confidence.is_some() && keep(n))
                    .collect();
                scored.sort_by(|a, b| {
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.id.cmp(&b.id))
                });
                out = scored;
            }
        }
        Ok(out)
    }

    /// Linear scan for nodes matching every supplied filter field.
    pub fn find_nodes(&self, filter: &NodeFilter) -> Vec<&ThoughtNode> {
        let mut found: Vec<&ThoughtNode> =
            self.nodes.values().filter(|n| filter.matches(n)).collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        found
    }

    /// Enumerate every simple path from `source` to `target` along child
    /// edges.
    ///
    /// Uses explicit-stack backtracking so deep chains cannot overflow the
    /// call stack. Returns an empty list when `target` is unreachable.
    pub fn find_paths(&self, source: &str, target: &str) -> ChainResult<Vec<Vec<String>>> {
        for id in [source, target] {
            if !self.nodes.contains_key(id) {
                return Err(ChainError::NodeNotFound {
                    node_id: id.to_string(),
                });
            }
        }

        let mut paths = Vec::new();
        let mut path: Vec<String> = vec![source.to_string()];
        if source == target {
            paths.push(path);
            return Ok(paths);
        }

        // One frame of pending children per node currently on the path.
        let mut frames: Vec<Vec<String>> = vec![self.children_desc(source)];
        loop {
            let next = match frames.last_mut() {
                Some(frame) => frame.pop(),
                None => break,
            };
            match next {
                Some(next) => {
                    if path.iter().any(|p| p == &next) {
                        continue;
                    }
                    if next == target {
                        let mut found = path.clone();
                        found.push(next);
                        paths.push(found);
                        continue;
                    }
                    frames.push(self.children_desc(&next));
                    path.push(next);
                }
                None => {
                    frames.pop();
                    path.pop();
                }
            }
        }
        Ok(paths)
    }

    /// Recompute every structural invariant, returning success or the full
    /// list of violations.
    pub fn validate(&self) -> (bool, Vec<String>) {
        let mut violations = Vec::new();

        for node in self.nodes.values() {
            for parent_id in &node.parent_ids {
                match self.nodes.get(parent_id) {
                    None => violations.push(format!(
                        "node {} lists missing parent {}",
                        node.id, parent_id
                    )),
                    Some(parent) => {
                        if !parent.child_ids.contains(&node.id) {
                            violations.push(format!(
                                "node {} lists parent {} but the reverse child edge is missing",
                                node.id, parent_id
                            ));
                        }
                        if node.relationship_to(parent_id) != parent.relationship_to(&node.id) {
                            violations.push(format!(
                                "relationship mismatch between {} and {}",
                                node.id, parent_id
                            ));
                        }
                    }
                }
            }
            for child_id in &node.child_ids {
                match self.nodes.get(child_id) {
                    None => violations
                        .push(format!("node {} lists missing child {}", node.id, child_id)),
                    Some(child) => {
                        if !child.parent_ids.contains(&node.id) {
                            violations.push(format!(
                                "node {} lists child {} but the reverse parent edge is missing",
                                node.id, child_id
                            ));
                        }
                    }
                }
            }

            let connected: BTreeSet<&String> =
                node.parent_ids.iter().chain(node.child_ids.iter()).collect();
            for related_id in node.relationships.keys() {
                if !connected.contains(related_id) {
                    violations.push(format!(
                        "node {} has a relationship entry for unconnected node {}",
                        node.id, related_id
                    ));
                }
            }
            for id in &connected {
                if !node.relationships.contains_key(*id) {
                    violations.push(format!(
                        "node {} is connected to {} without a relationship entry",
                        node.id, id
                    ));
                }
            }
        }

        let computed_roots: BTreeSet<String> = self
            .nodes
            .values()
            .filter(|n| n.parent_ids.is_empty())
            .map(|n| n.id.clone())
            .collect();
        if computed_roots != self.root_ids {
            violations.push(format!(
                "stored root set {:?} does not match computed {:?}",
                self.root_ids, computed_roots
            ));
        }
        let computed_leaves: BTreeSet<String> = self
            .nodes
            .values()
            .filter(|n| n.child_ids.is_empty())
            .map(|n| n.id.clone())
            .collect();
        if computed_leaves != self.leaf_ids {
            violations.push(format!(
                "stored leaf set {:?} does not match computed {:?}",
                self.leaf_ids, computed_leaves
            ));
        }

        violations.extend(self.find_hierarchy_cycles());

        (violations.is_empty(), violations)
    }

    /// Merge every node of `other` into this chain.
    ///
    /// Nodes already present by id are skipped; copied nodes arrive with
    /// cleared edges and `other`'s internal relationships are re-established
    /// among them. With `connect_roots` (which requires `root_relationship`),
    /// an edge is added from every pre-merge leaf of this chain to every
    /// root of `other`, subject to the usual cycle rule. Returns the number
    /// of nodes copied.
    pub fn merge(
        &mut self,
        other: &ReasoningChain,
        connect_roots: bool,
        root_relationship: Option<RelationshipKind>,
    ) -> ChainResult<usize> {
        if connect_roots && root_relationship.is_none() {
            return Err(ChainError::InvalidArgument {
                reason: "root_relationship required when connect_roots is set".to_string(),
            });
        }

        let pre_merge_leaves: Vec<String> = self.leaf_ids.iter().cloned().collect();

        let mut copied: BTreeSet<String> = BTreeSet::new();
        for node in other.nodes.values() {
            if self.nodes.contains_key(&node.id) {
                continue;
            }
            let mut copy = node.clone();
            copy.parent_ids.clear();
            copy.child_ids.clear();
            copy.relationships.clear();
            self.root_ids.insert(copy.id.clone());
            self.leaf_ids.insert(copy.id.clone());
            copied.insert(copy.id.clone());
            self.nodes.insert(copy.id.clone(), copy);
        }

        for node in other.nodes.values() {
            if !copied.contains(&node.id) {
                continue;
            }
            for child_id in &node.child_ids {
                if !copied.contains(child_id) {
                    continue;
                }
                if let Some(rel) = node.relationship_to(child_id) {
                    self.wire(&node.id, child_id, rel);
                }
            }
        }

        if connect_roots {
            let rel = root_relationship.unwrap_or_default();
            let other_roots: Vec<String> = other.root_ids.iter().cloned().collect();
            for leaf in &pre_merge_leaves {
                for root in &other_roots {
                    self.add_relationship(leaf, root, rel)?;
                }
            }
        }

        self.touch();
        debug!(
            chain_id = %self.id,
            from_chain = %other.id,
            copied = copied.len(),
            connect_roots,
            "Chains merged"
        );
        Ok(copied.len())
    }

    /// Update a node's content payload.
    pub fn update_thought_content(
        &mut self,
        node_id: &str,
        content: serde_json::Value,
    ) -> ChainResult<()> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ChainError::NodeNotFound {
                node_id: node_id.to_string(),
            })?;
        node.update_content(content)?;
        self.touch();
        Ok(())
    }

    /// Update a node's confidence.
    pub fn update_thought_confidence(
        &mut self,
        node_id: &str,
        confidence: Option<f64>,
    ) -> ChainResult<()> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ChainError::NodeNotFound {
                node_id: node_id.to_string(),
            })?;
        node.update_confidence(confidence)?;
        self.touch();
        Ok(())
    }

    /// Build a display summary of the chain.
    pub fn summary(&self) -> ChainSummary {
        let mut kind_counts: BTreeMap<String, usize> = BTreeMap::new();
        for node in self.nodes.values() {
            *kind_counts.entry(node.kind.to_string()).or_default() += 1;
        }
        ChainSummary {
            chain_id: self.id.clone(),
            name: self.name.clone(),
            node_count: self.nodes.len(),
            root_ids: self.root_ids.iter().cloned().collect(),
            leaf_ids: self.leaf_ids.iter().cloned().collect(),
            kind_counts,
        }
    }

    /// Produce a complete, order-independent structural snapshot.
    pub fn to_model(&self) -> ChainModel {
        let nodes: BTreeMap<String, NodeModel> = self
            .nodes
            .values()
            .map(|n| (n.id.clone(), NodeModel::from_node(n)))
            .collect();
        ChainModel {
            chain_id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            metadata: self.metadata.clone(),
            created_at: to_epoch(self.created_at),
            updated_at: to_epoch(self.updated_at),
            schema_version: self.schema_version.clone(),
            root_node_ids: self.root_ids.iter().cloned().collect(),
            leaf_node_ids: self.leaf_ids.iter().cloned().collect(),
            nodes,
        }
    }

    /// Reconstruct a chain from a structural snapshot.
    pub fn from_model(model: ChainModel) -> ChainResult<Self> {
        let mut nodes = HashMap::with_capacity(model.nodes.len());
        for (id, node_model) in model.nodes {
            let node = node_model.into_node(&id)?;
            nodes.insert(id, node);
        }
        Ok(Self {
            id: model.chain_id,
            name: model.name,
            description: model.description,
            metadata: model.metadata,
            created_at: from_epoch(model.created_at)?,
            updated_at: from_epoch(model.updated_at)?,
            nodes,
            root_ids: model.root_node_ids.into_iter().collect(),
            leaf_ids: model.leaf_node_ids.into_iter().collect(),
            schema_version: model.schema_version,
        })
    }

    /// Wire a parent->child edge on both sides and fix root/leaf sets.
    /// Callers are responsible for cycle checking.
    fn wire(&mut self, source: &str, target: &str, kind: RelationshipKind) {
        if let Some(s) = self.nodes.get_mut(source) {
            s.add_child(target, kind);
        }
        if let Some(t) = self.nodes.get_mut(target) {
            t.add_parent(source, kind);
        }
        self.leaf_ids.remove(source);
        self.root_ids.remove(target);
    }

    /// Whether `to` can be reached from `from` along hierarchical
    /// (non-parallel) child edges. Explicit stack; a node reaches itself.
    fn is_reachable(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![from];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(id) {
                for child in &node.child_ids {
                    if node.relationship_to(child).map(|r| r.is_hierarchical()) == Some(true) {
                        if child.as_str() == to {
                            return true;
                        }
                        stack.push(child);
                    }
                }
            }
        }
        false
    }

    /// Iterative three-color DFS over hierarchical edges, reporting every
    /// node on a back edge.
    fn find_hierarchy_cycles(&self) -> Vec<String> {
        const UNSEEN: u8 = 0;
        const OPEN: u8 = 1;
        const CLOSED: u8 = 2;

        let mut violations = Vec::new();
        let mut state: HashMap<&str, u8> = HashMap::new();

        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort_unstable();

        for start in ids {
            if state.get(start).copied().unwrap_or(UNSEEN) != UNSEEN {
                continue;
            }
            let mut stack: Vec<(&str, Vec<&str>)> =
                vec![(start, self.hierarchical_children(start))];
            state.insert(start, OPEN);
            loop {
                let next = match stack.last_mut() {
                    Some((_, pending)) => pending.pop(),
                    None => break,
                };
                match next {
                    Some(next) => match state.get(next).copied().unwrap_or(UNSEEN) {
                        OPEN => {
                            let current = stack.last().map(|(id, _)| *id).unwrap_or(start);
                            violations.push(format!(
                                "hierarchy cycle detected through edge {} -> {}",
                                current, next
                            ));
                        }
                        CLOSED => {}
                        _ => {
                            state.insert(next, OPEN);
                            let children = self.hierarchical_children(next);
                            stack.push((next, children));
                        }
                    },
                    None => {
                        if let Some((current, _)) = stack.pop() {
                            state.insert(current, CLOSED);
                        }
                    }
                }
            }
        }
        violations
    }

    fn hierarchical_children<'a>(&'a self, id: &str) -> Vec<&'a str> {
        match self.nodes.get(id) {
            Some(node) => node
                .child_ids
                .iter()
                .filter(|c| {
                    node.relationship_to(c.as_str()).map(|r| r.is_hierarchical()) == Some(true)
                })
                .map(String::as_str)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Children in descending id order, so popping yields ascending order.
    fn children_desc(&self, id: &str) -> Vec<String> {
        match self.nodes.get(id) {
            Some(node) => node.child_ids.iter().rev().cloned().collect(),
            None => Vec::new(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// Wire model
// ============================================================================

/// Wire snapshot of a single node, in the chain file schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeModel {
    /// Node id.
    pub node_id: String,
    /// Thought kind.
    pub thought_type: ThoughtKind,
    /// Opaque content payload.
    pub content: serde_json::Value,
    /// Author agent id.
    pub author_agent_id: String,
    /// Creation time as Unix-epoch seconds.
    pub timestamp: f64,
    /// Optional confidence.
    pub confidence: Option<f64>,
    /// Opaque metadata.
    pub metadata: serde_json::Value,
    /// Parent node ids.
    pub parent_ids: Vec<String>,
    /// Child node ids.
    pub child_ids: Vec<String>,
    /// Relationship kind per connected node id.
    pub relationships: BTreeMap<String, RelationshipKind>,
    /// Schema version.
    pub schema_version: String,
}

impl NodeModel {
    fn from_node(node: &ThoughtNode) -> Self {
        Self {
            node_id: node.id.clone(),
            thought_type: node.kind,
            content: node.content.clone(),
            author_agent_id: node.author_id.clone(),
            timestamp: to_epoch(node.created_at),
            confidence: node.confidence,
            metadata: node.metadata.clone(),
            parent_ids: node.parent_ids.iter().cloned().collect(),
            child_ids: node.child_ids.iter().cloned().collect(),
            relationships: node.relationships.clone(),
            schema_version: node.schema_version.clone(),
        }
    }

    fn into_node(self, key: &str) -> ChainResult<ThoughtNode> {
        if self.node_id != key {
            return Err(ChainError::Validation {
                reason: format!(
                    "node key {} does not match embedded node_id {}",
                    key, self.node_id
                ),
            });
        }
        Ok(ThoughtNode {
            id: self.node_id,
            kind: self.thought_type,
            content: self.content,
            author_id: self.author_agent_id,
            created_at: from_epoch(self.timestamp)?,
            confidence: self.confidence,
            metadata: self.metadata,
            parent_ids: self.parent_ids.into_iter().collect(),
            child_ids: self.child_ids.into_iter().collect(),
            relationships: self.relationships,
            schema_version: self.schema_version,
        })
    }
}

/// Wire snapshot of a whole chain. Serializing this struct produces the
/// chain file format; `nodes` is serialized last so metadata listing can
/// read headers cheaply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainModel {
    /// Chain id.
    pub chain_id: String,
    /// Chain name.
    pub name: String,
    /// Chain description.
    pub description: String,
    /// Opaque metadata.
    pub metadata: serde_json::Value,
    /// Creation time as Unix-epoch seconds.
    pub created_at: f64,
    /// Last update time as Unix-epoch seconds.
    pub updated_at: f64,
    /// Schema version.
    pub schema_version: String,
    /// Root node ids.
    pub root_node_ids: Vec<String>,
    /// Leaf node ids.
    pub leaf_node_ids: Vec<String>,
    /// All nodes keyed by id.
    pub nodes: BTreeMap<String, NodeModel>,
}

pub(crate) fn to_epoch(dt: DateTime<Utc>) -> f64 {
    dt.timestamp_micros() as f64 / 1_000_000.0
}

pub(crate) fn from_epoch(seconds: f64) -> ChainResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64).ok_or_else(|| {
        ChainError::Validation {
            reason: format!("timestamp out of range: {}", seconds),
        }
    })
}
