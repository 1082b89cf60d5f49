//! Multi-chain coordination: the chain registry, branches, contexts,
//! agent tracking, and the node cache.
//!
//! [`ChainManager`] serializes every operation through one coarse mutex
//! over [`ManagerInner`]; the optional [`ChainStore`] and the injected
//! [`ContextRetriever`] live outside it. Branches and contexts are views
//! over a chain's nodes, never owners; the manager reconciles them when
//! nodes are removed. When storage is configured, every mutation persists
//! the chain file and a metadata sidecar before returning.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ChainError, ManagerError, ManagerResult};
use crate::graph::{
    ChainSummary, NodeFilter, ReasoningChain, RelationshipKind, ThoughtKind, ThoughtNode,
    TraversalOrder,
};
use crate::persistence::ChainStore;

mod cache;

pub use cache::NodeCache;

// ============================================================================
// Branches and contexts
// ============================================================================

/// An ordered view over a subset of one chain's nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// Unique branch identifier.
    pub id: String,
    /// Human-readable branch name.
    pub name: String,
    /// Chain this branch belongs to.
    pub chain_id: String,
    /// First node recorded on the branch, if any.
    pub root_node_id: Option<String>,
    /// Member node ids in insertion order.
    pub node_ids: Vec<String>,
    /// Opaque key-value metadata.
    pub metadata: serde_json::Value,
    /// When the branch was created.
    pub created_at: DateTime<Utc>,
    /// When the branch was last changed.
    pub updated_at: DateTime<Utc>,
}

impl Branch {
    fn new(name: impl Into<String>, chain_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            chain_id: chain_id.into(),
            root_node_id: None,
            node_ids: Vec::new(),
            metadata: json!({}),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A working frame for agents collaborating on a chain: current branch,
/// free-form state, and append-only assumption/constraint/goal lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    /// Unique context identifier.
    pub id: String,
    /// Human-readable context name.
    pub name: String,
    /// Chain this context belongs to.
    pub chain_id: String,
    /// Branch new thoughts land on when the caller names this context.
    pub current_branch_id: Option<String>,
    /// Free-form shared state (JSON object, shallow-merged on update).
    pub state: serde_json::Value,
    /// Append-only list of working assumptions.
    pub assumptions: Vec<String>,
    /// Append-only list of constraints.
    pub constraints: Vec<String>,
    /// Append-only list of goals.
    pub goals: Vec<String>,
    /// When the context was created.
    pub created_at: DateTime<Utc>,
    /// When the context was last changed.
    pub updated_at: DateTime<Utc>,
}

impl Context {
    fn new(name: impl Into<String>, chain_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            chain_id: chain_id.into(),
            current_branch_id: None,
            state: json!({}),
            assumptions: Vec::new(),
            constraints: Vec::new(),
            goals: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// How [`ChainManager::merge_branches`] combines two branch memberships.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchMergeStrategy {
    /// Keep target members and append source members not already present.
    #[default]
    Union,
    /// Keep only members present on both branches.
    Intersection,
    /// Replace target membership with the source membership.
    Override,
}

impl std::fmt::Display for BranchMergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BranchMergeStrategy::Union => "union",
            BranchMergeStrategy::Intersection => "intersection",
            BranchMergeStrategy::Override => "override",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for BranchMergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "union" => Ok(BranchMergeStrategy::Union),
            "intersection" => Ok(BranchMergeStrategy::Intersection),
            "override" => Ok(BranchMergeStrategy::Override),
            _ => Err(format!("Unknown branch merge strategy: {}", s)),
        }
    }
}

/// Partial update for [`ChainManager::update_context`]. The state object
/// is shallow-merged; the lists are appended, never rewritten.
#[derive(Debug, Clone, Default)]
pub struct ContextUpdate {
    /// New state entries to merge in.
    pub state: Option<serde_json::Value>,
    /// Assumptions to append.
    pub assumptions: Vec<String>,
    /// Constraints to append.
    pub constraints: Vec<String>,
    /// Goals to append.
    pub goals: Vec<String>,
}

impl ContextUpdate {
    /// Create an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge these entries into the context state.
    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = Some(state);
        self
    }

    /// Append an assumption.
    pub fn with_assumption(mut self, assumption: impl Into<String>) -> Self {
        self.assumptions.push(assumption.into());
        self
    }

    /// Append a constraint.
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    /// Append a goal.
    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goals.push(goal.into());
        self
    }
}

/// Sidecar schema persisted next to each chain file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSidecar {
    /// Chain the sidecar belongs to.
    pub chain_id: String,
    /// Branches of the chain.
    pub branches: Vec<Branch>,
    /// Contexts of the chain.
    pub contexts: Vec<Context>,
    /// When the sidecar was written.
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Context retrieval
// ============================================================================

/// Selects which nodes fit a token budget when assembling a context
/// window. Injected so an external memory manager can replace the default.
pub trait ContextRetriever: Send + Sync {
    /// Pick a subset of `nodes` (given in chronological order) whose
    /// estimated token cost fits `token_budget`.
    fn select(&self, nodes: &[ThoughtNode], token_budget: usize) -> Vec<ThoughtNode>;
}

/// Default retriever: the chronological tail that fits the budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct TailRetriever;

impl ContextRetriever for TailRetriever {
    fn select(&self, nodes: &[ThoughtNode], token_budget: usize) -> Vec<ThoughtNode> {
        let mut selected = Vec::new();
        let mut used = 0;
        for node in nodes.iter().rev() {
            let cost = estimate_tokens(node);
            if used + cost > token_budget {
                break;
            }
            used += cost;
            selected.push(node.clone());
        }
        selected.reverse();
        selected
    }
}

/// Rough four-characters-per-token estimate over the rendered content.
fn estimate_tokens(node: &ThoughtNode) -> usize {
    node.content.to_string().len() / 4 + 1
}

// ============================================================================
// Add-thought parameters
// ============================================================================

/// Parameters for [`ChainManager::add_thought`].
#[derive(Debug, Clone)]
pub struct AddThoughtParams {
    /// Target chain.
    pub chain_id: String,
    /// Kind of thought.
    pub kind: ThoughtKind,
    /// Content payload (non-empty JSON object).
    pub content: serde_json::Value,
    /// Contributing agent.
    pub author_id: String,
    /// Optional parent to attach under.
    pub parent_id: Option<String>,
    /// Relationship toward the parent; required when `parent_id` is set.
    pub relationship: Option<RelationshipKind>,
    /// Optional confidence in [0.0, 1.0].
    pub confidence: Option<f64>,
    /// Explicit branch to record the thought on.
    pub branch_id: Option<String>,
    /// Context whose current branch is used when no branch is given.
    pub context_id: Option<String>,
}

impl AddThoughtParams {
    /// Create parameters with the required fields.
    pub fn new(
        chain_id: impl Into<String>,
        kind: ThoughtKind,
        content: serde_json::Value,
        author_id: impl Into<String>,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            kind,
            content,
            author_id: author_id.into(),
            parent_id: None,
            relationship: None,
            confidence: None,
            branch_id: None,
            context_id: None,
        }
    }

    /// Attach under a parent with the given relationship.
    pub fn with_parent(mut self, parent_id: impl Into<String>, kind: RelationshipKind) -> Self {
        self.parent_id = Some(parent_id.into());
        self.relationship = Some(kind);
        self
    }

    /// Set the confidence.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Record the thought on an explicit branch.
    pub fn with_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }

    /// Resolve the branch through a context.
    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }
}

// ============================================================================
// Manager
// ============================================================================

struct ManagerInner {
    chains: HashMap<String, ReasoningChain>,
    /// Chain name -> chain id; names are unique across the manager.
    names: HashMap<String, String>,
    branches: HashMap<String, Branch>,
    contexts: HashMap<String, Context>,
    chain_branches: HashMap<String, Vec<String>>,
    chain_contexts: HashMap<String, Vec<String>>,
    default_branches: HashMap<String, String>,
    /// Agent id -> chains the agent has contributed to.
    agent_chains: HashMap<String, BTreeSet<String>>,
    cache: NodeCache,
}

impl ManagerInner {
    fn new(cache_capacity: usize) -> Self {
        Self {
            chains: HashMap::new(),
            names: HashMap::new(),
            branches: HashMap::new(),
            contexts: HashMap::new(),
            chain_branches: HashMap::new(),
            chain_contexts: HashMap::new(),
            default_branches: HashMap::new(),
            agent_chains: HashMap::new(),
            cache: NodeCache::new(cache_capacity),
        }
    }

    fn sidecar(&self, chain_id: &str) -> ChainSidecar {
        let branches = self
            .chain_branches
            .get(chain_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.branches.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        let contexts = self
            .chain_contexts
            .get(chain_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.contexts.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        ChainSidecar {
            chain_id: chain_id.to_string(),
            branches,
            contexts,
            updated_at: Utc::now(),
        }
    }

    fn register_branch(&mut self, branch: Branch) -> String {
        let id = branch.id.clone();
        self.chain_branches
            .entry(branch.chain_id.clone())
            .or_default()
            .push(id.clone());
        self.branches.insert(id.clone(), branch);
        id
    }

    fn register_context(&mut self, context: Context) -> String {
        let id = context.id.clone();
        self.chain_contexts
            .entry(context.chain_id.clone())
            .or_default()
            .push(id.clone());
        self.contexts.insert(id.clone(), context);
        id
    }
}

/// Coordinates every chain, branch, and context in the process.
pub struct ChainManager {
    inner: Mutex<ManagerInner>,
    store: Option<ChainStore>,
    retriever: Box<dyn ContextRetriever>,
}

impl ChainManager {
    /// Create an in-memory manager with default cache capacity.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ManagerInner::new(256)),
            store: None,
            retriever: Box::new(TailRetriever),
        }
    }

    /// Create a manager with storage and cache sizing from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            inner: Mutex::new(ManagerInner::new(config.cache.capacity)),
            store: Some(ChainStore::new(&config.storage)),
            retriever: Box::new(TailRetriever),
        }
    }

    /// Attach a chain store to an existing manager.
    pub fn with_store(mut self, store: ChainStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the context retriever.
    pub fn with_retriever(mut self, retriever: Box<dyn ContextRetriever>) -> Self {
        self.retriever = retriever;
        self
    }

    // ------------------------------------------------------------------
    // Chain lifecycle
    // ------------------------------------------------------------------

    /// Register a new chain, optionally with a default `main` branch and a
    /// default context pointed at it. Returns the new chain id.
    pub fn create_chain(
        &self,
        name: &str,
        description: &str,
        create_default_branch: bool,
        create_default_context: bool,
    ) -> ManagerResult<String> {
        let mut inner = self.inner.lock();
        if inner.names.contains_key(name) {
            return Err(ManagerError::DuplicateChainName {
                name: name.to_string(),
            });
        }

        let chain = ReasoningChain::new(name, description);
        let chain_id = chain.id.clone();
        inner.names.insert(name.to_string(), chain_id.clone());
        inner.chains.insert(chain_id.clone(), chain);

        if create_default_branch {
            let branch = Branch::new("main", &chain_id);
            let branch_id = inner.register_branch(branch);
            inner
                .default_branches
                .insert(chain_id.clone(), branch_id.clone());

            if create_default_context {
                let mut context = Context::new("default", &chain_id);
                context.current_branch_id = Some(branch_id);
                inner.register_context(context);
            }
        }

        self.persist(&inner, &chain_id)?;
        info!(chain_id = %chain_id, name, "Chain created");
        Ok(chain_id)
    }

    /// Load a persisted chain and its sidecar into the registry.
    pub fn load_chain(&self, chain_id: &str) -> ManagerResult<String> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| ManagerError::ChainNotFound {
                chain_id: chain_id.to_string(),
            })?;

        let plain = store.storage_dir().join(format!("{}.json", chain_id));
        let path = if plain.exists() {
            plain
        } else {
            store.storage_dir().join(format!("{}.json.gz", chain_id))
        };
        let chain = store.load(&path)?;
        let sidecar: Option<ChainSidecar> = store.load_metadata(chain_id)?;

        let mut inner = self.inner.lock();
        let id = chain.id.clone();
        inner.names.insert(chain.name.clone(), id.clone());
        inner.chains.insert(id.clone(), chain);

        if let Some(sidecar) = sidecar {
            for branch in sidecar.branches {
                if branch.name == "main" && !inner.default_branches.contains_key(&id) {
                    inner.default_branches.insert(id.clone(), branch.id.clone());
                }
                inner.register_branch(branch);
            }
            for context in sidecar.contexts {
                inner.register_context(context);
            }
        }

        info!(chain_id = %id, "Chain loaded from storage");
        Ok(id)
    }

    /// Look up a chain id by its registered name.
    pub fn find_chain_by_name(&self, name: &str) -> Option<String> {
        self.inner.lock().names.get(name).cloned()
    }

    /// Clone a full chain out of the registry.
    pub fn get_chain(&self, chain_id: &str) -> ManagerResult<ReasoningChain> {
        let inner = self.inner.lock();
        inner
            .chains
            .get(chain_id)
            .cloned()
            .ok_or_else(|| ManagerError::ChainNotFound {
                chain_id: chain_id.to_string(),
            })
    }

    /// Summaries of every registered chain, sorted by name.
    pub fn list_chains(&self) -> Vec<ChainSummary> {
        let inner = self.inner.lock();
        let mut summaries: Vec<ChainSummary> =
            inner.chains.values().map(|c| c.summary()).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Merge the source chain's nodes into the target chain. The source is
    /// retained. Returns the number of nodes copied.
    pub fn merge_chains(
        &self,
        source_id: &str,
        target_id: &str,
        connect_roots: bool,
        root_relationship: Option<RelationshipKind>,
    ) -> ManagerResult<usize> {
        let mut inner = self.inner.lock();
        let source = inner
            .chains
            .get(source_id)
            .cloned()
            .ok_or_else(|| ManagerError::ChainNotFound {
                chain_id: source_id.to_string(),
            })?;
        let target = inner
            .chains
            .get_mut(target_id)
            .ok_or_else(|| ManagerError::ChainNotFound {
                chain_id: target_id.to_string(),
            })?;

        let copied = target.merge(&source, connect_roots, root_relationship)?;

        // Every agent who contributed to the source now appears in the
        // target as well.
        for chains in inner.agent_chains.values_mut() {
            if chains.contains(source_id) {
                chains.insert(target_id.to_string());
            }
        }

        self.persist(&inner, target_id)?;
        info!(source_id, target_id, copied, "Chains merged");
        Ok(copied)
    }

    /// Drop a chain with its branches, contexts, cached nodes, agent
    /// tracking, and durable files. Returns whether it was registered.
    pub fn delete_chain(&self, chain_id: &str) -> ManagerResult<bool> {
        let mut inner = self.inner.lock();
        if inner.chains.remove(chain_id).is_none() {
            return Ok(false);
        }

        inner.names.retain(|_, id| id != chain_id);
        if let Some(branch_ids) = inner.chain_branches.remove(chain_id) {
            for id in branch_ids {
                inner.branches.remove(&id);
            }
        }
        if let Some(context_ids) = inner.chain_contexts.remove(chain_id) {
            for id in context_ids {
                inner.contexts.remove(&id);
            }
        }
        inner.default_branches.remove(chain_id);
        for chains in inner.agent_chains.values_mut() {
            chains.remove(chain_id);
        }
        inner.cache.remove_chain(chain_id);

        if let Some(store) = &self.store {
            store.delete_chain_files(chain_id)?;
        }
        info!(chain_id, "Chain deleted");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Thoughts
    // ------------------------------------------------------------------

    /// Add a thought to a chain, resolving its branch and recording agent
    /// participation. Returns the new node id.
    ///
    /// Branch resolution order: explicit `branch_id`, then the context's
    /// current branch, then the chain's default branch.
    pub fn add_thought(&self, params: AddThoughtParams) -> ManagerResult<String> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if !inner.chains.contains_key(&params.chain_id) {
            return Err(ManagerError::ChainNotFound {
                chain_id: params.chain_id.clone(),
            });
        }

        if let Some(context_id) = &params.context_id {
            if !inner.contexts.contains_key(context_id) {
                return Err(ManagerError::ContextNotFound {
                    context_id: context_id.clone(),
                });
            }
        }
        let branch_id = match &params.branch_id {
            Some(branch_id) => {
                if !inner.branches.contains_key(branch_id) {
                    return Err(ManagerError::BranchNotFound {
                        branch_id: branch_id.clone(),
                    });
                }
                Some(branch_id.clone())
            }
            None => params
                .context_id
                .as_ref()
                .and_then(|cid| inner.contexts.get(cid))
                .and_then(|ctx| ctx.current_branch_id.clone())
                .or_else(|| inner.default_branches.get(&params.chain_id).cloned()),
        };

        let mut node = ThoughtNode::new(params.kind, params.content, &params.author_id)?;
        if let Some(confidence) = params.confidence {
            node = node.with_confidence(confidence)?;
        }
        let mut metadata = serde_json::Map::new();
        if let Some(id) = &branch_id {
            metadata.insert("branch_id".to_string(), json!(id));
        }
        if let Some(id) = &params.context_id {
            metadata.insert("context_id".to_string(), json!(id));
        }
        if !metadata.is_empty() {
            node = node.with_metadata(serde_json::Value::Object(metadata));
        }

        let chain = inner
            .chains
            .get_mut(&params.chain_id)
            .ok_or_else(|| ManagerError::ChainNotFound {
                chain_id: params.chain_id.clone(),
            })?;
        let node_id = chain.add_node(node, params.parent_id.as_deref(), params.relationship)?;

        if let Some(branch_id) = &branch_id {
            if let Some(branch) = inner.branches.get_mut(branch_id) {
                if branch.root_node_id.is_none() {
                    branch.root_node_id = Some(node_id.clone());
                }
                if !branch.node_ids.contains(&node_id) {
                    branch.node_ids.push(node_id.clone());
                }
                branch.updated_at = Utc::now();
            }
        }
        inner
            .agent_chains
            .entry(params.author_id.clone())
            .or_default()
            .insert(params.chain_id.clone());

        self.persist(inner, &params.chain_id)?;
        debug!(
            chain_id = %params.chain_id,
            node_id = %node_id,
            branch = ?branch_id,
            "Thought added"
        );
        Ok(node_id)
    }

    /// Fetch one thought, preferring the node cache.
    pub fn get_thought(&self, chain_id: &str, node_id: &str) -> ManagerResult<ThoughtNode> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if let Some(node) = inner.cache.get(chain_id, node_id) {
            return Ok(node.clone());
        }
        let chain = inner
            .chains
            .get(chain_id)
            .ok_or_else(|| ManagerError::ChainNotFound {
                chain_id: chain_id.to_string(),
            })?;
        let node = chain
            .get_node(node_id)
            .cloned()
            .ok_or_else(|| ChainError::NodeNotFound {
                node_id: node_id.to_string(),
            })?;
        inner.cache.insert(chain_id, node.clone());
        Ok(node)
    }

    /// Remove a thought from its chain and reconcile every branch of that
    /// chain: membership entries are dropped and a `root_node_id` pointing
    /// at the removed node is cleared. Returns whether the node existed.
    pub fn remove_thought(
        &self,
        chain_id: &str,
        node_id: &str,
        reconnect_orphans: bool,
    ) -> ManagerResult<bool> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let chain = inner
            .chains
            .get_mut(chain_id)
            .ok_or_else(|| ManagerError::ChainNotFound {
                chain_id: chain_id.to_string(),
            })?;
        if !chain.remove_node(node_id, reconnect_orphans) {
            return Ok(false);
        }

        if let Some(branch_ids) = inner.chain_branches.get(chain_id) {
            for branch_id in branch_ids {
                if let Some(branch) = inner.branches.get_mut(branch_id) {
                    branch.node_ids.retain(|id| id != node_id);
                    if branch.root_node_id.as_deref() == Some(node_id) {
                        branch.root_node_id = None;
                    }
                    branch.updated_at = Utc::now();
                }
            }
        }
        inner.cache.remove(chain_id, node_id);

        self.persist(inner, chain_id)?;
        debug!(chain_id, node_id, reconnect_orphans, "Thought removed");
        Ok(true)
    }

    /// Replace a thought's content payload.
    pub fn update_thought_content(
        &self,
        chain_id: &str,
        node_id: &str,
        content: serde_json::Value,
    ) -> ManagerResult<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let chain = inner
            .chains
            .get_mut(chain_id)
            .ok_or_else(|| ManagerError::ChainNotFound {
                chain_id: chain_id.to_string(),
            })?;
        chain.update_thought_content(node_id, content)?;
        inner.cache.remove(chain_id, node_id);
        self.persist(inner, chain_id)?;
        Ok(())
    }

    /// Cross-chain conjunctive search. Returns `(chain_id, node)` pairs;
    /// `chain_ids` restricts the scan when given.
    pub fn search_thoughts(
        &self,
        query: &str,
        chain_ids: Option<&[String]>,
        kind: Option<ThoughtKind>,
        author_id: Option<&str>,
        min_confidence: Option<f64>,
    ) -> Vec<(String, ThoughtNode)> {
        let mut filter = NodeFilter::new().with_keyword(query);
        if let Some(kind) = kind {
            filter = filter.with_kind(kind);
        }
        if let Some(author) = author_id {
            filter = filter.with_author(author);
        }
        if let Some(min) = min_confidence {
            filter = filter.with_min_confidence(min);
        }

        let inner = self.inner.lock();
        let mut hits = Vec::new();
        let mut scanned: Vec<&ReasoningChain> = match chain_ids {
            Some(ids) => ids.iter().filter_map(|id| inner.chains.get(id)).collect(),
            None => inner.chains.values().collect(),
        };
        scanned.sort_by(|a, b| a.id.cmp(&b.id));
        for chain in scanned {
            for node in chain.find_nodes(&filter) {
                hits.push((chain.id.clone(), node.clone()));
            }
        }
        hits
    }

    /// Breadth-first neighborhood of a node, bounded by edge distance. The
    /// start node itself is excluded; results are cached.
    pub fn find_related_thoughts(
        &self,
        chain_id: &str,
        node_id: &str,
        max_distance: usize,
        include_ancestors: bool,
        include_descendants: bool,
    ) -> ManagerResult<Vec<ThoughtNode>> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let chain = inner
            .chains
            .get(chain_id)
            .ok_or_else(|| ManagerError::ChainNotFound {
                chain_id: chain_id.to_string(),
            })?;
        if !chain.contains(node_id) {
            return Err(ChainError::NodeNotFound {
                node_id: node_id.to_string(),
            }
            .into());
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(node_id.to_string());
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        queue.push_back((node_id.to_string(), 0));
        let mut found = Vec::new();

        while let Some((id, distance)) = queue.pop_front() {
            if distance >= max_distance {
                continue;
            }
            let node = match chain.get_node(&id) {
                Some(node) => node,
                None => continue,
            };
            let mut neighbors: Vec<&String> = Vec::new();
            if include_ancestors {
                neighbors.extend(node.parent_ids.iter());
            }
            if include_descendants {
                neighbors.extend(node.child_ids.iter());
            }
            for neighbor in neighbors {
                if visited.insert(neighbor.clone()) {
                    if let Some(found_node) = chain.get_node(neighbor) {
                        found.push(found_node.clone());
                        queue.push_back((neighbor.clone(), distance + 1));
                    }
                }
            }
        }

        for node in &found {
            inner.cache.insert(chain_id, node.clone());
        }
        Ok(found)
    }

    /// Assemble a context window via the injected retriever, over the
    /// chain's nodes in chronological order.
    pub fn get_context_window(
        &self,
        chain_id: &str,
        token_budget: usize,
    ) -> ManagerResult<Vec<ThoughtNode>> {
        let inner = self.inner.lock();
        let chain = inner
            .chains
            .get(chain_id)
            .ok_or_else(|| ManagerError::ChainNotFound {
                chain_id: chain_id.to_string(),
            })?;
        let chronological: Vec<ThoughtNode> = chain
            .traverse(TraversalOrder::Chronological, None, None)?
            .into_iter()
            .cloned()
            .collect();
        Ok(self.retriever.select(&chronological, token_budget))
    }

    /// Chains a given agent has contributed to.
    pub fn chains_for_agent(&self, agent_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .agent_chains
            .get(agent_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Branches
    // ------------------------------------------------------------------

    /// Create a branch on an existing chain. Returns the branch id.
    pub fn create_branch(&self, chain_id: &str, name: &str) -> ManagerResult<String> {
        let mut inner = self.inner.lock();
        if !inner.chains.contains_key(chain_id) {
            return Err(ManagerError::ChainNotFound {
                chain_id: chain_id.to_string(),
            });
        }
        let branch_id = inner.register_branch(Branch::new(name, chain_id));
        self.persist(&inner, chain_id)?;
        debug!(chain_id, branch_id = %branch_id, name, "Branch created");
        Ok(branch_id)
    }

    /// Clone a branch out of the registry.
    pub fn get_branch(&self, branch_id: &str) -> ManagerResult<Branch> {
        self.inner
            .lock()
            .branches
            .get(branch_id)
            .cloned()
            .ok_or_else(|| ManagerError::BranchNotFound {
                branch_id: branch_id.to_string(),
            })
    }

    /// Branches of one chain in creation order.
    pub fn list_branches(&self, chain_id: &str) -> ManagerResult<Vec<Branch>> {
        let inner = self.inner.lock();
        if !inner.chains.contains_key(chain_id) {
            return Err(ManagerError::ChainNotFound {
                chain_id: chain_id.to_string(),
            });
        }
        Ok(inner
            .chain_branches
            .get(chain_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.branches.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Record an existing chain node on a branch.
    pub fn add_node_to_branch(&self, branch_id: &str, node_id: &str) -> ManagerResult<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let branch = inner
            .branches
            .get_mut(branch_id)
            .ok_or_else(|| ManagerError::BranchNotFound {
                branch_id: branch_id.to_string(),
            })?;
        let chain = inner
            .chains
            .get(&branch.chain_id)
            .ok_or_else(|| ManagerError::ChainNotFound {
                chain_id: branch.chain_id.clone(),
            })?;
        if !chain.contains(node_id) {
            return Err(ChainError::NodeNotFound {
                node_id: node_id.to_string(),
            }
            .into());
        }
        if branch.root_node_id.is_none() {
            branch.root_node_id = Some(node_id.to_string());
        }
        if !branch.node_ids.contains(&node_id.to_string()) {
            branch.node_ids.push(node_id.to_string());
        }
        branch.updated_at = Utc::now();
        let chain_id = branch.chain_id.clone();
        self.persist(inner, &chain_id)?;
        Ok(())
    }

    /// Combine two branch memberships of the same chain. Returns the
    /// target's member count after the merge.
    pub fn merge_branches(
        &self,
        source_id: &str,
        target_id: &str,
        strategy: BranchMergeStrategy,
    ) -> ManagerResult<usize> {
        let mut inner = self.inner.lock();
        let source = inner
            .branches
            .get(source_id)
            .cloned()
            .ok_or_else(|| ManagerError::BranchNotFound {
                branch_id: source_id.to_string(),
            })?;
        let target = inner
            .branches
            .get_mut(target_id)
            .ok_or_else(|| ManagerError::BranchNotFound {
                branch_id: target_id.to_string(),
            })?;
        if source.chain_id != target.chain_id {
            return Err(ChainError::InvalidArgument {
                reason: format!(
                    "branches {} and {} belong to different chains",
                    source_id, target_id
                ),
            }
            .into());
        }

        match strategy {
            BranchMergeStrategy::Union => {
                for id in &source.node_ids {
                    if !target.node_ids.contains(id) {
                        target.node_ids.push(id.clone());
                    }
                }
            }
            BranchMergeStrategy::Intersection => {
                target.node_ids.retain(|id| source.node_ids.contains(id));
            }
            BranchMergeStrategy::Override => {
                target.node_ids = source.node_ids.clone();
                target.root_node_id = source.root_node_id.clone();
            }
        }
        if target.root_node_id.is_none() {
            target.root_node_id = target.node_ids.first().cloned();
        }
        target.updated_at = Utc::now();
        let count = target.node_ids.len();
        let chain_id = target.chain_id.clone();

        self.persist(&inner, &chain_id)?;
        debug!(source_id, target_id, strategy = %strategy, count, "Branches merged");
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Contexts
    // ------------------------------------------------------------------

    /// Create a context on an existing chain, pointed at the chain's
    /// default branch when one exists. Returns the context id.
    pub fn create_context(&self, chain_id: &str, name: &str) -> ManagerResult<String> {
        let mut inner = self.inner.lock();
        if !inner.chains.contains_key(chain_id) {
            return Err(ManagerError::ChainNotFound {
                chain_id: chain_id.to_string(),
            });
        }
        let mut context = Context::new(name, chain_id);
        context.current_branch_id = inner.default_branches.get(chain_id).cloned();
        let context_id = inner.register_context(context);
        self.persist(&inner, chain_id)?;
        debug!(chain_id, context_id = %context_id, name, "Context created");
        Ok(context_id)
    }

    /// Clone a context out of the registry.
    pub fn get_context(&self, context_id: &str) -> ManagerResult<Context> {
        self.inner
            .lock()
            .contexts
            .get(context_id)
            .cloned()
            .ok_or_else(|| ManagerError::ContextNotFound {
                context_id: context_id.to_string(),
            })
    }

    /// Apply a partial context update: shallow state merge plus appends.
    pub fn update_context(&self, context_id: &str, update: ContextUpdate) -> ManagerResult<()> {
        let mut inner = self.inner.lock();
        let context = inner
            .contexts
            .get_mut(context_id)
            .ok_or_else(|| ManagerError::ContextNotFound {
                context_id: context_id.to_string(),
            })?;

        if let Some(state) = update.state {
            merge_state(&mut context.state, state);
        }
        context.assumptions.extend(update.assumptions);
        context.constraints.extend(update.constraints);
        context.goals.extend(update.goals);
        context.updated_at = Utc::now();
        let chain_id = context.chain_id.clone();

        self.persist(&inner, &chain_id)?;
        Ok(())
    }

    /// Point a context at a branch of the same chain.
    pub fn set_current_branch(&self, context_id: &str, branch_id: &str) -> ManagerResult<()> {
        let mut inner = self.inner.lock();
        let branch_chain = inner
            .branches
            .get(branch_id)
            .map(|b| b.chain_id.clone())
            .ok_or_else(|| ManagerError::BranchNotFound {
                branch_id: branch_id.to_string(),
            })?;
        let context = inner
            .contexts
            .get_mut(context_id)
            .ok_or_else(|| ManagerError::ContextNotFound {
                context_id: context_id.to_string(),
            })?;
        if context.chain_id != branch_chain {
            return Err(ChainError::InvalidArgument {
                reason: format!(
                    "branch {} belongs to a different chain than context {}",
                    branch_id, context_id
                ),
            }
            .into());
        }
        context.current_branch_id = Some(branch_id.to_string());
        context.updated_at = Utc::now();
        let chain_id = context.chain_id.clone();
        self.persist(&inner, &chain_id)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write the chain file and its sidecar when storage is configured.
    fn persist(&self, inner: &ManagerInner, chain_id: &str) -> ManagerResult<()> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(()),
        };
        let chain = match inner.chains.get(chain_id) {
            Some(chain) => chain,
            None => return Ok(()),
        };
        store.save(chain, &store.default_options())?;
        store.save_metadata(chain_id, &inner.sidecar(chain_id))?;
        Ok(())
    }
}

impl Default for ChainManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Shallow-merge `incoming` object keys into `state`; non-object inputs
/// replace the state wholesale.
fn merge_state(state: &mut serde_json::Value, incoming: serde_json::Value) {
    match (state.as_object_mut(), incoming) {
        (Some(current), serde_json::Value::Object(new_entries)) => {
            for (key, value) in new_entries {
                current.insert(key, value);
            }
        }
        (_, incoming) => *state = incoming,
    }
}
