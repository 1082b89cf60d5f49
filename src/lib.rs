//! Collaborative reasoning graph store.
//!
//! Multiple agents contribute typed thought nodes to shared reasoning
//! chains: directed-acyclic graphs with typed relationships, traversal,
//! search, path enumeration, validation, and merge. Chains persist as
//! versioned JSON files with optional gzip compression and backup
//! rotation, and a [`manager::ChainManager`] coordinates chains,
//! branches, contexts, and agent tracking behind one coarse lock.
//!
//! # Example
//!
//! ```
//! use reasoning_chains::graph::{ReasoningChain, RelationshipKind, ThoughtKind, ThoughtNode};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), reasoning_chains::error::ChainError> {
//! let mut chain = ReasoningChain::new("incident-42", "latency investigation");
//! let root = chain.add_node(
//!     ThoughtNode::new(ThoughtKind::Observation, json!({"text": "p99 doubled"}), "agent-a")?,
//!     None,
//!     None,
//! )?;
//! chain.add_node(
//!     ThoughtNode::new(ThoughtKind::Hypothesis, json!({"text": "cache misses"}), "agent-b")?,
//!     Some(&root),
//!     Some(RelationshipKind::DerivesFrom),
//! )?;
//! let (ok, violations) = chain.validate();
//! assert!(ok, "{:?}", violations);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod graph;
pub mod manager;
pub mod persistence;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use graph::{ReasoningChain, RelationshipKind, ThoughtKind, ThoughtNode, TraversalOrder};
pub use manager::ChainManager;
pub use persistence::ChainStore;
