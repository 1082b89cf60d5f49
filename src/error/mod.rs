//! Error types for all layers, rolled up into a top-level [`AppError`].

use std::path::PathBuf;

use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// What was wrong.
        message: String,
    },

    /// Error from chain or node operations.
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Error from the persistence layer.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Error from the chain manager.
    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),
}

/// Structural and argument errors raised by chain and node operations.
///
/// Argument validation always happens before any mutation, so a returned
/// error implies the chain is unchanged.
#[derive(Debug, Error)]
pub enum ChainError {
    /// A value failed domain validation.
    #[error("Validation failed: {reason}")]
    Validation {
        /// What was invalid.
        reason: String,
    },

    /// An argument combination is not allowed.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong.
        reason: String,
    },

    /// A referenced node does not exist in the chain.
    #[error("Node not found: {node_id}")]
    NodeNotFound {
        /// The missing node id.
        node_id: String,
    },

    /// Adding the relationship would close a hierarchy cycle.
    #[error("Relationship {source} -> {target} would create a cycle")]
    CycleDetected {
        /// Source node id.
        ///
        /// Spelled as a raw identifier so thiserror does not infer it as the
        /// error source (it is a node id, not an underlying error).
        r#source: String,
        /// Target node id.
        target: String,
    },
}

/// Persistence layer errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The requested chain file does not exist.
    #[error("Chain file not found: {}", .path.display())]
    FileNotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode or decode failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The file parsed but its content is unusable.
    #[error("Corrupt chain file {}: {reason}", .path.display())]
    Corrupt {
        /// The offending path.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// The stored snapshot failed chain reconstruction.
    #[error("Invalid chain data: {0}")]
    InvalidChain(#[from] ChainError),
}

/// Manager-level errors
#[derive(Debug, Error)]
pub enum ManagerError {
    /// No chain registered under this id.
    #[error("Chain not found: {chain_id}")]
    ChainNotFound {
        /// The unknown chain id.
        chain_id: String,
    },

    /// No branch registered under this id.
    #[error("Branch not found: {branch_id}")]
    BranchNotFound {
        /// The unknown branch id.
        branch_id: String,
    },

    /// No context registered under this id.
    #[error("Context not found: {context_id}")]
    ContextNotFound {
        /// The unknown context id.
        context_id: String,
    },

    /// A chain with this name already exists.
    #[error("Chain name already registered: {name}")]
    DuplicateChainName {
        /// The conflicting name.
        name: String,
    },

    /// Error from the underlying chain operation.
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Error from the persistence layer.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for chain operations
pub type ChainResult<T> = Result<T, ChainError>;

/// Result type alias for persistence operations
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Result type alias for manager operations
pub type ManagerResult<T> = Result<T, ManagerError>;
