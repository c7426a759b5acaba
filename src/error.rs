use thiserror::Error;

/// Result type for chain operations.
pub type Result<T> = std::result::Result<T, ChainError>;

/// Errors surfaced by the proof-of-work engine, the block codec and the chain store.
#[derive(Error, Debug)]
pub enum ChainError {
    /// No nonce in `0..=max_nonce` produced a hash below the target.
    #[error("nonce space exhausted at {max_nonce} without meeting difficulty {difficulty}")]
    PuzzleExhausted { max_nonce: u64, difficulty: u32 },

    /// A stored block could not be decoded.
    #[error("malformed block: {0}")]
    Decode(#[source] bincode::Error),

    /// A block could not be encoded for storage.
    #[error("failed to encode block: {0}")]
    Encode(#[source] bincode::Error),

    /// The underlying sled database failed.
    #[error("store error: {0}")]
    StoreIo(#[from] sled::Error),

    /// The persisted chain does not satisfy its linkage invariants.
    #[error("invalid chain state: {0}")]
    InvalidChainState(String),

    /// Another writer advanced the tip while a block was being mined.
    #[error("tip moved during append: expected {expected}, found {found}")]
    TipMoved { expected: String, found: String },

    #[error("configuration error: {0}")]
    Config(String),
}
