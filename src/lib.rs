//! A single-writer, hash-chained ledger guarded by SHA-256 proof of work.
//!
//! Blocks are mined with [`pow::ProofOfWork`], persisted by [`store::ChainStore`]
//! and walked newest-first with [`chain::ChainIterator`].

pub mod block;
pub mod chain;
pub mod config;
pub mod error;
pub mod pow;
pub mod store;

pub use block::Block;
pub use chain::{BlockReport, Chain, ChainIterator, ChainReport};
pub use config::Settings;
pub use error::{ChainError, Result};
pub use pow::{BlockFields, ProofOfWork, Puzzle, Target};
pub use store::ChainStore;
