//! The chain: a persisted block table plus the hash of its newest block.
//!
//! `Chain` owns the only mutable state (the tip). Appending takes `&mut self`,
//! so writers within a process are serialized by the borrow checker; the store
//! additionally refuses a block that does not extend the persisted tip.

use std::collections::HashSet;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::config::Settings;
use crate::error::{ChainError, Result};
use crate::pow::ProofOfWork;
use crate::store::ChainStore;

pub struct Chain {
    store: ChainStore,
    pow: ProofOfWork,
    tip: Vec<u8>,
}

impl Chain {
    /// Opens the chain at `settings.db_path`, mining a genesis block if none exists.
    pub fn open_or_create(settings: &Settings) -> Result<Self> {
        let store = ChainStore::open(&settings.db_path)?;
        // the configured difficulty only matters for a chain that does not exist yet
        let pow = match store.difficulty()? {
            Some(stored) => ProofOfWork::new(stored)?.with_max_nonce(settings.max_nonce),
            None => settings.proof_of_work()?,
        };
        Self::with_store(store, pow, settings.genesis_payload.as_bytes())
    }

    /// Loads the chain held by `store`, or creates it with `genesis_payload`.
    ///
    /// An existing chain keeps the difficulty it was created with; `pow` only
    /// contributes its nonce bound in that case.
    pub fn with_store(
        store: ChainStore,
        pow: ProofOfWork,
        genesis_payload: &[u8],
    ) -> Result<Self> {
        match store.tip()? {
            Some(tip) => {
                let difficulty = store.difficulty()?.ok_or_else(|| {
                    ChainError::InvalidChainState("chain has a tip but no difficulty".into())
                })?;
                let pow = ProofOfWork::new(difficulty)?.with_max_nonce(pow.max_nonce());
                if !store.contains_block(&tip)? {
                    return Err(ChainError::InvalidChainState(format!(
                        "tip {} is not in the block table",
                        hex::encode(&tip)
                    )));
                }
                debug!(tip = %hex::encode(&tip), difficulty, "loaded existing chain");
                Ok(Self { store, pow, tip })
            }
            None if !store.is_empty() => Err(ChainError::InvalidChainState(
                "blocks are present but the tip is missing".into(),
            )),
            None => {
                let started = Instant::now();
                let genesis = Block::new_genesis(genesis_payload, &pow)?;
                store.init_genesis(&genesis, pow.difficulty())?;
                info!(
                    hash = %genesis.hash_hex(),
                    nonce = genesis.nonce,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "created genesis block"
                );
                let tip = genesis.hash;
                Ok(Self { store, pow, tip })
            }
        }
    }

    pub fn tip(&self) -> &[u8] {
        &self.tip
    }

    pub fn pow(&self) -> &ProofOfWork {
        &self.pow
    }

    pub fn difficulty(&self) -> u32 {
        self.pow.difficulty()
    }

    /// Re-reads the tip from the store, picking up blocks appended by other handles.
    pub fn reload(&mut self) -> Result<()> {
        let tip = self
            .store
            .tip()?
            .ok_or_else(|| ChainError::InvalidChainState("tip is missing".into()))?;
        if !self.store.contains_block(&tip)? {
            return Err(ChainError::InvalidChainState(format!(
                "tip {} is not in the block table",
                hex::encode(&tip)
            )));
        }
        self.tip = tip;
        Ok(())
    }

    /// Mines a block carrying `payload` on top of the current tip and persists it.
    /// The returned block's hash is the new tip.
    ///
    /// If another handle advanced the tip meanwhile, the block is dropped, this
    /// handle's tip is refreshed and `TipMoved` is returned; a retry mines on the
    /// new tip.
    pub fn append(&mut self, payload: impl Into<Vec<u8>>) -> Result<Block> {
        let started = Instant::now();
        let block = Block::new(payload, self.tip.clone(), &self.pow)?;
        if let Err(e) = self.store.commit_block(&block) {
            if matches!(e, ChainError::TipMoved { .. }) {
                self.reload()?;
                debug!(tip = %hex::encode(&self.tip), "refreshed stale tip");
            }
            return Err(e);
        }
        self.tip = block.hash.clone();
        info!(
            hash = %block.hash_hex(),
            nonce = block.nonce,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "appended block"
        );
        Ok(block)
    }

    /// A cursor at the current tip walking back to genesis.
    pub fn iter(&self) -> ChainIterator {
        ChainIterator {
            store: self.store.clone(),
            current_hash: Some(self.tip.clone()),
            seen: HashSet::new(),
        }
    }

    /// Walks tip to genesis re-validating every block's proof of work and linkage.
    pub fn verify(&self) -> Result<ChainReport> {
        let mut blocks = Vec::new();
        let mut successor_prev: Option<Vec<u8>> = None;

        for block in self.iter() {
            let block = block?;
            let pow_valid = block.validate(&self.pow);
            let linked = successor_prev.as_deref().map_or(true, |prev| prev == block.hash);
            if !pow_valid || !linked {
                warn!(hash = %block.hash_hex(), pow_valid, linked, "block failed verification");
            }
            successor_prev = Some(block.prev_hash.clone());
            blocks.push(BlockReport {
                hash: block.hash_hex(),
                prev_hash: hex::encode(&block.prev_hash),
                pow_valid,
                linked,
            });
        }

        Ok(ChainReport { blocks })
    }
}

/// Backward cursor over a chain, newest block first.
///
/// The genesis block is yielded like any other; the iterator ends right after
/// it. A hash that is missing from the store, a record filed under a key other
/// than its own hash, or a link back to an already visited block yields one
/// `InvalidChainState` error and then ends.
pub struct ChainIterator {
    store: ChainStore,
    current_hash: Option<Vec<u8>>,
    seen: HashSet<Vec<u8>>,
}

impl ChainIterator {
    fn load(&self, hash: &[u8]) -> Result<Block> {
        let block = self.store.get_block(hash)?.ok_or_else(|| {
            ChainError::InvalidChainState(format!("block {} is missing", hex::encode(hash)))
        })?;
        if block.hash != hash {
            return Err(ChainError::InvalidChainState(format!(
                "record under {} holds block {}",
                hex::encode(hash),
                block.hash_hex()
            )));
        }
        if self.seen.contains(&block.prev_hash) || block.prev_hash == hash {
            return Err(ChainError::InvalidChainState(format!(
                "block {} links back into the chain already walked",
                block.hash_hex()
            )));
        }
        Ok(block)
    }
}

impl Iterator for ChainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current_hash.take()?;
        match self.load(&hash) {
            Ok(block) => {
                debug!(hash = %block.hash_hex(), "loaded block");
                if !block.is_genesis() {
                    self.current_hash = Some(block.prev_hash.clone());
                }
                self.seen.insert(hash);
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockReport {
    pub hash: String,
    pub prev_hash: String,
    pub pow_valid: bool,
    /// Whether this block's hash is what its successor points back to.
    pub linked: bool,
}

impl BlockReport {
    pub fn is_valid(&self) -> bool {
        self.pow_valid && self.linked
    }
}

/// Per-block verification results, tip first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub blocks: Vec<BlockReport>,
}

impl ChainReport {
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.blocks.iter().all(BlockReport::is_valid)
    }

    pub fn invalid(&self) -> impl Iterator<Item = &BlockReport> {
        self.blocks.iter().filter(|b| !b.is_valid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Chain {
        let store = ChainStore::temporary().unwrap();
        Chain::with_store(store, ProofOfWork::new(8).unwrap(), b"G").unwrap()
    }

    fn payloads(chain: &Chain) -> Vec<Vec<u8>> {
        chain.iter().map(|b| b.unwrap().payload).collect()
    }

    #[test]
    fn new_chain_has_only_genesis() {
        let chain = chain();
        let blocks: Vec<Block> = chain.iter().map(|b| b.unwrap()).collect();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_genesis());
        assert_eq!(blocks[0].hash, chain.tip());
        assert_eq!(blocks[0].payload, b"G");
    }

    #[test]
    fn append_moves_tip() {
        let mut chain = chain();
        let genesis_tip = chain.tip().to_vec();
        let block = chain.append("A").unwrap();
        assert_eq!(block.prev_hash, genesis_tip);
        assert_eq!(chain.tip(), block.hash.as_slice());
    }

    #[test]
    fn iterates_newest_first() {
        let mut chain = chain();
        chain.append("A").unwrap();
        chain.append("B").unwrap();
        assert_eq!(payloads(&chain), vec![b"B".to_vec(), b"A".to_vec(), b"G".to_vec()]);
        // restartable from the tip
        assert_eq!(payloads(&chain).len(), 3);
    }

    #[test]
    fn iterator_ends_after_genesis() {
        let chain = chain();
        let mut it = chain.iter();
        assert!(it.next().unwrap().unwrap().is_genesis());
        assert!(it.next().is_none());
        assert!(it.next().is_none());
    }

    #[test]
    fn verify_accepts_honest_chain() {
        let mut chain = chain();
        chain.append("A").unwrap();
        let report = chain.verify().unwrap();
        assert_eq!(report.len(), 2);
        assert!(report.is_valid());
    }

    #[test]
    fn tip_without_block_is_invalid_state() {
        let store = ChainStore::temporary().unwrap();
        let pow = ProofOfWork::new(8).unwrap();
        let genesis = Block::new_genesis("G", &pow).unwrap();
        store.init_genesis(&genesis, 8).unwrap();
        store.remove(&genesis.hash).unwrap();

        let err = Chain::with_store(store, pow, b"G").err().unwrap();
        assert!(matches!(err, ChainError::InvalidChainState(_)));
    }

    #[test]
    fn missing_predecessor_surfaces_during_iteration() {
        let store = ChainStore::temporary().unwrap();
        let pow = ProofOfWork::new(8).unwrap();
        let genesis = Block::new_genesis("G", &pow).unwrap();
        store.init_genesis(&genesis, 8).unwrap();
        let mut chain = Chain::with_store(store.clone(), pow, b"G").unwrap();
        chain.append("A").unwrap();
        store.remove(&genesis.hash).unwrap();

        let mut it = chain.iter();
        assert_eq!(it.next().unwrap().unwrap().payload, b"A");
        assert!(matches!(it.next(), Some(Err(ChainError::InvalidChainState(_)))));
        assert!(it.next().is_none());
        assert!(chain.verify().is_err());
    }

    #[test]
    fn record_under_foreign_key_is_invalid_state() {
        let store = ChainStore::temporary().unwrap();
        let pow = ProofOfWork::new(8).unwrap();
        let mut chain = Chain::with_store(store.clone(), pow, b"G").unwrap();
        let genesis = chain.iter().next().unwrap().unwrap();
        chain.append("A").unwrap();
        let b = chain.append("B").unwrap();
        store.put_raw(&b.hash, &genesis).unwrap();

        let mut it = chain.iter();
        assert!(matches!(it.next(), Some(Err(ChainError::InvalidChainState(_)))));
        assert!(it.next().is_none());
        assert!(matches!(chain.verify(), Err(ChainError::InvalidChainState(_))));
    }

    #[test]
    fn self_referencing_block_ends_iteration() {
        let store = ChainStore::temporary().unwrap();
        let chain = Chain::with_store(store.clone(), ProofOfWork::new(8).unwrap(), b"G").unwrap();
        let genesis = chain.iter().next().unwrap().unwrap();
        let looped = Block {
            prev_hash: genesis.hash.clone(),
            ..genesis.clone()
        };
        store.put_raw(&genesis.hash, &looped).unwrap();

        let items: Vec<Result<Block>> = chain.iter().take(10).collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ChainError::InvalidChainState(_))));
        assert!(chain.verify().is_err());
    }

    #[test]
    fn cycle_through_earlier_block_ends_iteration() {
        let store = ChainStore::temporary().unwrap();
        let mut chain =
            Chain::with_store(store.clone(), ProofOfWork::new(8).unwrap(), b"G").unwrap();
        let genesis = chain.iter().next().unwrap().unwrap();
        let a = chain.append("A").unwrap();
        // genesis now points forward to A, closing a loop
        let looped = Block {
            prev_hash: a.hash.clone(),
            ..genesis.clone()
        };
        store.put_raw(&genesis.hash, &looped).unwrap();

        let items: Vec<Result<Block>> = chain.iter().take(10).collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().payload, b"A");
        assert!(matches!(items[1], Err(ChainError::InvalidChainState(_))));
    }

    #[test]
    fn stale_handle_recovers_after_tip_moved() {
        let store = ChainStore::temporary().unwrap();
        let pow = ProofOfWork::new(8).unwrap();
        let mut first = Chain::with_store(store.clone(), pow, b"G").unwrap();
        let mut second = Chain::with_store(store, pow, b"G").unwrap();

        let a = first.append("A").unwrap();
        assert!(matches!(second.append("B"), Err(ChainError::TipMoved { .. })));
        assert_eq!(second.tip(), a.hash.as_slice());

        let b = second.append("B").unwrap();
        assert_eq!(b.prev_hash, a.hash);
        first.reload().unwrap();
        assert_eq!(payloads(&first), vec![b"B".to_vec(), b"A".to_vec(), b"G".to_vec()]);
    }

    #[test]
    fn exhausted_genesis_propagates() {
        let store = ChainStore::temporary().unwrap();
        let pow = ProofOfWork::new(64).unwrap().with_max_nonce(10);
        let err = Chain::with_store(store.clone(), pow, b"G").err().unwrap();
        assert!(matches!(err, ChainError::PuzzleExhausted { .. }));
        assert!(store.is_empty());
    }
}
