//! Persistent block table backed by sled.
//!
//! A single tree maps block hash to the bincode-encoded block. Two reserved
//! keys live alongside the hashes: `tip` holds the hash of the last appended
//! block and `difficulty` the difficulty the chain was created with. Both are
//! shorter than a digest so they never collide with a block key.

use std::path::Path;

use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use sled::{Db, Tree};
use tracing::debug;

use crate::block::Block;
use crate::error::{ChainError, Result};
use crate::pow::DIGEST_LEN;

const BLOCKS_TREE: &str = "blocks";
const TIP_KEY: &[u8] = b"tip";
const DIFFICULTY_KEY: &[u8] = b"difficulty";

/// Handle to the on-disk chain. Cloning yields another handle to the same database.
#[derive(Clone)]
pub struct ChainStore {
    db: Db,
    blocks: Tree,
}

impl ChainStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        debug!(path = %path.display(), "opened chain store");
        Self::from_db(db)
    }

    /// A throwaway database removed when the last handle is dropped.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let blocks = db.open_tree(BLOCKS_TREE)?;
        Ok(Self { db, blocks })
    }

    /// True when nothing, not even a tip, has been written.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn tip(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.blocks.get(TIP_KEY)?.map(|v| v.to_vec()))
    }

    pub fn difficulty(&self) -> Result<Option<u32>> {
        match self.blocks.get(DIFFICULTY_KEY)? {
            None => Ok(None),
            Some(raw) => {
                let bytes: [u8; 4] = (&*raw).try_into().map_err(|_| {
                    ChainError::InvalidChainState(format!(
                        "stored difficulty has {} bytes, expected 4",
                        raw.len()
                    ))
                })?;
                Ok(Some(u32::from_be_bytes(bytes)))
            }
        }
    }

    pub fn get_block(&self, hash: &[u8]) -> Result<Option<Block>> {
        match self.blocks.get(hash)? {
            Some(bytes) => Block::deserialize(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn contains_block(&self, hash: &[u8]) -> Result<bool> {
        Ok(self.blocks.contains_key(hash)?)
    }

    /// Writes the genesis block, the tip and the chain difficulty in one transaction.
    pub fn init_genesis(&self, genesis: &Block, difficulty: u32) -> Result<()> {
        check_block_key(genesis)?;
        let bytes = genesis.serialize()?;
        let outcome: TransactionResult<(), ChainError> = self.blocks.transaction(|tx| {
            if tx.get(TIP_KEY)?.is_some() {
                return Err(ConflictableTransactionError::Abort(
                    ChainError::InvalidChainState("chain already has a genesis block".into()),
                ));
            }
            tx.insert(genesis.hash.as_slice(), bytes.as_slice())?;
            tx.insert(TIP_KEY, genesis.hash.as_slice())?;
            tx.insert(DIFFICULTY_KEY, &difficulty.to_be_bytes()[..])?;
            Ok(())
        });
        finish(outcome)?;
        self.db.flush()?;
        Ok(())
    }

    /// Persists `block` and advances the tip to its hash, atomically.
    ///
    /// The block must extend the current tip; if another writer advanced the
    /// tip in the meantime neither write lands. Stored blocks are never
    /// overwritten.
    pub fn commit_block(&self, block: &Block) -> Result<()> {
        check_block_key(block)?;
        let bytes = block.serialize()?;
        let outcome: TransactionResult<(), ChainError> = self.blocks.transaction(|tx| {
            if tx.get(block.hash.as_slice())?.is_some() {
                return Err(ConflictableTransactionError::Abort(
                    ChainError::InvalidChainState(format!(
                        "block {} is already stored",
                        block.hash_hex()
                    )),
                ));
            }
            match tx.get(TIP_KEY)? {
                Some(tip) if &*tip == block.prev_hash.as_slice() => {}
                found => {
                    return Err(ConflictableTransactionError::Abort(ChainError::TipMoved {
                        expected: hex::encode(&block.prev_hash),
                        found: found.map(hex::encode).unwrap_or_else(|| "<none>".into()),
                    }))
                }
            }
            tx.insert(block.hash.as_slice(), bytes.as_slice())?;
            tx.insert(TIP_KEY, block.hash.as_slice())?;
            Ok(())
        });
        finish(outcome)?;
        self.db.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn remove(&self, key: &[u8]) -> Result<()> {
        self.blocks.remove(key)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn put_raw(&self, key: &[u8], block: &Block) -> Result<()> {
        self.blocks.insert(key, block.serialize()?)?;
        Ok(())
    }
}

/// Block keys are digest-wide, which keeps them apart from the reserved keys.
fn check_block_key(block: &Block) -> Result<()> {
    if block.hash.len() != DIGEST_LEN {
        return Err(ChainError::InvalidChainState(format!(
            "block hash is {} bytes, expected {DIGEST_LEN}",
            block.hash.len()
        )));
    }
    Ok(())
}

fn finish(outcome: TransactionResult<(), ChainError>) -> Result<()> {
    outcome.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => ChainError::StoreIo(e),
    })
}
