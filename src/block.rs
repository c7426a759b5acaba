use bincode::Options;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{ChainError, Result};
use crate::pow::{BlockFields, ProofOfWork, Puzzle};

/// Represents a mined block in the chain.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Seconds since the Unix epoch at creation.
    pub timestamp: i64,
    /// Opaque application data.
    pub payload: Vec<u8>,
    /// The hash of the predecessor block. Empty only for the genesis block.
    pub prev_hash: Vec<u8>,
    /// The nonce that solved the proof-of-work puzzle.
    pub nonce: u64,
    /// The winning digest over all other fields.
    pub hash: Vec<u8>,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
}

impl Block {
    /// Mines a block on top of `prev_hash`. Blocks until the puzzle is solved.
    pub fn new(
        payload: impl Into<Vec<u8>>,
        prev_hash: impl Into<Vec<u8>>,
        pow: &ProofOfWork,
    ) -> Result<Self> {
        Self::mine_at(Utc::now().timestamp(), payload.into(), prev_hash.into(), pow)
    }

    pub fn new_genesis(payload: impl Into<Vec<u8>>, pow: &ProofOfWork) -> Result<Self> {
        Self::new(payload, Vec::<u8>::new(), pow)
    }

    /// Mines a block with an explicit timestamp.
    pub fn mine_at(
        timestamp: i64,
        payload: Vec<u8>,
        prev_hash: Vec<u8>,
        pow: &ProofOfWork,
    ) -> Result<Self> {
        let puzzle = Puzzle::prepare(&BlockFields {
            timestamp,
            payload: &payload,
            prev_hash: &prev_hash,
        });
        let (nonce, hash) = pow.run(&puzzle)?;
        Ok(Self {
            timestamp,
            payload,
            prev_hash,
            nonce,
            hash: hash.to_vec(),
        })
    }

    pub fn fields(&self) -> BlockFields<'_> {
        BlockFields {
            timestamp: self.timestamp,
            payload: &self.payload,
            prev_hash: &self.prev_hash,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    /// Re-derives the hash from the stored fields and checks it against the target.
    pub fn validate(&self, pow: &ProofOfWork) -> bool {
        pow.validate(&self.fields(), self.nonce, &self.hash)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        codec().serialize(self).map_err(ChainError::Encode)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        codec().deserialize(bytes).map_err(ChainError::Decode)
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pow() -> ProofOfWork {
        ProofOfWork::new(8).unwrap()
    }

    #[test]
    fn genesis_has_empty_prev_hash() {
        let b = Block::new_genesis("G", &pow()).unwrap();
        assert!(b.is_genesis());
        assert_eq!(b.hash.len(), 32);
        assert!(b.validate(&pow()));
    }

    #[test]
    fn mined_block_links_to_prev() {
        let g = Block::new_genesis("G", &pow()).unwrap();
        let b = Block::new("A", g.hash.clone(), &pow()).unwrap();
        assert!(!b.is_genesis());
        assert_eq!(b.prev_hash, g.hash);
        assert!(b.validate(&pow()));
    }

    #[test]
    fn serialize_round_trips() {
        let b = Block::new(b"payload".to_vec(), vec![7u8; 32], &pow()).unwrap();
        let bytes = b.serialize().unwrap();
        assert_eq!(Block::deserialize(&bytes).unwrap(), b);
    }

    #[test]
    fn deserialize_rejects_malformed_bytes() {
        let b = Block::new_genesis("G", &pow()).unwrap();
        let bytes = b.serialize().unwrap();

        assert!(matches!(Block::deserialize(&[]), Err(ChainError::Decode(_))));
        assert!(matches!(
            Block::deserialize(&bytes[..bytes.len() - 1]),
            Err(ChainError::Decode(_))
        ));

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(matches!(Block::deserialize(&trailing), Err(ChainError::Decode(_))));
    }

    #[test]
    fn tampered_payload_fails_validation() {
        let mut b = Block::new("A", vec![1u8; 32], &pow()).unwrap();
        b.payload[0] ^= 0xff;
        assert!(!b.validate(&pow()));
    }

    #[test]
    fn tampered_timestamp_fails_validation() {
        let mut b = Block::mine_at(1_000, b"A".to_vec(), vec![1u8; 32], &pow()).unwrap();
        b.timestamp += 1;
        assert!(!b.validate(&pow()));
    }
}
