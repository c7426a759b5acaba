//! Proof-of-work puzzle: construction, nonce search and validation.
//!
//! A block's committed fields are hashed together with a nonce using SHA-256.
//! The puzzle is solved once the digest, read as a big-endian 256-bit integer,
//! is strictly below `2^(256 - difficulty)`.

use sha2::{Digest, Sha256};

use crate::error::{ChainError, Result};

/// Width of the SHA-256 digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Width of the SHA-256 digest in bits.
pub const DIGEST_BITS: u32 = 256;

/// Difficulty used when nothing else is configured.
pub const DEFAULT_DIFFICULTY: u32 = 16;

/// The threshold a block hash must fall below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    difficulty: u32,
    bytes: [u8; DIGEST_LEN],
}

impl Target {
    /// Builds `2^(256 - difficulty)` as a big-endian byte string.
    pub fn from_difficulty(difficulty: u32) -> Result<Self> {
        if difficulty == 0 || difficulty >= DIGEST_BITS {
            return Err(ChainError::Config(format!(
                "difficulty must be in 1..{DIGEST_BITS}, got {difficulty}"
            )));
        }
        let bit = (DIGEST_BITS - difficulty) as usize;
        let mut bytes = [0u8; DIGEST_LEN];
        bytes[DIGEST_LEN - 1 - bit / 8] = 1 << (bit % 8);
        Ok(Self { difficulty, bytes })
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.bytes
    }

    /// Big-endian comparison; equal-width byte strings order like the integers they encode.
    pub fn is_met_by(&self, hash: &[u8]) -> bool {
        hash.len() == DIGEST_LEN && hash < &self.bytes[..]
    }
}

/// The block fields committed to by the proof of work (everything except nonce and hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFields<'a> {
    pub timestamp: i64,
    pub payload: &'a [u8],
    pub prev_hash: &'a [u8],
}

/// Canonical hash input: timestamp, then length-prefixed payload and
/// predecessor hash, then the nonce. All integers are big-endian.
pub fn serialize_for_pow(fields: &BlockFields<'_>, nonce: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + fields.payload.len() + fields.prev_hash.len());
    write_prefix(&mut buf, fields);
    buf.extend_from_slice(&nonce.to_be_bytes());
    buf
}

fn write_prefix(buf: &mut Vec<u8>, fields: &BlockFields<'_>) {
    buf.extend_from_slice(&fields.timestamp.to_be_bytes());
    buf.extend_from_slice(&(fields.payload.len() as u64).to_be_bytes());
    buf.extend_from_slice(fields.payload);
    buf.extend_from_slice(&(fields.prev_hash.len() as u64).to_be_bytes());
    buf.extend_from_slice(fields.prev_hash);
}

/// A prepared puzzle instance for one set of block fields.
///
/// The hasher state over the nonce-independent prefix is computed once, so each
/// candidate only costs hashing the eight nonce bytes plus finalization.
#[derive(Clone)]
pub struct Puzzle {
    prefix_state: Sha256,
}

impl Puzzle {
    pub fn prepare(fields: &BlockFields<'_>) -> Self {
        let mut prefix = Vec::new();
        write_prefix(&mut prefix, fields);
        let mut prefix_state = Sha256::new();
        prefix_state.update(&prefix);
        Self { prefix_state }
    }

    /// Digest of the puzzle at `nonce`.
    pub fn digest(&self, nonce: u64) -> [u8; DIGEST_LEN] {
        self.prefix_state
            .clone()
            .chain_update(nonce.to_be_bytes())
            .finalize()
            .into()
    }
}

/// Proof-of-work engine bound to a fixed target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofOfWork {
    target: Target,
    max_nonce: u64,
}

impl ProofOfWork {
    pub fn new(difficulty: u32) -> Result<Self> {
        Ok(Self {
            target: Target::from_difficulty(difficulty)?,
            max_nonce: u64::MAX,
        })
    }

    /// Caps the nonce search at `max_nonce` (inclusive).
    pub fn with_max_nonce(mut self, max_nonce: u64) -> Self {
        self.max_nonce = max_nonce;
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn difficulty(&self) -> u32 {
        self.target.difficulty()
    }

    pub fn max_nonce(&self) -> u64 {
        self.max_nonce
    }

    /// Searches nonces `0, 1, 2, ...` in order and returns the first that meets the target.
    pub fn run(&self, puzzle: &Puzzle) -> Result<(u64, [u8; DIGEST_LEN])> {
        (0..=self.max_nonce)
            .map(|nonce| (nonce, puzzle.digest(nonce)))
            .find(|(_, hash)| self.target.is_met_by(hash))
            .ok_or(ChainError::PuzzleExhausted {
                max_nonce: self.max_nonce,
                difficulty: self.difficulty(),
            })
    }

    /// Recomputes the digest from `fields` and `nonce` and checks it against
    /// both `claimed_hash` and the target.
    pub fn validate(&self, fields: &BlockFields<'_>, nonce: u64, claimed_hash: &[u8]) -> bool {
        let recomputed: [u8; DIGEST_LEN] = Sha256::digest(serialize_for_pow(fields, nonce)).into();
        recomputed[..] == *claimed_hash && self.target.is_met_by(claimed_hash)
    }
}
