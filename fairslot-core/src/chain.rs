use crate::error::{FairSlotError, Result};
use crate::types::Digest;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest as _, Keccak256};
use std::fmt;

/// Hash-chain primitive shared by both roles.
pub struct HashChain;

impl HashChain {
    /// One application of the chain hash.
    pub fn hash(input: &[u8]) -> Digest {
        let mut hasher = Keccak256::new();
        hasher.update(input);
        Digest(hasher.finalize().into())
    }

    /// Apply the hash `depth` times starting from `seed`.
    pub fn derive(seed: &[u8], depth: u32) -> Result<Digest> {
        if depth == 0 {
            return Err(FairSlotError::ChainExhausted { chain_index: 0 });
        }

        let mut value = Self::hash(seed);
        for _ in 1..depth {
            value = Self::hash(value.as_bytes());
        }
        Ok(value)
    }

    /// True when `preimage` hashes exactly to `commitment`.
    pub fn opens(preimage: &[u8], commitment: &Digest) -> bool {
        Self::hash(preimage) == *commitment
    }
}

/// Locally generated chain secret. Never leaves the owning party.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed([u8; 32]);

impl Seed {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(..)")
    }
}
