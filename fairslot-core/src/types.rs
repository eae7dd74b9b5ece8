use crate::error::{FairSlotError, Result};
use crate::settlement::Settlement;
use crate::CHAIN_COUNT;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 20-byte ledger account or contract address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn random() -> Self {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for Address {
    type Err = FairSlotError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| FairSlotError::decode(format!("Invalid address hex: {}", e)))?;
        let bytes: [u8; 20] = raw
            .try_into()
            .map_err(|_| FairSlotError::decode("Address must be 20 bytes"))?;
        Ok(Self(bytes))
    }
}

/// 32-byte hash value: a chain commitment, a revealed preimage or a topic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub const ZERO: Digest = Digest([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FairSlotError::decode(format!("Digest must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| FairSlotError::decode(format!("Invalid digest hex: {}", e)))?;
        Self::from_slice(&raw)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

/// Ledger transaction identifier, opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub String);

impl TxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Player,
    Maker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Player => f.write_str("player"),
            Role::Maker => f.write_str("maker"),
        }
    }
}

/// Raw notification as delivered by the ledger subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<Digest>,
    pub data: Vec<u8>,
    pub transaction_id: TxId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    Occupied,
    BankerSeedInit,
    GameInitialized,
    BankerSeedSet,
    PlayerSeedSet,
    Confirmed,
    PlayerLeft,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Decoded event body, one variant per event kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Occupied {
        player: Address,
        commitments: [Digest; CHAIN_COUNT],
    },
    BankerSeedInit {
        commitments: [Digest; CHAIN_COUNT],
    },
    GameInitialized {
        player: Address,
        bet: u128,
        lines: u32,
        chain_index: usize,
    },
    SeedSet {
        preimage: Digest,
        chain_index: usize,
    },
    Confirmed(Settlement),
    PlayerLeft,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub address: Address,
    pub kind: EventKind,
    pub transaction_id: TxId,
    pub payload: EventPayload,
}

impl Event {
    /// Chain index carried by the payload, if the event kind has one.
    pub fn chain_index(&self) -> Option<usize> {
        match &self.payload {
            EventPayload::GameInitialized { chain_index, .. }
            | EventPayload::SeedSet { chain_index, .. } => Some(*chain_index),
            EventPayload::Confirmed(settlement) => Some(settlement.chain_index),
            _ => None,
        }
    }
}
