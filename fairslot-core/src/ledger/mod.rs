pub mod memory;

pub use memory::{MemoryClient, MemoryLedger};

use crate::error::Result;
use crate::types::{Address, Digest, LogEntry, TxId};
use crate::CHAIN_COUNT;
use async_trait::async_trait;
use futures::stream::BoxStream;
use rust_decimal::Decimal;

pub type LogStream = BoxStream<'static, LogEntry>;

/// Which contract addresses a subscription delivers. Empty means all.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub addresses: Vec<Address>,
}

impl EventFilter {
    pub fn for_addresses(addresses: impl IntoIterator<Item = Address>) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
        }
    }

    pub fn matches(&self, address: &Address) -> bool {
        self.addresses.is_empty() || self.addresses.contains(address)
    }
}

/// Ledger access as seen by one acting account. Every call is a request to
/// the ledger; its effect is observed later through the subscription.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Account this client signs as.
    fn account(&self) -> Address;

    /// Take the seat with the player's initial commitments, paying
    /// `deposit` into the contract.
    async fn submit_occupy(
        &self,
        address: &Address,
        commitments: [Digest; CHAIN_COUNT],
        deposit: Decimal,
    ) -> Result<TxId>;

    /// Publish the maker's initial commitments for the seated player.
    async fn submit_seed_commit(
        &self,
        address: &Address,
        commitments: [Digest; CHAIN_COUNT],
    ) -> Result<TxId>;

    async fn submit_seed_reveal(
        &self,
        address: &Address,
        preimage: Digest,
        chain_index: usize,
    ) -> Result<TxId>;

    async fn submit_play(
        &self,
        address: &Address,
        bet: Decimal,
        lines: u32,
        chain_index: usize,
    ) -> Result<TxId>;

    async fn subscribe(&self, filter: EventFilter) -> Result<LogStream>;

    /// Account that owns (and funds) the contract.
    async fn owner(&self, address: &Address) -> Result<Address>;

    /// Player currently seated at the contract, if any.
    async fn occupancy(&self, address: &Address) -> Result<Option<Address>>;

    async fn evict(&self, address: &Address, acting_as: &Address) -> Result<TxId>;

    /// Release the seat held by this client's account.
    async fn leave(&self, address: &Address) -> Result<TxId>;
}
