use super::{EventFilter, LedgerClient, LogStream};
use crate::abi;
use crate::chain::HashChain;
use crate::config::TopicTable;
use crate::error::{FairSlotError, Result};
use crate::settlement;
use crate::types::{Address, Digest, EventKind, LogEntry, TxId};
use crate::CHAIN_COUNT;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct PendingRound {
    bet: u128,
    lines: u32,
    banker_reveal: Option<Digest>,
}

#[derive(Debug)]
struct SlotContract {
    owner: Address,
    occupant: Option<Address>,
    player_commitments: Option<[Digest; CHAIN_COUNT]>,
    banker_commitments: Option<[Digest; CHAIN_COUNT]>,
    pending: HashMap<usize, PendingRound>,
    deposited: u128,
    paid_out: u128,
}

impl SlotContract {
    fn vacate(&mut self) {
        self.occupant = None;
        self.player_commitments = None;
        self.banker_commitments = None;
        self.pending.clear();
    }
}

/// In-process stand-in for the slot contract and its event feed.
///
/// Enforces the same commitment rules the contract does, so a party that
/// reveals a value not opening its commitment is rejected here as well.
pub struct MemoryLedger {
    topics: TopicTable,
    scale: u32,
    contracts: Mutex<HashMap<Address, SlotContract>>,
    events: broadcast::Sender<LogEntry>,
    duplicate_delivery: AtomicBool,
    offline: AtomicBool,
}

impl MemoryLedger {
    pub fn new(topics: TopicTable, scale: u32) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            topics,
            scale,
            contracts: Mutex::new(HashMap::new()),
            events,
            duplicate_delivery: AtomicBool::new(false),
            offline: AtomicBool::new(false),
        })
    }

    /// Deploy a slot contract owned by `owner` and return its address.
    pub fn deploy(&self, owner: Address) -> Address {
        let address = Address::random();
        self.contracts.lock().insert(
            address,
            SlotContract {
                owner,
                occupant: None,
                player_commitments: None,
                banker_commitments: None,
                pending: HashMap::new(),
                deposited: 0,
                paid_out: 0,
            },
        );
        tracing::info!("Deployed slot contract {} for owner {}", address, owner);
        address
    }

    pub fn client(self: &Arc<Self>, account: Address) -> MemoryClient {
        MemoryClient {
            ledger: self.clone(),
            account,
        }
    }

    /// Deliver every event twice, as an at-least-once transport may.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.duplicate_delivery.store(enabled, Ordering::SeqCst);
    }

    /// Fail every submission with a transport error while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Total minor units paid out by a contract.
    pub fn paid_out(&self, contract: &Address) -> Option<u128> {
        self.contracts.lock().get(contract).map(|c| c.paid_out)
    }

    /// Total minor units players deposited when occupying a contract.
    pub fn deposited(&self, contract: &Address) -> Option<u128> {
        self.contracts.lock().get(contract).map(|c| c.deposited)
    }

    pub fn log_entry(&self, contract: Address, kind: EventKind, data: Vec<u8>) -> LogEntry {
        LogEntry {
            address: contract,
            topics: vec![self.topics.topic_for(kind)],
            data,
            transaction_id: TxId::new(format!("0x{}", Uuid::new_v4().simple())),
        }
    }

    fn publish(&self, entries: Vec<LogEntry>) {
        let copies = if self.duplicate_delivery.load(Ordering::SeqCst) {
            2
        } else {
            1
        };
        for entry in entries {
            for _ in 0..copies {
                // no subscribers is fine
                let _ = self.events.send(entry.clone());
            }
        }
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(FairSlotError::transport("ledger unreachable"));
        }
        Ok(())
    }

    fn with_contract<R>(
        &self,
        contract: &Address,
        f: impl FnOnce(&mut SlotContract) -> Result<R>,
    ) -> Result<R> {
        self.ensure_online()?;
        let mut contracts = self.contracts.lock();
        let slot = contracts
            .get_mut(contract)
            .ok_or_else(|| FairSlotError::transport(format!("No contract at {}", contract)))?;
        f(slot)
    }

    fn payout(&self, bet: u128, lines: u32, banker: &Digest, player: &Digest) -> u128 {
        let mut mixed = [0u8; 32];
        for (i, byte) in mixed.iter_mut().enumerate() {
            *byte = banker.0[i] ^ player.0[i];
        }
        let outcome = HashChain::hash(&mixed);
        let multiplier = match outcome.0[0] % 16 {
            0 => 10,
            1..=3 => 2,
            _ => 0,
        };
        bet.saturating_mul(lines as u128).saturating_mul(multiplier)
    }
}

/// [`LedgerClient`] handle signing as one account on a [`MemoryLedger`].
#[derive(Clone)]
pub struct MemoryClient {
    ledger: Arc<MemoryLedger>,
    account: Address,
}

fn rejected(msg: impl std::fmt::Display) -> FairSlotError {
    FairSlotError::transport(format!("ledger rejected transaction: {}", msg))
}

#[async_trait]
impl LedgerClient for MemoryClient {
    fn account(&self) -> Address {
        self.account
    }

    async fn submit_occupy(
        &self,
        address: &Address,
        commitments: [Digest; CHAIN_COUNT],
        deposit: Decimal,
    ) -> Result<TxId> {
        let deposit = settlement::to_minor_units(deposit, self.ledger.scale)?;
        let account = self.account;
        let entry = self.ledger.with_contract(address, |slot| {
            if account == slot.owner {
                return Err(rejected("owner cannot occupy its own slot"));
            }
            if slot.occupant.is_some() {
                return Err(rejected("slot already occupied"));
            }
            slot.occupant = Some(account);
            slot.player_commitments = Some(commitments);
            slot.deposited = slot.deposited.saturating_add(deposit);
            let mut words = vec![abi::encode_address(&account)];
            words.extend(commitments.iter().map(|d| d.0));
            Ok(self
                .ledger
                .log_entry(*address, EventKind::Occupied, abi::pack(&words)))
        })?;

        let tx = entry.transaction_id.clone();
        self.ledger.publish(vec![entry]);
        Ok(tx)
    }

    async fn submit_seed_commit(
        &self,
        address: &Address,
        commitments: [Digest; CHAIN_COUNT],
    ) -> Result<TxId> {
        let account = self.account;
        let entry = self.ledger.with_contract(address, |slot| {
            if account != slot.owner {
                return Err(rejected("only the owner initializes the banker seed"));
            }
            if slot.occupant.is_none() {
                return Err(rejected("no player to initialize for"));
            }
            if slot.banker_commitments.is_some() {
                return Err(rejected("banker seed already initialized"));
            }
            slot.banker_commitments = Some(commitments);
            let words: Vec<[u8; 32]> = commitments.iter().map(|d| d.0).collect();
            Ok(self
                .ledger
                .log_entry(*address, EventKind::BankerSeedInit, abi::pack(&words)))
        })?;

        let tx = entry.transaction_id.clone();
        self.ledger.publish(vec![entry]);
        Ok(tx)
    }

    async fn submit_seed_reveal(
        &self,
        address: &Address,
        preimage: Digest,
        chain_index: usize,
    ) -> Result<TxId> {
        if chain_index >= CHAIN_COUNT {
            return Err(rejected("chain index out of range"));
        }
        let account = self.account;
        let ledger = &self.ledger;
        let entries = ledger.with_contract(address, |slot| {
            let payload = abi::pack(&[preimage.0, abi::encode_u128(chain_index as u128)]);

            if account == slot.owner {
                let commitments = slot
                    .banker_commitments
                    .as_mut()
                    .ok_or_else(|| rejected("banker seed not initialized"))?;
                let round = slot
                    .pending
                    .get_mut(&chain_index)
                    .ok_or_else(|| rejected("no round pending on chain"))?;
                if round.banker_reveal.is_some() {
                    return Err(rejected("banker already revealed"));
                }
                if !HashChain::opens(preimage.as_bytes(), &commitments[chain_index]) {
                    return Err(rejected("banker seed does not open commitment"));
                }
                commitments[chain_index] = preimage;
                round.banker_reveal = Some(preimage);
                return Ok(vec![ledger.log_entry(
                    *address,
                    EventKind::BankerSeedSet,
                    payload,
                )]);
            }

            if slot.occupant != Some(account) {
                return Err(rejected("caller is not the seated player"));
            }
            let banker_reveal = slot
                .pending
                .get(&chain_index)
                .and_then(|r| r.banker_reveal)
                .ok_or_else(|| rejected("banker has not revealed"))?;
            let commitments = slot
                .player_commitments
                .as_mut()
                .ok_or_else(|| rejected("player seed not initialized"))?;
            if !HashChain::opens(preimage.as_bytes(), &commitments[chain_index]) {
                return Err(rejected("player seed does not open commitment"));
            }
            commitments[chain_index] = preimage;

            let round = slot
                .pending
                .remove(&chain_index)
                .ok_or_else(|| rejected("no round pending on chain"))?;
            let payout = ledger.payout(round.bet, round.lines, &banker_reveal, &preimage);
            slot.paid_out = slot.paid_out.saturating_add(payout);

            let settlement = abi::pack(&[
                abi::encode_u128(payout),
                abi::encode_u128(chain_index as u128),
            ]);
            Ok(vec![
                ledger.log_entry(*address, EventKind::PlayerSeedSet, payload),
                ledger.log_entry(*address, EventKind::Confirmed, settlement),
            ])
        })?;

        let tx = entries[0].transaction_id.clone();
        ledger.publish(entries);
        Ok(tx)
    }

    async fn submit_play(
        &self,
        address: &Address,
        bet: Decimal,
        lines: u32,
        chain_index: usize,
    ) -> Result<TxId> {
        if chain_index >= CHAIN_COUNT {
            return Err(rejected("chain index out of range"));
        }
        let bet = settlement::to_minor_units(bet, self.ledger.scale)?;
        let account = self.account;

        let entry = self.ledger.with_contract(address, |slot| {
            if slot.occupant != Some(account) {
                return Err(rejected("caller is not the seated player"));
            }
            if slot.banker_commitments.is_none() {
                return Err(rejected("banker seed not initialized"));
            }
            if slot.pending.contains_key(&chain_index) {
                return Err(rejected("round already pending on chain"));
            }
            slot.pending.insert(
                chain_index,
                PendingRound {
                    bet,
                    lines,
                    banker_reveal: None,
                },
            );
            let payload = abi::pack(&[
                abi::encode_address(&account),
                abi::encode_u128(bet),
                abi::encode_u128(lines as u128),
                abi::encode_u128(chain_index as u128),
            ]);
            Ok(self
                .ledger
                .log_entry(*address, EventKind::GameInitialized, payload))
        })?;

        let tx = entry.transaction_id.clone();
        self.ledger.publish(vec![entry]);
        Ok(tx)
    }

    async fn subscribe(&self, filter: EventFilter) -> Result<LogStream> {
        let rx = self.ledger.events.subscribe();

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(entry) => return Some((entry, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Subscription lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |entry| futures::future::ready(filter.matches(&entry.address)));

        Ok(stream.boxed())
    }

    async fn owner(&self, address: &Address) -> Result<Address> {
        self.ledger.with_contract(address, |slot| Ok(slot.owner))
    }

    async fn occupancy(&self, address: &Address) -> Result<Option<Address>> {
        self.ledger.with_contract(address, |slot| Ok(slot.occupant))
    }

    async fn evict(&self, address: &Address, acting_as: &Address) -> Result<TxId> {
        let account = self.account;
        let entry = self.ledger.with_contract(address, |slot| {
            if account != slot.owner || *acting_as != slot.owner {
                return Err(rejected("only the owner can evict"));
            }
            if slot.occupant.is_none() {
                return Err(rejected("no player to evict"));
            }
            slot.vacate();
            Ok(self
                .ledger
                .log_entry(*address, EventKind::PlayerLeft, Vec::new()))
        })?;

        let tx = entry.transaction_id.clone();
        self.ledger.publish(vec![entry]);
        Ok(tx)
    }

    async fn leave(&self, address: &Address) -> Result<TxId> {
        let account = self.account;
        let entry = self.ledger.with_contract(address, |slot| {
            if slot.occupant != Some(account) {
                return Err(rejected("caller is not the seated player"));
            }
            slot.vacate();
            Ok(self
                .ledger
                .log_entry(*address, EventKind::PlayerLeft, Vec::new()))
        })?;

        let tx = entry.transaction_id.clone();
        self.ledger.publish(vec![entry]);
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::session::ChainSlot;

    fn ledger() -> Arc<MemoryLedger> {
        let config = ProtocolConfig::with_rounds_per_chain(3);
        MemoryLedger::new(config.topic_table().unwrap(), config.unit_scale)
    }

    fn commitments(slots: &[ChainSlot; CHAIN_COUNT]) -> [Digest; CHAIN_COUNT] {
        std::array::from_fn(|i| slots[i].commitment().unwrap())
    }

    #[tokio::test]
    async fn test_contract_round_emits_events() {
        let ledger = ledger();
        let owner = Address::random();
        let player = Address::random();
        let contract = ledger.deploy(owner);
        let banker_client = ledger.client(owner);
        let player_client = ledger.client(player);

        let mut stream = player_client
            .subscribe(EventFilter::for_addresses([contract]))
            .await
            .unwrap();

        let mut player_chains: [ChainSlot; CHAIN_COUNT] = std::array::from_fn(|_| ChainSlot::fresh(4));
        let mut banker_chains: [ChainSlot; CHAIN_COUNT] = std::array::from_fn(|_| ChainSlot::fresh(4));

        assert!(player_client
            .submit_seed_commit(&contract, commitments(&player_chains))
            .await
            .is_err());
        assert!(banker_client
            .submit_occupy(&contract, commitments(&banker_chains), Decimal::ZERO)
            .await
            .is_err());
        player_client
            .submit_occupy(&contract, commitments(&player_chains), Decimal::new(5, 1))
            .await
            .unwrap();
        assert_eq!(ledger.deposited(&contract), Some(500_000_000_000_000_000));
        assert_eq!(banker_client.owner(&contract).await.unwrap(), owner);
        banker_client
            .submit_seed_commit(&contract, commitments(&banker_chains))
            .await
            .unwrap();
        player_client
            .submit_play(&contract, Decimal::new(1, 2), 3, 0)
            .await
            .unwrap();

        let bad = Digest([1u8; 32]);
        assert!(banker_client.submit_seed_reveal(&contract, bad, 0).await.is_err());

        let banker_reveal = banker_chains[0].reveal_next(0).unwrap();
        banker_client
            .submit_seed_reveal(&contract, banker_reveal, 0)
            .await
            .unwrap();
        let player_reveal = player_chains[0].reveal_next(0).unwrap();
        player_client
            .submit_seed_reveal(&contract, player_reveal, 0)
            .await
            .unwrap();

        let table = ProtocolConfig::default().topic_table().unwrap();
        let mut kinds = Vec::new();
        for _ in 0..6 {
            let entry = stream.next().await.unwrap();
            kinds.push(table.kind_of(&entry.topics[0]).unwrap());
        }
        assert_eq!(
            kinds,
            vec![
                EventKind::Occupied,
                EventKind::BankerSeedInit,
                EventKind::GameInitialized,
                EventKind::BankerSeedSet,
                EventKind::PlayerSeedSet,
                EventKind::Confirmed,
            ]
        );
    }

    #[tokio::test]
    async fn test_evict_and_offline() {
        let ledger = ledger();
        let owner = Address::random();
        let player = Address::random();
        let contract = ledger.deploy(owner);
        let chains: [ChainSlot; CHAIN_COUNT] = std::array::from_fn(|_| ChainSlot::fresh(4));

        ledger
            .client(player)
            .submit_occupy(&contract, commitments(&chains), Decimal::ONE)
            .await
            .unwrap();
        assert!(ledger
            .client(Address::random())
            .submit_occupy(&contract, commitments(&chains), Decimal::ONE)
            .await
            .is_err());
        assert_eq!(
            ledger.client(owner).occupancy(&contract).await.unwrap(),
            Some(player)
        );

        assert!(ledger.client(player).evict(&contract, &owner).await.is_err());
        ledger.client(owner).evict(&contract, &owner).await.unwrap();
        assert_eq!(ledger.client(owner).occupancy(&contract).await.unwrap(), None);

        ledger.set_offline(true);
        assert!(matches!(
            ledger.client(owner).occupancy(&contract).await,
            Err(FairSlotError::Transport(_))
        ));
    }
}
