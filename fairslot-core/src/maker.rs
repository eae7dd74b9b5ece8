use crate::config::{ProtocolConfig, TopicTable};
use crate::error::{FairSlotError, Result};
use crate::ledger::{EventFilter, LedgerClient};
use crate::router::{self, EventHandler, RouterHandle};
use crate::session::{Command, Phase, RoundResult, Session, Step};
use crate::storage::SessionStore;
use crate::types::{Address, Event, EventKind, EventPayload, Role};
use async_trait::async_trait;
use std::sync::Arc;

/// Where the maker reports things an operator should know about.
pub trait OperatorSink: Send + Sync {
    fn evicted(&self, address: &Address, player: &Address);

    fn eviction_failed(&self, address: &Address, error: &FairSlotError);

    fn aborted(&self, address: &Address, error: &FairSlotError);
}

/// Default sink: operator notices go to the log.
pub struct LogSink;

impl OperatorSink for LogSink {
    fn evicted(&self, address: &Address, player: &Address) {
        tracing::warn!("Evicted idle player {} from {}", player, address);
    }

    fn eviction_failed(&self, address: &Address, error: &FairSlotError) {
        tracing::error!("Failed to evict idle player from {}: {}", address, error);
    }

    fn aborted(&self, address: &Address, error: &FairSlotError) {
        tracing::error!("Maker session {} aborted: {}", address, error);
    }
}

/// Maker reaction to one admitted event.
pub fn transition(session: &mut Session, event: &Event) -> Result<Step<()>> {
    let address = session.address;

    match &event.payload {
        EventPayload::Occupied {
            player,
            commitments,
        } => {
            if !session.is_fresh() {
                return Err(FairSlotError::invalid_state(format!(
                    "Session {} has used chains, cannot serve a new player",
                    address
                )));
            }
            for (chain_index, commitment) in commitments.iter().enumerate() {
                if commitment.is_zero() {
                    return Err(FairSlotError::fairness(
                        chain_index,
                        "player committed to zero",
                    ));
                }
            }

            for (slot, commitment) in session.chains.iter_mut().zip(commitments.iter()) {
                slot.set_counterpart(*commitment);
            }
            session.counterparty = Some(*player);
            session.phase = Phase::Serving;
            session.recently_active = true;

            tracing::info!("Player {} seated at {}, publishing commitments", player, address);
            Ok(Step::ignore().command(Command::CommitSeeds(session.commitments()?)))
        }

        EventPayload::GameInitialized {
            player,
            bet,
            lines,
            chain_index,
        } => {
            let chain_index = *chain_index;
            if session.phase != Phase::Serving {
                tracing::debug!("Ignoring play on {} in {:?}", address, session.phase);
                return Ok(Step::ignore());
            }
            if session.counterparty != Some(*player) {
                tracing::warn!("Play on {} from unseated account {}", address, player);
                return Ok(Step::ignore());
            }
            if session.chains[chain_index].counterpart().is_none() {
                return Err(FairSlotError::MissingCommitment { chain_index });
            }
            if session.chains[chain_index].awaiting_counterpart() {
                tracing::debug!(
                    "Chain {} at {} still waits for the player's reveal, not advancing",
                    chain_index,
                    address
                );
                return Ok(Step::ignore());
            }

            let preimage = session.chains[chain_index].reveal_next(chain_index)?;
            session.chains[chain_index].set_awaiting_counterpart();
            session.recently_active = true;

            tracing::info!(
                "Revealing on chain {} at {} for bet {} x {} lines",
                chain_index,
                address,
                bet,
                lines
            );
            Ok(Step::ignore().command(Command::RevealSeed {
                preimage,
                chain_index,
            }))
        }

        EventPayload::SeedSet {
            preimage,
            chain_index,
        } if event.kind == EventKind::PlayerSeedSet => {
            if !session.chains[*chain_index].awaiting_counterpart() {
                tracing::debug!(
                    "Ignoring player reveal on chain {} at {}, no maker reveal outstanding",
                    chain_index,
                    address
                );
                return Ok(Step::ignore());
            }
            session.chains[*chain_index].accept_counterpart(*chain_index, *preimage)?;
            session.recently_active = true;
            tracing::debug!("Player reveal verified on chain {} at {}", chain_index, address);
            Ok(Step::ignore())
        }

        EventPayload::Confirmed(settlement) => {
            session.recently_active = true;
            session.last_result = Some(RoundResult {
                chain_index: settlement.chain_index,
                payout: settlement.payout,
            });
            tracing::info!(
                "Round on chain {} at {} paid {}",
                settlement.chain_index,
                address,
                settlement.payout
            );
            Ok(Step::ignore())
        }

        EventPayload::PlayerLeft => {
            session.reset();
            tracing::info!("Player left {}, session reinitialized", address);
            Ok(Step::ignore())
        }

        _ => Ok(Step::ignore()),
    }
}

/// Maker side: serves every watched contract from one subscription and
/// evicts idle players.
pub struct MakerProtocol {
    config: ProtocolConfig,
    table: TopicTable,
    store: Arc<SessionStore>,
    ledger: Arc<dyn LedgerClient>,
    sink: Arc<dyn OperatorSink>,
}

impl MakerProtocol {
    pub fn new(
        config: ProtocolConfig,
        store: Arc<SessionStore>,
        ledger: Arc<dyn LedgerClient>,
    ) -> Result<Arc<Self>> {
        Self::with_sink(config, store, ledger, Arc::new(LogSink))
    }

    pub fn with_sink(
        config: ProtocolConfig,
        store: Arc<SessionStore>,
        ledger: Arc<dyn LedgerClient>,
        sink: Arc<dyn OperatorSink>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let table = config.topic_table()?;
        Ok(Arc::new(Self {
            config,
            table,
            store,
            ledger,
            sink,
        }))
    }

    /// Create sessions for `addresses` and start serving them.
    pub async fn watch(
        self: &Arc<Self>,
        addresses: impl IntoIterator<Item = Address>,
    ) -> Result<RouterHandle> {
        let mut count = 0;
        for address in addresses {
            self.store.create(address, Role::Maker).await?;
            count += 1;
        }
        tracing::info!("Maker watching {} contracts", count);

        let handler: Arc<dyn EventHandler> = self.clone();
        router::spawn(
            handler,
            self.ledger.as_ref(),
            EventFilter::default(),
            self.table.clone(),
            self.config.unit_scale,
            Some(self.config.idle_interval),
        )
        .await
    }

    pub async fn session(&self, address: &Address) -> Result<Session> {
        self.store.get(address).await
    }

    /// One idle pass over every maker session. Returns the number of
    /// players evicted.
    pub async fn sweep(&self) -> usize {
        let mut evicted = 0;

        for address in self.store.addresses() {
            let session = match self.store.get(&address).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::debug!("Skipping {} in sweep: {}", address, e);
                    continue;
                }
            };
            if session.role != Role::Maker {
                continue;
            }

            if !session.recently_active {
                match self.ledger.occupancy(&address).await {
                    Ok(Some(player)) if player != self.ledger.account() => {
                        match self.ledger.evict(&address, &self.ledger.account()).await {
                            Ok(tx) => {
                                tracing::debug!("Eviction from {} submitted in {}", address, tx);
                                self.sink.evicted(&address, &player);
                                evicted += 1;
                            }
                            Err(e) => self.sink.eviction_failed(&address, &e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Occupancy query for {} failed: {}", address, e);
                    }
                }
            }

            let cleared = self
                .store
                .mutate(&address, |session| {
                    session.recently_active = false;
                    Ok(())
                })
                .await;
            if let Err(e) = cleared {
                tracing::warn!("Could not clear activity flag for {}: {}", address, e);
            }
        }

        evicted
    }
}

#[async_trait]
impl EventHandler for MakerProtocol {
    fn watches(&self, address: &Address) -> bool {
        self.store.contains(address)
    }

    async fn on_event(&self, event: Event) {
        let address = event.address;
        match router::drive(&self.store, self.ledger.as_ref(), &event, transition).await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => self.sink.aborted(&address, &e),
            Err(e) => tracing::warn!("{} for {} not applied: {}", event.kind, address, e),
        }
    }

    async fn on_tick(&self) {
        let evicted = self.sweep().await;
        tracing::debug!("Idle sweep done, {} evicted", evicted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LogStream;
    use crate::session::ChainSlot;
    use crate::types::{Digest, LogEntry, TxId};
    use crate::CHAIN_COUNT;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    #[derive(Default)]
    struct MockLedger {
        occupant: Mutex<Option<Address>>,
        fail_evict: bool,
        evictions: Mutex<Vec<Address>>,
        occupancy_queries: Mutex<usize>,
    }

    #[async_trait]
    impl LedgerClient for MockLedger {
        fn account(&self) -> Address {
            Address([0xaa; 20])
        }

        async fn submit_occupy(
            &self,
            _: &Address,
            _: [Digest; CHAIN_COUNT],
            _: Decimal,
        ) -> Result<TxId> {
            Ok(TxId::new("0xoccupy"))
        }

        async fn submit_seed_commit(&self, _: &Address, _: [Digest; CHAIN_COUNT]) -> Result<TxId> {
            Ok(TxId::new("0xcommit"))
        }

        async fn submit_seed_reveal(&self, _: &Address, _: Digest, _: usize) -> Result<TxId> {
            Ok(TxId::new("0xreveal"))
        }

        async fn submit_play(&self, _: &Address, _: Decimal, _: u32, _: usize) -> Result<TxId> {
            Ok(TxId::new("0xplay"))
        }

        async fn subscribe(&self, _: EventFilter) -> Result<LogStream> {
            Ok(futures::stream::empty::<LogEntry>().boxed())
        }

        async fn owner(&self, _: &Address) -> Result<Address> {
            Ok(self.account())
        }

        async fn occupancy(&self, _: &Address) -> Result<Option<Address>> {
            *self.occupancy_queries.lock() += 1;
            Ok(*self.occupant.lock())
        }

        async fn evict(&self, address: &Address, acting_as: &Address) -> Result<TxId> {
            assert_eq!(*acting_as, self.account());
            self.evictions.lock().push(*address);
            if self.fail_evict {
                return Err(FairSlotError::transport("evict rejected"));
            }
            Ok(TxId::new("0xevict"))
        }

        async fn leave(&self, _: &Address) -> Result<TxId> {
            Ok(TxId::new("0xleave"))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        evicted: Mutex<Vec<Address>>,
        failures: Mutex<usize>,
    }

    impl OperatorSink for RecordingSink {
        fn evicted(&self, address: &Address, _player: &Address) {
            self.evicted.lock().push(*address);
        }

        fn eviction_failed(&self, _address: &Address, _error: &FairSlotError) {
            *self.failures.lock() += 1;
        }

        fn aborted(&self, _address: &Address, _error: &FairSlotError) {}
    }

    async fn maker(
        ledger: Arc<MockLedger>,
        sink: Arc<RecordingSink>,
    ) -> (Arc<MakerProtocol>, Address) {
        let store = Arc::new(SessionStore::in_memory(3));
        let address = Address::random();
        store.create(address, Role::Maker).await.unwrap();
        let protocol = MakerProtocol::with_sink(
            ProtocolConfig::with_rounds_per_chain(3),
            store,
            ledger,
            sink,
        )
        .unwrap();
        (protocol, address)
    }

    fn event(kind: EventKind, payload: EventPayload) -> Event {
        Event {
            address: Address([1u8; 20]),
            kind,
            transaction_id: TxId::new("0x1"),
            payload,
        }
    }

    #[tokio::test]
    async fn test_idle_player_evicted_once_per_interval() {
        let ledger = Arc::new(MockLedger::default());
        *ledger.occupant.lock() = Some(Address::random());
        let sink = Arc::new(RecordingSink::default());
        let (protocol, address) = maker(ledger.clone(), sink.clone()).await;

        assert_eq!(protocol.sweep().await, 1);
        assert_eq!(*ledger.evictions.lock(), vec![address]);
        assert_eq!(*sink.evicted.lock(), vec![address]);

        protocol
            .store
            .mutate(&address, |session| {
                session.recently_active = true;
                Ok(())
            })
            .await
            .unwrap();

        // active in the last interval: no query, flag cleared
        assert_eq!(protocol.sweep().await, 0);
        assert_eq!(*ledger.occupancy_queries.lock(), 1);
        assert!(!protocol.session(&address).await.unwrap().recently_active);
    }

    #[tokio::test]
    async fn test_empty_seat_not_evicted() {
        let ledger = Arc::new(MockLedger::default());
        let sink = Arc::new(RecordingSink::default());
        let (protocol, _) = maker(ledger.clone(), sink).await;

        assert_eq!(protocol.sweep().await, 0);
        assert!(ledger.evictions.lock().is_empty());
    }

    #[tokio::test]
    async fn test_own_account_in_seat_not_evicted() {
        let ledger = Arc::new(MockLedger::default());
        *ledger.occupant.lock() = Some(ledger.account());
        let sink = Arc::new(RecordingSink::default());
        let (protocol, _) = maker(ledger.clone(), sink.clone()).await;

        assert_eq!(protocol.sweep().await, 0);
        assert_eq!(*ledger.occupancy_queries.lock(), 1);
        assert!(ledger.evictions.lock().is_empty());
        assert!(sink.evicted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_flag_cleared_when_evict_fails() {
        let ledger = Arc::new(MockLedger {
            fail_evict: true,
            ..MockLedger::default()
        });
        *ledger.occupant.lock() = Some(Address::random());
        let sink = Arc::new(RecordingSink::default());
        let (protocol, address) = maker(ledger.clone(), sink.clone()).await;

        protocol
            .store
            .mutate(&address, |session| {
                session.recently_active = true;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(protocol.sweep().await, 0);
        assert!(!protocol.session(&address).await.unwrap().recently_active);

        assert_eq!(protocol.sweep().await, 0);
        assert_eq!(ledger.evictions.lock().len(), 1);
        assert_eq!(*sink.failures.lock(), 1);
    }

    #[test]
    fn test_occupied_publishes_commitments() {
        let mut session = Session::new(Address([1u8; 20]), Role::Maker, 3);
        let player = Address([2u8; 20]);
        let player_chains: [ChainSlot; CHAIN_COUNT] = std::array::from_fn(|_| ChainSlot::fresh(4));
        let commitments = std::array::from_fn(|i| player_chains[i].commitment().unwrap());

        let step = transition(
            &mut session,
            &event(
                EventKind::Occupied,
                EventPayload::Occupied {
                    player,
                    commitments,
                },
            ),
        )
        .unwrap();

        assert_eq!(
            step.commands,
            vec![Command::CommitSeeds(session.commitments().unwrap())]
        );
        assert_eq!(session.phase, Phase::Serving);
        assert_eq!(session.counterparty, Some(player));
        assert!(session.recently_active);
    }

    #[test]
    fn test_play_reveals_and_tampered_player_reveal_is_fatal() {
        let mut session = Session::new(Address([1u8; 20]), Role::Maker, 3);
        let player = Address([2u8; 20]);
        let player_chains: [ChainSlot; CHAIN_COUNT] = std::array::from_fn(|_| ChainSlot::fresh(4));
        let commitments = std::array::from_fn(|i| player_chains[i].commitment().unwrap());
        transition(
            &mut session,
            &event(
                EventKind::Occupied,
                EventPayload::Occupied {
                    player,
                    commitments,
                },
            ),
        )
        .unwrap();
        let own = session.chains[2].commitment().unwrap();

        let step = transition(
            &mut session,
            &event(
                EventKind::GameInitialized,
                EventPayload::GameInitialized {
                    player,
                    bet: 10,
                    lines: 1,
                    chain_index: 2,
                },
            ),
        )
        .unwrap();
        let Command::RevealSeed { preimage, .. } = &step.commands[0] else {
            panic!("expected a reveal");
        };
        assert!(crate::chain::HashChain::opens(preimage.as_bytes(), &own));
        assert_eq!(session.chains[2].depth(), 3);

        let result = transition(
            &mut session,
            &event(
                EventKind::PlayerSeedSet,
                EventPayload::SeedSet {
                    preimage: Digest([3u8; 32]),
                    chain_index: 2,
                },
            ),
        );
        assert!(matches!(
            result,
            Err(FairSlotError::FairnessViolation { chain_index: 2, .. })
        ));
    }

    fn seat(session: &mut Session, player: Address) -> [ChainSlot; CHAIN_COUNT] {
        let player_chains: [ChainSlot; CHAIN_COUNT] = std::array::from_fn(|_| ChainSlot::fresh(4));
        let commitments = std::array::from_fn(|i| player_chains[i].commitment().unwrap());
        transition(
            session,
            &event(
                EventKind::Occupied,
                EventPayload::Occupied {
                    player,
                    commitments,
                },
            ),
        )
        .unwrap();
        player_chains
    }

    fn play(player: Address, chain_index: usize) -> Event {
        event(
            EventKind::GameInitialized,
            EventPayload::GameInitialized {
                player,
                bet: 10,
                lines: 1,
                chain_index,
            },
        )
    }

    #[test]
    fn test_reveals_alternate_per_chain() {
        let mut session = Session::new(Address([1u8; 20]), Role::Maker, 3);
        let player = Address([2u8; 20]);
        let mut player_chains = seat(&mut session, player);

        // a player reveal with no maker reveal outstanding does nothing
        let early = player_chains[1].commitment().unwrap();
        let step = transition(
            &mut session,
            &event(
                EventKind::PlayerSeedSet,
                EventPayload::SeedSet {
                    preimage: Digest([9u8; 32]),
                    chain_index: 1,
                },
            ),
        )
        .unwrap();
        assert!(step.commands.is_empty());
        assert_eq!(session.chains[1].counterpart(), Some(&early));

        let first = transition(&mut session, &play(player, 0)).unwrap();
        assert_eq!(first.commands.len(), 1);
        assert!(session.chains[0].awaiting_counterpart());

        let second = transition(&mut session, &play(player, 0)).unwrap();
        assert!(second.commands.is_empty());
        assert_eq!(session.chains[0].depth(), 3);

        // other chains are not held up
        let other = transition(&mut session, &play(player, 1)).unwrap();
        assert_eq!(other.commands.len(), 1);

        let reveal = player_chains[0].reveal_next(0).unwrap();
        transition(
            &mut session,
            &event(
                EventKind::PlayerSeedSet,
                EventPayload::SeedSet {
                    preimage: reveal,
                    chain_index: 0,
                },
            ),
        )
        .unwrap();
        assert!(!session.chains[0].awaiting_counterpart());

        let third = transition(&mut session, &play(player, 0)).unwrap();
        assert_eq!(third.commands.len(), 1);
        assert_eq!(session.chains[0].depth(), 2);
    }

    #[tokio::test]
    async fn test_stale_occupied_after_departure_ignored() {
        let ledger = Arc::new(MockLedger::default());
        let sink = Arc::new(RecordingSink::default());
        let (protocol, address) = maker(ledger, sink).await;

        let player_chains: [ChainSlot; CHAIN_COUNT] = std::array::from_fn(|_| ChainSlot::fresh(4));
        let occupied = Event {
            address,
            kind: EventKind::Occupied,
            transaction_id: TxId::new("0xoccupy"),
            payload: EventPayload::Occupied {
                player: Address([2u8; 20]),
                commitments: std::array::from_fn(|i| player_chains[i].commitment().unwrap()),
            },
        };
        let left = Event {
            address,
            kind: EventKind::PlayerLeft,
            transaction_id: TxId::new("0xleft"),
            payload: EventPayload::PlayerLeft,
        };

        protocol.on_event(occupied.clone()).await;
        assert_eq!(protocol.session(&address).await.unwrap().phase, Phase::Serving);

        protocol.on_event(left).await;
        protocol.on_event(occupied).await;

        let session = protocol.session(&address).await.unwrap();
        assert_eq!(session.phase, Phase::Idle);
        assert_eq!(session.counterparty, None);
        assert!(session.is_fresh());
    }

    #[test]
    fn test_player_left_reinitializes() {
        let mut session = Session::new(Address([1u8; 20]), Role::Maker, 3);
        session.phase = Phase::Serving;
        session.chains[0].reveal_next(0).unwrap();

        transition(&mut session, &event(EventKind::PlayerLeft, EventPayload::PlayerLeft)).unwrap();
        assert_eq!(session.phase, Phase::Idle);
        assert!(session.is_fresh());
    }
}
