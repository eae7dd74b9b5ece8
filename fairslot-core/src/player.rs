use crate::config::{ProtocolConfig, TopicTable};
use crate::error::{FairSlotError, Result};
use crate::ledger::{EventFilter, LedgerClient};
use crate::router::{self, EventHandler, RouterHandle};
use crate::session::{Command, Phase, RoundResult, Session, Step};
use crate::storage::{SessionGuard, SessionStore};
use crate::types::{Address, Event, EventKind, EventPayload, Role, TxId};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast;

const UPDATE_CAPACITY: usize = 256;

/// Progress notifications published by the player side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerUpdate {
    MakerReady {
        address: Address,
    },
    Revealed {
        address: Address,
        chain_index: usize,
        round_counter: u32,
    },
    Settled {
        address: Address,
        result: RoundResult,
        balance: Decimal,
    },
    Aborted {
        address: Address,
        reason: String,
    },
    Reset {
        address: Address,
    },
}

impl PlayerUpdate {
    pub fn address(&self) -> &Address {
        match self {
            Self::MakerReady { address }
            | Self::Revealed { address, .. }
            | Self::Settled { address, .. }
            | Self::Aborted { address, .. }
            | Self::Reset { address } => address,
        }
    }
}

/// How [`PlayerProtocol::occupy`] obtained the seat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seat {
    /// Taken in this transaction.
    Taken(TxId),
    /// Already held by this account, with the local session still live.
    Resumed,
}

/// Player reaction to one admitted event.
pub fn transition(session: &mut Session, event: &Event) -> Result<Step<PlayerUpdate>> {
    let address = session.address;

    match &event.payload {
        EventPayload::BankerSeedInit { commitments } => {
            if session.phase != Phase::AwaitingMakerInit {
                tracing::debug!(
                    "Ignoring maker commitments for {} in {:?}",
                    address,
                    session.phase
                );
                return Ok(Step::ignore());
            }
            for (chain_index, commitment) in commitments.iter().enumerate() {
                if commitment.is_zero() {
                    return Err(FairSlotError::fairness(chain_index, "maker committed to zero"));
                }
            }
            for (slot, commitment) in session.chains.iter_mut().zip(commitments.iter()) {
                slot.set_counterpart(*commitment);
            }
            session.phase = Phase::Playing;
            tracing::info!("Maker commitments accepted for {}", address);
            Ok(Step::ignore().update(PlayerUpdate::MakerReady { address }))
        }

        EventPayload::SeedSet {
            preimage,
            chain_index,
        } if event.kind == EventKind::BankerSeedSet => {
            let chain_index = *chain_index;
            if session.phase != (Phase::AwaitingReveal { chain_index }) {
                tracing::debug!(
                    "Ignoring maker reveal on chain {} for {} in {:?}",
                    chain_index,
                    address,
                    session.phase
                );
                return Ok(Step::ignore());
            }

            session.chains[chain_index].accept_counterpart(chain_index, *preimage)?;
            let reveal = session.chains[chain_index].reveal_next(chain_index)?;
            session.round_counter = session.round_counter.saturating_sub(1);
            session.phase = Phase::AwaitingConfirm { chain_index };

            tracing::info!(
                "Maker reveal verified on chain {} for {}, {} rounds left",
                chain_index,
                address,
                session.round_counter
            );

            Ok(Step::ignore()
                .command(Command::RevealSeed {
                    preimage: reveal,
                    chain_index,
                })
                .update(PlayerUpdate::Revealed {
                    address,
                    chain_index,
                    round_counter: session.round_counter,
                }))
        }

        EventPayload::Confirmed(settlement) => {
            let chain_index = settlement.chain_index;
            if session.phase != (Phase::AwaitingConfirm { chain_index }) {
                tracing::debug!(
                    "Ignoring settlement on chain {} for {} in {:?}",
                    chain_index,
                    address,
                    session.phase
                );
                return Ok(Step::ignore());
            }

            let result = RoundResult {
                chain_index,
                payout: settlement.payout,
            };
            session.balance += settlement.payout;
            session.last_result = Some(result.clone());
            session.phase = Phase::Playing;

            tracing::info!(
                "Round on chain {} settled for {}: payout {}, balance {}",
                settlement.chain_index,
                address,
                settlement.payout,
                session.balance
            );

            Ok(Step::ignore().update(PlayerUpdate::Settled {
                address,
                result,
                balance: session.balance,
            }))
        }

        EventPayload::PlayerLeft => {
            session.reset();
            tracing::info!("Seat at {} released, session reset", address);
            Ok(Step::ignore().update(PlayerUpdate::Reset { address }))
        }

        // own echoes and maker-only events
        _ => Ok(Step::ignore()),
    }
}

/// Player side of the slot protocol.
pub struct PlayerProtocol {
    config: ProtocolConfig,
    table: TopicTable,
    store: Arc<SessionStore>,
    ledger: Arc<dyn LedgerClient>,
    updates: broadcast::Sender<PlayerUpdate>,
}

impl PlayerProtocol {
    pub fn new(
        config: ProtocolConfig,
        store: Arc<SessionStore>,
        ledger: Arc<dyn LedgerClient>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let table = config.topic_table()?;
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);

        Ok(Arc::new(Self {
            config,
            table,
            store,
            ledger,
            updates,
        }))
    }

    /// Start routing ledger events for this player's sessions.
    pub async fn spawn(self: &Arc<Self>) -> Result<RouterHandle> {
        let handler: Arc<dyn EventHandler> = self.clone();
        router::spawn(
            handler,
            self.ledger.as_ref(),
            EventFilter::default(),
            self.table.clone(),
            self.config.unit_scale,
            None,
        )
        .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerUpdate> {
        self.updates.subscribe()
    }

    pub async fn session(&self, address: &Address) -> Result<Session> {
        self.store.get(address).await
    }

    fn publish(&self, update: PlayerUpdate) {
        // nobody listening is fine
        let _ = self.updates.send(update);
    }

    /// Commit `session` as aborted and tell listeners.
    async fn abort_with(&self, guard: SessionGuard, error: &FairSlotError) -> Result<()> {
        let mut aborted = guard.snapshot();
        let address = aborted.address;
        aborted.abort(error.to_string());
        guard.commit(aborted).await?;
        tracing::warn!("Session {} aborted: {}", address, error);
        self.publish(PlayerUpdate::Aborted {
            address,
            reason: error.to_string(),
        });
        Ok(())
    }

    /// Take the seat at `address`: publish fresh commitments with `deposit`
    /// and wait for the maker's. A seat this account already holds is
    /// resumed instead.
    pub async fn occupy(&self, address: &Address, deposit: Decimal) -> Result<Seat> {
        let account = self.ledger.account();
        if self.ledger.owner(address).await? == account {
            return Err(FairSlotError::invalid_state(format!(
                "{} is owned by {}, cannot play against it",
                address, account
            )));
        }
        match self.ledger.occupancy(address).await? {
            Some(occupant) if occupant == account => return self.resume(address).await,
            Some(occupant) => {
                return Err(FairSlotError::invalid_state(format!(
                    "{} is already occupied by {}",
                    address, occupant
                )));
            }
            None => {}
        }

        self.store.create(*address, Role::Player).await?;
        let mut rx = self.subscribe();

        let tx = {
            let guard = self.store.lock(address).await?;
            let mut working = guard.snapshot();

            if let Phase::Aborted { reason } = &working.phase {
                return Err(FairSlotError::SessionAborted(reason.clone()));
            }
            if working.phase != Phase::Idle || !working.is_fresh() {
                return Err(FairSlotError::invalid_state(format!(
                    "Cannot occupy {} in {:?}, leave first",
                    address, working.phase
                )));
            }

            let commitments = working.commitments()?;
            let tx = self
                .ledger
                .submit_occupy(address, commitments, deposit)
                .await?;
            working.phase = Phase::AwaitingMakerInit;
            guard.commit(working).await?;
            tx
        };

        tracing::info!("Occupy requested for {} in {} with deposit {}", address, tx, deposit);

        self.wait_for(&mut rx, address, "maker commitments", |update| match update {
            PlayerUpdate::MakerReady { .. } => Some(Ok(())),
            _ => None,
        })
        .await?;

        Ok(Seat::Taken(tx))
    }

    /// Pick up a seat this account already holds. Only possible while the
    /// local session still has the seeds it committed with.
    async fn resume(&self, address: &Address) -> Result<Seat> {
        let mut rx = self.subscribe();
        let session = match self.store.get(address).await {
            Ok(session) => session,
            Err(FairSlotError::UnknownSession(_)) => {
                return Err(FairSlotError::invalid_state(format!(
                    "Seat at {} is held by this account without a session, leave first",
                    address
                )));
            }
            Err(e) => return Err(e),
        };

        match &session.phase {
            Phase::Aborted { reason } => Err(FairSlotError::SessionAborted(reason.clone())),
            Phase::Idle => Err(FairSlotError::invalid_state(format!(
                "Seat at {} is held by this account with unknown seeds, leave first",
                address
            ))),
            Phase::AwaitingMakerInit => {
                tracing::info!("Resuming seat at {}, waiting for maker commitments", address);
                self.wait_for(&mut rx, address, "maker commitments", |update| match update {
                    PlayerUpdate::MakerReady { .. } => Some(Ok(())),
                    _ => None,
                })
                .await?;
                Ok(Seat::Resumed)
            }
            phase => {
                tracing::info!("Resuming seat at {} in {:?}", address, phase);
                Ok(Seat::Resumed)
            }
        }
    }

    /// Play one round. Resolves with the chain index once the maker's reveal
    /// has been verified and this player's reveal submitted.
    pub async fn play(&self, address: &Address, bet: Decimal, lines: u32) -> Result<usize> {
        let mut rx = self.subscribe();

        let chain_index = {
            let guard = self.store.lock(address).await?;
            let mut working = guard.snapshot();

            if let Phase::Aborted { reason } = &working.phase {
                return Err(FairSlotError::SessionAborted(reason.clone()));
            }
            if working.phase != Phase::Playing {
                return Err(FairSlotError::invalid_state(format!(
                    "Cannot play on {} in {:?}",
                    address, working.phase
                )));
            }

            let chain_index = working.next_chain_index();
            let precondition = if working.round_counter == 0 {
                Err(FairSlotError::ChainExhausted { chain_index })
            } else if working.chains[chain_index].counterpart().is_none() {
                Err(FairSlotError::MissingCommitment { chain_index })
            } else {
                Ok(())
            };
            if let Err(e) = precondition {
                self.abort_with(guard, &e).await?;
                return Err(e);
            }

            self.ledger
                .submit_play(address, bet, lines, chain_index)
                .await?;
            working.phase = Phase::AwaitingReveal { chain_index };
            guard.commit(working).await?;
            chain_index
        };

        tracing::info!(
            "Playing {} x {} lines on chain {} at {}",
            bet,
            lines,
            chain_index,
            address
        );

        self.wait_for(&mut rx, address, "maker reveal", |update| match update {
            PlayerUpdate::Revealed {
                chain_index: revealed,
                ..
            } if *revealed == chain_index => Some(Ok(chain_index)),
            _ => None,
        })
        .await
    }

    /// Wait for the settlement of the round in flight, or return the last
    /// one if it already arrived.
    pub async fn await_result(&self, address: &Address) -> Result<RoundResult> {
        let mut rx = self.subscribe();
        let session = self.store.get(address).await?;

        let chain_index = match &session.phase {
            Phase::AwaitingReveal { chain_index } | Phase::AwaitingConfirm { chain_index } => {
                *chain_index
            }
            Phase::Playing => {
                return session.last_result.ok_or_else(|| {
                    FairSlotError::invalid_state(format!("No round played on {}", address))
                });
            }
            Phase::Aborted { reason } => return Err(FairSlotError::SessionAborted(reason.clone())),
            other => {
                return Err(FairSlotError::invalid_state(format!(
                    "No round in flight on {} in {:?}",
                    address, other
                )))
            }
        };

        self.wait_for(&mut rx, address, "settlement", |update| match update {
            PlayerUpdate::Settled { result, .. } if result.chain_index == chain_index => {
                Some(Ok(result.clone()))
            }
            _ => None,
        })
        .await
    }

    /// Give up the seat. The session resets once the departure is observed.
    pub async fn leave(&self, address: &Address) -> Result<TxId> {
        let mut rx = self.subscribe();
        self.store.get(address).await?;

        let tx = self.ledger.leave(address).await?;
        tracing::info!("Leave requested for {} in {}", address, tx);

        self.wait_for(&mut rx, address, "departure", |update| match update {
            PlayerUpdate::Reset { .. } => Some(Ok(())),
            _ => None,
        })
        .await?;

        Ok(tx)
    }

    async fn wait_for<T, F>(
        &self,
        rx: &mut broadcast::Receiver<PlayerUpdate>,
        address: &Address,
        what: &str,
        mut pick: F,
    ) -> Result<T>
    where
        F: FnMut(&PlayerUpdate) -> Option<Result<T>>,
    {
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(update) if update.address() == address => {
                        if let PlayerUpdate::Aborted { reason, .. } = &update {
                            return Err(FairSlotError::SessionAborted(reason.clone()));
                        }
                        if let Some(outcome) = pick(&update) {
                            return outcome;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Player updates lagged by {}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(FairSlotError::internal("Player update channel closed"));
                    }
                }
            }
        };

        tokio::time::timeout(self.config.response_timeout, wait)
            .await
            .map_err(|_| {
                FairSlotError::timeout(format!("Waiting for {} on {}", what, address))
            })?
    }
}

#[async_trait]
impl EventHandler for PlayerProtocol {
    fn watches(&self, address: &Address) -> bool {
        self.store.contains(address)
    }

    async fn on_event(&self, event: Event) {
        let address = event.address;
        match router::drive(&self.store, self.ledger.as_ref(), &event, transition).await {
            Ok(updates) => {
                for update in updates {
                    self.publish(update);
                }
            }
            Err(e) if e.is_fatal() => {
                self.publish(PlayerUpdate::Aborted {
                    address,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                tracing::warn!("{} for {} not applied: {}", event.kind, address, e);
            }
        }
    }
}
