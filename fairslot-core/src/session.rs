use crate::chain::{HashChain, Seed};
use crate::error::{FairSlotError, Result};
use crate::types::{Address, Digest, EventKind, Role, TxId};
use crate::CHAIN_COUNT;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One of the three parallel hash chains of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSlot {
    seed: Seed,
    /// Depth of the value this party published last.
    depth: u32,
    last_opened: Option<Digest>,
    counterpart: Option<Digest>,
    /// Set after this party revealed; cleared by the counterpart's reveal.
    #[serde(default)]
    awaiting_counterpart: bool,
}

impl ChainSlot {
    pub fn fresh(init_depth: u32) -> Self {
        Self {
            seed: Seed::generate(),
            depth: init_depth,
            last_opened: None,
            counterpart: None,
            awaiting_counterpart: false,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn last_opened(&self) -> Option<&Digest> {
        self.last_opened.as_ref()
    }

    pub fn counterpart(&self) -> Option<&Digest> {
        self.counterpart.as_ref()
    }

    /// Commitment at the current depth.
    pub fn commitment(&self) -> Result<Digest> {
        HashChain::derive(self.seed.as_bytes(), self.depth)
    }

    /// Open the current commitment by revealing the next value down the chain.
    pub fn reveal_next(&mut self, chain_index: usize) -> Result<Digest> {
        if self.depth <= 1 {
            return Err(FairSlotError::ChainExhausted { chain_index });
        }

        let value = HashChain::derive(self.seed.as_bytes(), self.depth - 1)?;
        self.depth -= 1;
        self.last_opened = Some(value);
        Ok(value)
    }

    pub fn awaiting_counterpart(&self) -> bool {
        self.awaiting_counterpart
    }

    pub fn set_awaiting_counterpart(&mut self) {
        self.awaiting_counterpart = true;
    }

    pub fn set_counterpart(&mut self, commitment: Digest) {
        self.counterpart = Some(commitment);
    }

    /// Verify a counterpart reveal against the stored commitment and
    /// replace the commitment with it.
    pub fn accept_counterpart(&mut self, chain_index: usize, preimage: Digest) -> Result<()> {
        let expected = self
            .counterpart
            .ok_or(FairSlotError::MissingCommitment { chain_index })?;

        if !HashChain::opens(preimage.as_bytes(), &expected) {
            return Err(FairSlotError::fairness(
                chain_index,
                format!("{} does not open {}", preimage, expected),
            ));
        }

        self.counterpart = Some(preimage);
        self.awaiting_counterpart = false;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Player not seated yet, or maker seat vacant.
    Idle,
    AwaitingMakerInit,
    Playing,
    AwaitingReveal { chain_index: usize },
    AwaitingConfirm { chain_index: usize },
    /// Maker commitments published, reacting to rounds.
    Serving,
    Aborted { reason: String },
}

/// Duplicate-suppression state consulted before any reaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventGuards {
    /// Processed tx ids. Kept across resets, so a late redelivery from an
    /// earlier tenancy cannot act on the next one.
    seen: BTreeMap<EventKind, BTreeSet<TxId>>,
    occupied_handled: bool,
    last_confirmed_chain: Option<usize>,
}

impl EventGuards {
    pub fn has_seen(&self, kind: EventKind, tx: &TxId) -> bool {
        self.seen.get(&kind).map_or(false, |set| set.contains(tx))
    }

    pub fn mark_seen(&mut self, kind: EventKind, tx: TxId) {
        self.seen.entry(kind).or_default().insert(tx);
    }

    pub fn occupied_handled(&self) -> bool {
        self.occupied_handled
    }

    pub fn set_occupied_handled(&mut self) {
        self.occupied_handled = true;
    }

    pub fn last_confirmed_chain(&self) -> Option<usize> {
        self.last_confirmed_chain
    }

    pub fn set_last_confirmed_chain(&mut self, chain_index: usize) {
        self.last_confirmed_chain = Some(chain_index);
    }

    /// Start a new tenancy. Processed tx ids stay.
    fn clear(&mut self) {
        self.occupied_handled = false;
        self.last_confirmed_chain = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResult {
    pub chain_index: usize,
    pub payout: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub address: Address,
    pub role: Role,
    pub phase: Phase,
    pub chains: [ChainSlot; CHAIN_COUNT],
    /// Player rounds left across all chains; unused by the maker.
    pub round_counter: u32,
    pub rounds_per_chain: u32,
    pub guards: EventGuards,
    pub recently_active: bool,
    pub counterparty: Option<Address>,
    pub balance: Decimal,
    pub last_result: Option<RoundResult>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(address: Address, role: Role, rounds_per_chain: u32) -> Self {
        let init_depth = rounds_per_chain + 1;
        Self {
            address,
            role,
            phase: Phase::Idle,
            chains: std::array::from_fn(|_| ChainSlot::fresh(init_depth)),
            round_counter: rounds_per_chain * CHAIN_COUNT as u32,
            rounds_per_chain,
            guards: EventGuards::default(),
            recently_active: false,
            counterparty: None,
            balance: Decimal::ZERO,
            last_result: None,
            created_at: Utc::now(),
        }
    }

    pub fn init_depth(&self) -> u32 {
        self.rounds_per_chain + 1
    }

    pub fn total_rounds(&self) -> u32 {
        self.rounds_per_chain * CHAIN_COUNT as u32
    }

    /// All chains untouched since the seeds were generated.
    pub fn is_fresh(&self) -> bool {
        self.chains
            .iter()
            .all(|c| c.depth() == self.init_depth() && c.last_opened().is_none())
    }

    /// Chain the player's next round runs on: rounds played so far, mod 3.
    pub fn next_chain_index(&self) -> usize {
        ((self.total_rounds() - self.round_counter) % CHAIN_COUNT as u32) as usize
    }

    pub fn commitments(&self) -> Result<[Digest; CHAIN_COUNT]> {
        let mut out = [Digest::ZERO; CHAIN_COUNT];
        for (slot, chain) in out.iter_mut().zip(self.chains.iter()) {
            *slot = chain.commitment()?;
        }
        Ok(out)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.phase, Phase::Aborted { .. })
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        self.phase = Phase::Aborted {
            reason: reason.into(),
        };
    }

    /// Fresh seeds, fresh counters, new tenancy. Address, role and the
    /// processed tx ids survive.
    pub fn reset(&mut self) {
        let init_depth = self.init_depth();
        self.phase = Phase::Idle;
        self.chains = std::array::from_fn(|_| ChainSlot::fresh(init_depth));
        self.round_counter = self.total_rounds();
        self.guards.clear();
        self.recently_active = false;
        self.counterparty = None;
        self.balance = Decimal::ZERO;
        self.last_result = None;
    }
}

/// Outbound request produced by a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CommitSeeds([Digest; CHAIN_COUNT]),
    RevealSeed { preimage: Digest, chain_index: usize },
}

/// Result of applying one event to a session.
#[derive(Debug, Clone)]
pub struct Step<U> {
    pub commands: Vec<Command>,
    pub updates: Vec<U>,
}

impl<U> Step<U> {
    pub fn ignore() -> Self {
        Self {
            commands: Vec::new(),
            updates: Vec::new(),
        }
    }

    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn update(mut self, update: U) -> Self {
        self.updates.push(update);
        self
    }
}
