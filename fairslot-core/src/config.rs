use crate::error::{FairSlotError, Result};
use crate::types::{Digest, EventKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ROUNDS_PER_CHAIN: u32 = 3333;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Reveals available on each chain before the session must be cashed out.
    pub rounds_per_chain: u32,
    /// Interval of the maker's idle-eviction sweep.
    pub idle_interval: Duration,
    /// Upper bound on any wait for a counterpart event.
    pub response_timeout: Duration,
    /// Decimal places between the ledger's minor unit and the display unit.
    pub unit_scale: u32,
    pub topics: TopicConfig,
}

/// Event topic signatures emitted by the slot contract, hex encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub occupied: String,
    pub banker_seed_init: String,
    pub game_initialized: String,
    pub banker_seed_set: String,
    pub player_seed_set: String,
    pub confirmed: String,
    pub player_left: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            occupied: "0xa8594317be29e78728fb10fbf57b1f8becff7bc83fa4639b9c3b0a4c965f9629"
                .to_string(),
            banker_seed_init: "0xa4338f9ae2970a5aa65035a4c9fb88da1cd0940e3df6fd42874bb3d862806972"
                .to_string(),
            game_initialized: "0xb7f32217976898f350090cced7da439b6a1de2d176c3895f4cf388c6a9388190"
                .to_string(),
            banker_seed_set: "0x05157405ea453181cba290132a142d488a688a03f0b08869ca47c88a0cbba8b5"
                .to_string(),
            player_seed_set: "0xee65ec46c8744067af9955308ee9958ab02a5882e505b3b06e3e4e50cada6014"
                .to_string(),
            confirmed: "0xf77a3f60313a25f9aeff0bdd6f243b0b6f7cae52522d7b99f8c92d7ffcdbf17d"
                .to_string(),
            player_left: "0x471055d6adcbcece6a26aaf208fc1e5e978d9ebd07c0293ea1ac2a00dab7ec98"
                .to_string(),
        }
    }
}

/// Parsed topic signatures, used to classify raw log entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTable {
    entries: Vec<(Digest, EventKind)>,
}

impl TopicTable {
    pub fn kind_of(&self, topic: &Digest) -> Option<EventKind> {
        self.entries
            .iter()
            .find(|(t, _)| t == topic)
            .map(|(_, kind)| *kind)
    }

    pub fn topic_for(&self, kind: EventKind) -> Digest {
        self.entries
            .iter()
            .find(|(_, k)| *k == kind)
            .map(|(t, _)| *t)
            .unwrap_or(Digest::ZERO)
    }
}

impl TryFrom<&TopicConfig> for TopicTable {
    type Error = FairSlotError;

    fn try_from(config: &TopicConfig) -> Result<Self> {
        let pairs = [
            (&config.occupied, EventKind::Occupied),
            (&config.banker_seed_init, EventKind::BankerSeedInit),
            (&config.game_initialized, EventKind::GameInitialized),
            (&config.banker_seed_set, EventKind::BankerSeedSet),
            (&config.player_seed_set, EventKind::PlayerSeedSet),
            (&config.confirmed, EventKind::Confirmed),
            (&config.player_left, EventKind::PlayerLeft),
        ];

        let mut entries = Vec::with_capacity(pairs.len());
        for (hex, kind) in pairs {
            let topic = Digest::from_hex(hex)
                .map_err(|e| FairSlotError::config(format!("Topic for {}: {}", kind, e)))?;
            if entries.iter().any(|(t, _)| *t == topic) {
                return Err(FairSlotError::config(format!(
                    "Topic for {} is not unique",
                    kind
                )));
            }
            entries.push((topic, kind));
        }

        Ok(Self { entries })
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            rounds_per_chain: DEFAULT_ROUNDS_PER_CHAIN,
            idle_interval: Duration::from_secs(600), // 10 minutes
            response_timeout: Duration::from_secs(300),
            unit_scale: 18, // wei per ether
            topics: TopicConfig::default(),
        }
    }
}

impl ProtocolConfig {
    /// Short chains, used by the simulator and tests.
    pub fn with_rounds_per_chain(rounds_per_chain: u32) -> Self {
        Self {
            rounds_per_chain,
            ..Self::default()
        }
    }

    pub fn topic_table(&self) -> Result<TopicTable> {
        TopicTable::try_from(&self.topics)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rounds_per_chain == 0 {
            return Err(FairSlotError::config("Rounds per chain must be greater than 0"));
        }

        if self.rounds_per_chain >= u32::MAX / crate::CHAIN_COUNT as u32 {
            return Err(FairSlotError::config("Rounds per chain is too large"));
        }

        if self.idle_interval.is_zero() {
            return Err(FairSlotError::config("Idle interval cannot be zero"));
        }

        if self.response_timeout.is_zero() {
            return Err(FairSlotError::config("Response timeout cannot be zero"));
        }

        if self.unit_scale > 28 {
            return Err(FairSlotError::config("Unit scale must be at most 28"));
        }

        self.topic_table()?;
        Ok(())
    }
}
