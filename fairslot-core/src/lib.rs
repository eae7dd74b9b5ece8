//! fairslot - provably-fair commit-reveal engine for slot sessions
//!
//! A maker and a player each commit to three hash chains per session and
//! open them one link at a time, so neither side can choose its value after
//! seeing the other's. This crate holds the chain primitive, the per-session
//! state machines for both roles, the event router that feeds them, and an
//! in-memory ledger that stands in for the slot contract.

pub mod abi;
pub mod chain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod maker;
pub mod player;
pub mod router;
pub mod session;
pub mod settlement;
pub mod storage;
pub mod types;

/// Parallel hash chains per session.
pub const CHAIN_COUNT: usize = 3;

pub use chain::{HashChain, Seed};
pub use config::{ProtocolConfig, TopicConfig, TopicTable};
pub use error::{FairSlotError, Result};
pub use ledger::{EventFilter, LedgerClient, MemoryClient, MemoryLedger};
pub use maker::{LogSink, MakerProtocol, OperatorSink};
pub use player::{PlayerProtocol, PlayerUpdate, Seat};
pub use router::{Inbound, RouterHandle};
pub use session::{Phase, RoundResult, Session};
pub use settlement::Settlement;
pub use storage::{SessionBackend, SessionStore, SqliteBackend};
pub use types::{Address, Digest, Role, TxId};

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use std::time::Duration;

    fn config() -> ProtocolConfig {
        let mut config = ProtocolConfig::with_rounds_per_chain(4);
        config.response_timeout = Duration::from_secs(5);
        config
    }

    #[tokio::test]
    async fn test_full_game_with_duplicated_delivery() {
        let config = config();
        let ledger = MemoryLedger::new(config.topic_table().unwrap(), config.unit_scale);
        ledger.set_duplicate_delivery(true);

        let owner = Address::random();
        let contract = ledger.deploy(owner);

        let maker_store = Arc::new(SessionStore::in_memory(config.rounds_per_chain));
        let maker = MakerProtocol::new(
            config.clone(),
            maker_store.clone(),
            Arc::new(ledger.client(owner)),
        )
        .unwrap();
        let maker_router = maker.watch([contract]).await.unwrap();

        let player_store = Arc::new(SessionStore::in_memory(config.rounds_per_chain));
        let player = PlayerProtocol::new(
            config.clone(),
            player_store,
            Arc::new(ledger.client(Address::random())),
        )
        .unwrap();
        let player_router = player.spawn().await.unwrap();

        let seat = player.occupy(&contract, Decimal::ONE).await.unwrap();
        assert!(matches!(seat, Seat::Taken(_)));
        assert_eq!(player.session(&contract).await.unwrap().phase, Phase::Playing);
        assert_eq!(
            player.occupy(&contract, Decimal::ONE).await.unwrap(),
            Seat::Resumed
        );

        let bet = Decimal::new(1, 2);
        let mut chains = Vec::new();
        let mut total = Decimal::ZERO;
        for _ in 0..4 {
            chains.push(player.play(&contract, bet, 5).await.unwrap());
            let result = player.await_result(&contract).await.unwrap();
            total += result.payout;
        }
        assert_eq!(chains, vec![0, 1, 2, 0]);

        let session = player.session(&contract).await.unwrap();
        assert_eq!(session.balance, total);
        assert_eq!(session.round_counter, 12 - 4);
        assert_eq!(session.chains[0].depth(), 3);
        assert_eq!(session.chains[1].depth(), 4);

        let paid = ledger.paid_out(&contract).unwrap();
        assert_eq!(settlement::from_minor_units(paid, 18).unwrap(), total);

        let maker_session = maker.session(&contract).await.unwrap();
        assert_eq!(maker_session.phase, Phase::Serving);
        assert_eq!(maker_session.chains[0].depth(), 3);

        player.leave(&contract).await.unwrap();
        assert!(player.session(&contract).await.unwrap().is_fresh());

        player_router.shutdown().await;
        maker_router.shutdown().await;
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_state_untouched() {
        let config = config();
        let ledger = MemoryLedger::new(config.topic_table().unwrap(), config.unit_scale);
        let owner = Address::random();
        let contract = ledger.deploy(owner);

        let maker = MakerProtocol::new(
            config.clone(),
            Arc::new(SessionStore::in_memory(config.rounds_per_chain)),
            Arc::new(ledger.client(owner)),
        )
        .unwrap();
        let maker_router = maker.watch([contract]).await.unwrap();

        let player = PlayerProtocol::new(
            config.clone(),
            Arc::new(SessionStore::in_memory(config.rounds_per_chain)),
            Arc::new(ledger.client(Address::random())),
        )
        .unwrap();
        let player_router = player.spawn().await.unwrap();
        player.occupy(&contract, Decimal::ZERO).await.unwrap();

        ledger.set_offline(true);
        let err = player.play(&contract, Decimal::ONE, 1).await.unwrap_err();
        assert!(err.is_retryable());
        let session = player.session(&contract).await.unwrap();
        assert_eq!(session.phase, Phase::Playing);
        assert_eq!(session.round_counter, 12);

        ledger.set_offline(false);
        assert_eq!(player.play(&contract, Decimal::ONE, 1).await.unwrap(), 0);
        player.await_result(&contract).await.unwrap();

        player_router.shutdown().await;
        maker_router.shutdown().await;
    }
}
