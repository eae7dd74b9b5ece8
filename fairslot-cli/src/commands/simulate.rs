use crate::config::CliConfig;
use clap::Args;
use comfy_table::{presets::UTF8_FULL, Table};
use fairslot_core::{
    Address, MakerProtocol, MemoryLedger, PlayerProtocol, ProtocolConfig, Result, SessionStore,
    SqliteBackend,
};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;

#[derive(Args)]
pub struct SimulateArgs {
    /// Rounds to play
    #[arg(short, long, default_value_t = 6)]
    rounds: u32,

    /// Bet per line
    #[arg(short, long, default_value = "0.01")]
    bet: Decimal,

    /// Lines per round
    #[arg(short, long, default_value_t = 1)]
    lines: u32,

    /// Deposit paid when taking the seat
    #[arg(long, default_value = "1")]
    deposit: Decimal,

    /// Reveals available on each chain
    #[arg(long)]
    rounds_per_chain: Option<u32>,

    /// Deliver every ledger event twice
    #[arg(long)]
    duplicate: bool,

    /// Persist sessions under the data directory
    #[arg(long)]
    db: bool,
}

async fn open_store(rounds_per_chain: u32, db: Option<&Path>) -> Result<Arc<SessionStore>> {
    let store = match db {
        Some(path) => {
            let backend = Arc::new(SqliteBackend::new(path).await?);
            SessionStore::open(rounds_per_chain, backend).await?
        }
        None => SessionStore::in_memory(rounds_per_chain),
    };
    Ok(Arc::new(store))
}

pub async fn handle_simulate(args: SimulateArgs, config: &CliConfig) -> Result<()> {
    let rounds_per_chain = args.rounds_per_chain.unwrap_or(config.rounds_per_chain);
    let protocol_config = ProtocolConfig::with_rounds_per_chain(rounds_per_chain);
    protocol_config.validate()?;

    let ledger = MemoryLedger::new(protocol_config.topic_table()?, protocol_config.unit_scale);
    ledger.set_duplicate_delivery(args.duplicate);

    let owner = Address::random();
    let player_account = Address::random();
    let contract = ledger.deploy(owner);

    let (player_db, maker_db) = if args.db {
        (Some(config.player_db()), Some(config.maker_db()))
    } else {
        (None, None)
    };

    let maker = MakerProtocol::new(
        protocol_config.clone(),
        open_store(rounds_per_chain, maker_db.as_deref()).await?,
        Arc::new(ledger.client(owner)),
    )?;
    let maker_router = maker.watch([contract]).await?;

    let player = PlayerProtocol::new(
        protocol_config.clone(),
        open_store(rounds_per_chain, player_db.as_deref()).await?,
        Arc::new(ledger.client(player_account)),
    )?;
    let player_router = player.spawn().await?;

    tracing::debug!(
        "Simulating {} rounds, {} per chain, duplicate delivery {}",
        args.rounds,
        rounds_per_chain,
        args.duplicate
    );

    println!("Contract: {}", contract);
    println!("Maker:    {}", owner);
    println!("Player:   {}", player_account);
    println!();

    player.occupy(&contract, args.deposit).await?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Round", "Chain", "Stake", "Payout", "Balance"]);

    let stake = args.bet * Decimal::from(args.lines);
    let mut staked = Decimal::ZERO;
    let mut outcome = Ok(());

    for round in 1..=args.rounds {
        let played = player.play(&contract, args.bet, args.lines).await;
        let chain_index = match played {
            Ok(chain_index) => chain_index,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        };
        let result = match player.await_result(&contract).await {
            Ok(result) => result,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        };
        staked += stake;

        let session = player.session(&contract).await?;
        table.add_row(vec![
            round.to_string(),
            chain_index.to_string(),
            stake.to_string(),
            result.payout.to_string(),
            session.balance.to_string(),
        ]);
    }

    println!("{}", table);

    let session = player.session(&contract).await?;
    let paid = ledger.paid_out(&contract).unwrap_or_default();

    let mut summary = Table::new();
    summary.load_preset(UTF8_FULL);
    let deposited = ledger.deposited(&contract).unwrap_or_default();
    summary.set_header(vec![
        "Staked",
        "Won",
        "Rounds left",
        "Ledger deposited (wei)",
        "Ledger paid (wei)",
    ]);
    summary.add_row(vec![
        staked.to_string(),
        session.balance.to_string(),
        session.round_counter.to_string(),
        deposited.to_string(),
        paid.to_string(),
    ]);
    println!("{}", summary);

    if outcome.is_ok() {
        player.leave(&contract).await?;
        println!("Seat released");
    }

    player_router.shutdown().await;
    maker_router.shutdown().await;

    outcome
}
