use crate::config::CliConfig;
use comfy_table::{presets::UTF8_FULL, Table};
use fairslot_core::{Address, Result, SessionStore, SqliteBackend};
use std::path::PathBuf;
use std::sync::Arc;

pub async fn handle_sessions(
    db: Option<PathBuf>,
    remove: Option<String>,
    config: &CliConfig,
) -> Result<()> {
    let path = db.unwrap_or_else(|| config.player_db());
    if !path.exists() {
        println!("No session database at {}", path.display());
        return Ok(());
    }

    let backend = Arc::new(SqliteBackend::new(&path).await?);
    let store = SessionStore::open(config.rounds_per_chain, backend).await?;

    if let Some(address) = remove {
        let address: Address = address.parse()?;
        store.remove(&address).await?;
        println!("Removed session {}", address);
        return Ok(());
    }

    let sessions = store.list().await;

    if sessions.is_empty() {
        println!("No sessions found");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        "Contract",
        "Role",
        "Phase",
        "Chain depths",
        "Rounds left",
        "Balance",
    ]);

    for session in sessions {
        let depths = session
            .chains
            .iter()
            .map(|c| c.depth().to_string())
            .collect::<Vec<_>>()
            .join(" / ");
        table.add_row(vec![
            session.address.to_string(),
            session.role.to_string(),
            format!("{:?}", session.phase),
            depths,
            session.round_counter.to_string(),
            session.balance.to_string(),
        ]);
    }

    println!("{}", table);
    Ok(())
}
