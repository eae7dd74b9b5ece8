use fairslot_core::config::DEFAULT_ROUNDS_PER_CHAIN;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub data_dir: PathBuf,
    pub rounds_per_chain: u32,
}

impl CliConfig {
    pub fn player_db(&self) -> PathBuf {
        self.data_dir.join("player.db")
    }

    pub fn maker_db(&self) -> PathBuf {
        self.data_dir.join("maker.db")
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("fairslot"),
            rounds_per_chain: DEFAULT_ROUNDS_PER_CHAIN,
        }
    }
}
