pub mod chain;
pub mod sessions;
pub mod simulate;

pub use chain::{handle_chain_command, ChainCommands};
pub use sessions::handle_sessions;
pub use simulate::{handle_simulate, SimulateArgs};
