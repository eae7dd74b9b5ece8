use clap::Subcommand;
use fairslot_core::{Digest, FairSlotError, HashChain, Result};

#[derive(Subcommand)]
pub enum ChainCommands {
    /// Hash a seed `depth` times
    Derive {
        /// Seed, as text or 0x-prefixed hex
        seed: String,
        /// Number of hash applications
        depth: u32,
    },
    /// Check that a preimage hashes to a commitment
    Verify {
        /// Preimage, as text or 0x-prefixed hex
        preimage: String,
        /// Commitment, 0x-prefixed hex
        commitment: String,
    },
}

fn seed_bytes(seed: &str) -> Result<Vec<u8>> {
    match seed.strip_prefix("0x") {
        Some(hex) => hex::decode(hex)
            .map_err(|e| FairSlotError::decode(format!("Invalid seed hex: {}", e))),
        None => Ok(seed.as_bytes().to_vec()),
    }
}

pub fn handle_chain_command(cmd: ChainCommands) -> Result<()> {
    match cmd {
        ChainCommands::Derive { seed, depth } => {
            let digest = HashChain::derive(&seed_bytes(&seed)?, depth)?;
            println!("{}", digest);
        }

        ChainCommands::Verify {
            preimage,
            commitment,
        } => {
            let preimage = seed_bytes(&preimage)?;
            let commitment = Digest::from_hex(&commitment)?;

            if HashChain::opens(&preimage, &commitment) {
                println!("✓ Preimage opens {}", commitment);
            } else {
                println!("✗ Preimage does not open {}", commitment);
                println!("  hash(preimage) = {}", HashChain::hash(&preimage));
            }
        }
    }

    Ok(())
}
