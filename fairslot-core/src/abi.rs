//! 32-byte word layout shared with the slot contract's event ABI.

use crate::error::{FairSlotError, Result};
use crate::types::{Address, Digest};
use crate::CHAIN_COUNT;

pub const WORD: usize = 32;

pub fn word(data: &[u8], index: usize) -> Result<&[u8]> {
    let start = index * WORD;
    data.get(start..start + WORD)
        .ok_or_else(|| FairSlotError::decode(format!("Missing ABI word {}", index)))
}

pub fn expect_words(data: &[u8], count: usize) -> Result<()> {
    if data.len() != count * WORD {
        return Err(FairSlotError::decode(format!(
            "Expected {} bytes of payload, got {}",
            count * WORD,
            data.len()
        )));
    }
    Ok(())
}

pub fn read_digest(data: &[u8], index: usize) -> Result<Digest> {
    Digest::from_slice(word(data, index)?)
}

pub fn read_u128(data: &[u8], index: usize) -> Result<u128> {
    let w = word(data, index)?;
    if w[..16].iter().any(|b| *b != 0) {
        return Err(FairSlotError::decode(format!(
            "ABI word {} exceeds 128 bits",
            index
        )));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&w[16..]);
    Ok(u128::from_be_bytes(low))
}

pub fn read_address(data: &[u8], index: usize) -> Result<Address> {
    let w = word(data, index)?;
    if w[..12].iter().any(|b| *b != 0) {
        return Err(FairSlotError::decode("Address word has non-zero padding"));
    }
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&w[12..]);
    Ok(Address(bytes))
}

pub fn read_chain_index(data: &[u8], index: usize) -> Result<usize> {
    let raw = read_u128(data, index)?;
    if raw >= CHAIN_COUNT as u128 {
        return Err(FairSlotError::decode(format!(
            "Chain index {} out of range",
            raw
        )));
    }
    Ok(raw as usize)
}

pub fn encode_u128(value: u128) -> [u8; WORD] {
    let mut w = [0u8; WORD];
    w[16..].copy_from_slice(&value.to_be_bytes());
    w
}

pub fn encode_address(address: &Address) -> [u8; WORD] {
    let mut w = [0u8; WORD];
    w[12..].copy_from_slice(address.as_bytes());
    w
}

/// Concatenate words into a payload.
pub fn pack(words: &[[u8; WORD]]) -> Vec<u8> {
    words.iter().flat_map(|w| w.iter().copied()).collect()
}
