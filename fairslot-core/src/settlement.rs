use crate::abi;
use crate::error::{FairSlotError, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Decoded `Confirmed` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// Payout in major (display) units.
    pub payout: Decimal,
    /// Payout exactly as the ledger reported it, in minor units.
    pub raw: u128,
    pub chain_index: usize,
}

/// Parse a settlement payload: payout word followed by the chain index word.
pub fn decode(data: &[u8], scale: u32) -> Result<Settlement> {
    abi::expect_words(data, 2)?;
    let raw = abi::read_u128(data, 0)?;
    let chain_index = abi::read_chain_index(data, 1)?;

    Ok(Settlement {
        payout: from_minor_units(raw, scale)?,
        raw,
        chain_index,
    })
}

pub fn from_minor_units(raw: u128, scale: u32) -> Result<Decimal> {
    let value = i128::try_from(raw)
        .map_err(|_| FairSlotError::decode(format!("Amount {} out of range", raw)))?;
    Decimal::try_from_i128_with_scale(value, scale)
        .map_err(|e| FairSlotError::decode(format!("Amount {} not representable: {}", raw, e)))
}

/// Convert a display amount back to integral minor units.
pub fn to_minor_units(amount: Decimal, scale: u32) -> Result<u128> {
    if amount.is_sign_negative() {
        return Err(FairSlotError::decode(format!(
            "Negative amount {}",
            amount
        )));
    }

    let factor = Decimal::from_i128_with_scale(10i128.pow(scale), 0);
    let minor = amount
        .checked_mul(factor)
        .ok_or_else(|| FairSlotError::decode(format!("Amount {} overflows", amount)))?;

    if !minor.fract().is_zero() {
        return Err(FairSlotError::decode(format!(
            "Amount {} has more than {} decimal places",
            amount, scale
        )));
    }

    minor
        .to_u128()
        .ok_or_else(|| FairSlotError::decode(format!("Amount {} out of range", amount)))
}
