// Copyright (c) Eth Relay Contributors
// SPDX-License-Identifier: Apache-2.0

//! ERC-20 call encoding and decimal scaling. Pure data formatting.

use ethers::types::{Address, Bytes, U256};

use crate::error::{RelayError, RelayResult};

pub const ETH_DECIMALS: u32 = 18;

// First four bytes of keccak256("transfer(address,uint256)") and
// keccak256("balanceOf(address)").
const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// Scale a human-readable decimal amount ("0.5") into base units
/// (amount × 10^decimals).
pub fn scale_to_base_units(value: &str, decimals: u32) -> RelayResult<U256> {
    let invalid = |reason: &str| {
        RelayError::InvalidAmount(value.to_string(), reason.to_string())
    };

    let (whole, frac) = match value.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (value, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid("empty amount"));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid("not a decimal number"));
    }
    if frac.len() as u32 > decimals {
        return Err(invalid("more fractional digits than the token supports"));
    }

    let mut digits = String::with_capacity(whole.len() + decimals as usize);
    digits.push_str(if whole.is_empty() { "0" } else { whole });
    digits.push_str(frac);
    for _ in 0..(decimals as usize - frac.len()) {
        digits.push('0');
    }
    U256::from_dec_str(&digits).map_err(|e| invalid(&e.to_string()))
}

/// Calldata for `transfer(recipient, amount)`.
pub fn encode_transfer(recipient: Address, amount: U256) -> Bytes {
    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&TRANSFER_SELECTOR);
    data.extend_from_slice(&address_word(recipient));
    data.extend_from_slice(&u256_word(amount));
    Bytes::from(data)
}

/// Calldata for `balanceOf(owner)`.
pub fn encode_balance_of(owner: Address) -> Bytes {
    let mut data = Vec::with_capacity(4 + 32);
    data.extend_from_slice(&BALANCE_OF_SELECTOR);
    data.extend_from_slice(&address_word(owner));
    Bytes::from(data)
}

fn address_word(address: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}

fn u256_word(value: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_whole_number() {
        assert_eq!(scale_to_base_units("1", 6).unwrap(), U256::from(1_000_000u64));
        assert_eq!(
            scale_to_base_units("25", 18).unwrap(),
            U256::from_dec_str("25000000000000000000").unwrap()
        );
    }

    #[test]
    fn test_scale_fractional_number() {
        assert_eq!(
            scale_to_base_units("0.5", 18).unwrap(),
            U256::from_dec_str("500000000000000000").unwrap()
        );
        assert_eq!(scale_to_base_units("1.25", 6).unwrap(), U256::from(1_250_000u64));
        // No leading zero before the dot.
        assert_eq!(scale_to_base_units(".5", 1).unwrap(), U256::from(5u64));
    }

    #[test]
    fn test_scale_rejects_malformed_amounts() {
        assert!(scale_to_base_units("", 18).is_err());
        assert!(scale_to_base_units(".", 18).is_err());
        assert!(scale_to_base_units("1.2.3", 18).is_err());
        assert!(scale_to_base_units("abc", 18).is_err());
        assert!(scale_to_base_units("-1", 18).is_err());
        // More fractional digits than the token supports.
        assert!(scale_to_base_units("0.1234567", 6).is_err());
    }

    #[test]
    fn test_encode_transfer_layout() {
        let recipient = "0x1111111111111111111111111111111111111111"
            .parse::<Address>()
            .unwrap();
        let data = encode_transfer(recipient, U256::from(0x0102u64));
        assert_eq!(data.len(), 4 + 32 + 32);
        assert_eq!(
            hex::encode(&data[..]),
            "a9059cbb\
             0000000000000000000000001111111111111111111111111111111111111111\
             0000000000000000000000000000000000000000000000000000000000000102"
        );
    }

    #[test]
    fn test_encode_balance_of_layout() {
        let owner = "0x2222222222222222222222222222222222222222"
            .parse::<Address>()
            .unwrap();
        let data = encode_balance_of(owner);
        assert_eq!(data.len(), 4 + 32);
        assert!(hex::encode(&data[..]).starts_with("70a08231"));
    }
}
