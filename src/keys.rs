//! Ledger key layout and typed accessors.
//!
//! Every key is `<resource>/<identifier>`: the resource type is everything
//! before the last `/`, the identifier the tail. Declared access operations
//! are checked against keys through this split.

use crate::state::{Key, KvRead, KvStore};
use crate::types::ResourceType;
use alloy_primitives::{hex, Address, U256};

pub const BALANCES: &str = "bank/balances";
pub const NONCES: &str = "evm/nonce";
pub const ORACLE_VOTES: &str = "oracle/votes";
pub const GOV_PROPOSALS: &str = "gov/proposals";
pub const BLOCK_HEADER: &str = "block/header";
pub const BLOCK_GAS: &str = "block/gas";

/// Identifier form of an address.
pub fn address_id(address: &Address) -> String {
    hex::encode(address.as_slice())
}

pub fn key(resource: &str, identifier: &str) -> Key {
    format!("{resource}/{identifier}").into_bytes()
}

pub fn balance_key(address: &Address) -> Key {
    key(BALANCES, &address_id(address))
}

pub fn nonce_key(address: &Address) -> Key {
    key(NONCES, &address_id(address))
}

pub fn vote_key(address: &Address) -> Key {
    key(ORACLE_VOTES, &address_id(address))
}

pub fn proposal_key(id: u64) -> Key {
    key(GOV_PROPOSALS, &id.to_string())
}

pub fn header_key() -> Key {
    key(BLOCK_HEADER, "current")
}

pub fn evm_gas_key() -> Key {
    key(BLOCK_GAS, "evm_used")
}

/// Splits a key into its resource type and identifier.
pub fn split_key(key: &[u8]) -> Option<(ResourceType, &str)> {
    let key = std::str::from_utf8(key).ok()?;
    let (resource, identifier) = key.rsplit_once('/')?;
    Some((ResourceType::new(resource), identifier))
}

pub fn encode_u64(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

pub fn decode_u64(bytes: &[u8]) -> u64 {
    <[u8; 8]>::try_from(bytes).map(u64::from_be_bytes).unwrap_or(0)
}

pub fn encode_u256(value: U256) -> Vec<u8> {
    value.to_be_bytes::<32>().to_vec()
}

pub fn decode_u256(bytes: &[u8]) -> U256 {
    U256::try_from_be_slice(bytes).unwrap_or_default()
}

pub fn get_balance<S: KvRead + ?Sized>(state: &S, address: &Address) -> U256 {
    state
        .get(&balance_key(address))
        .map(|bytes| decode_u256(&bytes))
        .unwrap_or_default()
}

pub fn set_balance<S: KvStore + ?Sized>(state: &mut S, address: &Address, balance: U256) {
    state.set(balance_key(address), encode_u256(balance));
}

pub fn get_nonce<S: KvRead + ?Sized>(state: &S, address: &Address) -> u64 {
    state
        .get(&nonce_key(address))
        .map(|bytes| decode_u64(&bytes))
        .unwrap_or(0)
}

pub fn set_nonce<S: KvStore + ?Sized>(state: &mut S, address: &Address, nonce: u64) {
    state.set(nonce_key(address), encode_u64(nonce));
}
