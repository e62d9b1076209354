//! Synthetic signed transfer load.
//!
//! Accounts are derived from seeds so every run of a configuration produces
//! the same keys, genesis and transaction stream. A [`LoadGenerator`] can be
//! installed as the application's [`ProposalSource`].

use crate::app::ProposalSource;
use crate::codec::{TypedTx, VirtualMachineTx};
use crate::keys;
use crate::state::{Key, Value};
use alloy_primitives::{keccak256, Address, Bytes, U256};
use k256::ecdsa::{SigningKey, VerifyingKey};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::BTreeMap;
use tracing::warn;

/// An account with its signing key.
#[derive(Clone)]
pub struct Account {
    pub signing_key: SigningKey,
    pub address: Address,
}

impl Account {
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = public_key_to_address(&VerifyingKey::from(&signing_key));
        Self { signing_key, address }
    }

    /// Deterministic account for `seed`.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        loop {
            let mut key_bytes = [0u8; 32];
            rng.fill(&mut key_bytes);
            // Zero or out-of-range scalars are rejected; draw again.
            if let Ok(signing_key) = SigningKey::from_bytes(&key_bytes.into()) {
                return Self::from_signing_key(signing_key);
            }
        }
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account").field("address", &self.address).finish()
    }
}

fn public_key_to_address(verifying_key: &VerifyingKey) -> Address {
    let point = verifying_key.to_encoded_point(false);
    // Uncompressed point without its 0x04 prefix.
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub num_accounts: usize,
    pub txs_per_block: usize,
    /// 0.0 spreads transfers over every account, 1.0 confines them to two.
    pub conflict_factor: f64,
    pub seed: u64,
    pub chain_id: u64,
    pub initial_balance: U256,
    pub value: U256,
    pub gas_price: U256,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_accounts: 1000,
            txs_per_block: 100,
            conflict_factor: 0.0,
            seed: 42,
            chain_id: 1,
            initial_balance: U256::from(1_000_000_000_000_000_000_000u128),
            value: U256::from(1_000_000_000_000_000u64),
            gas_price: U256::from(1),
        }
    }
}

struct GeneratorState {
    rng: StdRng,
    nonces: Vec<u64>,
}

/// Produces blocks of signed transfers with consecutive nonces.
pub struct LoadGenerator {
    config: WorkloadConfig,
    accounts: Vec<Account>,
    hot_accounts: usize,
    state: Mutex<GeneratorState>,
}

impl LoadGenerator {
    pub fn new(config: WorkloadConfig) -> Self {
        let num_accounts = config.num_accounts.max(2);
        let accounts: Vec<Account> = (0..num_accounts)
            .map(|i| Account::from_seed(config.seed.wrapping_add(i as u64)))
            .collect();
        let hot_accounts = if config.conflict_factor > 0.0 {
            (2.0 + (1.0 - config.conflict_factor) * (num_accounts as f64 - 2.0)).max(2.0) as usize
        } else {
            num_accounts
        };
        Self {
            state: Mutex::new(GeneratorState {
                rng: StdRng::seed_from_u64(config.seed),
                nonces: vec![0; num_accounts],
            }),
            config,
            accounts,
            hot_accounts,
        }
    }

    pub fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    /// Committed state funding every account.
    pub fn genesis(&self) -> BTreeMap<Key, Value> {
        self.accounts
            .iter()
            .map(|account| {
                (
                    keys::balance_key(&account.address),
                    keys::encode_u256(self.config.initial_balance),
                )
            })
            .collect()
    }

    pub fn next_block(&self) -> Vec<Bytes> {
        self.generate_up_to(self.config.txs_per_block, usize::MAX)
    }

    fn generate_up_to(&self, max_txs: usize, max_bytes: usize) -> Vec<Bytes> {
        let mut state = self.state.lock();
        let mut txs = Vec::with_capacity(max_txs);
        let mut total_bytes = 0usize;

        while txs.len() < max_txs {
            let (from, to) = self.pick_pair(&mut state.rng);
            let mut tx = VirtualMachineTx {
                chain_id: self.config.chain_id,
                nonce: state.nonces[from],
                gas_limit: crate::vm::TX_GAS,
                max_fee_per_gas: self.config.gas_price,
                max_priority_fee_per_gas: U256::ZERO,
                to: Some(self.accounts[to].address),
                value: self.config.value,
                data: Bytes::new(),
                signature: Vec::new(),
            };
            let raw = match tx.sign(&self.accounts[from].signing_key).and_then(|()| TypedTx::Vm(tx).encode()) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(%err, "failed to build load transaction");
                    break;
                }
            };
            if total_bytes + raw.len() > max_bytes {
                break;
            }
            total_bytes += raw.len();
            state.nonces[from] += 1;
            txs.push(Bytes::from(raw));
        }
        txs
    }

    fn pick_pair(&self, rng: &mut StdRng) -> (usize, usize) {
        let range = if rng.gen::<f64>() < self.config.conflict_factor {
            self.hot_accounts
        } else {
            self.accounts.len()
        };
        let from = rng.gen_range(0..range);
        let mut to = rng.gen_range(0..range);
        while to == from {
            to = rng.gen_range(0..range);
        }
        (from, to)
    }
}

impl ProposalSource for LoadGenerator {
    fn generate(&self, _height: u64, max_bytes: usize) -> Vec<Bytes> {
        self.generate_up_to(self.config.txs_per_block, max_bytes)
    }
}
