//! Transaction envelope.
//!
//! Raw transactions are bincode-encoded [`TypedTx`] values. Decoding resolves
//! the kind once; everything downstream carries the tagged union.

use crate::error::{CodecError, RecoveryError};
use alloy_primitives::{address, keccak256, Address, Bytes, Signature, B256, U256};
use bincode::Options;
use k256::ecdsa::SigningKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Upper bound on an encoded transaction.
pub const MAX_TX_BYTES: u64 = 1 << 20;

/// Calls to this address carry an encoded [`NativeMsg`] in their data and
/// are dispatched to the native handlers.
pub const INTEROP_ADDRESS: Address = address!("0000000000000000000000000000000000001001");

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_TX_BYTES)
}

/// Encodes any value with the transaction codec.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    options()
        .serialize(value)
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decodes any value with the transaction codec; trailing bytes are rejected.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    options()
        .deserialize(bytes)
        .map_err(|e| CodecError::Decode(e.to_string()))
}

/// Hash identifying a raw transaction.
pub fn tx_hash(raw: &[u8]) -> B256 {
    keccak256(raw)
}

/// A message for a registered native handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeMsg {
    pub msg_type: String,
    pub payload: Vec<u8>,
}

impl NativeMsg {
    pub fn new<T: Serialize>(msg_type: impl Into<String>, body: &T) -> Result<Self, CodecError> {
        Ok(Self {
            msg_type: msg_type.into(),
            payload: encode(body)?,
        })
    }

    pub fn body<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        decode(&self.payload)
    }
}

/// A transaction dispatched to native business-rule handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeLedgerTx {
    pub signer: Address,
    /// Flat fee deducted before any message runs.
    pub fee: U256,
    pub gas_limit: u64,
    pub msgs: Vec<NativeMsg>,
}

/// A transaction for the virtual machine interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineTx {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_limit: u64,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    /// `None` creates a contract.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    /// 65-byte recoverable signature over [`VirtualMachineTx::signing_hash`].
    pub signature: Vec<u8>,
}

impl VirtualMachineTx {
    /// Hash of the transaction with its signature cleared.
    pub fn signing_hash(&self) -> Result<B256, CodecError> {
        let unsigned = Self {
            signature: Vec::new(),
            ..self.clone()
        };
        Ok(keccak256(encode(&unsigned)?))
    }

    pub fn sign(&mut self, signing_key: &SigningKey) -> Result<(), CodecError> {
        let hash = self.signing_hash()?;
        let (sig, recovery_id) = signing_key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        let signature = Signature::from_signature_and_parity(sig, recovery_id.is_y_odd());
        self.signature = signature.as_bytes().to_vec();
        Ok(())
    }

    /// Recovers the sender's address from the signature.
    pub fn recover_sender(&self) -> Result<Address, RecoveryError> {
        let hash = self
            .signing_hash()
            .map_err(|e| RecoveryError::Decode(e.to_string()))?;
        let signature = Signature::from_raw(&self.signature)
            .map_err(|e| RecoveryError::InvalidSignature(e.to_string()))?;
        signature
            .recover_address_from_prehash(&hash)
            .map_err(|e| RecoveryError::InvalidSignature(e.to_string()))
    }

    pub fn is_create(&self) -> bool {
        self.to.is_none()
    }

    pub fn is_interop(&self) -> bool {
        self.to == Some(INTEROP_ADDRESS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Native,
    VirtualMachine,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypedTx {
    Native(NativeLedgerTx),
    Vm(VirtualMachineTx),
}

impl TypedTx {
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        decode(raw)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode(self)
    }

    pub fn kind(&self) -> TxKind {
        match self {
            TypedTx::Native(_) => TxKind::Native,
            TypedTx::Vm(_) => TxKind::VirtualMachine,
        }
    }

    pub fn gas_limit(&self) -> u64 {
        match self {
            TypedTx::Native(tx) => tx.gas_limit,
            TypedTx::Vm(tx) => tx.gas_limit,
        }
    }
}
