//! Native business-rule handlers, registered per message type.

use crate::codec::NativeMsg;
use crate::error::HandlerError;
use crate::keys::{self, address_id};
use crate::state::KvStore;
use crate::types::{codes, BlockContext, Event, ResourceAccessOperation};
use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const MSG_SEND: &str = "bank/MsgSend";
pub const MSG_AGGREGATE_VOTE: &str = "oracle/MsgAggregateVote";
pub const MSG_SUBMIT_PROPOSAL: &str = "gov/MsgSubmitProposal";

/// Handler for one native message type.
pub trait NativeHandler: Send + Sync {
    fn msg_type(&self) -> &'static str;

    /// Resources the message reads and writes for `signer`.
    fn access_ops(&self, signer: &Address, msg: &NativeMsg) -> Result<Vec<ResourceAccessOperation>, HandlerError>;

    fn deliver(
        &self,
        state: &mut dyn KvStore,
        ctx: &BlockContext,
        signer: &Address,
        msg: &NativeMsg,
    ) -> Result<Vec<Event>, HandlerError>;

    fn gas_cost(&self) -> u64 {
        10_000
    }

    /// Prioritized messages run in a batch ahead of the rest of the block.
    fn is_prioritized(&self) -> bool {
        false
    }

    /// False when the handler's effects cannot be captured by declared
    /// accesses; a batch containing it must run sequentially.
    fn is_schedulable(&self) -> bool {
        true
    }
}

/// Message-type keyed handler table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn NativeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in bank, oracle and gov handlers.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BankSendHandler));
        registry.register(Arc::new(OracleVoteHandler));
        registry.register(Arc::new(GovProposalHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn NativeHandler>) {
        self.handlers.insert(handler.msg_type(), handler);
    }

    pub fn get(&self, msg_type: &str) -> Option<&Arc<dyn NativeHandler>> {
        self.handlers.get(msg_type)
    }

    /// True if every message is registered and prioritized.
    pub fn all_prioritized(&self, msgs: &[NativeMsg]) -> bool {
        !msgs.is_empty()
            && msgs
                .iter()
                .all(|msg| self.get(&msg.msg_type).is_some_and(|h| h.is_prioritized()))
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(msg: &NativeMsg) -> Result<T, HandlerError> {
    msg.body()
        .map_err(|e| HandlerError::new(codes::TX_DECODE, format!("{}: {e}", msg.msg_type)))
}

// ============================================================================
// Bank
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSend {
    pub to: Address,
    pub amount: U256,
}

pub struct BankSendHandler;

impl NativeHandler for BankSendHandler {
    fn msg_type(&self) -> &'static str {
        MSG_SEND
    }

    fn access_ops(&self, signer: &Address, msg: &NativeMsg) -> Result<Vec<ResourceAccessOperation>, HandlerError> {
        let body: MsgSend = decode_body(msg)?;
        Ok(vec![
            ResourceAccessOperation::write(keys::BALANCES, address_id(signer)),
            ResourceAccessOperation::write(keys::BALANCES, address_id(&body.to)),
        ])
    }

    fn deliver(
        &self,
        state: &mut dyn KvStore,
        _ctx: &BlockContext,
        signer: &Address,
        msg: &NativeMsg,
    ) -> Result<Vec<Event>, HandlerError> {
        let body: MsgSend = decode_body(msg)?;
        let from_balance = keys::get_balance(&*state, signer);
        let remaining = from_balance.checked_sub(body.amount).ok_or_else(|| {
            HandlerError::new(
                codes::INSUFFICIENT_FUNDS,
                format!("{from_balance} is smaller than {}", body.amount),
            )
        })?;
        keys::set_balance(state, signer, remaining);
        let to_balance = keys::get_balance(&*state, &body.to);
        keys::set_balance(state, &body.to, to_balance.saturating_add(body.amount));

        Ok(vec![Event::new("transfer")
            .attr("sender", signer)
            .attr("recipient", body.to)
            .attr("amount", body.amount)])
    }
}

// ============================================================================
// Oracle
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgAggregateVote {
    pub exchange_rates: String,
}

pub struct OracleVoteHandler;

impl NativeHandler for OracleVoteHandler {
    fn msg_type(&self) -> &'static str {
        MSG_AGGREGATE_VOTE
    }

    fn access_ops(&self, signer: &Address, _msg: &NativeMsg) -> Result<Vec<ResourceAccessOperation>, HandlerError> {
        Ok(vec![ResourceAccessOperation::write(keys::ORACLE_VOTES, address_id(signer))])
    }

    fn deliver(
        &self,
        state: &mut dyn KvStore,
        ctx: &BlockContext,
        signer: &Address,
        msg: &NativeMsg,
    ) -> Result<Vec<Event>, HandlerError> {
        let body: MsgAggregateVote = decode_body(msg)?;
        if body.exchange_rates.is_empty() {
            return Err(HandlerError::new(codes::INVALID_REQUEST, "empty exchange rates"));
        }
        let mut record = keys::encode_u64(ctx.height);
        record.extend_from_slice(body.exchange_rates.as_bytes());
        state.set(keys::vote_key(signer), record);

        Ok(vec![Event::new("aggregate_vote")
            .attr("voter", signer)
            .attr("exchange_rates", body.exchange_rates)])
    }

    fn gas_cost(&self) -> u64 {
        0
    }

    fn is_prioritized(&self) -> bool {
        true
    }
}

// ============================================================================
// Governance
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSubmitProposal {
    pub id: u64,
    pub title: String,
}

/// Stores a proposal by id. Not schedulable.
pub struct GovProposalHandler;

impl NativeHandler for GovProposalHandler {
    fn msg_type(&self) -> &'static str {
        MSG_SUBMIT_PROPOSAL
    }

    fn access_ops(&self, _signer: &Address, msg: &NativeMsg) -> Result<Vec<ResourceAccessOperation>, HandlerError> {
        let body: MsgSubmitProposal = decode_body(msg)?;
        Ok(vec![ResourceAccessOperation::write(keys::GOV_PROPOSALS, body.id.to_string())])
    }

    fn deliver(
        &self,
        state: &mut dyn KvStore,
        _ctx: &BlockContext,
        signer: &Address,
        msg: &NativeMsg,
    ) -> Result<Vec<Event>, HandlerError> {
        let body: MsgSubmitProposal = decode_body(msg)?;
        let key = keys::proposal_key(body.id);
        if state.get(&key).is_some() {
            return Err(HandlerError::new(
                codes::INVALID_REQUEST,
                format!("proposal {} already exists", body.id),
            ));
        }
        state.set(key, body.title.clone().into_bytes());

        Ok(vec![Event::new("submit_proposal")
            .attr("proposer", signer)
            .attr("proposal_id", body.id)])
    }

    fn is_schedulable(&self) -> bool {
        false
    }
}
