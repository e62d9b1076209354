//! Begin, mid and end of block hooks.

use crate::error::HookError;
use crate::keys;
use crate::state::KvStore;
use crate::types::{BlockContext, BlockHeader, EndBlockResponse, Event};

pub trait BlockHooks: Send + Sync {
    fn begin_block(
        &self,
        state: &mut dyn KvStore,
        ctx: &BlockContext,
        header: &BlockHeader,
    ) -> Result<Vec<Event>, HookError>;

    /// Runs between the prioritized batch and the rest of the block.
    fn mid_block(&self, _state: &mut dyn KvStore, _ctx: &BlockContext) -> Result<Vec<Event>, HookError> {
        Ok(Vec::new())
    }

    fn end_block(
        &self,
        state: &mut dyn KvStore,
        ctx: &BlockContext,
        evm_gas_used: u64,
    ) -> Result<EndBlockResponse, HookError>;

    /// Name of an upgrade scheduled at `height`, if any.
    fn upgrade_pending(&self, height: u64) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledUpgrade {
    pub name: String,
    pub height: u64,
}

/// Records the header and EVM gas, reports evidence and missed votes.
#[derive(Debug, Clone, Default)]
pub struct StandardHooks {
    upgrade: Option<ScheduledUpgrade>,
}

impl StandardHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_upgrade(name: impl Into<String>, height: u64) -> Self {
        Self {
            upgrade: Some(ScheduledUpgrade {
                name: name.into(),
                height,
            }),
        }
    }
}

impl BlockHooks for StandardHooks {
    fn begin_block(
        &self,
        state: &mut dyn KvStore,
        ctx: &BlockContext,
        header: &BlockHeader,
    ) -> Result<Vec<Event>, HookError> {
        if let Some(name) = self.upgrade_pending(ctx.height) {
            return Err(HookError::UpgradeRequired {
                name,
                height: ctx.height,
            });
        }

        let mut record = keys::encode_u64(ctx.height);
        record.extend_from_slice(&keys::encode_u64(ctx.time));
        record.extend_from_slice(ctx.hash.as_slice());
        state.set(keys::header_key(), record);

        let mut events = Vec::new();
        for evidence in &header.byzantine_validators {
            events.push(
                Event::new("slash")
                    .attr("address", evidence.validator)
                    .attr("reason", "double_sign")
                    .attr("infraction_height", evidence.height),
            );
        }
        for vote in header.last_commit_votes.iter().filter(|vote| !vote.signed_last_block) {
            events.push(
                Event::new("liveness")
                    .attr("address", vote.validator)
                    .attr("power", vote.power)
                    .attr("height", ctx.height),
            );
        }
        Ok(events)
    }

    fn end_block(
        &self,
        state: &mut dyn KvStore,
        _ctx: &BlockContext,
        evm_gas_used: u64,
    ) -> Result<EndBlockResponse, HookError> {
        state.set(keys::evm_gas_key(), keys::encode_u64(evm_gas_used));
        Ok(EndBlockResponse {
            events: vec![Event::new("block_gas").attr("evm_gas_used", evm_gas_used)],
            ..EndBlockResponse::default()
        })
    }

    fn upgrade_pending(&self, height: u64) -> Option<String> {
        self.upgrade
            .as_ref()
            .filter(|upgrade| upgrade.height == height)
            .map(|upgrade| upgrade.name.clone())
    }
}
