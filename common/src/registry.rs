use crate::{
    block::BlockInfo,
    crypto::{Address, DepositSignature, Hash, PublicKey},
};
use serde::{Deserialize, Serialize};

// Snapshot pinning the mirrored registry state to a chain state.
// One row per tracked module, replaced atomically on every committed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub block_number: u64,
    pub block_hash: Hash,
    pub timestamp: u64,
    // monotone counter bumped by the contract on any key mutation,
    // used as a cheap change sentinel
    pub keys_op_index: u64,
}

impl Meta {
    pub fn new(block: BlockInfo, keys_op_index: u64) -> Self {
        Self {
            block_number: block.number,
            block_hash: block.hash,
            timestamp: block.timestamp,
            keys_op_index,
        }
    }

    pub fn block(&self) -> BlockInfo {
        BlockInfo {
            number: self.block_number,
            hash: self.block_hash,
            timestamp: self.timestamp,
        }
    }
}

// A node operator registered in the on-chain module.
// Indices are dense, contract-assigned and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub index: u64,
    pub active: bool,
    pub name: String,
    pub reward_address: Address,
    pub staking_limit: u64,
    pub stopped_validators: u64,
    // upper bound on keys owned by this operator
    pub total_signing_keys: u64,
    // keys below this index are consumed by deposits and immutable on-chain
    pub used_signing_keys: u64,
}

// One signing key of an operator, addressed by its absolute index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKey {
    pub operator_index: u64,
    pub index: u64,
    pub key: PublicKey,
    pub deposit_signature: DepositSignature,
    pub used: bool,
}
