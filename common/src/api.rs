use crate::{
    crypto::{Address, DepositSignature, Hash, PublicKey},
    registry::{Meta, Operator, SigningKey},
};
use serde::{Deserialize, Serialize};

// Execution-layer block coordinates attached to every read response,
// so consumers know which chain state the returned rows were mirrored at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElBlockSnapshot {
    pub block_number: u64,
    pub block_hash: Hash,
    pub timestamp: u64,
}

impl From<&Meta> for ElBlockSnapshot {
    fn from(meta: &Meta) -> Self {
        Self {
            block_number: meta.block_number,
            block_hash: meta.block_hash,
            timestamp: meta.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub el_block_snapshot: ElBlockSnapshot,
}

// A mirrored signing key with its owning module joined in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    pub module_address: Address,
    pub operator_index: u64,
    pub index: u64,
    pub key: PublicKey,
    pub deposit_signature: DepositSignature,
    pub used: bool,
}

impl KeyEntry {
    pub fn new(module_address: Address, key: SigningKey) -> Self {
        Self {
            module_address,
            operator_index: key.operator_index,
            index: key.index,
            key: key.key,
            deposit_signature: key.deposit_signature,
            used: key.used,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorEntry {
    pub module_address: Address,
    #[serde(flatten)]
    pub operator: Operator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysResponse {
    pub data: Vec<KeyEntry>,
    pub meta: ResponseMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorsResponse {
    pub data: Vec<OperatorEntry>,
    pub meta: ResponseMeta,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FindKeysRequest {
    pub pubkeys: Vec<PublicKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub address: Address,
    pub el_block_snapshot: Option<ElBlockSnapshot>,
    pub keys_op_index: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub modules: Vec<ModuleStatus>,
}
