mod contract;
mod rpc;

pub use contract::ContractFetcher;
pub use rpc::JsonRpcClient;

use async_trait::async_trait;
use keymirror_common::{
    block::{BlockInfo, BlockRef},
    crypto::Hash,
    registry::{Operator, SigningKey},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chain RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("unexpected RPC payload: {0}")]
    Payload(String),
    #[error("unknown block {0}")]
    UnknownBlock(String),
    #[error("ABI error: {0}")]
    Abi(#[from] ethabi::Error),
    #[error("{0} out of range")]
    OutOfRange(&'static str),
}

// Read-only view of one registry module at pinned chain states.
// All reads of one update cycle are pinned on the hash returned by
// resolve_block so a reorg during the cycle cannot splice in rows
// from a different chain state.
#[async_trait]
pub trait RegistryFetcher: Send + Sync {
    // Resolve a block reference into canonical block coordinates
    async fn resolve_block(&self, at: &BlockRef) -> Result<BlockInfo, ChainError>;

    // Read the key mutation counter of the module at the given block
    async fn keys_op_index(&self, block: &Hash) -> Result<u64, ChainError>;

    // Read the full operator list at the given block, dense and ascending
    async fn operators(&self, block: &Hash) -> Result<Vec<Operator>, ChainError>;

    // Read the signing keys of one operator over the half-open range
    // [from, to) at the given block. An empty range yields no calls.
    async fn signing_keys(
        &self,
        operator: u64,
        from: u64,
        to: u64,
        block: &Hash,
    ) -> Result<Vec<SigningKey>, ChainError>;
}
