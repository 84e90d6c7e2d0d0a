use super::{
    rpc::{parse_hex_u64, JsonRpcClient},
    ChainError, RegistryFetcher,
};
use crate::config::{KEY_FETCH_BATCH_SIZE, OPERATOR_FETCH_BATCH_SIZE};
use async_trait::async_trait;
use ethabi::{ethereum_types::U256, Contract, Token};
use keymirror_common::{
    block::{BlockInfo, BlockRef},
    crypto::{Address, DepositSignature, Hash, PublicKey},
    registry::{Operator, SigningKey},
};
use lazy_static::lazy_static;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

// The read surface of the node operators registry used by the mirror
const REGISTRY_ABI_JSON: &str = r#"[
    {
        "name": "getKeysOpIndex",
        "type": "function",
        "stateMutability": "view",
        "inputs": [],
        "outputs": [{ "name": "index", "type": "uint256" }]
    },
    {
        "name": "getNodeOperatorsCount",
        "type": "function",
        "stateMutability": "view",
        "inputs": [],
        "outputs": [{ "name": "count", "type": "uint256" }]
    },
    {
        "name": "getNodeOperator",
        "type": "function",
        "stateMutability": "view",
        "inputs": [
            { "name": "_id", "type": "uint256" },
            { "name": "_fullInfo", "type": "bool" }
        ],
        "outputs": [
            { "name": "active", "type": "bool" },
            { "name": "name", "type": "string" },
            { "name": "rewardAddress", "type": "address" },
            { "name": "stakingLimit", "type": "uint64" },
            { "name": "stoppedValidators", "type": "uint64" },
            { "name": "totalSigningKeys", "type": "uint64" },
            { "name": "usedSigningKeys", "type": "uint64" }
        ]
    },
    {
        "name": "getSigningKey",
        "type": "function",
        "stateMutability": "view",
        "inputs": [
            { "name": "_operator_id", "type": "uint256" },
            { "name": "_index", "type": "uint256" }
        ],
        "outputs": [
            { "name": "key", "type": "bytes" },
            { "name": "depositSignature", "type": "bytes" },
            { "name": "used", "type": "bool" }
        ]
    }
]"#;

lazy_static! {
    static ref REGISTRY_ABI: Contract =
        serde_json::from_str(REGISTRY_ABI_JSON).expect("embedded registry ABI is valid");
}

#[derive(Deserialize)]
struct RpcBlock {
    number: String,
    hash: String,
    timestamp: String,
}

// Contract reader for one registry module. All reads go through eth_call
// pinned on a block hash with the EIP-1898 block parameter, batched where
// the call cardinality warrants it.
pub struct ContractFetcher {
    rpc: Arc<JsonRpcClient>,
    module: Address,
    operator_batch: usize,
    key_batch: usize,
}

impl ContractFetcher {
    pub fn new(rpc: Arc<JsonRpcClient>, module: Address) -> Self {
        Self {
            rpc,
            module,
            operator_batch: OPERATOR_FETCH_BATCH_SIZE,
            key_batch: KEY_FETCH_BATCH_SIZE,
        }
    }

    pub fn module(&self) -> &Address {
        &self.module
    }

    fn call_params(&self, data: &[u8], block: &Hash) -> Value {
        json!([
            { "to": self.module.to_hex(), "data": format!("0x{}", hex::encode(data)) },
            { "blockHash": block.to_hex() }
        ])
    }

    async fn eth_call(&self, data: Vec<u8>, block: &Hash) -> Result<Vec<u8>, ChainError> {
        let value = self
            .rpc
            .call("eth_call", self.call_params(&data, block))
            .await?;
        decode_hex_bytes(&value)
    }

    async fn operator_count(&self, block: &Hash) -> Result<u64, ChainError> {
        let function = REGISTRY_ABI.function("getNodeOperatorsCount")?;
        let data = self.eth_call(function.encode_input(&[])?, block).await?;
        let mut tokens = function.decode_output(&data)?.into_iter();
        take_uint(tokens.next(), "operator count")
    }

    fn decode_operator(index: u64, data: &[u8]) -> Result<Operator, ChainError> {
        let function = REGISTRY_ABI.function("getNodeOperator")?;
        let mut tokens = function.decode_output(data)?.into_iter();

        Ok(Operator {
            index,
            active: take_bool(tokens.next(), "active")?,
            name: take_string(tokens.next(), "name")?,
            reward_address: take_address(tokens.next(), "reward address")?,
            staking_limit: take_uint(tokens.next(), "staking limit")?,
            stopped_validators: take_uint(tokens.next(), "stopped validators")?,
            total_signing_keys: take_uint(tokens.next(), "total signing keys")?,
            used_signing_keys: take_uint(tokens.next(), "used signing keys")?,
        })
    }

    fn decode_signing_key(
        operator: u64,
        index: u64,
        data: &[u8],
    ) -> Result<SigningKey, ChainError> {
        let function = REGISTRY_ABI.function("getSigningKey")?;
        let mut tokens = function.decode_output(data)?.into_iter();

        let key = take_bytes(tokens.next(), "key")?;
        let deposit_signature = take_bytes(tokens.next(), "deposit signature")?;
        let used = take_bool(tokens.next(), "used")?;

        Ok(SigningKey {
            operator_index: operator,
            index,
            key: PublicKey::try_from(key.as_slice())
                .map_err(|e| ChainError::Payload(e.to_owned()))?,
            deposit_signature: DepositSignature::try_from(deposit_signature.as_slice())
                .map_err(|e| ChainError::Payload(e.to_owned()))?,
            used,
        })
    }
}

#[async_trait]
impl RegistryFetcher for ContractFetcher {
    async fn resolve_block(&self, at: &BlockRef) -> Result<BlockInfo, ChainError> {
        let (method, param) = match at {
            BlockRef::Number(number) => ("eth_getBlockByNumber", json!(format!("0x{:x}", number))),
            BlockRef::Finalized => ("eth_getBlockByNumber", json!("finalized")),
            BlockRef::Latest => ("eth_getBlockByNumber", json!("latest")),
            BlockRef::Hash(hash) => ("eth_getBlockByHash", json!(hash.to_hex())),
        };

        let value = self.rpc.call(method, json!([param, false])).await?;
        if value.is_null() {
            return Err(ChainError::UnknownBlock(at.to_string()));
        }

        let block: RpcBlock =
            serde_json::from_value(value).map_err(|e| ChainError::Payload(e.to_string()))?;

        Ok(BlockInfo {
            number: parse_hex_u64(&block.number, "block number")?,
            hash: block
                .hash
                .parse()
                .map_err(|e: &str| ChainError::Payload(e.to_owned()))?,
            timestamp: parse_hex_u64(&block.timestamp, "block timestamp")?,
        })
    }

    async fn keys_op_index(&self, block: &Hash) -> Result<u64, ChainError> {
        let function = REGISTRY_ABI.function("getKeysOpIndex")?;
        let data = self.eth_call(function.encode_input(&[])?, block).await?;
        let mut tokens = function.decode_output(&data)?.into_iter();
        take_uint(tokens.next(), "keys op index")
    }

    async fn operators(&self, block: &Hash) -> Result<Vec<Operator>, ChainError> {
        let count = self.operator_count(block).await?;
        let function = REGISTRY_ABI.function("getNodeOperator")?;

        let mut operators = Vec::with_capacity(count as usize);
        let mut index = 0u64;
        while index < count {
            let end = count.min(index + self.operator_batch as u64);
            let mut params = Vec::with_capacity((end - index) as usize);
            for i in index..end {
                let data =
                    function.encode_input(&[Token::Uint(U256::from(i)), Token::Bool(true)])?;
                params.push(self.call_params(&data, block));
            }

            let results = self.rpc.batch("eth_call", params).await?;
            for (i, value) in (index..end).zip(results) {
                let data = decode_hex_bytes(&value)?;
                operators.push(Self::decode_operator(i, &data)?);
            }

            index = end;
        }

        Ok(operators)
    }

    async fn signing_keys(
        &self,
        operator: u64,
        from: u64,
        to: u64,
        block: &Hash,
    ) -> Result<Vec<SigningKey>, ChainError> {
        if to <= from {
            return Ok(Vec::new());
        }

        let function = REGISTRY_ABI.function("getSigningKey")?;

        let mut keys = Vec::with_capacity((to - from) as usize);
        let mut index = from;
        while index < to {
            let end = to.min(index + self.key_batch as u64);
            let mut params = Vec::with_capacity((end - index) as usize);
            for i in index..end {
                let data = function
                    .encode_input(&[Token::Uint(U256::from(operator)), Token::Uint(U256::from(i))])?;
                params.push(self.call_params(&data, block));
            }

            let results = self.rpc.batch("eth_call", params).await?;
            for (i, value) in (index..end).zip(results) {
                let data = decode_hex_bytes(&value)?;
                keys.push(Self::decode_signing_key(operator, i, &data)?);
            }

            index = end;
        }

        Ok(keys)
    }
}

// eth_call results are 0x-prefixed hex strings
fn decode_hex_bytes(value: &Value) -> Result<Vec<u8>, ChainError> {
    let raw = value
        .as_str()
        .ok_or_else(|| ChainError::Payload(format!("expected hex string, got {}", value)))?;
    hex::decode(raw.strip_prefix("0x").unwrap_or(raw))
        .map_err(|e| ChainError::Payload(e.to_string()))
}

fn take_uint(token: Option<Token>, what: &'static str) -> Result<u64, ChainError> {
    match token {
        Some(Token::Uint(value)) => {
            if value > U256::from(u64::MAX) {
                return Err(ChainError::OutOfRange(what));
            }
            Ok(value.as_u64())
        }
        _ => Err(ChainError::Payload(format!("expected uint for {}", what))),
    }
}

fn take_bool(token: Option<Token>, what: &'static str) -> Result<bool, ChainError> {
    match token {
        Some(Token::Bool(value)) => Ok(value),
        _ => Err(ChainError::Payload(format!("expected bool for {}", what))),
    }
}

fn take_string(token: Option<Token>, what: &'static str) -> Result<String, ChainError> {
    match token {
        Some(Token::String(value)) => Ok(value),
        _ => Err(ChainError::Payload(format!("expected string for {}", what))),
    }
}

fn take_address(token: Option<Token>, what: &'static str) -> Result<Address, ChainError> {
    match token {
        Some(Token::Address(value)) => Ok(Address::new(value.to_fixed_bytes())),
        _ => Err(ChainError::Payload(format!("expected address for {}", what))),
    }
}

fn take_bytes(token: Option<Token>, what: &'static str) -> Result<Vec<u8>, ChainError> {
    match token {
        Some(Token::Bytes(value)) => Ok(value),
        _ => Err(ChainError::Payload(format!("expected bytes for {}", what))),
    }
}
