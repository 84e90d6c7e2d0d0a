use crate::crypto::Hash;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error, Formatter},
    str::FromStr,
};

// A way to designate the block an update cycle should pin on.
// Symbolic tags are resolved by the chain reader into a concrete hash
// so that every read of one cycle observes the same chain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockRef {
    Number(u64),
    Hash(Hash),
    Finalized,
    Latest,
}

impl Display for BlockRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        match self {
            BlockRef::Number(number) => write!(f, "#{}", number),
            BlockRef::Hash(hash) => write!(f, "{}", hash),
            BlockRef::Finalized => write!(f, "finalized"),
            BlockRef::Latest => write!(f, "latest"),
        }
    }
}

impl FromStr for BlockRef {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "finalized" => Ok(BlockRef::Finalized),
            "latest" => Ok(BlockRef::Latest),
            other => {
                if let Ok(hash) = Hash::from_str(other) {
                    return Ok(BlockRef::Hash(hash));
                }
                other
                    .parse::<u64>()
                    .map(BlockRef::Number)
                    .map_err(|_| "Expected a block number, a block hash or a tag")
            }
        }
    }
}

// Canonical coordinates of a resolved block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: Hash,
    pub timestamp: u64,
}
