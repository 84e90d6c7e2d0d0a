use keymirror_common::registry::{Meta, Operator};
use std::collections::HashMap;

// Which part of an operator's key list the mirror tracks.
// The key mirror follows everything the contract advertises, the
// validator mirror only follows the deposited prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    All,
    UsedOnly,
}

// Cheap change sentinel: the contract bumps keys_op_index on any key
// mutation, and the block hash pins the snapshot against reorgs at an
// equal counter value
pub fn same_meta(prev: Option<&Meta>, curr: &Meta) -> bool {
    match prev {
        Some(prev) => {
            prev.keys_op_index == curr.keys_op_index && prev.block_hash == curr.block_hash
        }
        None => false,
    }
}

// Whether the deposited prefix of an operator can be trusted across the
// two observations. All stable columns must match; the key total may only
// have grown, keys appended past the previous total never invalidate the
// prefix, while a shrunken total means on-chain key removal and voids any
// assumption about what is still there.
pub fn same_operator(prev: Option<&Operator>, curr: &Operator) -> bool {
    match prev {
        Some(prev) => {
            prev.index == curr.index
                && prev.active == curr.active
                && prev.name == curr.name
                && prev.reward_address == curr.reward_address
                && prev.staking_limit == curr.staking_limit
                && prev.stopped_validators == curr.stopped_validators
                && prev.used_signing_keys == curr.used_signing_keys
                && curr.total_signing_keys >= prev.total_signing_keys
        }
        None => false,
    }
}

// Upper fetch bound of one operator under the given scope
pub fn to_index(scope: KeyScope, curr: &Operator) -> u64 {
    match scope {
        KeyScope::All => curr.total_signing_keys,
        KeyScope::UsedOnly => curr.used_signing_keys,
    }
}

// Lower fetch bound: an unchanged operator keeps its deposited prefix,
// which the contract guarantees immutable, so only the tail is refetched.
// Some test networks delete used keys, which can push the prefix past the
// upper bound, in which case everything is refetched.
pub fn from_index(prev: Option<&Operator>, curr: &Operator, to: u64) -> u64 {
    let from = match prev {
        Some(prev) if same_operator(Some(prev), curr) => prev.used_signing_keys,
        _ => 0,
    };

    if from > to {
        0
    } else {
        from
    }
}

// Whether the stored key rows cover everything the stored operator rows
// advertise under the given scope. A shortfall means a previous cycle was
// interrupted between its operator commit and its key fetches, and the
// fast path must not skip the repair.
pub fn covers(scope: KeyScope, operators: &[Operator], key_counts: &HashMap<u64, u64>) -> bool {
    operators.iter().all(|operator| {
        key_counts.get(&operator.index).copied().unwrap_or(0) >= to_index(scope, operator)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keymirror_common::crypto::{Address, Hash};

    fn meta(block_number: u64, block_hash: u8, keys_op_index: u64) -> Meta {
        Meta {
            block_number,
            block_hash: Hash::new([block_hash; 32]),
            timestamp: 1700,
            keys_op_index,
        }
    }

    fn operator(total: u64, used: u64) -> Operator {
        Operator {
            index: 0,
            active: true,
            name: "operator".to_owned(),
            reward_address: Address::zero(),
            staking_limit: 100,
            stopped_validators: 0,
            total_signing_keys: total,
            used_signing_keys: used,
        }
    }

    #[test]
    fn test_same_meta() {
        let curr = meta(100, 0xAA, 7);
        assert!(!same_meta(None, &curr));
        assert!(same_meta(Some(&meta(99, 0xAA, 7)), &curr));
        // counter moved
        assert!(!same_meta(Some(&meta(100, 0xAA, 8)), &curr));
        // reorg at an equal counter
        assert!(!same_meta(Some(&meta(100, 0xBB, 7)), &curr));
    }

    #[test]
    fn test_same_operator() {
        let curr = operator(3, 1);
        assert!(!same_operator(None, &curr));
        assert!(same_operator(Some(&operator(3, 1)), &curr));
        // appended keys keep the prefix trustworthy
        assert!(same_operator(Some(&operator(2, 1)), &curr));
        // a shrunken total or a moved used counter does not
        assert!(!same_operator(Some(&operator(4, 1)), &curr));
        assert!(!same_operator(Some(&operator(3, 2)), &curr));

        let mut renamed = operator(3, 1);
        renamed.name = "renamed".to_owned();
        assert!(!same_operator(Some(&renamed), &curr));
    }

    #[test]
    fn test_to_index_per_scope() {
        let curr = operator(12, 5);
        assert_eq!(to_index(KeyScope::All, &curr), 12);
        assert_eq!(to_index(KeyScope::UsedOnly, &curr), 5);
    }

    #[test]
    fn test_from_index_skips_immutable_prefix() {
        let curr = operator(4, 2);
        assert_eq!(from_index(Some(&operator(4, 2)), &curr, 4), 2);
        // keys were appended: the deposited prefix still holds
        assert_eq!(from_index(Some(&operator(3, 2)), &curr, 4), 2);
        // the used counter moved: refetch from scratch
        assert_eq!(from_index(Some(&operator(4, 1)), &curr, 4), 0);
        assert_eq!(from_index(None, &curr, 4), 0);
    }

    #[test]
    fn test_from_index_resets_on_shrunken_total() {
        // on-chain key removal: the whole remaining range is refetched
        let curr = operator(2, 1);
        assert_eq!(from_index(Some(&operator(4, 1)), &curr, 2), 0);
    }

    #[test]
    fn test_from_index_clamps_inverted_range() {
        // a testnet contract deleted used keys: used prefix beyond total
        let curr = operator(2, 5);
        let prev = operator(2, 5);
        assert_eq!(from_index(Some(&prev), &curr, 2), 0);
    }

    #[test]
    fn test_covers() {
        let operators = vec![operator(3, 1)];
        let mut counts = HashMap::new();
        assert!(!covers(KeyScope::All, &operators, &counts));

        counts.insert(0, 3);
        assert!(covers(KeyScope::All, &operators, &counts));

        counts.insert(0, 1);
        assert!(!covers(KeyScope::All, &operators, &counts));
        assert!(covers(KeyScope::UsedOnly, &operators, &counts));
    }
}
