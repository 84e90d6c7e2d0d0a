// End-to-end reconciliation scenarios against a mock contract reader
// and an in-memory store

use async_trait::async_trait;
use keymirror_common::{
    block::{BlockInfo, BlockRef},
    crypto::{Address, DepositSignature, Hash, PublicKey},
    registry::{Meta, Operator, SigningKey},
};
use keymirror_daemon::core::{
    chain::{ChainError, RegistryFetcher},
    diff::KeyScope,
    error::IndexerError,
    reconciler::Reconciler,
    store::Store,
    updater::Updater,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

struct MockChain {
    block: BlockInfo,
    keys_op_index: u64,
    operators: Vec<Operator>,
    // full key list per operator index
    keys: HashMap<u64, Vec<SigningKey>>,
}

// Scripted contract reader with call counters, shared between the test
// body and the reconciler under test
#[derive(Clone)]
struct MockFetcher {
    chain: Arc<Mutex<MockChain>>,
    operators_calls: Arc<AtomicUsize>,
    keys_calls: Arc<AtomicUsize>,
    // every requested key range as (operator, from, to)
    key_ranges: Arc<Mutex<Vec<(u64, u64, u64)>>>,
    fail_keys: Arc<AtomicBool>,
}

impl MockFetcher {
    fn new(chain: MockChain) -> Self {
        Self {
            chain: Arc::new(Mutex::new(chain)),
            operators_calls: Arc::new(AtomicUsize::new(0)),
            keys_calls: Arc::new(AtomicUsize::new(0)),
            key_ranges: Arc::new(Mutex::new(Vec::new())),
            fail_keys: Arc::new(AtomicBool::new(false)),
        }
    }

    fn reset_counters(&self) {
        self.operators_calls.store(0, Ordering::SeqCst);
        self.keys_calls.store(0, Ordering::SeqCst);
        self.key_ranges.lock().unwrap().clear();
    }

    fn ranges(&self) -> Vec<(u64, u64, u64)> {
        self.key_ranges.lock().unwrap().clone()
    }

    fn set_chain(&self, f: impl FnOnce(&mut MockChain)) {
        f(&mut self.chain.lock().unwrap());
    }
}

#[async_trait]
impl RegistryFetcher for MockFetcher {
    async fn resolve_block(&self, _at: &BlockRef) -> Result<BlockInfo, ChainError> {
        Ok(self.chain.lock().unwrap().block)
    }

    async fn keys_op_index(&self, _block: &Hash) -> Result<u64, ChainError> {
        Ok(self.chain.lock().unwrap().keys_op_index)
    }

    async fn operators(&self, _block: &Hash) -> Result<Vec<Operator>, ChainError> {
        self.operators_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.chain.lock().unwrap().operators.clone())
    }

    async fn signing_keys(
        &self,
        operator: u64,
        from: u64,
        to: u64,
        _block: &Hash,
    ) -> Result<Vec<SigningKey>, ChainError> {
        self.keys_calls.fetch_add(1, Ordering::SeqCst);
        self.key_ranges.lock().unwrap().push((operator, from, to));

        if self.fail_keys.load(Ordering::SeqCst) {
            return Err(ChainError::Payload("injected key fetch failure".into()));
        }

        let chain = self.chain.lock().unwrap();
        let keys = chain.keys.get(&operator).cloned().unwrap_or_default();
        Ok(keys
            .into_iter()
            .filter(|key| key.index >= from && key.index < to)
            .collect())
    }
}

fn module() -> Address {
    Address::new([0x42; 20])
}

fn block(number: u64, hash: u8, timestamp: u64) -> BlockInfo {
    BlockInfo {
        number,
        hash: Hash::new([hash; 32]),
        timestamp,
    }
}

fn operator(index: u64, total: u64, used: u64) -> Operator {
    Operator {
        index,
        active: true,
        name: format!("operator-{}", index),
        reward_address: Address::new([0x11; 20]),
        staking_limit: 1_000,
        stopped_validators: 0,
        total_signing_keys: total,
        used_signing_keys: used,
    }
}

fn signing_key(operator: u64, index: u64, fill: u8, used: bool) -> SigningKey {
    SigningKey {
        operator_index: operator,
        index,
        key: PublicKey::new([fill; 48]),
        deposit_signature: DepositSignature::new([fill; 96]),
        used,
    }
}

// S1 chain state: one operator with three keys, the first one deposited
fn bootstrap_chain() -> MockChain {
    MockChain {
        block: block(100, 0xAA, 1700),
        keys_op_index: 7,
        operators: vec![operator(0, 3, 1)],
        keys: HashMap::from([(
            0,
            vec![
                signing_key(0, 0, 0xA0, true),
                signing_key(0, 1, 0xA1, false),
                signing_key(0, 2, 0xA2, false),
            ],
        )]),
    }
}

fn reconciler(store: Store, fetcher: MockFetcher, scope: KeyScope) -> Reconciler<MockFetcher> {
    Reconciler::new(store, fetcher, module(), scope)
}

async fn store_fingerprint(store: &Store) -> (Option<Meta>, Vec<Operator>, Vec<SigningKey>) {
    let meta = store.meta(&module()).await.unwrap();
    let operators = store.operators(&module()).await.unwrap();
    let mut keys = Vec::new();
    for operator in &operators {
        keys.extend(store.keys_by_operator(&module(), operator.index).await.unwrap());
    }
    (meta, operators, keys)
}

#[tokio::test]
async fn test_bootstrap_mirrors_contract_state() {
    let store = Store::in_memory().await.unwrap();
    let fetcher = MockFetcher::new(bootstrap_chain());
    let engine = reconciler(store.clone(), fetcher.clone(), KeyScope::All);

    let meta = engine
        .update(&BlockRef::Number(100))
        .await
        .unwrap()
        .expect("first cycle commits a snapshot");

    assert_eq!(
        meta,
        Meta {
            block_number: 100,
            block_hash: Hash::new([0xAA; 32]),
            timestamp: 1700,
            keys_op_index: 7,
        }
    );
    assert_eq!(store.meta(&module()).await.unwrap(), Some(meta));

    let operators = store.operators(&module()).await.unwrap();
    assert_eq!(operators, vec![operator(0, 3, 1)]);

    let keys = store.keys_by_operator(&module(), 0).await.unwrap();
    assert_eq!(keys.len(), 3);
    let used: Vec<bool> = keys.iter().map(|key| key.used).collect();
    assert_eq!(used, vec![true, false, false]);
    assert_eq!(fetcher.ranges(), vec![(0, 0, 3)]);
}

#[tokio::test]
async fn test_noop_cycle_skips_fetches() {
    let store = Store::in_memory().await.unwrap();
    let fetcher = MockFetcher::new(bootstrap_chain());
    let engine = reconciler(store.clone(), fetcher.clone(), KeyScope::All);

    engine.update(&BlockRef::Number(100)).await.unwrap();
    let before = store_fingerprint(&store).await;
    fetcher.reset_counters();

    let meta = engine.update(&BlockRef::Number(100)).await.unwrap();
    assert!(meta.is_some());

    // no operator or key traffic on the second cycle
    assert_eq!(fetcher.operators_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fetcher.keys_calls.load(Ordering::SeqCst), 0);

    // and the store contents are byte-identical
    assert_eq!(store_fingerprint(&store).await, before);
}

#[tokio::test]
async fn test_key_added_fetches_tail_only() {
    let store = Store::in_memory().await.unwrap();
    let fetcher = MockFetcher::new(bootstrap_chain());
    let engine = reconciler(store.clone(), fetcher.clone(), KeyScope::All);

    engine.update(&BlockRef::Number(100)).await.unwrap();
    fetcher.reset_counters();

    // a fourth key was submitted
    fetcher.set_chain(|chain| {
        chain.block = block(105, 0xAB, 1760);
        chain.keys_op_index = 8;
        chain.operators = vec![operator(0, 4, 1)];
        chain
            .keys
            .get_mut(&0)
            .unwrap()
            .push(signing_key(0, 3, 0xA3, false));
    });

    engine.update(&BlockRef::Number(105)).await.unwrap();

    // only the mutable tail is refetched, the deposited prefix is kept
    assert_eq!(fetcher.ranges(), vec![(0, 1, 4)]);

    let keys = store.keys_by_operator(&module(), 0).await.unwrap();
    assert_eq!(keys.len(), 4);
    assert_eq!(keys[0], signing_key(0, 0, 0xA0, true));
    assert_eq!(keys[3], signing_key(0, 3, 0xA3, false));
}

#[tokio::test]
async fn test_key_used_refetches_everything() {
    let store = Store::in_memory().await.unwrap();
    let fetcher = MockFetcher::new(bootstrap_chain());
    let engine = reconciler(store.clone(), fetcher.clone(), KeyScope::All);

    engine.update(&BlockRef::Number(100)).await.unwrap();

    fetcher.set_chain(|chain| {
        chain.block = block(105, 0xAB, 1760);
        chain.keys_op_index = 8;
        chain.operators = vec![operator(0, 4, 1)];
        chain
            .keys
            .get_mut(&0)
            .unwrap()
            .push(signing_key(0, 3, 0xA3, false));
    });
    engine.update(&BlockRef::Number(105)).await.unwrap();
    fetcher.reset_counters();

    // the second key got deposited
    fetcher.set_chain(|chain| {
        chain.block = block(110, 0xAC, 1820);
        chain.keys_op_index = 9;
        chain.operators = vec![operator(0, 4, 2)];
        let keys = chain.keys.get_mut(&0).unwrap();
        keys[1] = signing_key(0, 1, 0xA1, true);
    });

    engine.update(&BlockRef::Number(110)).await.unwrap();

    // the used counter moved, the whole range is refetched
    assert_eq!(fetcher.ranges(), vec![(0, 0, 4)]);

    let keys = store.keys_by_operator(&module(), 0).await.unwrap();
    let used: Vec<bool> = keys.iter().map(|key| key.used).collect();
    assert_eq!(used, vec![true, true, false, false]);
    // prefix bytes are untouched
    assert_eq!(keys[0], signing_key(0, 0, 0xA0, true));
}

#[tokio::test]
async fn test_used_only_scope_follows_deposited_prefix() {
    let store = Store::in_memory().await.unwrap();
    let fetcher = MockFetcher::new(bootstrap_chain());
    let engine = reconciler(store.clone(), fetcher.clone(), KeyScope::UsedOnly);

    engine.update(&BlockRef::Number(100)).await.unwrap();
    assert_eq!(fetcher.ranges(), vec![(0, 0, 1)]);
    assert_eq!(store.count_keys(&module()).await.unwrap(), 1);
    fetcher.reset_counters();

    // a key submission alone does not widen the mirrored range
    fetcher.set_chain(|chain| {
        chain.block = block(105, 0xAB, 1760);
        chain.keys_op_index = 8;
        chain.operators = vec![operator(0, 4, 1)];
        chain
            .keys
            .get_mut(&0)
            .unwrap()
            .push(signing_key(0, 3, 0xA3, false));
    });
    engine.update(&BlockRef::Number(105)).await.unwrap();
    assert_eq!(fetcher.ranges(), Vec::<(u64, u64, u64)>::new());
    fetcher.reset_counters();

    // a deposit does
    fetcher.set_chain(|chain| {
        chain.block = block(110, 0xAC, 1820);
        chain.keys_op_index = 9;
        chain.operators = vec![operator(0, 4, 2)];
        let keys = chain.keys.get_mut(&0).unwrap();
        keys[1] = signing_key(0, 1, 0xA1, true);
    });
    engine.update(&BlockRef::Number(110)).await.unwrap();

    assert_eq!(fetcher.ranges(), vec![(0, 0, 2)]);
    assert_eq!(store.count_keys(&module()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_key_removed_trims_tail() {
    let store = Store::in_memory().await.unwrap();
    let fetcher = MockFetcher::new(bootstrap_chain());
    let engine = reconciler(store.clone(), fetcher.clone(), KeyScope::All);

    engine.update(&BlockRef::Number(100)).await.unwrap();

    fetcher.set_chain(|chain| {
        chain.block = block(105, 0xAB, 1760);
        chain.keys_op_index = 8;
        chain.operators = vec![operator(0, 4, 1)];
        chain
            .keys
            .get_mut(&0)
            .unwrap()
            .push(signing_key(0, 3, 0xA3, false));
    });
    engine.update(&BlockRef::Number(105)).await.unwrap();
    fetcher.reset_counters();

    // a testnet contract removed the two trailing keys
    fetcher.set_chain(|chain| {
        chain.block = block(110, 0xAC, 1820);
        chain.keys_op_index = 10;
        chain.operators = vec![operator(0, 2, 1)];
        chain.keys.get_mut(&0).unwrap().truncate(2);
    });

    engine.update(&BlockRef::Number(110)).await.unwrap();

    // the shrunken total voids the prefix assumption entirely
    assert_eq!(fetcher.ranges(), vec![(0, 0, 2)]);

    let keys = store.keys_by_operator(&module(), 0).await.unwrap();
    assert_eq!(keys.len(), 2);
    assert!(keys.iter().all(|key| key.index < 2));
}

#[tokio::test]
async fn test_stale_block_is_ignored() {
    let store = Store::in_memory().await.unwrap();
    let fetcher = MockFetcher::new(bootstrap_chain());
    let engine = reconciler(store.clone(), fetcher.clone(), KeyScope::All);

    engine.update(&BlockRef::Number(100)).await.unwrap();
    let before = store_fingerprint(&store).await;
    fetcher.reset_counters();

    // a lagging RPC node answers with an older block
    fetcher.set_chain(|chain| {
        chain.block = block(90, 0x99, 1640);
    });

    let result = engine.update(&BlockRef::Number(90)).await.unwrap();
    assert!(result.is_none());

    assert_eq!(fetcher.operators_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fetcher.keys_calls.load(Ordering::SeqCst), 0);
    assert_eq!(store_fingerprint(&store).await, before);
}

#[tokio::test]
async fn test_meta_block_number_is_monotone() {
    let store = Store::in_memory().await.unwrap();
    let fetcher = MockFetcher::new(bootstrap_chain());
    let engine = reconciler(store.clone(), fetcher.clone(), KeyScope::All);

    engine.update(&BlockRef::Number(100)).await.unwrap();

    // an empty block: same registry state at a fresher block
    fetcher.set_chain(|chain| {
        chain.block = block(101, 0xAB, 1712);
    });
    engine.update(&BlockRef::Number(101)).await.unwrap();
    assert_eq!(
        store.meta(&module()).await.unwrap().unwrap().block_number,
        101
    );

    // a real mutation afterwards
    fetcher.set_chain(|chain| {
        chain.block = block(102, 0xAC, 1724);
        chain.keys_op_index = 8;
        chain.operators = vec![operator(0, 4, 1)];
        chain
            .keys
            .get_mut(&0)
            .unwrap()
            .push(signing_key(0, 3, 0xA3, false));
    });
    engine.update(&BlockRef::Number(102)).await.unwrap();
    assert_eq!(
        store.meta(&module()).await.unwrap().unwrap().block_number,
        102
    );
}

#[tokio::test]
async fn test_fresh_operator_fetches_its_whole_range() {
    let store = Store::in_memory().await.unwrap();
    let fetcher = MockFetcher::new(bootstrap_chain());
    let engine = reconciler(store.clone(), fetcher.clone(), KeyScope::All);

    engine.update(&BlockRef::Number(100)).await.unwrap();
    fetcher.reset_counters();

    fetcher.set_chain(|chain| {
        chain.block = block(105, 0xAB, 1760);
        chain.keys_op_index = 8;
        chain.operators = vec![operator(0, 3, 1), operator(1, 2, 0)];
        chain.keys.insert(
            1,
            vec![signing_key(1, 0, 0xB0, false), signing_key(1, 1, 0xB1, false)],
        );
    });

    engine.update(&BlockRef::Number(105)).await.unwrap();

    // the new operator is fetched from scratch, the old one only its tail
    assert_eq!(fetcher.ranges(), vec![(0, 1, 3), (1, 0, 2)]);

    let keys = store.keys_by_operator(&module(), 1).await.unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(store.count_keys(&module()).await.unwrap(), 5);
}

#[tokio::test]
async fn test_interrupted_cycle_converges() {
    let store = Store::in_memory().await.unwrap();
    let fetcher = MockFetcher::new(bootstrap_chain());
    let engine = reconciler(store.clone(), fetcher.clone(), KeyScope::All);

    engine.update(&BlockRef::Number(100)).await.unwrap();

    let mutate = |chain: &mut MockChain| {
        chain.block = block(105, 0xAB, 1760);
        chain.keys_op_index = 8;
        chain.operators = vec![operator(0, 4, 1)];
        if chain.keys[&0].len() == 3 {
            chain
                .keys
                .get_mut(&0)
                .unwrap()
                .push(signing_key(0, 3, 0xA3, false));
        }
    };

    // the cycle dies between the operator commit and the key fetches
    fetcher.set_chain(mutate);
    fetcher.fail_keys.store(true, Ordering::SeqCst);
    let result = engine.update(&BlockRef::Number(105)).await;
    assert!(matches!(result, Err(IndexerError::Chain(_))));

    // operators and the snapshot are already committed, keys are stale
    assert_eq!(store.meta(&module()).await.unwrap().unwrap().keys_op_index, 8);
    assert_eq!(store.count_keys(&module()).await.unwrap(), 3);

    // the next cycle against the very same block repairs the mirror
    fetcher.fail_keys.store(false, Ordering::SeqCst);
    fetcher.reset_counters();
    engine.update(&BlockRef::Number(105)).await.unwrap();
    assert_eq!(fetcher.ranges(), vec![(0, 1, 4)]);

    let repaired = store_fingerprint(&store).await;

    // and the result is identical to a single-shot successful update
    let reference_store = Store::in_memory().await.unwrap();
    let reference_fetcher = MockFetcher::new(bootstrap_chain());
    reference_fetcher.set_chain(mutate);
    let reference = reconciler(
        reference_store.clone(),
        reference_fetcher.clone(),
        KeyScope::All,
    );
    reference.update(&BlockRef::Number(105)).await.unwrap();

    assert_eq!(repaired, store_fingerprint(&reference_store).await);
}

#[tokio::test]
async fn test_cycle_is_idempotent_after_repair() {
    let store = Store::in_memory().await.unwrap();
    let fetcher = MockFetcher::new(bootstrap_chain());
    let engine = reconciler(store.clone(), fetcher.clone(), KeyScope::All);

    engine.update(&BlockRef::Number(100)).await.unwrap();
    engine.update(&BlockRef::Number(100)).await.unwrap();
    let first = store_fingerprint(&store).await;

    fetcher.reset_counters();
    engine.update(&BlockRef::Number(100)).await.unwrap();

    assert_eq!(fetcher.keys_calls.load(Ordering::SeqCst), 0);
    assert_eq!(store_fingerprint(&store).await, first);
}

#[tokio::test]
async fn test_update_loop_single_flight() {
    let store = Store::in_memory().await.unwrap();
    let fetcher = SlowFetcher {
        inner: MockFetcher::new(bootstrap_chain()),
    };
    let engine = Reconciler::new(store, fetcher, module(), KeyScope::All);
    let updater = Updater::new(
        vec![engine],
        Duration::from_millis(10),
        Duration::from_secs(60),
    );

    // two concurrent triggers: one runs, the other is dropped
    let (first, second) = tokio::join!(updater.run_cycle(), updater.run_cycle());
    let outcomes = [first.unwrap(), second.unwrap()];
    assert_eq!(outcomes.iter().filter(|ran| **ran).count(), 1);
    assert_eq!(outcomes.iter().filter(|ran| !**ran).count(), 1);
}

// Delays block resolution long enough for the overlapping trigger to
// observe the single-flight guard
#[derive(Clone)]
struct SlowFetcher {
    inner: MockFetcher,
}

#[async_trait]
impl RegistryFetcher for SlowFetcher {
    async fn resolve_block(&self, at: &BlockRef) -> Result<BlockInfo, ChainError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.inner.resolve_block(at).await
    }

    async fn keys_op_index(&self, block: &Hash) -> Result<u64, ChainError> {
        self.inner.keys_op_index(block).await
    }

    async fn operators(&self, block: &Hash) -> Result<Vec<Operator>, ChainError> {
        self.inner.operators(block).await
    }

    async fn signing_keys(
        &self,
        operator: u64,
        from: u64,
        to: u64,
        block: &Hash,
    ) -> Result<Vec<SigningKey>, ChainError> {
        self.inner.signing_keys(operator, from, to, block).await
    }
}
