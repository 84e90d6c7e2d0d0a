use crate::core::{
    chain::RegistryFetcher,
    diff::{self, KeyScope},
    error::IndexerError,
    store::{Batch, Store},
};
use keymirror_common::{block::BlockRef, crypto::Address, registry::Meta};
use std::collections::HashMap;

// Reconciles the mirrored state of one registry module with the contract
// state at a resolved block. The engine is stateless between cycles:
// everything it needs is re-derived from the store and the chain, so an
// aborted cycle is repaired by the next one.
pub struct Reconciler<F: RegistryFetcher> {
    store: Store,
    fetcher: F,
    module: Address,
    scope: KeyScope,
}

impl<F: RegistryFetcher> Reconciler<F> {
    pub fn new(store: Store, fetcher: F, module: Address, scope: KeyScope) -> Self {
        Self {
            store,
            fetcher,
            module,
            scope,
        }
    }

    pub fn module(&self) -> &Address {
        &self.module
    }

    // Run one update cycle pinned on the given block reference.
    // Returns the committed snapshot, or None when the resolved block is
    // older than the mirrored one and nothing was touched.
    pub async fn update(&self, at: &BlockRef) -> Result<Option<Meta>, IndexerError> {
        let prev_meta = self.store.meta(&self.module).await?;

        let block = self.fetcher.resolve_block(at).await?;
        let keys_op_index = self.fetcher.keys_op_index(&block.hash).await?;
        let curr_meta = Meta::new(block, keys_op_index);

        // a lagging RPC node can resolve a block behind the mirror
        if let Some(prev) = &prev_meta {
            if prev.block_number > curr_meta.block_number {
                warn!(
                    "Resolved block #{} is behind mirrored block #{} for module {}, skipping",
                    curr_meta.block_number, prev.block_number, self.module
                );
                return Ok(None);
            }
        }

        let prev_operators = self.store.operators(&self.module).await?;
        let key_counts = self.store.key_counts(&self.module).await?;

        // nothing mutated on-chain and the mirror is complete: only move
        // the snapshot forward to the fresher block
        if diff::same_meta(prev_meta.as_ref(), &curr_meta)
            && diff::covers(self.scope, &prev_operators, &key_counts)
        {
            debug!(
                "Registry of module {} unchanged at block #{}, refreshing snapshot",
                self.module, curr_meta.block_number
            );
            self.store
                .apply(
                    &self.module,
                    Batch {
                        meta: Some(curr_meta),
                        ..Batch::default()
                    },
                )
                .await?;
            return Ok(Some(curr_meta));
        }

        let curr_operators = self.fetcher.operators(&block.hash).await?;
        info!(
            "Updating module {} at block #{}: {} operators",
            self.module,
            curr_meta.block_number,
            curr_operators.len()
        );

        // Commit operators, tail trims and the new snapshot first. Key
        // indices at or past an operator's advertised total are deleted
        // here, so the per-operator phase below only ever upserts. Used
        // key indices are always below the total, so the trim cannot
        // touch the immutable prefix.
        let trims = curr_operators
            .iter()
            .map(|operator| (operator.index, operator.total_signing_keys))
            .collect();
        self.store
            .apply(
                &self.module,
                Batch {
                    meta: Some(curr_meta),
                    operators: curr_operators.clone(),
                    trim_keys_from: trims,
                    keys: Vec::new(),
                },
            )
            .await?;

        let prev_by_index: HashMap<u64, _> = prev_operators
            .iter()
            .map(|operator| (operator.index, operator))
            .collect();

        // Refetch each operator's mutable range. The bounds are
        // recomputed from current state on every cycle, which is what
        // makes an interrupted cycle converge: whatever was not stored
        // last time is below the coverage count and gets fetched again.
        for curr in &curr_operators {
            let prev = prev_by_index.get(&curr.index).copied();
            let to = diff::to_index(self.scope, curr);
            let covered = key_counts.get(&curr.index).copied().unwrap_or(0);
            let from = diff::from_index(prev, curr, to).min(covered);

            if from >= to {
                continue;
            }

            let keys = self
                .fetcher
                .signing_keys(curr.index, from, to, &block.hash)
                .await?;

            if log::log_enabled!(log::Level::Debug) {
                debug!(
                    "Operator #{} of module {}: fetched keys [{}, {})",
                    curr.index, self.module, from, to
                );
            }

            self.store
                .apply(
                    &self.module,
                    Batch {
                        keys,
                        ..Batch::default()
                    },
                )
                .await?;
        }

        Ok(Some(curr_meta))
    }
}
