use crate::config::SQL_INSERT_CHUNK_SIZE;
use keymirror_common::{
    api::KeyEntry,
    crypto::{Address, DepositSignature, Hash, PublicKey},
    registry::{Meta, Operator, SigningKey},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    QueryBuilder, Row, SqlitePool,
};
use std::{collections::HashMap, time::Duration};

// Mirror tables. Upserts target the composite primary keys explicitly,
// deletes are ranged on the key index so the immutable used prefix of an
// operator is never touched by a tail trim.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS registry_meta (
        module_address BLOB NOT NULL PRIMARY KEY,
        block_number INTEGER NOT NULL,
        block_hash BLOB NOT NULL,
        timestamp INTEGER NOT NULL,
        keys_op_index INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS registry_operator (
        module_address BLOB NOT NULL,
        operator_index INTEGER NOT NULL,
        active INTEGER NOT NULL,
        name TEXT NOT NULL,
        reward_address BLOB NOT NULL,
        staking_limit INTEGER NOT NULL,
        stopped_validators INTEGER NOT NULL,
        total_signing_keys INTEGER NOT NULL,
        used_signing_keys INTEGER NOT NULL,
        PRIMARY KEY (module_address, operator_index)
    )",
    "CREATE TABLE IF NOT EXISTS registry_key (
        module_address BLOB NOT NULL,
        operator_index INTEGER NOT NULL,
        key_index INTEGER NOT NULL,
        pubkey BLOB NOT NULL,
        deposit_signature BLOB NOT NULL,
        used INTEGER NOT NULL,
        PRIMARY KEY (module_address, operator_index, key_index)
    )",
    "CREATE INDEX IF NOT EXISTS registry_key_pubkey ON registry_key (pubkey)",
];

// One transactional write batch, applied commit-or-nothing.
// The reconciler uses two shapes: operators + meta + tail trims in the
// first phase of a cycle, key upserts per operator afterwards.
#[derive(Debug, Default)]
pub struct Batch {
    pub meta: Option<Meta>,
    pub operators: Vec<Operator>,
    // (operator index, first key index to delete)
    pub trim_keys_from: Vec<(u64, u64)>,
    pub keys: Vec<SigningKey>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    // Open (or create) the mirror database at the given path
    pub async fn open(path: &str, pool_size: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_tables().await?;
        Ok(store)
    }

    // In-memory database, a single connection so that every handle sees
    // the same data
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await?;

        let store = Self { pool };
        store.create_tables().await?;
        Ok(store)
    }

    async fn create_tables(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn meta(&self, module: &Address) -> Result<Option<Meta>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT block_number, block_hash, timestamp, keys_op_index
             FROM registry_meta WHERE module_address = ?",
        )
        .bind(module.as_bytes().to_vec())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Meta {
                block_number: row.try_get::<i64, _>("block_number")? as u64,
                block_hash: hash_column(&row, "block_hash")?,
                timestamp: row.try_get::<i64, _>("timestamp")? as u64,
                keys_op_index: row.try_get::<i64, _>("keys_op_index")? as u64,
            })
        })
        .transpose()
    }

    pub async fn operators(&self, module: &Address) -> Result<Vec<Operator>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT operator_index, active, name, reward_address, staking_limit,
                    stopped_validators, total_signing_keys, used_signing_keys
             FROM registry_operator WHERE module_address = ?
             ORDER BY operator_index",
        )
        .bind(module.as_bytes().to_vec())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(operator_from_row).collect()
    }

    pub async fn keys_by_operator(
        &self,
        module: &Address,
        operator: u64,
    ) -> Result<Vec<SigningKey>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT operator_index, key_index, pubkey, deposit_signature, used
             FROM registry_key WHERE module_address = ? AND operator_index = ?
             ORDER BY key_index",
        )
        .bind(module.as_bytes().to_vec())
        .bind(operator as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(key_from_row).collect()
    }

    // One page of the key listing, ordered by (operator index, key index).
    // Keyset pagination keeps the HTTP streaming cursor independent of
    // concurrent update cycles.
    pub async fn keys_page(
        &self,
        module: &Address,
        after: Option<(u64, u64)>,
        limit: u32,
        used: Option<bool>,
    ) -> Result<Vec<SigningKey>, sqlx::Error> {
        let mut builder = QueryBuilder::new(
            "SELECT operator_index, key_index, pubkey, deposit_signature, used
             FROM registry_key WHERE module_address = ",
        );
        builder.push_bind(module.as_bytes().to_vec());

        if let Some((operator, index)) = after {
            builder.push(" AND (operator_index, key_index) > (");
            builder.push_bind(operator as i64);
            builder.push(", ");
            builder.push_bind(index as i64);
            builder.push(")");
        }

        if let Some(used) = used {
            builder.push(" AND used = ");
            builder.push_bind(used);
        }

        builder.push(" ORDER BY operator_index, key_index LIMIT ");
        builder.push_bind(limit as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(key_from_row).collect()
    }

    pub async fn count_keys(&self, module: &Address) -> Result<u64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM registry_key WHERE module_address = ?")
            .bind(module.as_bytes().to_vec())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    // Number of stored keys per operator. Keys are only ever written as
    // ranges anchored at zero, so the count doubles as the contiguous
    // coverage of each operator.
    pub async fn key_counts(&self, module: &Address) -> Result<HashMap<u64, u64>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT operator_index, COUNT(*) AS n FROM registry_key
             WHERE module_address = ? GROUP BY operator_index",
        )
        .bind(module.as_bytes().to_vec())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in rows {
            counts.insert(
                row.try_get::<i64, _>("operator_index")? as u64,
                row.try_get::<i64, _>("n")? as u64,
            );
        }
        Ok(counts)
    }

    // Lookup keys by their pubkeys across every mirrored module
    pub async fn find_keys_by_pubkeys(
        &self,
        pubkeys: &[PublicKey],
    ) -> Result<Vec<KeyEntry>, sqlx::Error> {
        let mut entries = Vec::new();
        for chunk in pubkeys.chunks(SQL_INSERT_CHUNK_SIZE) {
            let mut builder = QueryBuilder::new(
                "SELECT module_address, operator_index, key_index, pubkey, deposit_signature, used
                 FROM registry_key WHERE pubkey IN (",
            );
            let mut separated = builder.separated(", ");
            for pubkey in chunk {
                separated.push_bind(pubkey.as_bytes().to_vec());
            }
            builder.push(") ORDER BY module_address, operator_index, key_index");

            let rows = builder.build().fetch_all(&self.pool).await?;
            for row in &rows {
                let module = Address::try_from(row.try_get::<Vec<u8>, _>("module_address")?.as_slice())
                    .map_err(decode_error)?;
                entries.push(KeyEntry::new(module, key_from_row(row)?));
            }
        }
        Ok(entries)
    }

    // Apply one write batch in a single transaction. Either every part of
    // the batch is visible afterwards or none is.
    pub async fn apply(&self, module: &Address, batch: Batch) -> Result<(), sqlx::Error> {
        let module = module.as_bytes().to_vec();
        let mut tx = self.pool.begin().await?;

        if let Some(meta) = &batch.meta {
            sqlx::query("DELETE FROM registry_meta WHERE module_address = ?")
                .bind(module.clone())
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT INTO registry_meta
                 (module_address, block_number, block_hash, timestamp, keys_op_index)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(module.clone())
            .bind(meta.block_number as i64)
            .bind(meta.block_hash.as_bytes().to_vec())
            .bind(meta.timestamp as i64)
            .bind(meta.keys_op_index as i64)
            .execute(&mut *tx)
            .await?;
        }

        for chunk in batch.operators.chunks(SQL_INSERT_CHUNK_SIZE) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO registry_operator
                 (module_address, operator_index, active, name, reward_address,
                  staking_limit, stopped_validators, total_signing_keys, used_signing_keys) ",
            );
            builder.push_values(chunk, |mut row, operator| {
                row.push_bind(module.clone())
                    .push_bind(operator.index as i64)
                    .push_bind(operator.active)
                    .push_bind(operator.name.clone())
                    .push_bind(operator.reward_address.as_bytes().to_vec())
                    .push_bind(operator.staking_limit as i64)
                    .push_bind(operator.stopped_validators as i64)
                    .push_bind(operator.total_signing_keys as i64)
                    .push_bind(operator.used_signing_keys as i64);
            });
            builder.push(
                " ON CONFLICT (module_address, operator_index) DO UPDATE SET
                 active = excluded.active,
                 name = excluded.name,
                 reward_address = excluded.reward_address,
                 staking_limit = excluded.staking_limit,
                 stopped_validators = excluded.stopped_validators,
                 total_signing_keys = excluded.total_signing_keys,
                 used_signing_keys = excluded.used_signing_keys",
            );
            builder.build().execute(&mut *tx).await?;
        }

        for (operator, from) in &batch.trim_keys_from {
            sqlx::query(
                "DELETE FROM registry_key
                 WHERE module_address = ? AND operator_index = ? AND key_index >= ?",
            )
            .bind(module.clone())
            .bind(*operator as i64)
            .bind(*from as i64)
            .execute(&mut *tx)
            .await?;
        }

        for chunk in batch.keys.chunks(SQL_INSERT_CHUNK_SIZE) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO registry_key
                 (module_address, operator_index, key_index, pubkey, deposit_signature, used) ",
            );
            builder.push_values(chunk, |mut row, key| {
                row.push_bind(module.clone())
                    .push_bind(key.operator_index as i64)
                    .push_bind(key.index as i64)
                    .push_bind(key.key.as_bytes().to_vec())
                    .push_bind(key.deposit_signature.as_bytes().to_vec())
                    .push_bind(key.used);
            });
            builder.push(
                " ON CONFLICT (module_address, operator_index, key_index) DO UPDATE SET
                 pubkey = excluded.pubkey,
                 deposit_signature = excluded.deposit_signature,
                 used = excluded.used",
            );
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await
    }
}

fn decode_error(e: &'static str) -> sqlx::Error {
    sqlx::Error::Decode(e.into())
}

fn hash_column(row: &SqliteRow, column: &str) -> Result<Hash, sqlx::Error> {
    Hash::try_from(row.try_get::<Vec<u8>, _>(column)?.as_slice()).map_err(decode_error)
}

fn operator_from_row(row: &SqliteRow) -> Result<Operator, sqlx::Error> {
    Ok(Operator {
        index: row.try_get::<i64, _>("operator_index")? as u64,
        active: row.try_get("active")?,
        name: row.try_get("name")?,
        reward_address: Address::try_from(row.try_get::<Vec<u8>, _>("reward_address")?.as_slice())
            .map_err(decode_error)?,
        staking_limit: row.try_get::<i64, _>("staking_limit")? as u64,
        stopped_validators: row.try_get::<i64, _>("stopped_validators")? as u64,
        total_signing_keys: row.try_get::<i64, _>("total_signing_keys")? as u64,
        used_signing_keys: row.try_get::<i64, _>("used_signing_keys")? as u64,
    })
}

fn key_from_row(row: &SqliteRow) -> Result<SigningKey, sqlx::Error> {
    Ok(SigningKey {
        operator_index: row.try_get::<i64, _>("operator_index")? as u64,
        index: row.try_get::<i64, _>("key_index")? as u64,
        key: PublicKey::try_from(row.try_get::<Vec<u8>, _>("pubkey")?.as_slice())
            .map_err(decode_error)?,
        deposit_signature: DepositSignature::try_from(
            row.try_get::<Vec<u8>, _>("deposit_signature")?.as_slice(),
        )
        .map_err(decode_error)?,
        used: row.try_get("used")?,
    })
}
