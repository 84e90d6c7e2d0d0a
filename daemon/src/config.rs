use clap::Parser;
use keymirror_common::{config::VERSION, crypto::Address};

// bind addresses
// The HTTP API is read-only but still defaults to loopback; expose it
// explicitly with --bind-address 0.0.0.0:8080 behind a firewall if needed
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";

// Default path of the SQLite mirror database
pub const DEFAULT_DB_PATH: &str = "keymirror.db";

// Default size of the SQLite connection pool shared between the update
// loop and the HTTP readers
pub const DEFAULT_POOL_SIZE: u32 = 4;

// Milliseconds between two update cycles
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 5_000;

// Milliseconds without a successful update cycle before the process
// gives up and exits, letting the supervisor restart it
pub const DEFAULT_UPDATE_TIMEOUT_MS: u64 = 90 * 60 * 1_000;

// Timeout of a single JSON-RPC round trip
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 30_000;

// Number of getNodeOperator calls packed in one JSON-RPC batch
pub const OPERATOR_FETCH_BATCH_SIZE: usize = 100;

// Number of getSigningKey calls packed in one JSON-RPC batch
pub const KEY_FETCH_BATCH_SIZE: usize = 200;

// Rows per bulk INSERT statement, conservative under the SQLite
// bind-parameter limit
pub const SQL_INSERT_CHUNK_SIZE: usize = 499;

// Rows per page when streaming the full key list over HTTP
pub const KEYS_PAGE_SIZE: u32 = 1_000;

#[derive(Debug, Clone, Parser)]
#[command(name = "keymirror_daemon", version = VERSION, about = "Staking-registry mirror daemon")]
pub struct NodeConfig {
    /// Execution-layer JSON-RPC endpoint
    #[clap(long)]
    pub rpc_url: Option<String>,
    /// Registry module contract address to mirror, repeat for several modules
    #[clap(long = "module-address")]
    pub module_addresses: Vec<Address>,
    /// Path of the SQLite mirror database
    #[clap(long, default_value_t = String::from(DEFAULT_DB_PATH))]
    pub db_path: String,
    /// HTTP API bind address
    #[clap(long, default_value_t = String::from(DEFAULT_BIND_ADDRESS))]
    pub bind_address: String,
    /// Milliseconds between two update cycles
    #[clap(long, default_value_t = DEFAULT_UPDATE_INTERVAL_MS)]
    pub update_interval_ms: u64,
    /// Milliseconds without a successful update cycle before the process exits
    #[clap(long, default_value_t = DEFAULT_UPDATE_TIMEOUT_MS)]
    pub update_timeout_ms: u64,
    /// Disable the update loop and only serve already mirrored state
    #[clap(long)]
    pub no_sync: bool,
    /// Mirror only the used key prefix of each operator instead of all
    /// advertised keys
    #[clap(long)]
    pub used_keys_only: bool,
    /// Log level (error, warn, info, debug, trace)
    #[clap(long, default_value_t = String::from("info"))]
    pub log_level: String,
}

impl NodeConfig {
    // Reject configurations the update loop cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.update_interval_ms == 0 {
            return Err("update interval must be greater than zero".to_owned());
        }

        if self.update_timeout_ms == 0 {
            return Err("update timeout must be greater than zero".to_owned());
        }

        if !self.no_sync {
            if self.rpc_url.is_none() {
                return Err("an RPC endpoint is required unless --no-sync is set".to_owned());
            }

            if self.module_addresses.is_empty() {
                return Err(
                    "at least one module address is required unless --no-sync is set".to_owned(),
                );
            }
        }

        Ok(())
    }
}
