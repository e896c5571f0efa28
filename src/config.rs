use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};

#[derive(Debug, Deserialize, Clone)]
pub struct ChainCfg {
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    pub chain_id: Option<u64>,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingCfg {
    #[serde(default)]
    pub deployment_block: u64,
    #[serde(default = "default_backfill_window")]
    pub backfill_window: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub resume_live_from_cursor: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PgCfg {
    #[serde(default)]
    pub dsn: String,
    /// Path to an SQL script replacing the built-in schema bootstrap.
    pub schema: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub statement_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContractCfg {
    pub name: String,
    pub address: String,
    /// ABI document path, `<abi_dir>/<name>.json` when absent.
    pub abi: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogCfg {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppCfg {
    #[serde(default = "default_chain")]
    pub chain: ChainCfg,
    #[serde(default = "default_indexing")]
    pub indexing: IndexingCfg,
    #[serde(default = "default_postgres")]
    pub postgres: PgCfg,
    #[serde(default = "default_abi_dir")]
    pub abi_dir: PathBuf,
    /// A list of `{name, address, abi?}`, or a `name: address` mapping.
    #[serde(default, deserialize_with = "contracts_list_or_map")]
    pub contracts: Vec<ContractCfg>,
    #[serde(default = "default_log")]
    pub log: LogCfg,
}

impl AppCfg {
    /// Loads the file at `path` (format by extension), then `ETL_*` environment
    /// overrides, then the plain `DATABASE_URL` / `RPC_URL` variables.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("ETL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: Self = settings.try_deserialize()?;

        if let Ok(dsn) = std::env::var("DATABASE_URL") {
            cfg.postgres.dsn = dsn;
        }
        if let Ok(rpc_url) = std::env::var("RPC_URL") {
            cfg.chain.rpc_url = rpc_url;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.indexing.backfill_window == 0 {
            anyhow::bail!("indexing.backfill_window must be at least 1");
        }
        if self.indexing.poll_interval_secs == 0 {
            anyhow::bail!("indexing.poll_interval_secs must be at least 1");
        }
        if self.postgres.dsn.trim().is_empty() {
            anyhow::bail!("postgres.dsn is not set (or set DATABASE_URL)");
        }
        if self.contracts.is_empty() {
            anyhow::bail!("no contracts configured");
        }

        let mut names = HashSet::new();
        let mut addresses = HashSet::new();
        for contract in &self.contracts {
            if !names.insert(contract.name.as_str()) {
                anyhow::bail!("contract name '{}' is configured more than once", contract.name);
            }
            if !addresses.insert(contract.address.to_lowercase()) {
                anyhow::bail!(
                    "contract address {} is configured more than once (second: '{}')",
                    contract.address,
                    contract.name
                );
            }
        }

        Ok(())
    }

    pub fn contract_abi_path(&self, contract: &ContractCfg) -> PathBuf {
        contract
            .abi
            .clone()
            .unwrap_or_else(|| self.abi_dir.join(format!("{}.json", contract.name)))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ContractsDoc {
    List(Vec<ContractCfg>),
    Map(BTreeMap<String, ContractEntry>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ContractEntry {
    Address(String),
    Detailed { address: String, abi: Option<PathBuf> },
}

fn contracts_list_or_map<'de, D>(deserializer: D) -> Result<Vec<ContractCfg>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match ContractsDoc::deserialize(deserializer)? {
        ContractsDoc::List(contracts) => contracts,
        ContractsDoc::Map(entries) => entries
            .into_iter()
            .map(|(name, entry)| match entry {
                ContractEntry::Address(address) => ContractCfg { name, address, abi: None },
                ContractEntry::Detailed { address, abi } => ContractCfg { name, address, abi },
            })
            .collect(),
    })
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_backfill_window() -> u64 {
    100
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_true() -> bool {
    true
}

fn default_abi_dir() -> PathBuf {
    PathBuf::from("./abi")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_chain() -> ChainCfg {
    ChainCfg {
        rpc_url: default_rpc_url(),
        chain_id: None,
        request_timeout_secs: default_timeout_secs(),
    }
}

fn default_indexing() -> IndexingCfg {
    IndexingCfg {
        deployment_block: 0,
        backfill_window: default_backfill_window(),
        poll_interval_secs: default_poll_interval_secs(),
        resume_live_from_cursor: true,
    }
}

fn default_postgres() -> PgCfg {
    PgCfg {
        dsn: String::new(),
        schema: None,
        statement_timeout_secs: default_timeout_secs(),
    }
}

fn default_log() -> LogCfg {
    LogCfg {
        level: default_log_level(),
        format: LogFormat::default(),
    }
}
