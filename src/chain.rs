use std::fmt::Display;
use std::future::IntoFuture;
use std::str::FromStr;
use std::time::Duration;

use alloy::providers::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller,
};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{BlockNumberOrTag, Filter, FilterBlockOption, Log as RpcLog};
use alloy_primitives::Address;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::ChainCfg;
use crate::decoder::RawLog;
use crate::error::{EtlError, Result};

type RPCProvider = FillProvider<
    JoinFill<Identity, JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>>,
    RootProvider,
>;

/// Inclusive block range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub start: u64,
    pub end: u64,
}

impl BlockSpan {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.end - self.start + 1
        }
    }
}

impl std::fmt::Display for BlockSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

impl From<BlockSpan> for FilterBlockOption {
    fn from(value: BlockSpan) -> Self {
        FilterBlockOption::Range {
            from_block: Some(BlockNumberOrTag::Number(value.start)),
            to_block: Some(BlockNumberOrTag::Number(value.end)),
        }
    }
}

/// Read access to the chain: the current head and logs for a block range.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn head_block_number(&self) -> Result<u64>;

    /// Logs emitted by any of `addresses` within `span`, in chain order.
    async fn get_logs(&self, addresses: &[Address], span: BlockSpan) -> Result<Vec<RawLog>>;
}

/// JSON-RPC over HTTP.
pub struct RpcChainClient {
    provider: RPCProvider,
    timeout: Duration,
}

impl RpcChainClient {
    /// Builds the provider and checks the node answers. When `chain_id` is
    /// configured the node must report the same id.
    pub async fn connect(cfg: &ChainCfg) -> Result<Self> {
        let url = reqwest::Url::from_str(&cfg.rpc_url)
            .map_err(|e| EtlError::Config(format!("invalid rpc_url {}: {e}", cfg.rpc_url)))?;
        let provider = ProviderBuilder::new().connect_http(url.clone());
        info!("Connecting to RPC endpoint: {}", url);

        let client = Self {
            provider,
            timeout: Duration::from_secs(cfg.request_timeout_secs.max(1)),
        };

        let chain_id = client
            .bounded("eth_chainId", client.provider.get_chain_id())
            .await?;
        match cfg.chain_id {
            Some(expected) if expected != chain_id => {
                return Err(EtlError::Config(format!(
                    "Chain ID mismatch: expected {expected}, got {chain_id}"
                )));
            }
            Some(_) => info!("Chain ID: {}", chain_id),
            None => info!("Chain ID: {} (not pinned in config)", chain_id),
        }

        Ok(client)
    }

    async fn bounded<T, E, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        E: Display,
        F: IntoFuture<Output = std::result::Result<T, E>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(EtlError::Rpc(format!("{operation}: {e}"))),
            Err(_) => Err(EtlError::Timeout {
                operation,
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn head_block_number(&self) -> Result<u64> {
        self.bounded("eth_blockNumber", self.provider.get_block_number())
            .await
    }

    async fn get_logs(&self, addresses: &[Address], span: BlockSpan) -> Result<Vec<RawLog>> {
        let filter = Filter::new().address(addresses.to_vec()).select(span);
        let logs = self
            .bounded("eth_getLogs", self.provider.get_logs(&filter))
            .await?;
        debug!("Received {} logs for {} from {} contracts", logs.len(), span, addresses.len());

        Ok(logs.into_iter().filter_map(into_raw_log).collect())
    }
}

/// Drops logs the node flags as removed or returns without a chain position.
fn into_raw_log(log: RpcLog) -> Option<RawLog> {
    if log.removed {
        warn!(tx_hash = ?log.transaction_hash, "Skipping log removed by reorg");
        return None;
    }
    let (Some(block_number), Some(tx_hash), Some(log_index)) =
        (log.block_number, log.transaction_hash, log.log_index)
    else {
        warn!(address = %log.address(), "Skipping log without block position");
        return None;
    };

    Some(RawLog {
        address: log.address(),
        topics: log.topics().to_vec(),
        data: log.inner.data.data.clone(),
        block_number,
        tx_hash,
        log_index,
    })
}
