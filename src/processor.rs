use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::abi::ContractRegistry;
use crate::chain::{BlockSpan, ChainClient};
use crate::decoder::decode_log;
use crate::error::{EtlError, Result};
use crate::mapper::map_event;
use crate::store::{CursorUpdate, EventStore, IngestedEvent, InsertOutcome, RangeReport};

/// Fetch, decode, map and store every bound log within a block range.
pub struct RangeProcessor {
    registry: Arc<ContractRegistry>,
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn EventStore>,
    commit_timeout: Duration,
}

impl RangeProcessor {
    pub fn new(
        registry: Arc<ContractRegistry>,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn EventStore>,
        commit_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            chain,
            store,
            commit_timeout,
        }
    }

    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Processes `span` with one log query and one store commit. When
    /// `cursor` is given it is advanced to `span.end` in the same commit.
    ///
    /// An `Err` means nothing from this range was committed.
    pub async fn process_range(&self, span: BlockSpan, cursor: Option<&str>) -> Result<RangeReport> {
        let mut report = RangeReport::default();
        if span.is_empty() {
            return Ok(report);
        }

        let logs = self
            .chain
            .get_logs(&self.registry.addresses(), span)
            .await?;
        report.fetched = logs.len();

        let mut rows = Vec::with_capacity(logs.len());
        for log in &logs {
            let Some(binding) = self.registry.get(&log.address) else {
                report.unbound += 1;
                debug!(address = %log.address, tx_hash = %log.tx_hash, "Log from unbound address");
                continue;
            };

            let Some(decoded) = decode_log(binding, log) else {
                report.undecodable += 1;
                debug!(
                    contract = %binding.name,
                    tx_hash = %log.tx_hash,
                    log_index = log.log_index,
                    "Log matches no known event, skipping"
                );
                continue;
            };
            report.decoded += 1;

            rows.push(IngestedEvent {
                contract_name: binding.name.clone(),
                contract_address: binding.checksum.clone(),
                event_name: decoded.event_name.clone(),
                tx_hash: format!("{:#x}", decoded.tx_hash),
                block_number: decoded.block_number,
                log_index: decoded.log_index,
                payload: map_event(&decoded),
            });
        }

        let cursor = cursor.map(|name| CursorUpdate::new(name, span.end));
        let outcomes = tokio::time::timeout(self.commit_timeout, self.store.commit_range(&rows, cursor))
            .await
            .map_err(|_| EtlError::Timeout {
                operation: "range commit",
                secs: self.commit_timeout.as_secs(),
            })??;

        for (row, outcome) in rows.iter().zip(&outcomes) {
            match outcome {
                InsertOutcome::Inserted => {}
                InsertOutcome::Duplicate => info!(
                    tx_hash = %row.tx_hash,
                    log_index = row.log_index,
                    "Duplicate event discarded"
                ),
                InsertOutcome::Failed(reason) => warn!(
                    contract = %row.contract_name,
                    event = %row.event_name,
                    tx_hash = %row.tx_hash,
                    log_index = row.log_index,
                    "Insert failed, event dropped: {reason}"
                ),
            }
        }
        report.tally(&outcomes);

        if report.fetched > 0 || report.failed > 0 {
            info!(
                from = span.start,
                to = span.end,
                fetched = report.fetched,
                inserted = report.inserted,
                duplicates = report.duplicates,
                failed = report.failed,
                skipped = report.unbound + report.undecodable,
                "Range processed"
            );
        } else {
            debug!(from = span.start, to = span.end, "Range processed, no logs");
        }

        Ok(report)
    }
}
