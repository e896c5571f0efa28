//! One-shot historical ingestion in fixed-size windows.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::chain::BlockSpan;
use crate::error::Result;
use crate::processor::RangeProcessor;
use crate::store::RangeReport;

/// Contiguous windows of at most `width` blocks covering `[start, end]`.
/// Empty when `start > end`; a zero width is treated as one.
pub fn windows(start: u64, end: u64, width: u64) -> Vec<BlockSpan> {
    let width = width.max(1);
    let mut spans = Vec::new();
    let mut current = start;
    while current <= end {
        let window_end = current.saturating_add(width - 1).min(end);
        spans.push(BlockSpan::new(current, window_end));
        match window_end.checked_add(1) {
            Some(next) => current = next,
            None => break,
        }
    }
    spans
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BackfillReport {
    pub from: u64,
    pub to: u64,
    pub windows: usize,
    pub totals: RangeReport,
}

pub struct Backfill {
    processor: Arc<RangeProcessor>,
    deployment_block: u64,
    window: u64,
}

impl Backfill {
    pub fn new(processor: Arc<RangeProcessor>, deployment_block: u64, window: u64) -> Self {
        Self {
            processor,
            deployment_block,
            window,
        }
    }

    /// Walks `[from, to]` window by window, in order. `from` defaults to the
    /// deployment block and `to` to the current head. The first failing
    /// window stops the run; earlier windows stay committed.
    pub async fn run(&self, from: Option<u64>, to: Option<u64>) -> Result<BackfillReport> {
        let from = from.unwrap_or(self.deployment_block);
        let to = match to {
            Some(to) => to,
            None => self.processor.chain().head_block_number().await?,
        };

        let spans = windows(from, to, self.window);
        info!(from, to, window = self.window, windows = spans.len(), "Starting backfill");

        let mut report = BackfillReport {
            from,
            to,
            windows: 0,
            totals: RangeReport::default(),
        };
        for span in spans {
            let range = self.processor.process_range(span, None).await?;
            report.totals.absorb(&range);
            report.windows += 1;
        }

        info!(
            from,
            to,
            windows = report.windows,
            inserted = report.totals.inserted,
            duplicates = report.totals.duplicates,
            failed = report.totals.failed,
            "Backfill complete"
        );
        Ok(report)
    }
}
