use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::chain::BlockSpan;
use crate::error::Result;
use crate::processor::RangeProcessor;
use crate::store::RangeReport;

/// Cursor row holding the live watermark.
pub const LIVE_CURSOR: &str = "live";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Waiting for the next poll.
    Idle,
    /// Processing a newly observed range.
    CatchingUp,
}

/// Polls the chain head and processes each block range past the watermark
/// exactly once.
pub struct LiveListener {
    processor: Arc<RangeProcessor>,
    poll_interval: Duration,
    watermark: u64,
    state: ListenerState,
}

impl LiveListener {
    /// Starts at the persisted live cursor when `resume` is set and the cursor
    /// is not ahead of the chain, otherwise at the current head.
    pub async fn start(
        processor: Arc<RangeProcessor>,
        poll_interval: Duration,
        resume: bool,
    ) -> Result<Self> {
        let head = processor.chain().head_block_number().await?;
        let cursor = if resume {
            processor.store().load_cursor(LIVE_CURSOR).await?
        } else {
            None
        };

        let watermark = match cursor {
            Some(saved) if saved <= head => {
                info!(cursor = saved, head, "Resuming live ingestion from saved cursor");
                saved
            }
            Some(saved) => {
                warn!(cursor = saved, head, "Saved cursor is ahead of the chain head, starting at head");
                head
            }
            None => {
                info!(head, "Starting live ingestion at chain head");
                head
            }
        };

        Ok(Self {
            processor,
            poll_interval,
            watermark,
            state: ListenerState::Idle,
        })
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// One head check. Processes `(watermark, head]` when the head moved and
    /// advances the watermark only after that range is committed.
    pub async fn poll_once(&mut self) -> Result<Option<RangeReport>> {
        let head = self.processor.chain().head_block_number().await?;
        if head <= self.watermark {
            debug!(head, watermark = self.watermark, "No new blocks");
            return Ok(None);
        }

        self.state = ListenerState::CatchingUp;
        let span = BlockSpan::new(self.watermark + 1, head);
        let result = self.processor.process_range(span, Some(LIVE_CURSOR)).await;
        self.state = ListenerState::Idle;

        let report = result?;
        self.watermark = head;
        Ok(Some(report))
    }

    /// Polls every `poll_interval` until `shutdown` resolves. Poll failures
    /// are logged and retried on the next tick from the same watermark.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            watermark = self.watermark,
            poll_interval_secs = self.poll_interval.as_secs(),
            "Live listener started"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(watermark = self.watermark, "Shutdown signal received, stopping live listener");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.poll_once().await {
                        if e.is_transient() {
                            warn!(watermark = self.watermark, "Poll failed, will retry: {e}");
                        } else {
                            error!(watermark = self.watermark, "Poll failed: {e}");
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
