use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde_json::json;

use onchain_etl::abi::{parse_abi_document, ContractBinding, ContractRegistry};
use onchain_etl::backfill::Backfill;
use onchain_etl::chain::{BlockSpan, ChainClient};
use onchain_etl::decoder::RawLog;
use onchain_etl::listener::{ListenerState, LiveListener, LIVE_CURSOR};
use onchain_etl::processor::RangeProcessor;
use onchain_etl::store::{CursorUpdate, EventStore, IngestedEvent, InsertOutcome, MemoryEventStore};
use onchain_etl::{EtlError, Result};

const BOOKING_ABI: &str = r#"{
    "contractName": "BookingRegistry",
    "abi": [
        {
            "type": "event",
            "name": "Booked",
            "inputs": [
                {"name": "amount", "type": "uint256", "indexed": false},
                {"name": "memo", "type": "bytes", "indexed": false}
            ]
        },
        {
            "type": "event",
            "name": "Cancelled",
            "inputs": [
                {"name": "bookingId", "type": "uint256", "indexed": true}
            ]
        }
    ]
}"#;

fn contract() -> Address {
    Address::with_last_byte(0xb0)
}

fn registry() -> Arc<ContractRegistry> {
    let events = parse_abi_document(BOOKING_ABI.as_bytes()).unwrap();
    let binding = ContractBinding::new("BookingRegistry", contract(), &events).unwrap();
    Arc::new(ContractRegistry::new(vec![binding]))
}

fn selector(name: &str) -> B256 {
    let registry = registry();
    let binding = registry.get(&contract()).unwrap();
    binding.events().iter().find(|e| e.name == name).unwrap().selector
}

fn booked_log(block_number: u64, log_index: u64, tx_byte: u8, amount: u64, memo: &[u8]) -> RawLog {
    let data = DynSolValue::Tuple(vec![
        DynSolValue::Uint(U256::from(amount), 256),
        DynSolValue::Bytes(memo.to_vec()),
    ])
    .abi_encode_params();

    RawLog {
        address: contract(),
        topics: vec![selector("Booked")],
        data: data.into(),
        block_number,
        tx_hash: B256::repeat_byte(tx_byte),
        log_index,
    }
}

/// Serves canned logs and records every range it is asked for.
#[derive(Default)]
struct CannedChain {
    head: AtomicU64,
    logs: Mutex<Vec<RawLog>>,
    calls: Mutex<Vec<BlockSpan>>,
    fail_next: AtomicBool,
    stall_next: AtomicBool,
}

impl CannedChain {
    fn new(head: u64, logs: Vec<RawLog>) -> Arc<Self> {
        Arc::new(Self {
            head: AtomicU64::new(head),
            logs: Mutex::new(logs),
            ..Default::default()
        })
    }

    fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().unwrap().iter().map(|s| (s.start, s.end)).collect()
    }
}

#[async_trait]
impl ChainClient for CannedChain {
    async fn head_block_number(&self) -> Result<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_logs(&self, addresses: &[Address], span: BlockSpan) -> Result<Vec<RawLog>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EtlError::Rpc("connection reset".to_string()));
        }
        if self.stall_next.swap(false, Ordering::SeqCst) {
            // Same outcome as the RPC client's request bound expiring
            tokio::time::sleep(Duration::from_secs(30)).await;
            return Err(EtlError::Timeout {
                operation: "eth_getLogs",
                secs: 30,
            });
        }
        self.calls.lock().unwrap().push(span);

        let mut logs: Vec<RawLog> = self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| addresses.contains(&log.address))
            .filter(|log| log.block_number >= span.start && log.block_number <= span.end)
            .cloned()
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }
}

/// Wraps the memory store and holds the next commit long past any timeout.
struct StallingStore {
    inner: Arc<MemoryEventStore>,
    stall_next: AtomicBool,
}

#[async_trait]
impl EventStore for StallingStore {
    async fn commit_range(
        &self,
        events: &[IngestedEvent],
        cursor: Option<CursorUpdate>,
    ) -> Result<Vec<InsertOutcome>> {
        if self.stall_next.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        }
        self.inner.commit_range(events, cursor).await
    }

    async fn load_cursor(&self, name: &str) -> Result<Option<u64>> {
        self.inner.load_cursor(name).await
    }
}

fn processor(chain: Arc<CannedChain>, store: Arc<MemoryEventStore>) -> Arc<RangeProcessor> {
    Arc::new(RangeProcessor::new(
        registry(),
        chain,
        store,
        Duration::from_secs(5),
    ))
}

#[tokio::test]
async fn backfill_end_to_end_then_overlapping_rerun() {
    let chain = CannedChain::new(300, vec![booked_log(100, 0, 0x01, 42, &[0xde, 0xad])]);
    let store = Arc::new(MemoryEventStore::new());
    let backfill = Backfill::new(processor(chain.clone(), store.clone()), 0, 100);

    let first = backfill.run(Some(100), Some(100)).await.unwrap();
    assert_eq!(first.totals.inserted, 1);

    let rows = store.snapshot().await;
    assert_eq!(rows.len(), 1);
    let row = &rows[0].event;
    assert_eq!(row.block_number, 100);
    assert_eq!(row.log_index, 0);
    assert_eq!(row.contract_name, "BookingRegistry");
    assert_eq!(row.contract_address, contract().to_checksum(None));
    assert_eq!(row.tx_hash, format!("0x{}", "01".repeat(32)));
    assert_eq!(
        row.payload,
        json!({"event_name": "Booked", "args": {"amount": 42, "memo": "dead"}})
    );

    let rerun = backfill.run(Some(90), Some(110)).await.unwrap();
    assert_eq!(rerun.totals.inserted, 0);
    assert_eq!(rerun.totals.duplicates, 1);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn processing_a_range_twice_is_idempotent() {
    let chain = CannedChain::new(
        20,
        vec![
            booked_log(10, 0, 0x0a, 1, b"a"),
            booked_log(10, 1, 0x0a, 2, b"b"),
            booked_log(12, 0, 0x0c, 3, b"c"),
        ],
    );
    let store = Arc::new(MemoryEventStore::new());
    let processor = processor(chain, store.clone());

    let first = processor.process_range(BlockSpan::new(10, 12), None).await.unwrap();
    let before = store.snapshot().await;

    let second = processor.process_range(BlockSpan::new(10, 12), None).await.unwrap();
    let after = store.snapshot().await;

    assert_eq!(first.inserted, 3);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.duplicates, 3);
    assert_eq!(before, after);
}

#[tokio::test]
async fn undecodable_logs_are_skipped_without_aborting_the_range() {
    let mut unknown = booked_log(5, 1, 0x05, 0, b"");
    unknown.topics = vec![B256::repeat_byte(0xee)];

    let mut truncated = booked_log(5, 2, 0x05, 0, b"");
    truncated.data = Bytes::from(vec![0u8; 16]);

    let chain = CannedChain::new(
        10,
        vec![
            booked_log(5, 0, 0x05, 7, b"x"),
            unknown,
            truncated,
            booked_log(6, 0, 0x06, 8, b"y"),
        ],
    );
    let store = Arc::new(MemoryEventStore::new());
    let report = processor(chain, store.clone())
        .process_range(BlockSpan::new(5, 6), None)
        .await
        .unwrap();

    assert_eq!(report.fetched, 4);
    assert_eq!(report.decoded, 2);
    assert_eq!(report.undecodable, 2);
    assert_eq!(report.inserted, 2);

    let indexes: Vec<_> = store
        .snapshot()
        .await
        .iter()
        .map(|r| (r.event.block_number, r.event.log_index))
        .collect();
    assert_eq!(indexes, vec![(5, 0), (6, 0)]);
}

#[tokio::test]
async fn indexed_event_is_decoded_from_topics() {
    let cancelled = RawLog {
        address: contract(),
        topics: vec![
            selector("Cancelled"),
            B256::from(U256::from(77).to_be_bytes::<32>()),
        ],
        data: Bytes::new(),
        block_number: 3,
        tx_hash: B256::repeat_byte(0x03),
        log_index: 4,
    };
    let chain = CannedChain::new(3, vec![cancelled]);
    let store = Arc::new(MemoryEventStore::new());
    processor(chain, store.clone())
        .process_range(BlockSpan::new(3, 3), None)
        .await
        .unwrap();

    let rows = store.snapshot().await;
    assert_eq!(
        rows[0].event.payload,
        json!({"event_name": "Cancelled", "args": {"bookingId": 77}})
    );
}

#[tokio::test]
async fn backfill_walks_deployment_block_to_head_in_windows() {
    let chain = CannedChain::new(250, vec![]);
    let store = Arc::new(MemoryEventStore::new());
    let report = Backfill::new(processor(chain.clone(), store), 100, 100)
        .run(None, None)
        .await
        .unwrap();

    assert_eq!(chain.calls(), vec![(100, 199), (200, 250)]);
    assert_eq!(report.windows, 2);
    assert_eq!((report.from, report.to), (100, 250));
}

#[tokio::test]
async fn backfill_stops_at_first_failing_window() {
    let chain = CannedChain::new(250, vec![booked_log(150, 0, 0x15, 1, b"")]);
    let store = Arc::new(MemoryEventStore::new());
    let backfill = Backfill::new(processor(chain.clone(), store.clone()), 100, 100);

    chain.fail_next.store(true, Ordering::SeqCst);
    let err = backfill.run(None, None).await.unwrap_err();
    assert!(err.is_transient());
    assert!(chain.calls().is_empty());
    assert!(store.is_empty().await);

    backfill.run(None, None).await.unwrap();
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn listener_covers_each_new_block_once() {
    let chain = CannedChain::new(
        50,
        vec![booked_log(50, 0, 0x50, 1, b""), booked_log(53, 0, 0x53, 2, b""), booked_log(58, 0, 0x58, 3, b"")],
    );
    let store = Arc::new(MemoryEventStore::new());
    let mut listener = LiveListener::start(processor(chain.clone(), store.clone()), Duration::from_secs(3), true)
        .await
        .unwrap();
    assert_eq!(listener.watermark(), 50);
    assert_eq!(listener.state(), ListenerState::Idle);

    assert!(listener.poll_once().await.unwrap().is_none());

    chain.set_head(55);
    let report = listener.poll_once().await.unwrap().unwrap();
    assert_eq!(report.inserted, 1);

    chain.set_head(60);
    listener.poll_once().await.unwrap();
    assert!(listener.poll_once().await.unwrap().is_none());

    assert_eq!(chain.calls(), vec![(51, 55), (56, 60)]);
    assert_eq!(listener.watermark(), 60);
    assert_eq!(listener.state(), ListenerState::Idle);
    assert_eq!(store.load_cursor(LIVE_CURSOR).await.unwrap(), Some(60));

    // Block 50 was already behind the head at start
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn listener_keeps_watermark_when_a_poll_fails() {
    let chain = CannedChain::new(10, vec![booked_log(12, 0, 0x12, 1, b"")]);
    let store = Arc::new(MemoryEventStore::new());
    let mut listener = LiveListener::start(processor(chain.clone(), store.clone()), Duration::from_secs(3), false)
        .await
        .unwrap();

    chain.set_head(15);
    chain.fail_next.store(true, Ordering::SeqCst);
    assert!(listener.poll_once().await.is_err());
    assert_eq!(listener.watermark(), 10);
    assert_eq!(store.load_cursor(LIVE_CURSOR).await.unwrap(), None);

    listener.poll_once().await.unwrap();
    assert_eq!(chain.calls(), vec![(11, 15)]);
    assert_eq!(listener.watermark(), 15);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn listener_resumes_from_persisted_cursor() {
    let chain = CannedChain::new(45, vec![booked_log(42, 0, 0x42, 9, b"")]);
    let store = Arc::new(MemoryEventStore::new());
    store
        .commit_range(&[], Some(CursorUpdate::new(LIVE_CURSOR, 40)))
        .await
        .unwrap();

    let mut resumed = LiveListener::start(processor(chain.clone(), store.clone()), Duration::from_secs(3), true)
        .await
        .unwrap();
    assert_eq!(resumed.watermark(), 40);
    resumed.poll_once().await.unwrap();
    assert_eq!(chain.calls(), vec![(41, 45)]);
    assert_eq!(store.len().await, 1);

    let fresh = LiveListener::start(processor(chain.clone(), store.clone()), Duration::from_secs(3), false)
        .await
        .unwrap();
    assert_eq!(fresh.watermark(), 45);
}

#[tokio::test]
async fn cursor_ahead_of_head_falls_back_to_head() {
    let chain = CannedChain::new(45, vec![]);
    let store = Arc::new(MemoryEventStore::new());
    store
        .commit_range(&[], Some(CursorUpdate::new(LIVE_CURSOR, 900)))
        .await
        .unwrap();

    let listener = LiveListener::start(processor(chain, store), Duration::from_secs(3), true)
        .await
        .unwrap();
    assert_eq!(listener.watermark(), 45);
}

#[tokio::test(start_paused = true)]
async fn run_polls_until_shutdown() {
    let chain = CannedChain::new(5, vec![booked_log(6, 0, 0x06, 1, b"")]);
    let store = Arc::new(MemoryEventStore::new());
    let mut listener = LiveListener::start(processor(chain.clone(), store.clone()), Duration::from_secs(3), false)
        .await
        .unwrap();

    chain.set_head(6);
    listener
        .run(tokio::time::sleep(Duration::from_secs(10)))
        .await
        .unwrap();

    assert_eq!(chain.calls(), vec![(6, 6)]);
    assert_eq!(listener.watermark(), 6);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn backfill_and_listener_share_the_store_safely() {
    let chain = CannedChain::new(20, vec![booked_log(18, 0, 0x18, 1, b""), booked_log(19, 0, 0x19, 2, b"")]);
    let store = Arc::new(MemoryEventStore::new());

    let backfill = Backfill::new(processor(chain.clone(), store.clone()), 0, 7);
    let live = processor(chain.clone(), store.clone());

    let (a, b) = tokio::join!(
        backfill.run(Some(15), Some(20)),
        live.process_range(BlockSpan::new(17, 20), Some(LIVE_CURSOR)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.totals.inserted + b.inserted, 2);
    assert_eq!(a.totals.duplicates + b.duplicates, 2);
    assert_eq!(store.len().await, 2);
}

#[tokio::test(start_paused = true)]
async fn commit_timeout_abandons_the_range() {
    let chain = CannedChain::new(10, vec![booked_log(12, 0, 0x12, 1, b"")]);
    let memory = Arc::new(MemoryEventStore::new());
    let store = Arc::new(StallingStore {
        inner: memory.clone(),
        stall_next: AtomicBool::new(true),
    });
    let processor = Arc::new(RangeProcessor::new(
        registry(),
        chain.clone(),
        store,
        Duration::from_secs(5),
    ));
    let mut listener = LiveListener::start(processor, Duration::from_secs(3), true)
        .await
        .unwrap();

    chain.set_head(15);
    let err = listener.poll_once().await.unwrap_err();
    assert!(matches!(err, EtlError::Timeout { operation: "range commit", secs: 5 }));
    assert_eq!(listener.watermark(), 10);
    assert_eq!(listener.state(), ListenerState::Idle);
    assert_eq!(memory.load_cursor(LIVE_CURSOR).await.unwrap(), None);
    assert!(memory.is_empty().await);

    listener.poll_once().await.unwrap();
    assert_eq!(listener.watermark(), 15);
    assert_eq!(memory.load_cursor(LIVE_CURSOR).await.unwrap(), Some(15));
    assert_eq!(memory.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn query_timeout_abandons_the_range() {
    let chain = CannedChain::new(10, vec![booked_log(12, 0, 0x12, 1, b"")]);
    let store = Arc::new(MemoryEventStore::new());
    store
        .commit_range(&[], Some(CursorUpdate::new(LIVE_CURSOR, 10)))
        .await
        .unwrap();
    let mut listener = LiveListener::start(processor(chain.clone(), store.clone()), Duration::from_secs(3), true)
        .await
        .unwrap();

    chain.set_head(15);
    chain.stall_next.store(true, Ordering::SeqCst);
    let err = listener.poll_once().await.unwrap_err();
    assert!(matches!(err, EtlError::Timeout { .. }));
    assert!(err.is_transient());
    assert_eq!(listener.watermark(), 10);
    assert_eq!(store.load_cursor(LIVE_CURSOR).await.unwrap(), Some(10));
    assert!(store.is_empty().await);

    listener.poll_once().await.unwrap();
    assert_eq!(chain.calls(), vec![(11, 15)]);
    assert_eq!(store.load_cursor(LIVE_CURSOR).await.unwrap(), Some(15));
}
