//! End-to-end tests for the storage core as dataflow operators use it:
//! - Tuple layout and text parsing seen from an operator
//! - Concurrent open/close of shared physical indexes
//! - Scheduler ordering and synchronicity guarantees
//! - Durability across close and reopen

use bytes::BytesMut;
use kestrel_codec::{Mbr, RTreeTupleWriter, TupleReference, Value, parser_for};
use kestrel_common::{
    KestrelError, MergePolicyConfig, Result, SchedulerPolicy, StorageConfig, TypeId, TypeTrait,
};
use kestrel_index::{IndexDataflowHelper, IndexDescriptor, StorageRuntime, TaskContext};
use kestrel_lsm::{
    ComponentId, ImmediateScheduler, IndexId, IoOperation, IoOperationKind, IoOperationTarget,
    IoScheduler, OperationState, SequentialScheduler, list_generations,
};
use parking_lot::Mutex;
use rand::Rng;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

fn runtime(dir: &Path, policy: SchedulerPolicy) -> Arc<StorageRuntime> {
    let mut config = StorageConfig::new(dir)
        .with_scheduler(policy)
        .with_memory_budget(4096)
        .with_merge_policy(MergePolicyConfig::Constant { max_components: 4 });
    config.fsync_enabled = false;
    StorageRuntime::new(config).unwrap()
}

fn row_schema() -> Vec<TypeTrait> {
    vec![TypeTrait::INT64, TypeTrait::UTF8]
}

fn row(k: i64, v: &str) -> BytesMut {
    let mut out = BytesMut::new();
    kestrel_codec::TupleWriter::new(row_schema())
        .write_values(&[Value::Int64(k), Value::Utf8(v.to_string())], &mut out)
        .unwrap();
    out
}

// =============================================================================
// Codec scenarios
// =============================================================================

#[test]
fn test_tuple_layout_int_and_bytes() {
    let schema: Arc<[TypeTrait]> = Arc::from(vec![TypeTrait::INT32, TypeTrait::BINARY]);
    let writer = kestrel_codec::TupleWriter::new(Arc::clone(&schema));
    let values = vec![
        Value::Int32(42),
        Value::Binary(bytes::Bytes::from_static(b"hi")),
    ];

    let mut buf = BytesMut::new();
    let written = writer.write_values(&values, &mut buf).unwrap();
    assert_eq!(written, 10);
    assert_eq!(&buf[..], &[0x00, 0x00, 0x00, 0x2A, 0x00, 0x00, 0x00, 0x02, b'h', b'i']);

    let reader = TupleReference::at(schema, &buf, 0);
    assert_eq!(reader.values().unwrap(), values);
    assert_eq!(reader.tuple_size().unwrap(), 10);
}

#[test]
fn test_float_text_parsing() {
    let parser = parser_for(TypeId::Float32);
    let mut out = BytesMut::new();
    parser.parse_str("3.14", &mut out).unwrap();
    assert_eq!(&out[..], &3.14f32.to_be_bytes());

    let mut out = BytesMut::new();
    let err = parser.parse_str("abc", &mut out).unwrap_err();
    assert!(err.is_parse_error());
    assert!(out.is_empty());
}

// =============================================================================
// Shared physical indexes
// =============================================================================

#[test]
fn test_two_partitions_share_until_both_close() {
    init_tracing();
    let dir = tempdir().unwrap();
    let rt = runtime(dir.path(), SchedulerPolicy::Sequential);
    let desc = IndexDescriptor::btree("pk", row_schema(), 1, true);
    let ctx = TaskContext::new("job-c", "insert", Arc::clone(&rt));
    IndexDataflowHelper::new(desc.clone(), &ctx, 0)
        .unwrap()
        .create()
        .unwrap();

    let opened = Arc::new(Barrier::new(2));
    let first_closed = Arc::new(Barrier::new(2));
    let workers: Vec<_> = (0..2)
        .map(|partition| {
            let desc = desc.clone();
            let ctx = ctx.clone();
            let opened = Arc::clone(&opened);
            let first_closed = Arc::clone(&first_closed);
            thread::spawn(move || {
                let helper = IndexDataflowHelper::new(desc, &ctx, partition).unwrap();
                let handle = helper.open().unwrap();
                handle
                    .index()
                    .insert(&row(partition as i64, "partition"))
                    .unwrap();
                opened.wait();

                if partition == 0 {
                    helper.close(handle).unwrap();
                    first_closed.wait();
                } else {
                    first_closed.wait();
                    // The other partition's close must not release the index.
                    assert!(handle.index().is_active());
                    assert_eq!(handle.index().scan().unwrap().len(), 2);
                    assert_eq!(helper.open_count(), 1);
                    helper.close(handle).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let helper = IndexDataflowHelper::new(desc, &ctx, 0).unwrap();
    assert_eq!(helper.open_count(), 0);
    assert!(rt.lifecycle().open_indexes().is_empty());
    // Released on the last close: memory flushed, WAL generations gone.
    assert!(list_generations(helper.id().path()).unwrap().is_empty());

    let handle = helper.open().unwrap();
    assert_eq!(handle.index().scan().unwrap().len(), 2);
    helper.close(handle).unwrap();
    rt.shutdown();
}

#[test]
fn test_interleaved_open_close_refcount() {
    init_tracing();
    const THREADS: i64 = 8;
    const ROUNDS: i64 = 40;

    let dir = tempdir().unwrap();
    let rt = runtime(dir.path(), SchedulerPolicy::Sequential);
    let desc = IndexDescriptor::btree("shared", row_schema(), 1, true);
    let ctx = TaskContext::new("job-r", "upsert", Arc::clone(&rt));
    IndexDataflowHelper::new(desc.clone(), &ctx, 0)
        .unwrap()
        .create()
        .unwrap();

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let desc = desc.clone();
            let ctx = ctx.clone();
            thread::spawn(move || {
                let helper = IndexDataflowHelper::new(desc, &ctx, t as usize).unwrap();
                let mut rng = rand::rng();
                for i in 0..ROUNDS {
                    let handle = helper.open().unwrap();
                    let index = handle.index();
                    assert!(index.is_active());
                    index.upsert(&row(t * 1_000 + i, "value")).unwrap();
                    if rng.random_bool(0.3) {
                        thread::sleep(Duration::from_micros(rng.random_range(0..200)));
                    }
                    assert!(index.is_active());
                    helper.close(handle).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let helper = IndexDataflowHelper::new(desc, &ctx, 0).unwrap();
    assert_eq!(helper.open_count(), 0);
    let handle = helper.open().unwrap();
    assert_eq!(
        handle.index().scan().unwrap().len(),
        (THREADS * ROUNDS) as usize
    );
    assert!(handle.index().maintenance_failures().is_empty());
    helper.close(handle).unwrap();

    let err = rt.lifecycle().close(helper.id()).unwrap_err();
    assert!(err.is_lifecycle_error());
    rt.shutdown();
}

#[test]
fn test_open_after_shutdown_is_lifecycle_error() {
    let dir = tempdir().unwrap();
    let rt = runtime(dir.path(), SchedulerPolicy::Immediate);
    let ctx = TaskContext::new("job", "scan", Arc::clone(&rt));
    let helper =
        IndexDataflowHelper::new(IndexDescriptor::btree("pk", row_schema(), 1, false), &ctx, 0)
            .unwrap();
    helper.create().unwrap();
    let handle = helper.open().unwrap();

    rt.shutdown();
    assert!(!handle.index().is_active());
    assert!(matches!(helper.open(), Err(KestrelError::Lifecycle(_))));
    assert!(helper.close(handle).unwrap_err().is_lifecycle_error());
}

#[test]
fn test_rtree_index_through_handle() {
    let dir = tempdir().unwrap();
    let rt = runtime(dir.path(), SchedulerPolicy::Immediate);
    let ctx = TaskContext::new("job", "spatial", Arc::clone(&rt));
    let traits = vec![
        TypeTrait::FLOAT64,
        TypeTrait::FLOAT64,
        TypeTrait::FLOAT64,
        TypeTrait::FLOAT64,
        TypeTrait::INT64,
    ];
    let helper =
        IndexDataflowHelper::new(IndexDescriptor::rtree("geo", traits.clone(), 2, true), &ctx, 0)
            .unwrap();
    helper.create().unwrap();
    let handle = helper.open().unwrap();

    // Source rows carry only the payload; the bounding key is prepended.
    let rtree = RTreeTupleWriter::new(traits, 2).unwrap();
    let payload_writer = kestrel_codec::TupleWriter::new(vec![TypeTrait::INT64]);
    for (id, x, y) in [(1i64, 1.0, 1.0), (2, 8.0, 8.0), (3, 2.5, 0.5)] {
        let mut src = BytesMut::new();
        payload_writer
            .write_values(&[Value::Int64(id)], &mut src)
            .unwrap();
        let reader = TupleReference::at(payload_writer.shared_schema(), &src, 0);
        let mut out = BytesMut::new();
        rtree
            .write_with_bounding_key(&Mbr::from_point(&[x, y]).unwrap(), &reader, 0, &mut out)
            .unwrap();
        handle.index().insert(&out).unwrap();
    }

    let query = Mbr::new(vec![0.0, 0.0], vec![3.0, 3.0]).unwrap();
    let mut ids: Vec<i64> = handle
        .index()
        .search_rtree(&query)
        .unwrap()
        .iter()
        .map(|t| {
            let reader = TupleReference::at(Arc::from(handle.index().schema()), t, 0);
            match reader.value(4).unwrap() {
                Value::Int64(id) => id,
                other => panic!("unexpected id value {:?}", other),
            }
        })
        .collect();
    ids.sort();
    assert_eq!(ids, vec![1, 3]);
    helper.close(handle).unwrap();
    rt.shutdown();
}

// =============================================================================
// Scheduler guarantees
// =============================================================================

/// Records execution order and detects overlapping executions.
#[derive(Default)]
struct OrderRecorder {
    running: AtomicBool,
    overlaps: AtomicUsize,
    executed: Mutex<Vec<u64>>,
    delay: Duration,
    fail: bool,
}

impl IoOperationTarget for OrderRecorder {
    fn execute(&self, op: &IoOperation) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        thread::sleep(self.delay);
        self.executed.lock().push(op.id());
        self.running.store(false, Ordering::SeqCst);
        if self.fail {
            return Err(KestrelError::Internal("injected failure".to_string()));
        }
        Ok(())
    }

    fn on_completion(&self, _op: &IoOperation, _result: &Result<()>) {}
}

fn recorded_op(recorder: &Arc<OrderRecorder>, index: &IndexId, generation: u64) -> IoOperation {
    IoOperation::new(
        IoOperationKind::Flush,
        index.clone(),
        Vec::new(),
        ComponentId::flushed(generation),
        Arc::clone(recorder) as Arc<dyn IoOperationTarget>,
    )
}

#[test]
fn test_sequential_fifo_across_threads() {
    let scheduler = Arc::new(SequentialScheduler::new().unwrap());
    let recorder = Arc::new(OrderRecorder {
        delay: Duration::from_micros(300),
        ..Default::default()
    });
    let index = IndexId::new("/tmp/kestrel-fifo");
    let enqueued = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..4u64)
        .map(|t| {
            let scheduler = Arc::clone(&scheduler);
            let recorder = Arc::clone(&recorder);
            let index = index.clone();
            let enqueued = Arc::clone(&enqueued);
            thread::spawn(move || {
                let mut tickets = Vec::new();
                for i in 0..10 {
                    let op = recorded_op(&recorder, &index, t * 100 + i);
                    // Enqueue order is the order ids land in `enqueued`.
                    let mut order = enqueued.lock();
                    order.push(op.id());
                    tickets.push(scheduler.schedule(op).unwrap());
                }
                tickets
            })
        })
        .collect();

    let tickets: Vec<_> = producers
        .into_iter()
        .flat_map(|p| p.join().unwrap())
        .collect();
    for ticket in &tickets {
        ticket.wait().unwrap();
    }

    assert_eq!(*recorder.executed.lock(), *enqueued.lock());
    assert_eq!(recorder.overlaps.load(Ordering::SeqCst), 0);
    scheduler.shutdown();
}

#[test]
fn test_immediate_returns_after_terminal_state() {
    let scheduler = ImmediateScheduler::new();
    let index = IndexId::new("/tmp/kestrel-immediate");

    let recorder = Arc::new(OrderRecorder {
        delay: Duration::from_millis(20),
        ..Default::default()
    });
    let op = recorded_op(&recorder, &index, 1);
    let id = op.id();
    let ticket = scheduler.schedule(op).unwrap();
    assert_eq!(ticket.state(), OperationState::Completed);
    assert_eq!(*recorder.executed.lock(), vec![id]);

    let failing = Arc::new(OrderRecorder {
        fail: true,
        ..Default::default()
    });
    let ticket = scheduler.schedule(recorded_op(&failing, &index, 2)).unwrap();
    assert_eq!(ticket.state(), OperationState::Failed);
    assert!(ticket.wait().unwrap_err().is_io_operation_failure());

    scheduler.shutdown();
    let err = scheduler.schedule(recorded_op(&recorder, &index, 3)).unwrap_err();
    assert!(matches!(err, KestrelError::SchedulerShutdown));
}
