//! End-to-end snapshot behaviour across backends, gangs and isolation levels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use mppsnap_error::MppError;
use mppsnap_mvcc::{
    BackendState, DistributedLog, DistributedSnapshotCoordinator, DtxRole,
    GlobalTransactionDirectory, InMemoryCommitLog, InMemoryDistributedLog, InMemoryDtxDirectory,
    InMemorySubtrans, MvccConfig, ProcArray, ProcEntry, ReaderWaitConfig, SharedSnapshotRegistry,
    SnapshotBuilder, SnapshotManager, VisibilityOracle, XidAllocator,
};
use mppsnap_types::{
    CommandId, DatabaseId, DispatchCorrelation, DispatchedStatement, DistributedSnapshot,
    DistributedXid, IsolationLevel, Pid, RoleId, SessionId, Snapshot, TransactionId,
    TransactionRef,
};
use proptest::prelude::*;

fn xid(raw: u64) -> TransactionId {
    TransactionId::new(raw).unwrap()
}

fn gxid(raw: u64) -> DistributedXid {
    DistributedXid::new(raw).unwrap()
}

fn config() -> MvccConfig {
    let mut config = MvccConfig {
        max_backends: 16,
        max_prepared_xacts: 4,
        max_cached_subxids: 8,
        ..MvccConfig::default()
    };
    config.reader_wait = ReaderWaitConfig {
        timeout: Duration::from_secs(10),
        ..ReaderWaitConfig::default()
    };
    config
}

struct Node {
    config: MvccConfig,
    procs: Arc<ProcArray>,
    alloc: Arc<XidAllocator>,
    builder: Arc<SnapshotBuilder>,
    registry: Arc<SharedSnapshotRegistry>,
}

impl Node {
    fn worker(config: MvccConfig) -> Self {
        let procs = Arc::new(ProcArray::new(&config).unwrap());
        let builder = Arc::new(SnapshotBuilder::new(
            Arc::clone(&procs),
            DistributedSnapshotCoordinator::worker(&config),
            &config,
        ));
        let registry = Arc::new(SharedSnapshotRegistry::new(&config).unwrap());
        Self {
            config,
            procs,
            alloc: Arc::new(XidAllocator::default()),
            builder,
            registry,
        }
    }

    fn backend(&self, pid: u32) -> BackendState {
        BackendState::attach(
            &self.procs,
            ProcEntry::backend(Pid::new(pid), DatabaseId::new(1), RoleId::new(1)),
        )
        .unwrap()
    }

    fn gang_member(&self, pid: u32, session: SessionId, is_writer: bool) -> BackendState {
        BackendState::attach(
            &self.procs,
            ProcEntry::backend(Pid::new(pid), DatabaseId::new(1), RoleId::new(1))
                .with_gang(session, is_writer),
        )
        .unwrap()
    }
}

fn statement(generation: u32, cid: u32) -> DispatchedStatement {
    DispatchedStatement {
        correlation: DispatchCorrelation {
            coordinator_xid: gxid(40),
            coordinator_cid: CommandId::new(cid),
            generation,
        },
        distributed: DistributedSnapshot {
            xmin: gxid(38),
            xmax: gxid(41),
            xmin_all_snapshots: gxid(38),
            in_progress: vec![gxid(38)],
            ..DistributedSnapshot::default()
        },
    }
}

#[test]
fn snapshot_lists_running_transactions_and_their_subtransactions() {
    let config = config();
    let procs = Arc::new(ProcArray::with_latest_completed(&config, xid(110)).unwrap());
    let builder = SnapshotBuilder::new(
        Arc::clone(&procs),
        DistributedSnapshotCoordinator::worker(&config),
        &config,
    );
    let a = procs
        .add(ProcEntry::backend(Pid::new(1), DatabaseId::new(1), RoleId::new(1)))
        .unwrap();
    let b = procs
        .add(ProcEntry::backend(Pid::new(2), DatabaseId::new(1), RoleId::new(1)))
        .unwrap();
    procs.set_xid(a, xid(100)).unwrap();
    procs.set_xid(b, xid(105)).unwrap();
    procs.add_subxid(b, xid(106)).unwrap();
    let mut me = BackendState::attach(
        &procs,
        ProcEntry::backend(Pid::new(3), DatabaseId::new(1), RoleId::new(1)),
    )
    .unwrap();

    let mut snap = Snapshot::default();
    builder.build(&mut me, &mut snap).unwrap();
    let mut running = snap.running.clone();
    running.sort_unstable();
    assert_eq!(running, vec![xid(100), xid(105)]);
    assert_eq!(snap.subxids, vec![xid(106)]);
    assert_eq!(snap.xmin, xid(100));
    assert_eq!(snap.xmax, xid(111));

    let subtrans = InMemorySubtrans::new();
    assert!(mppsnap_mvcc::xid_in_snapshot(&snap, TransactionRef::Local(xid(106)), &subtrans));
    assert!(!mppsnap_mvcc::xid_in_snapshot(&snap, TransactionRef::Local(xid(103)), &subtrans));
}

#[test]
fn serializable_snapshot_ignores_later_commits() {
    let node = Node::worker(config());
    let mut me = node.backend(1);
    let mut other = node.backend(2);
    let running = other.assign_xid(&node.procs, &node.alloc).unwrap();
    let mut third = node.backend(3);
    third.assign_xid(&node.procs, &node.alloc).unwrap();
    third.finish_transaction(&node.procs).unwrap();

    me.begin(&node.procs, IsolationLevel::Serializable).unwrap();
    let mut mgr = SnapshotManager::new(Arc::clone(&node.builder));
    let first = mgr.transaction_snapshot(&mut me).unwrap().clone();
    assert_eq!(first.running, vec![running]);

    other.finish_transaction(&node.procs).unwrap();
    for _ in 0..3 {
        me.command_counter_increment().unwrap();
        let again = mgr.transaction_snapshot(&mut me).unwrap();
        assert_eq!(again.running, first.running);
        assert_eq!(again.xmin, first.xmin);
        assert_eq!(again.xmax, first.xmax);
        assert_eq!(again.curcid, me.curcid());
    }
    let latest = mgr.latest_snapshot(&mut me).unwrap();
    assert!(latest.running.is_empty());
}

#[test]
fn gang_readers_agree_with_writer() {
    let node = Arc::new(Node::worker(config()));
    let session = SessionId::new(21);

    // Some unrelated running work so the snapshot is not trivial.
    let mut busy = node.backend(500);
    busy.assign_xid(&node.procs, &node.alloc).unwrap();
    let mut done = node.backend(501);
    done.assign_xid(&node.procs, &node.alloc).unwrap();
    done.finish_transaction(&node.procs).unwrap();

    let mut writer = node.gang_member(100, session, true);
    let slot = node.registry.add(session, writer.pid()).unwrap();
    writer.attach_gang_slot(slot);
    writer.assign_xid(&node.procs, &node.alloc).unwrap();

    let started = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..3_u32)
        .map(|i| {
            let node = Arc::clone(&node);
            let started = Arc::clone(&started);
            thread::spawn(move || {
                let mut reader = node.gang_member(200 + i, session, false);
                reader.attach_gang_slot(node.registry.lookup(session).unwrap());
                reader.set_role(DtxRole::Reader(statement(7, 2)));
                started.store(true, Ordering::Release);
                let mut snap = Snapshot::default();
                node.builder.build(&mut reader, &mut snap).unwrap();
                (snap, reader.writer_xid())
            })
        })
        .collect();

    while !started.load(Ordering::Acquire) {
        thread::yield_now();
    }
    thread::sleep(Duration::from_millis(10));
    writer.set_role(DtxRole::Writer(statement(7, 2)));
    let mut written = Snapshot::default();
    node.builder.build(&mut writer, &mut written).unwrap();

    for handle in readers {
        let (snap, writer_xid) = handle.join().unwrap();
        assert_eq!(snap, written);
        assert_eq!(snap.fingerprint(), written.fingerprint());
        assert_eq!(writer_xid, writer.xid());
    }
    assert_eq!(
        node.procs.find_writer_by_session(session),
        Some(writer.pid())
    );
}

#[test]
fn reader_with_stale_generation_times_out() {
    let mut config = config();
    config.reader_wait = ReaderWaitConfig {
        timeout: Duration::from_millis(80),
        initial_poll: Duration::from_millis(1),
        max_poll: Duration::from_millis(10),
        warn_every: Duration::from_millis(30),
    };
    let node = Node::worker(config);
    let session = SessionId::new(5);
    let mut writer = node.gang_member(1, session, true);
    writer.attach_gang_slot(node.registry.add(session, writer.pid()).unwrap());
    writer.set_role(DtxRole::Writer(statement(3, 0)));
    let mut written = Snapshot::default();
    node.builder.build(&mut writer, &mut written).unwrap();

    let mut reader = node.gang_member(2, session, false);
    reader.attach_gang_slot(node.registry.lookup(session).unwrap());
    reader.set_role(DtxRole::Reader(statement(4, 0)));
    let mut snap = Snapshot::default();
    let started = Instant::now();
    let err = node.builder.build(&mut reader, &mut snap).unwrap_err();
    assert!(matches!(err, MppError::ReaderSnapshotTimeout { .. }));
    assert!(started.elapsed() >= node.config.reader_wait.timeout);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn cancelling_a_waiting_reader() {
    let node = Node::worker(config());
    let session = SessionId::new(6);
    let writer = node.gang_member(1, session, true);
    node.registry.add(session, writer.pid()).unwrap();

    let mut reader = node.gang_member(2, session, false);
    reader.attach_gang_slot(node.registry.lookup(session).unwrap());
    reader.set_role(DtxRole::Reader(statement(1, 0)));
    let cancel = reader.cancel_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        cancel.cancel();
    });
    let mut snap = Snapshot::default();
    let started = Instant::now();
    let err = node.builder.build(&mut reader, &mut snap).unwrap_err();
    canceller.join().unwrap();
    assert!(matches!(err, MppError::QueryCanceled));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn serializable_writer_refreshes_reader_command_id() {
    let node = Node::worker(config());
    let session = SessionId::new(8);
    let mut writer = node.gang_member(1, session, true);
    writer.attach_gang_slot(node.registry.add(session, writer.pid()).unwrap());
    writer.begin(&node.procs, IsolationLevel::Serializable).unwrap();
    writer.assign_xid(&node.procs, &node.alloc).unwrap();
    writer.set_role(DtxRole::Writer(statement(1, 0)));
    let mut mgr = SnapshotManager::new(Arc::clone(&node.builder));
    mgr.transaction_snapshot(&mut writer).unwrap();

    // Next statement of the same distributed transaction.
    writer.command_counter_increment().unwrap();
    writer.set_role(DtxRole::Writer(statement(2, 1)));
    let reused = mgr.transaction_snapshot(&mut writer).unwrap().clone();

    let mut reader = node.gang_member(2, session, false);
    reader.attach_gang_slot(node.registry.lookup(session).unwrap());
    reader.set_role(DtxRole::Reader(statement(2, 1)));
    let mut snap = Snapshot::default();
    node.builder.build(&mut reader, &mut snap).unwrap();
    assert_eq!(snap.curcid, CommandId::new(1));
    assert_eq!(snap.running, reused.running);
    assert_eq!(snap.xmax, reused.xmax);
}

#[test]
fn coordinator_and_worker_split_visibility() {
    let config = config();
    let dir = Arc::new(InMemoryDtxDirectory::new(2));
    let mine = dir.begin().unwrap();
    let concurrent = dir.begin().unwrap();
    let procs = Arc::new(ProcArray::new(&config).unwrap());
    let coordinator = DistributedSnapshotCoordinator::coordinator(
        Arc::clone(&dir) as Arc<dyn GlobalTransactionDirectory>,
        &config,
    );
    let builder = SnapshotBuilder::new(Arc::clone(&procs), coordinator.clone(), &config);
    let mut me = BackendState::attach(
        &procs,
        ProcEntry::backend(Pid::new(1), DatabaseId::new(1), RoleId::new(1)),
    )
    .unwrap();
    me.set_role(DtxRole::Coordinator(mine));
    let mut snap = Snapshot::default();
    builder.build(&mut me, &mut snap).unwrap();

    // The concurrent distributed transaction committed on this node as a
    // purely local id that the local view considers finished.
    let alloc = XidAllocator::default();
    let local = alloc.assign().unwrap();
    dir.bind_local(concurrent, local);
    let tref = coordinator.resolve(local);
    assert!(matches!(tref, TransactionRef::Distributed { .. }));

    let oracle = VisibilityOracle::new(
        Arc::clone(&procs),
        Arc::new(InMemoryCommitLog::new()),
        Arc::new(InMemorySubtrans::new()),
    );
    assert!(oracle.xid_in_snapshot(&snap, tref));
    dir.forget(concurrent);
    dir.forget(mine);
}

#[test]
fn worker_judges_distributed_creators_by_dispatched_snapshot() {
    let config = config();
    let procs = Arc::new(ProcArray::new(&config).unwrap());
    let log = Arc::new(InMemoryDistributedLog::new());
    let dtx = DistributedSnapshotCoordinator::worker(&config)
        .with_distributed_log(Arc::clone(&log) as Arc<dyn DistributedLog>);
    let builder = SnapshotBuilder::new(Arc::clone(&procs), dtx, &config);
    let alloc = XidAllocator::default();

    // Still running locally, but its distributed transaction gxid#39 had
    // committed before the statement's distributed snapshot.
    let mut other = BackendState::attach(
        &procs,
        ProcEntry::backend(Pid::new(2), DatabaseId::new(1), RoleId::new(1)),
    )
    .unwrap();
    let running_locally = other.assign_xid(&procs, &alloc).unwrap();
    log.record(running_locally, gxid(39));
    // Finished locally, but gxid#38 is still in progress cluster-wide.
    let mut done = BackendState::attach(
        &procs,
        ProcEntry::backend(Pid::new(3), DatabaseId::new(1), RoleId::new(1)),
    )
    .unwrap();
    let finished_locally = done.assign_xid(&procs, &alloc).unwrap();
    done.finish_transaction(&procs).unwrap();
    log.record(finished_locally, gxid(38));
    let mut bump = BackendState::attach(
        &procs,
        ProcEntry::backend(Pid::new(4), DatabaseId::new(1), RoleId::new(1)),
    )
    .unwrap();
    bump.assign_xid(&procs, &alloc).unwrap();
    bump.finish_transaction(&procs).unwrap();

    let mut me = BackendState::attach(
        &procs,
        ProcEntry::backend(Pid::new(1), DatabaseId::new(1), RoleId::new(1)),
    )
    .unwrap();
    let registry = SharedSnapshotRegistry::new(&config).unwrap();
    let slot = registry.add(SessionId::new(1), me.pid()).unwrap();
    me.attach_gang_slot(slot);
    me.set_role(DtxRole::Writer(statement(1, 0)));
    let mut snap = Snapshot::default();
    builder.build(&mut me, &mut snap).unwrap();
    assert!(snap.running.contains(&running_locally));

    let oracle = VisibilityOracle::new(
        Arc::clone(&procs),
        Arc::new(InMemoryCommitLog::new()),
        Arc::new(InMemorySubtrans::new()),
    );
    let coordinator = builder.coordinator();
    assert!(!oracle.xid_in_snapshot(&snap, coordinator.resolve(running_locally)));
    assert!(oracle.xid_in_snapshot(&snap, coordinator.resolve(finished_locally)));
}

#[test]
fn is_in_progress_below_recent_xmin_takes_no_lock() {
    let config = config();
    let procs = Arc::new(ProcArray::with_latest_completed(&config, xid(70)).unwrap());
    let builder = SnapshotBuilder::new(
        Arc::clone(&procs),
        DistributedSnapshotCoordinator::worker(&config),
        &config,
    );
    let oracle = VisibilityOracle::new(
        Arc::clone(&procs),
        Arc::new(InMemoryCommitLog::new()),
        Arc::new(InMemorySubtrans::new()),
    );
    let other = procs
        .add(ProcEntry::backend(Pid::new(9), DatabaseId::new(1), RoleId::new(1)))
        .unwrap();
    procs.set_xid(other, xid(60)).unwrap();
    let mut me = BackendState::attach(
        &procs,
        ProcEntry::backend(Pid::new(1), DatabaseId::new(1), RoleId::new(1)),
    )
    .unwrap();
    let mut snap = Snapshot::default();
    builder.build(&mut me, &mut snap).unwrap();
    assert_eq!(me.recent_xmin(), xid(60));

    let before = procs.stats();
    assert!(!oracle.is_in_progress(&mut me, xid(50)));
    let after = procs.stats();
    assert_eq!(after.lock_acquisitions(), before.lock_acquisitions());
}

#[test]
fn snapshots_taken_during_prepare_stay_well_formed() {
    let node = Arc::new(Node::worker(config()));
    let stop = Arc::new(AtomicBool::new(false));
    let observer = {
        let node = Arc::clone(&node);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut me = node.backend(90);
            let mut snap = Snapshot::default();
            let mut builds = 0_u32;
            while !stop.load(Ordering::Acquire) || builds == 0 {
                node.builder.build(&mut me, &mut snap).unwrap();
                assert!(snap.is_well_formed(), "{snap}");
                builds += 1;
            }
            builds
        })
    };

    let mut preparer = node.backend(1);
    let mut bumper = node.backend(2);
    for _ in 0..300 {
        let top = preparer.assign_xid(&node.procs, &node.alloc).unwrap();
        // Move the watermark past `top` so snapshots list it.
        bumper.assign_xid(&node.procs, &node.alloc).unwrap();
        bumper.finish_transaction(&node.procs).unwrap();
        let prepared = preparer.prepare(&node.procs).unwrap();
        assert_eq!(node.procs.pid_of_xid(top), None);
        node.procs.remove(prepared, Some(top)).unwrap();
    }
    stop.store(true, Ordering::Release);
    assert!(observer.join().unwrap() > 0);
    assert_eq!(node.procs.live_count(), 2);
}

#[test]
fn registry_exhaustion_is_fatal() {
    let mut config = config();
    config.shared_snapshot.slots = Some(1);
    config.shared_snapshot.wait_timeout = Duration::from_millis(20);
    let registry = SharedSnapshotRegistry::new(&config).unwrap();
    registry.add(SessionId::new(1), Pid::new(1)).unwrap();
    let err = registry.add(SessionId::new(2), Pid::new(2)).unwrap_err();
    assert!(err.is_fatal());
    assert!(registry.dump().contains("session#1"));
}

#[derive(Debug, Clone)]
enum Step {
    Begin(usize),
    Finish(usize),
    Snapshot(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0_usize..4).prop_map(Step::Begin),
        (0_usize..4).prop_map(Step::Finish),
        (0_usize..4).prop_map(Step::Snapshot),
    ]
}

proptest! {
    #[test]
    fn prop_watermark_and_snapshots_stay_consistent(steps in proptest::collection::vec(step(), 1..60)) {
        let node = Node::worker(config());
        let mut backends: Vec<BackendState> = (0..4).map(|i| node.backend(i + 1)).collect();
        let mut last_watermark = node.procs.latest_completed();
        let mut snap = Snapshot::default();
        for step in steps {
            match step {
                Step::Begin(i) => {
                    backends[i].assign_xid(&node.procs, &node.alloc).unwrap();
                }
                Step::Finish(i) => {
                    backends[i].finish_transaction(&node.procs).unwrap();
                }
                Step::Snapshot(i) => {
                    node.builder.build(&mut backends[i], &mut snap).unwrap();
                    prop_assert!(snap.is_well_formed());
                    for (j, other) in backends.iter().enumerate() {
                        if let Some(x) = other.xid() {
                            if j != i {
                                prop_assert!(snap.local_in_progress(x, |x| x));
                            }
                        }
                    }
                }
            }
            let watermark = node.procs.latest_completed();
            prop_assert!(watermark >= last_watermark);
            last_watermark = watermark;
        }
    }
}
