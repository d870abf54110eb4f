use adiskd::filter::runner::{FilterRunner, FnFilter};
use adiskd::filter::{FilterId, FilterSpec};
use adiskd::search::{RunnerFactory, SearchConn, DEV_FLAG_COMPLETE, DEV_FLAG_RUNNING};
use adiskd::server::callbacks::ConnHandler;
use adiskd::server::conn::{ConnState, CSTATE_TX_ATTACHED};
use adiskd::store::group::{self, GidIdxEnt, GroupId};
use adiskd::store::ObjectStore;
use adiskd::{Object, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const GID: &str = "01:23:45:67:89:AB:CD:EF";

/// Runner factory dispatching on the filter name, so tests stay in-process.
fn test_runners() -> RunnerFactory {
    Arc::new(|spec: &FilterSpec| {
        let runner: Box<dyn FilterRunner> = match spec.name() {
            "always-drop" => Box::new(FnFilter::new(|_: &mut Object| 0)),
            "pass-odd" => Box::new(FnFilter::new(|obj: &mut Object| {
                i64::from(obj.data().first().is_some_and(|b| b % 2 == 1))
            })),
            "pass-even" => Box::new(FnFilter::new(|obj: &mut Object| {
                i64::from(obj.data().first().is_some_and(|b| b % 2 == 0))
            })),
            _ => Box::new(FnFilter::new(|_: &mut Object| 1)),
        };
        Ok(runner)
    })
}

struct Harness {
    conn: Arc<ConnState>,
    search: SearchConn,
}

impl Harness {
    fn new(dir: &Path) -> Self {
        let conn = Arc::new(ConnState::new(1));

        // pretend a data consumer is attached; the test drains the rings
        conn.set_flags(CSTATE_TX_ATTACHED);

        let search = SearchConn::spawn(
            1,
            Arc::clone(&conn),
            dir.to_path_buf(),
            None,
            test_runners(),
        );

        Self { conn, search }
    }

    fn configure_and_start(&mut self, specs: Vec<FilterSpec>) -> Result<()> {
        self.search.set_spec(specs)?;
        self.search.set_gid(GID.parse::<GroupId>().expect("should parse"))?;
        self.search.start()
    }

    /// Drains both output rings until the search completes; returns
    /// (complete, partial) objects in arrival order.
    fn collect(&mut self) -> (Vec<Object>, Vec<Object>) {
        let deadline = Instant::now() + Duration::from_secs(30);
        let mut complete = vec![];
        let mut partial = vec![];

        loop {
            assert!(Instant::now() < deadline, "search did not finish in time");

            let mut moved = false;

            while let Some(obj) = self.conn.complete_ring().deq() {
                complete.push(obj);
                moved = true;
            }
            while let Some(obj) = self.conn.partial_ring().deq() {
                partial.push(obj);
                moved = true;
            }

            let stats = self.search.get_stats().expect("should snapshot");
            if stats.flags & DEV_FLAG_COMPLETE != 0 && self.conn.tx_backlog() == 0 {
                return (complete, partial);
            }

            if !moved {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

fn write_objects(dir: &Path, count: u8) -> Vec<String> {
    (0..count)
        .map(|i| {
            let name = format!("obj-{i:03}");
            std::fs::write(dir.join(&name), vec![i]).expect("should write");
            name
        })
        .collect()
}

fn obj_name(obj: &Object) -> String {
    obj.attrs()
        .get("name")
        .and_then(|v| std::str::from_utf8(v).ok())
        .expect("object should carry its name")
        .to_owned()
}

/// Scenario: an empty spec passes every object through in directory
/// iteration order.
#[test_log::test]
fn pipeline_empty_spec_passes_all() {
    let folder = tempfile::tempdir().expect("should create tempdir");
    write_objects(folder.path(), 3);

    let mut harness = Harness::new(folder.path());
    harness
        .configure_and_start(vec![])
        .expect("should start");

    let (complete, partial) = harness.collect();

    assert_eq!(3, complete.len());
    assert!(partial.is_empty());

    // same order as a fresh scan of the directory
    let mut store = ObjectStore::open(folder.path()).expect("should open");
    let mut scan_order = vec![];
    while let Some(obj) = store.next_obj().expect("should iterate") {
        scan_order.push(obj_name(&obj));
    }

    let received = complete.iter().map(obj_name).collect::<Vec<_>>();
    assert_eq!(scan_order, received);

    let stats = harness.search.get_stats().expect("should snapshot");
    assert_eq!(3, stats.obj_passed);
    assert_eq!(0, stats.obj_dropped);
    assert_eq!(stats.obj_processed, stats.obj_passed + stats.obj_dropped + stats.obj_skipped);
    assert_eq!(0, stats.flags & DEV_FLAG_RUNNING);
}

/// Scenario: a single always-drop filter drops everything and leaves exactly
/// one conditional entry (plus its union record).
#[test_log::test]
fn pipeline_single_drop_filter() {
    let folder = tempfile::tempdir().expect("should create tempdir");
    write_objects(folder.path(), 3);

    let mut harness = Harness::new(folder.path());

    let spec = FilterSpec::new("always-drop", "/bin/false").expect("should create");
    harness.configure_and_start(vec![spec]).expect("should start");

    let (complete, partial) = harness.collect();

    assert!(complete.is_empty());
    assert!(partial.is_empty());

    let stats = harness.search.get_stats().expect("should snapshot");
    assert_eq!(3, stats.obj_dropped);
    assert_eq!(0, stats.obj_passed);

    let fdata = harness.search.shared().fdata().expect("should exist");
    let prob = fdata.prob();

    let f0 = FilterId::new(0);
    let entry = prob.lookup(f0, &[]).expect("should exist");
    assert_eq!(3, entry.num_exec());
    assert_eq!(0, entry.num_pass());

    // one direct entry + one union entry
    assert_eq!(2, prob.len());
}

/// Scenario: a two-filter chain builds the conditional entry of the second
/// filter behind the first.
#[test_log::test]
fn pipeline_two_filter_conditional() {
    let folder = tempfile::tempdir().expect("should create tempdir");
    write_objects(folder.path(), 100);

    let mut harness = Harness::new(folder.path());

    let specs = vec![
        FilterSpec::new("pass-odd", "/bin/true").expect("should create"),
        FilterSpec::new("pass-even", "/bin/true").expect("should create"),
    ];
    harness.configure_and_start(specs).expect("should start");

    let (complete, _) = harness.collect();

    // odd then even can never both pass a single byte
    assert!(complete.is_empty());

    let stats = harness.search.get_stats().expect("should snapshot");
    assert_eq!(100, stats.obj_dropped);

    let passed_first = 50; // bytes 1, 3, ..., 99

    let fdata = harness.search.shared().fdata().expect("should exist");
    let prob = fdata.prob();

    let (f0, f1) = (FilterId::new(0), FilterId::new(1));

    let head = prob.lookup(f0, &[]).expect("should exist");
    assert_eq!(100, head.num_exec());
    assert_eq!(passed_first, head.num_pass());

    let cond = prob.lookup(f1, &[f0]).expect("should exist");
    assert_eq!(passed_first, cond.num_exec());
    assert!(cond.num_pass() <= cond.num_exec());

    // per-filter stats line up with the conditional table
    let row = stats
        .filters
        .iter()
        .find(|row| row.name == "pass-even")
        .expect("should exist");
    assert_eq!(passed_first, row.objs_processed);
}

/// A group index file restricts and orders the feed.
#[test_log::test]
fn pipeline_follows_group_index() {
    let folder = tempfile::tempdir().expect("should create tempdir");
    let names = write_objects(folder.path(), 8);

    let gid = GID.parse::<GroupId>().expect("should parse");

    // index only the even objects, in reverse order
    let mut expected = names.iter().step_by(2).cloned().collect::<Vec<_>>();
    expected.reverse();

    let subset = expected
        .iter()
        .map(|n| GidIdxEnt::new(n).expect("should create"))
        .collect::<Vec<_>>();

    group::write_index(&gid.idx_path(folder.path()), &subset).expect("should write");

    let mut harness = Harness::new(folder.path());
    harness.configure_and_start(vec![]).expect("should start");

    let (complete, _) = harness.collect();

    let received = complete.iter().map(obj_name).collect::<Vec<_>>();
    assert_eq!(expected, received);
}

/// A zero split ratio bypasses the chain entirely: everything ships as a
/// partial result.
#[test_log::test]
fn pipeline_offload_everything() {
    let folder = tempfile::tempdir().expect("should create tempdir");
    write_objects(folder.path(), 5);

    let mut harness = Harness::new(folder.path());

    let spec = FilterSpec::new("always-drop", "/bin/false").expect("should create");
    harness.search.set_spec(vec![spec]).expect("should queue");
    harness
        .search
        .set_gid(GID.parse::<GroupId>().expect("should parse"))
        .expect("should queue");
    harness.search.set_offload(0).expect("should queue");
    harness.search.start().expect("should queue");

    let (complete, partial) = harness.collect();

    assert!(complete.is_empty());
    assert_eq!(5, partial.len());

    let stats = harness.search.get_stats().expect("should snapshot");
    assert_eq!(0, stats.obj_dropped);

    // the drop filter never saw an object
    let row = stats.filters.first().expect("should exist");
    assert_eq!(0, row.objs_processed);
}

/// Unloadable objects are skipped, counted, and do not break the run.
#[test_log::test]
fn pipeline_skips_bad_objects() {
    let folder = tempfile::tempdir().expect("should create tempdir");
    write_objects(folder.path(), 4);

    // corrupt sidecar: the object fails to load
    std::fs::write(folder.path().join("broken"), b"data").expect("should write");
    std::fs::write(folder.path().join("broken.attr"), b"\xFF").expect("should write");

    let mut harness = Harness::new(folder.path());
    harness.configure_and_start(vec![]).expect("should start");

    let (complete, _) = harness.collect();

    assert_eq!(4, complete.len());

    let stats = harness.search.get_stats().expect("should snapshot");
    assert_eq!(1, stats.obj_skipped);
    assert_eq!(
        stats.obj_processed,
        stats.obj_passed + stats.obj_dropped + stats.obj_skipped
    );
}

/// Starting without a spec or group is refused synchronously.
#[test_log::test]
fn pipeline_start_requires_configuration() {
    let folder = tempfile::tempdir().expect("should create tempdir");

    let mut harness = Harness::new(folder.path());

    assert!(harness.search.start().is_err());

    harness.search.set_spec(vec![]).expect("should queue");
    assert!(harness.search.start().is_err(), "still no group configured");
}
