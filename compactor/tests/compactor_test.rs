// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! End to end tests of the compaction, retention and deletion flows against
//! a local filesystem object store.

use std::{collections::HashMap, fs, sync::Arc, time::Duration};

use bytes::Bytes;
use common_util::{
    config::ReadableDuration,
    time::{Clock, ClockRef, ManualClock, SystemClock, TimeRange, Timestamp},
};
use compactor::{
    config::Config,
    deletion::DeleteRequestStatus,
    index::{default_index_compactors, is_compacted_file, plain::{encode_index_lines, IndexLine}},
    labels::{Labels, Matcher},
    limits::{StaticLimits, StreamRetention, TenantLimits},
    retention::ChunkEntry,
    ring::{
        kv::{MemoryKvStore, RingKvStoreRef},
        lifecycler::Lifecycler,
        InstanceState, Ring, RING_KEY, RING_NUM_TOKENS,
    },
    schema::{PeriodConfig, SchemaConfig, TABLE_PERIOD_MS},
    storage::{IndexStorageClient, LocalFileSystem, ObjectStoreRef},
    Compactor,
};
use object_store::{path::Path as ObjectPath, ObjectStore};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const HOUR_MS: i64 = 60 * 60 * 1_000;
const DAY_MS: i64 = TABLE_PERIOD_MS;

struct TestEnv {
    compactor: Arc<Compactor>,
    clock: Arc<ManualClock>,
    object_store: ObjectStoreRef,
    storage: IndexStorageClient,
    work_dir: TempDir,
    _store_dir: TempDir,
}

async fn build_env(retention_enabled: bool, limits: StaticLimits, now: Timestamp) -> TestEnv {
    let store_dir = TempDir::new().unwrap();
    let work_dir = TempDir::new().unwrap();
    let object_store: ObjectStoreRef =
        Arc::new(LocalFileSystem::new_with_prefix(store_dir.path()).unwrap());
    let clock = Arc::new(ManualClock::new(now));

    let cfg = Config {
        working_directory: work_dir.path().to_path_buf(),
        retention_enabled,
        delete_request_store: if retention_enabled {
            "filesystem".to_string()
        } else {
            String::new()
        },
        ..Default::default()
    };

    let mut object_stores = HashMap::new();
    object_stores.insert(Timestamp::ZERO, object_store.clone());
    let delete_store_client = retention_enabled.then(|| object_store.clone());

    let compactor = Compactor::new(
        cfg,
        object_stores,
        delete_store_client,
        SchemaConfig::single(PeriodConfig::default()),
        Arc::new(limits),
        Arc::new(MemoryKvStore::default()) as RingKvStoreRef,
        default_index_compactors(),
        clock.clone() as ClockRef,
    )
    .await
    .unwrap();

    let storage = IndexStorageClient::new(object_store.clone(), "index/").unwrap();
    TestEnv {
        compactor,
        clock,
        object_store,
        storage,
        work_dir,
        _store_dir: store_dir,
    }
}

fn index_line(tenant: &str, app: &str, key: &str, from: Timestamp, through: Timestamp) -> IndexLine {
    IndexLine {
        tenant: tenant.to_string(),
        labels: Labels::from_pairs(&[("app", app)]),
        chunk: ChunkEntry {
            key: key.to_string(),
            from,
            through,
        },
    }
}

async fn put_fragment(env: &TestEnv, table: &str, name: &str, lines: &[IndexLine]) {
    env.storage
        .put_file(table, name, Bytes::from(encode_index_lines(lines)))
        .await
        .unwrap();
    // The chunk objects the fragment references.
    for line in lines {
        env.object_store
            .put(&ObjectPath::from(line.chunk.key.as_str()), Bytes::from_static(b"chunk"))
            .await
            .unwrap();
    }
}

async fn table_file_names(env: &TestEnv, table: &str) -> Vec<String> {
    let mut names: Vec<String> = env
        .storage
        .list_table_files(table)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    names.sort();
    names
}

async fn compacted_chunk_keys(env: &TestEnv, table: &str) -> Vec<String> {
    let mut keys = Vec::new();
    for name in table_file_names(env, table).await {
        let data = env.storage.get_file(table, &name).await.unwrap();
        for raw in data.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            let line: IndexLine = serde_json::from_slice(raw).unwrap();
            keys.push(line.chunk.key);
        }
    }
    keys.sort();
    keys
}

async fn chunk_exists(env: &TestEnv, key: &str) -> bool {
    env.object_store.head(&ObjectPath::from(key)).await.is_ok()
}

fn marker_files(env: &TestEnv) -> Vec<std::path::PathBuf> {
    let dir = env
        .work_dir
        .path()
        .join("retention")
        .join("filesystem_0")
        .join("markers");
    match fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

async fn run_compaction(env: &TestEnv, apply_retention: bool) {
    env.compactor
        .tables_manager()
        .run_compaction(&CancellationToken::new(), apply_retention)
        .await
        .unwrap();
}

fn limits_with_tenant_retention(tenant: &str, period: ReadableDuration) -> StaticLimits {
    let mut limits = StaticLimits::default();
    limits.tenants.insert(
        tenant.to_string(),
        TenantLimits {
            retention_period: Some(period),
            stream_retention: Vec::new(),
        },
    );
    limits
}

// S1: three fragments fold into exactly one compacted object, the originals
// are removed and the scratch space is cleaned up.
#[tokio::test]
async fn test_compaction_folds_fragments() {
    let day = 19_723;
    let table = format!("index_{day}");
    let now = Timestamp::new((day + 1) * DAY_MS);
    let env = build_env(false, StaticLimits::default(), now).await;

    let t0 = Timestamp::new(day * DAY_MS);
    for (i, name) in ["ingester-0", "ingester-1", "ingester-2"].iter().enumerate() {
        let lines = vec![index_line(
            "tenant-a",
            "web",
            &format!("tenant-a/c{i}"),
            t0,
            Timestamp::new(t0.as_i64() + HOUR_MS),
        )];
        put_fragment(&env, &table, name, &lines).await;
    }

    run_compaction(&env, false).await;

    let files = table_file_names(&env, &table).await;
    assert_eq!(1, files.len(), "files:{files:?}");
    assert!(is_compacted_file(&files[0]));
    assert!(files[0].starts_with("tenant-a/"));
    assert_eq!(
        vec!["tenant-a/c0", "tenant-a/c1", "tenant-a/c2"],
        compacted_chunk_keys(&env, &table).await
    );

    // Scratch space of the run is gone.
    let scratch = env.work_dir.path().join("compactor");
    assert!(!scratch.exists() || fs::read_dir(&scratch).unwrap().next().is_none());

    // Idempotence: another pass leaves the identical object set.
    run_compaction(&env, false).await;
    assert_eq!(files, table_file_names(&env, &table).await);
}

// S2 + S3: expired chunks are marked and dropped from the index but only
// physically deleted once the delete delay elapsed.
#[tokio::test]
async fn test_retention_marks_then_sweeps_after_delay() {
    let day = 19_723;
    let table = format!("index_{day}");
    let t0 = Timestamp::new(day * DAY_MS);
    // 30 days after the chunks were written.
    let now = Timestamp::new(t0.as_i64() + 30 * DAY_MS);

    let mut limits = limits_with_tenant_retention("tenant-a", ReadableDuration::days(7));
    // One stream is pinned far beyond the tenant default.
    limits.tenants.get_mut("tenant-a").unwrap().stream_retention = vec![StreamRetention {
        priority: 1,
        period: ReadableDuration::days(90),
        matchers: vec![Matcher::eq("app", "keep")],
    }];
    let env = build_env(true, limits, now).await;

    let lines = vec![
        index_line("tenant-a", "web", "tenant-a/expired-1", t0, Timestamp::new(t0.as_i64() + HOUR_MS)),
        index_line("tenant-a", "web", "tenant-a/expired-2", t0, Timestamp::new(t0.as_i64() + 2 * HOUR_MS)),
        index_line("tenant-a", "keep", "tenant-a/kept", t0, Timestamp::new(t0.as_i64() + HOUR_MS)),
    ];
    put_fragment(&env, &table, "ingester-0", &lines).await;

    run_compaction(&env, true).await;

    // Marker file holds exactly the two expired chunk keys.
    let markers = marker_files(&env);
    assert_eq!(1, markers.len());
    let mut marked: Vec<String> = fs::read_to_string(&markers[0])
        .unwrap()
        .lines()
        .map(|l| l.to_string())
        .collect();
    marked.sort();
    assert_eq!(
        vec!["tenant-a/expired-1".to_string(), "tenant-a/expired-2".to_string()],
        marked
    );

    // The compacted index only references the surviving chunk.
    assert_eq!(
        vec!["tenant-a/kept".to_string()],
        compacted_chunk_keys(&env, &table).await
    );

    // S2: inside the delete delay nothing is physically deleted.
    env.compactor.sweepers()[0].sweep_once().await.unwrap();
    assert!(chunk_exists(&env, "tenant-a/expired-1").await);
    assert!(chunk_exists(&env, "tenant-a/expired-2").await);

    // S3: three hours later the sweeper removes chunks and marker file.
    env.clock.advance(Duration::from_secs(3 * 60 * 60));
    env.compactor.sweepers()[0].sweep_once().await.unwrap();
    assert!(!chunk_exists(&env, "tenant-a/expired-1").await);
    assert!(!chunk_exists(&env, "tenant-a/expired-2").await);
    assert!(chunk_exists(&env, "tenant-a/kept").await);
    assert!(marker_files(&env).is_empty());
}

// S4: a 48h request is stored as two 24h shards sharing one request id.
#[tokio::test]
async fn test_wide_delete_request_is_sharded() {
    let now = Timestamp::new(20_000 * DAY_MS);
    let env = build_env(true, StaticLimits::default(), now).await;
    let store = env.compactor.delete_requests_store().unwrap();

    let t0 = Timestamp::new(19_000 * DAY_MS);
    let range = TimeRange::new_unchecked(t0, Timestamp::new(t0.as_i64() + 48 * HOUR_MS));
    let shards = store
        .add_delete_request(
            "tenant-a",
            vec![Matcher::eq("app", "x")],
            Vec::new(),
            range,
            Duration::from_millis(24 * HOUR_MS as u64),
            env.clock.now(),
        )
        .unwrap();

    assert_eq!(2, shards.len());
    let reloaded = store
        .get_request_group("tenant-a", &shards[0].request_id)
        .unwrap();
    assert_eq!(2, reloaded.len());
    assert_eq!(
        TimeRange::new_unchecked(t0, Timestamp::new(t0.as_i64() + 24 * HOUR_MS)),
        reloaded[0].range
    );
    assert_eq!(
        TimeRange::new_unchecked(
            Timestamp::new(t0.as_i64() + 24 * HOUR_MS),
            Timestamp::new(t0.as_i64() + 48 * HOUR_MS)
        ),
        reloaded[1].range
    );
    for shard in &reloaded {
        assert_eq!(DeleteRequestStatus::Received, shard.status);
        assert_eq!(env.clock.now(), shard.created_at);
    }
}

// S5 + S6: a delete request is held for the cancel period, then flows
// through building_plan/processing into processed while its chunks are
// marked and dropped from the index.
#[tokio::test]
async fn test_delete_request_lifecycle() {
    let day = 19_723;
    let table = format!("index_{day}");
    let t0 = Timestamp::new(day * DAY_MS);
    let submit_at = Timestamp::new(t0.as_i64() + 2 * DAY_MS);

    // Retention itself must not fire here.
    let env = build_env(
        true,
        limits_with_tenant_retention("tenant-a", ReadableDuration::days(365)),
        submit_at,
    )
    .await;

    let lines = vec![
        index_line("tenant-a", "x", "tenant-a/doomed", t0, Timestamp::new(t0.as_i64() + HOUR_MS)),
        index_line("tenant-a", "y", "tenant-a/spared", t0, Timestamp::new(t0.as_i64() + HOUR_MS)),
    ];
    put_fragment(&env, &table, "ingester-0", &lines).await;

    let store = env.compactor.delete_requests_store().unwrap();
    let shards = store
        .add_delete_request(
            "tenant-a",
            vec![Matcher::eq("app", "x")],
            Vec::new(),
            TimeRange::new_unchecked(t0, Timestamp::new(t0.as_i64() + DAY_MS)),
            Duration::from_millis(24 * HOUR_MS as u64),
            env.clock.now(),
        )
        .unwrap();
    let request_id = shards[0].request_id.clone();

    // S5: one second before the cancel period elapses nothing moves.
    env.clock
        .advance(Duration::from_secs(24 * 60 * 60 - 1));
    run_compaction(&env, true).await;
    assert_eq!(
        DeleteRequestStatus::Received,
        store.get_request_status("tenant-a", &request_id).unwrap()
    );
    assert!(marker_files(&env).is_empty());

    // S6: past the hold window the request is applied.
    env.clock.advance(Duration::from_secs(2));
    run_compaction(&env, true).await;
    assert_eq!(
        DeleteRequestStatus::Processed,
        store.get_request_status("tenant-a", &request_id).unwrap()
    );

    let markers = marker_files(&env);
    assert_eq!(1, markers.len());
    assert_eq!(
        "tenant-a/doomed\n",
        fs::read_to_string(&markers[0]).unwrap()
    );
    assert_eq!(
        vec!["tenant-a/spared".to_string()],
        compacted_chunk_keys(&env, &table).await
    );

    // The doomed chunk object goes away after the delete delay.
    env.clock.advance(Duration::from_secs(3 * 60 * 60));
    env.compactor.sweepers()[0].sweep_once().await.unwrap();
    assert!(!chunk_exists(&env, "tenant-a/doomed").await);
    assert!(chunk_exists(&env, "tenant-a/spared").await);
}

// Cancelled requests never produce markers.
#[tokio::test]
async fn test_cancelled_delete_request_is_ignored() {
    let day = 19_723;
    let table = format!("index_{day}");
    let t0 = Timestamp::new(day * DAY_MS);
    let env = build_env(
        true,
        limits_with_tenant_retention("tenant-a", ReadableDuration::days(365)),
        Timestamp::new(t0.as_i64() + 2 * DAY_MS),
    )
    .await;

    put_fragment(
        &env,
        &table,
        "ingester-0",
        &[index_line("tenant-a", "x", "tenant-a/c1", t0, Timestamp::new(t0.as_i64() + HOUR_MS))],
    )
    .await;

    let store = env.compactor.delete_requests_store().unwrap();
    let shards = store
        .add_delete_request(
            "tenant-a",
            vec![Matcher::eq("app", "x")],
            Vec::new(),
            TimeRange::new_unchecked(t0, Timestamp::new(t0.as_i64() + DAY_MS)),
            Duration::from_millis(24 * HOUR_MS as u64),
            env.clock.now(),
        )
        .unwrap();
    store.cancel_request("tenant-a", &shards[0].request_id).unwrap();

    env.clock.advance(Duration::from_secs(25 * 60 * 60));
    run_compaction(&env, true).await;

    assert_eq!(
        DeleteRequestStatus::Cancelled,
        store
            .get_request_status("tenant-a", &shards[0].request_id)
            .unwrap()
    );
    assert!(marker_files(&env).is_empty());
    assert_eq!(
        vec!["tenant-a/c1".to_string()],
        compacted_chunk_keys(&env, &table).await
    );
}

// S7: when the leader dies, the survivor is auto-forgotten into leadership
// within ten heartbeat timeouts and further cycles stay idempotent.
#[tokio::test]
async fn test_leader_failover() {
    let kv: RingKvStoreRef = Arc::new(MemoryKvStore::default());
    let clock: ClockRef = Arc::new(SystemClock);
    let heartbeat_period = Duration::from_millis(20);
    let heartbeat_timeout = Duration::from_millis(100);

    let new_lifecycler = |id: &str| {
        Arc::new(Lifecycler::new(
            kv.clone(),
            RING_KEY,
            id,
            &format!("addr-{id}"),
            heartbeat_period,
            heartbeat_timeout,
            RING_NUM_TOKENS,
            None,
            clock.clone(),
        ))
    };

    let a = new_lifecycler("a");
    let b = new_lifecycler("b");
    for instance in [&a, &b] {
        instance.register().await.unwrap();
        instance.change_state(InstanceState::Active).await.unwrap();
    }

    let ring = Ring::new(kv.clone(), heartbeat_timeout, clock.clone());
    let leader = ring.leader_addr().await.unwrap().unwrap();
    let (dead, survivor) = if leader == "addr-a" { (&a, &b) } else { (&b, &a) };

    // Only the survivor keeps heartbeating; `dead` was killed mid-run.
    let shutdown = CancellationToken::new();
    survivor.spawn_heartbeat_loop(shutdown.clone());
    let _ = dead;

    // Within 10 heartbeat timeouts the survivor owns the leader key.
    let deadline = tokio::time::Instant::now() + 10 * heartbeat_timeout + Duration::from_secs(2);
    loop {
        if let Some(addr) = ring.leader_addr().await.unwrap() {
            if addr == survivor.instance_addr() {
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "survivor never became leader"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The survivor's cycles complete without duplicate artifacts.
    let day = 19_723;
    let table = format!("index_{day}");
    let env = build_env(false, StaticLimits::default(), Timestamp::new((day + 1) * DAY_MS)).await;
    put_fragment(
        &env,
        &table,
        "ingester-0",
        &[index_line(
            "tenant-a",
            "web",
            "tenant-a/c1",
            Timestamp::new(day * DAY_MS),
            Timestamp::new(day * DAY_MS + HOUR_MS),
        )],
    )
    .await;

    run_compaction(&env, false).await;
    let after_first = table_file_names(&env, &table).await;
    assert_eq!(1, after_first.len());
    run_compaction(&env, false).await;
    run_compaction(&env, false).await;
    assert_eq!(after_first, table_file_names(&env, &table).await);

    shutdown.cancel();
}
