use crate::*;

use hubstat_services::{InsertOutcome, Registration};

// ══════════════════════════════════════════════════════════════════════════════
//  Coalescing & Scheduling
// ══════════════════════════════════════════════════════════════════════════════

/// Two inserts before any worker claims → exactly one handler call, with the
/// later bundle.
#[tokio::test]
async fn test_coalescing_processes_only_latest() {
    let recorder = Recorder::new();
    let mut manager = ConflationManager::new(PipelineStats::new());
    manager
        .register(Registration::new("ManagedClusters", 1, recorder.clone()))
        .unwrap();
    let manager = Arc::new(manager);

    assert_eq!(
        manager.insert(envelope("hub1", "ManagedClusters", 1), pos(0)),
        InsertOutcome::Ready
    );
    assert_eq!(
        manager.insert(envelope("hub1", "ManagedClusters", 2), pos(1)),
        InsertOutcome::Ready
    );

    let pipeline = Pipeline::with_manager(manager.clone(), 2, fast_retry(3));
    assert!(wait_for(Duration::from_secs(2), || !recorder.calls().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let calls = recorder.calls();
    assert_eq!(calls.len(), 1, "coalesced bundles must be handled once");
    assert_eq!(calls[0].version, BundleVersion::new(0, 2));
    assert_eq!(calls[0].records, vec![serde_json::json!({"value": 2})]);
    assert_eq!(manager.stats().snapshot().envelopes_conflated, 1);

    pipeline.stop().await;
}

/// Lower priority values are served first when several tickets wait.
#[tokio::test]
async fn test_priority_order_with_single_worker() {
    let recorder = Recorder::new();
    let mut manager = ConflationManager::new(PipelineStats::new());
    manager
        .register(Registration::new("LocalPolicies", 10, recorder.clone()))
        .unwrap();
    manager
        .register(Registration::new("ManagedClusters", 1, recorder.clone()))
        .unwrap();
    manager
        .register(Registration::new("Policies", 2, recorder.clone()))
        .unwrap();
    let manager = Arc::new(manager);

    manager.insert(envelope("hub1", "LocalPolicies", 1), pos(0));
    manager.insert(envelope("hub1", "Policies", 1), pos(1));
    manager.insert(envelope("hub1", "ManagedClusters", 1), pos(2));

    let pipeline = Pipeline::with_manager(manager, 1, fast_retry(3));
    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 3).await);

    let order: Vec<String> = recorder.calls().into_iter().map(|c| c.bundle_type).collect();
    assert_eq!(order, vec!["ManagedClusters", "Policies", "LocalPolicies"]);

    pipeline.stop().await;
}

/// Concurrent inserts from many tasks into a multi-worker pool never run two
/// handler calls for the same (source, bundle type) at once, and the last
/// version always ends up processed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_in_flight_under_concurrency() {
    const SOURCES: [&str; 4] = ["hub1", "hub2", "hub3", "hub4"];
    const TYPES: [&str; 3] = ["ManagedClusters", "Policies", "Placements"];
    const VERSIONS: u64 = 40;

    let recorder = Recorder::with_delay(Duration::from_millis(2));
    let pipeline = Pipeline::start(8, fast_retry(3), |m| {
        for (i, t) in TYPES.iter().enumerate() {
            m.register(Registration::new(*t, i as u32, recorder.clone()))
                .unwrap();
        }
    });

    let mut producers = Vec::new();
    for (s, &source) in SOURCES.iter().enumerate() {
        for (t, &bundle_type) in TYPES.iter().enumerate() {
            let manager = pipeline.manager.clone();
            producers.push(tokio::spawn(async move {
                for v in 1..=VERSIONS {
                    let offset = ((s * TYPES.len() + t) as u64) * 1000 + v;
                    manager.insert(envelope(source, bundle_type, v), pos(offset));
                    if v % 5 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
    }
    for p in producers {
        p.await.unwrap();
    }

    let all_done = wait_for(Duration::from_secs(10), || {
        SOURCES.iter().all(|s| {
            TYPES.iter().all(|t| {
                recorder
                    .calls_for(s, t)
                    .last()
                    .is_some_and(|c| c.version == BundleVersion::new(0, VERSIONS))
            })
        })
    })
    .await;
    assert!(all_done, "every slot should end on its newest version");
    assert!(!recorder.saw_overlap(), "two workers processed the same slot at once");

    // Within a slot, processing follows version order.
    for s in SOURCES {
        for t in TYPES {
            let versions: Vec<BundleVersion> =
                recorder.calls_for(s, t).into_iter().map(|c| c.version).collect();
            assert!(versions.windows(2).all(|w| w[0] < w[1]), "{s}/{t}: {versions:?}");
        }
    }

    let manager = pipeline.manager.clone();
    pipeline.stop().await;
    let snap = manager.stats().snapshot();
    assert_eq!(
        snap.envelopes_inserted + snap.envelopes_stale,
        (SOURCES.len() * TYPES.len()) as u64 * VERSIONS
    );
    assert_eq!(snap.bundles_processed as usize, recorder.calls().len());
}

/// Re-delivered or out-of-order versions are dropped as stale.
#[tokio::test]
async fn test_stale_versions_never_reach_the_handler() {
    let recorder = Recorder::new();
    let pipeline = Pipeline::start(1, fast_retry(3), |m| {
        m.register(Registration::new("Policies", 1, recorder.clone()))
            .unwrap();
    });

    pipeline.manager.insert(envelope("hub1", "Policies", 5), pos(0));
    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 1).await);

    assert_eq!(
        pipeline.manager.insert(envelope("hub1", "Policies", 5), pos(1)),
        InsertOutcome::Stale
    );
    assert_eq!(
        pipeline.manager.insert(envelope("hub1", "Policies", 3), pos(2)),
        InsertOutcome::Stale
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(recorder.calls().len(), 1);
    assert_eq!(pipeline.manager.stats().snapshot().envelopes_stale, 2);

    pipeline.stop().await;
}
