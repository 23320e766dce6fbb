use crate::*;

use hubstat_services::{commit_positions, InsertOutcome, Registration};

// ══════════════════════════════════════════════════════════════════════════════
//  Retries & Failures
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_retry_succeeds_after_transient_failures() {
    let recorder = Recorder::new();
    recorder.fail_next("Policies", 2);
    let pipeline = Pipeline::start(2, fast_retry(3), |m| {
        m.register(Registration::new("Policies", 2, recorder.clone()))
            .unwrap();
    });

    pipeline.manager.insert(envelope("hub1", "Policies", 1), pos(0));
    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 1).await);

    let call = &recorder.calls()[0];
    assert_eq!(call.attempt, 3);
    assert_eq!(call.version, BundleVersion::new(0, 1));
    assert_eq!(recorder.failed(), 2);

    let manager = pipeline.manager.clone();
    pipeline.stop().await;
    let snap = manager.stats().snapshot();
    assert_eq!(snap.handler_failures, 2);
    assert_eq!(snap.bundles_processed, 1);
    assert_eq!(snap.bundles_dropped, 0);
}

/// Out of attempts: the bundle is dropped, the offset moves past it, and the
/// slot keeps accepting newer bundles.
#[tokio::test]
async fn test_exhausted_retries_drop_the_bundle() {
    let recorder = Recorder::new();
    recorder.fail_next("Policies", 2);
    let pipeline = Pipeline::start(1, fast_retry(2), |m| {
        m.register(Registration::new("Policies", 2, recorder.clone()))
            .unwrap();
    });
    let m = pipeline.manager.clone();

    m.insert(envelope("hub1", "Policies", 1), pos(7));
    assert!(wait_for(Duration::from_secs(2), || m.stats().snapshot().bundles_dropped == 1).await);
    assert!(recorder.calls().is_empty());
    assert_eq!(recorder.failed(), 2);

    assert_eq!(
        commit_positions(&m.metadatas(), &[]),
        vec![TransportPosition::new("status", 0, 8)]
    );

    // Version 1 was never processed, so it is not stale; version 2 is newer
    // anyway and goes through on its first attempt.
    m.insert(envelope("hub1", "Policies", 2), pos(8));
    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 1).await);
    assert_eq!(recorder.calls()[0].attempt, 1);
    assert_eq!(recorder.calls()[0].version, BundleVersion::new(0, 2));

    pipeline.stop().await;
}

/// A failed complete snapshot is discarded when a newer one is already
/// buffered; the newer one runs without a retry delay.
#[tokio::test]
async fn test_failed_snapshot_is_superseded() {
    let recorder = Recorder::with_delay(Duration::from_millis(80));
    recorder.fail_next("ManagedClusters", 1);
    let pipeline = Pipeline::start(1, fast_retry(5), |m| {
        m.register(Registration::new("ManagedClusters", 1, recorder.clone()))
            .unwrap();
    });
    let m = &pipeline.manager;

    m.insert(envelope("hub1", "ManagedClusters", 1), pos(0));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        m.insert(envelope("hub1", "ManagedClusters", 2), pos(1)),
        InsertOutcome::Buffered
    );

    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 1).await);
    let call = &recorder.calls()[0];
    assert_eq!(call.version, BundleVersion::new(0, 2));
    assert_eq!(call.attempt, 1);
    assert_eq!(recorder.failed(), 1);

    pipeline.stop().await;
}

/// A failed delta is merged back under the delta that arrived while it was
/// in flight, and the retry carries both change sets.
#[tokio::test]
async fn test_failed_delta_is_merged_into_retry() {
    let recorder = Recorder::with_delay(Duration::from_millis(80));
    recorder.fail_next("DeltaPolicies", 1);
    let pipeline = Pipeline::start(1, fast_retry(5), |m| {
        m.register(Registration::new("DeltaPolicies", 5, recorder.clone()).delta(Some("cluster")))
            .unwrap();
    });
    let m = &pipeline.manager;
    let delta = |value: u64, cluster: &str| {
        BundleEnvelope::new(
            "hub1",
            "DeltaPolicies",
            BundleVersion::new(0, value),
            vec![serde_json::json!({"cluster": cluster, "value": value})],
        )
    };

    m.insert(delta(1, "a"), pos(20));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(m.insert(delta(2, "b"), pos(21)), InsertOutcome::Buffered);

    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 1).await);
    let call = &recorder.calls()[0];
    assert_eq!(call.attempt, 2);
    assert_eq!(call.version, BundleVersion::new(0, 2));
    assert_eq!(
        call.records,
        vec![
            serde_json::json!({"cluster": "a", "value": 1}),
            serde_json::json!({"cluster": "b", "value": 2}),
        ]
    );

    pipeline.stop().await;
}

struct PanicOnce {
    panicked: AtomicBool,
    inner: Arc<Recorder>,
}

#[async_trait]
impl BundleHandler for PanicOnce {
    async fn handle(&self, bundle: &BundleEnvelope, metadata: &BundleMetadata) -> Result<()> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("handler blew up");
        }
        self.inner.handle(bundle, metadata).await
    }
}

/// A panicking handler is a failed attempt, not a dead worker.
#[tokio::test]
async fn test_handler_panic_counts_as_failure() {
    let recorder = Recorder::new();
    let handler = Arc::new(PanicOnce {
        panicked: AtomicBool::new(false),
        inner: recorder.clone(),
    });
    let pipeline = Pipeline::start(1, fast_retry(3), |m| {
        m.register(Registration::new("Placements", 7, handler))
            .unwrap();
    });

    pipeline.manager.insert(envelope("hub1", "Placements", 1), pos(0));
    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 1).await);
    assert_eq!(recorder.calls()[0].attempt, 2);

    // The single worker survived and keeps serving.
    pipeline.manager.insert(envelope("hub1", "Placements", 2), pos(1));
    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 2).await);

    let manager = pipeline.manager.clone();
    pipeline.stop().await;
    assert_eq!(manager.stats().snapshot().handler_failures, 1);
}
