use crate::*;

use hubstat_services::{InsertOutcome, Registration};

// ══════════════════════════════════════════════════════════════════════════════
//  Dependency Gating
// ══════════════════════════════════════════════════════════════════════════════

fn compliance_pipeline(recorder: &Arc<Recorder>) -> Pipeline {
    Pipeline::start(4, fast_retry(3), |m| {
        m.register(Registration::new("ClustersPerPolicy", 3, recorder.clone()))
            .unwrap();
        m.register(
            Registration::new("CompleteCompliance", 4, recorder.clone())
                .depends_on("ClustersPerPolicy"),
        )
        .unwrap();
        m.register(
            Registration::new("DeltaCompliance", 5, recorder.clone())
                .depends_on("CompleteCompliance")
                .delta(Some("cluster")),
        )
        .unwrap();
    })
}

/// CompleteCompliance arriving before its ClustersPerPolicy is held until the
/// required ClustersPerPolicy version has been processed.
#[tokio::test]
async fn test_complete_compliance_waits_for_clusters_per_policy() {
    let recorder = Recorder::new();
    let pipeline = compliance_pipeline(&recorder);
    let m = &pipeline.manager;

    let compliance = BundleEnvelope::new(
        "hub1",
        "CompleteCompliance",
        BundleVersion::new(0, 1),
        vec![serde_json::json!({"policy": "p1", "noncompliant": ["c2"]})],
    )
    .with_dependency_version(BundleVersion::new(0, 2));
    assert_eq!(m.insert(compliance, pos(0)), InsertOutcome::Buffered);

    // An older ClustersPerPolicy does not satisfy the requirement.
    m.insert(envelope("hub1", "ClustersPerPolicy", 1), pos(1));
    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(recorder.calls_for("hub1", "CompleteCompliance").is_empty());

    m.insert(envelope("hub1", "ClustersPerPolicy", 2), pos(2));
    assert!(
        wait_for(Duration::from_secs(2), || {
            !recorder.calls_for("hub1", "CompleteCompliance").is_empty()
        })
        .await
    );

    let order: Vec<(String, BundleVersion)> = recorder
        .calls()
        .into_iter()
        .map(|c| (c.bundle_type, c.version))
        .collect();
    assert_eq!(
        order,
        vec![
            ("ClustersPerPolicy".to_string(), BundleVersion::new(0, 1)),
            ("ClustersPerPolicy".to_string(), BundleVersion::new(0, 2)),
            ("CompleteCompliance".to_string(), BundleVersion::new(0, 1)),
        ]
    );
    pipeline.stop().await;
}

/// Without an explicit dependency version the bundle's own version is the
/// requirement.
#[tokio::test]
async fn test_dependency_defaults_to_own_version() {
    let recorder = Recorder::new();
    let pipeline = compliance_pipeline(&recorder);
    let m = &pipeline.manager;

    m.insert(envelope("hub1", "ClustersPerPolicy", 1), pos(0));
    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 1).await);

    assert_eq!(
        m.insert(envelope("hub1", "CompleteCompliance", 2), pos(1)),
        InsertOutcome::Buffered
    );
    m.insert(envelope("hub1", "ClustersPerPolicy", 3), pos(2));
    assert!(
        wait_for(Duration::from_secs(2), || {
            recorder.calls_for("hub1", "CompleteCompliance").len() == 1
        })
        .await
    );
    pipeline.stop().await;
}

/// Dependencies are tracked per source: hub2's progress never releases
/// hub1's bundles.
#[tokio::test]
async fn test_dependencies_are_per_source() {
    let recorder = Recorder::new();
    let pipeline = compliance_pipeline(&recorder);
    let m = &pipeline.manager;

    m.insert(envelope("hub1", "CompleteCompliance", 1), pos(0));
    m.insert(envelope("hub2", "ClustersPerPolicy", 5), pos(1));
    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(recorder.calls_for("hub1", "CompleteCompliance").is_empty());

    m.insert(envelope("hub1", "ClustersPerPolicy", 1), pos(2));
    assert!(
        wait_for(Duration::from_secs(2), || {
            recorder.calls_for("hub1", "CompleteCompliance").len() == 1
        })
        .await
    );
    pipeline.stop().await;
}

/// Delta bundles buffered behind their dependency are merged and applied in
/// one call, with later records replacing earlier ones for the same key.
#[tokio::test]
async fn test_deltas_accumulate_while_blocked() {
    let recorder = Recorder::new();
    let pipeline = compliance_pipeline(&recorder);
    let m = &pipeline.manager;

    let delta = |value: u64, cluster: &str, state: &str| {
        BundleEnvelope::new(
            "hub1",
            "DeltaCompliance",
            BundleVersion::new(0, value),
            vec![serde_json::json!({"cluster": cluster, "state": state})],
        )
        .with_dependency_version(BundleVersion::new(0, 1))
    };
    m.insert(delta(1, "c1", "compliant"), pos(10));
    m.insert(delta(2, "c2", "noncompliant"), pos(11));
    m.insert(delta(3, "c1", "noncompliant"), pos(12));

    m.insert(envelope("hub1", "ClustersPerPolicy", 1), pos(13));
    m.insert(envelope("hub1", "CompleteCompliance", 1), pos(14));

    assert!(
        wait_for(Duration::from_secs(2), || {
            recorder.calls_for("hub1", "DeltaCompliance").len() == 1
        })
        .await
    );
    let call = &recorder.calls_for("hub1", "DeltaCompliance")[0];
    assert_eq!(call.version, BundleVersion::new(0, 3));
    assert_eq!(
        call.records,
        vec![
            serde_json::json!({"cluster": "c2", "state": "noncompliant"}),
            serde_json::json!({"cluster": "c1", "state": "noncompliant"}),
        ]
    );
    pipeline.stop().await;
}
