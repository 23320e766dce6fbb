use crate::*;

use bytes::Bytes;
use hubstat_core::wire::{fragment_message, hub_hash, ContentEncoding, ANY_DESTINATION};
use hubstat_core::TransportMessage;
use hubstat_services::transport::now_millis;
use hubstat_services::{
    channel, ChannelSender, ChannelTransport, Committer, FileSink, Fragmenter, MessageAssembler,
    Receiver, Registration, Transport,
};

// ── Wire harness ──────────────────────────────────────────────────────────────

/// A [`Pipeline`] fed by a receiver over an in-process channel transport.
struct Wired {
    pipeline: Pipeline,
    sender: ChannelSender,
    transport: Arc<ChannelTransport>,
    assembler: Arc<MessageAssembler>,
    receiver: JoinHandle<Result<()>>,
}

impl Wired {
    fn start(hub: [u8; 32], workers: usize, register: impl FnOnce(&mut ConflationManager)) -> Self {
        let pipeline = Pipeline::start(workers, fast_retry(3), register);
        let (sender, transport) = channel("status", 1024);
        let transport = Arc::new(transport);
        let assembler = Arc::new(MessageAssembler::new(
            Duration::from_secs(60),
            256,
            pipeline.manager.stats().clone(),
        ));
        let receiver = tokio::spawn(
            Receiver::new(
                transport.clone(),
                assembler.clone(),
                pipeline.manager.clone(),
                hub,
                pipeline.shutdown.subscribe(),
            )
            .run(),
        );
        Self {
            pipeline,
            sender,
            transport,
            assembler,
            receiver,
        }
    }

    fn committer(&self, stop: broadcast::Receiver<()>) -> Committer {
        Committer::new(
            self.pipeline.manager.clone(),
            self.assembler.clone(),
            self.transport.clone() as Arc<dyn Transport>,
            Duration::from_secs(3600),
            stop,
        )
    }

    async fn send(&self, envelope: &BundleEnvelope, destination: &str) -> Vec<TransportPosition> {
        let message = TransportMessage::from_envelope(envelope, destination).unwrap();
        self.sender
            .send_message(&message, &Fragmenter::new(ContentEncoding::Zstd, 128))
            .await
            .unwrap()
    }

    async fn stop(self) {
        self.pipeline.stop().await;
        self.receiver.await.unwrap().unwrap();
    }
}

fn big_bundle(source: &str, bundle_type: &str, value: u64, records: usize) -> BundleEnvelope {
    let data = (0..records)
        .map(|i| {
            serde_json::json!({
                "policy": format!("policy-{i}"),
                "cluster": format!("cluster-{}", (i * 7919) % 1009),
                "state": if i % 3 == 0 { "noncompliant" } else { "compliant" },
            })
        })
        .collect();
    BundleEnvelope::new(source, bundle_type, BundleVersion::new(1, value), data)
}

// ══════════════════════════════════════════════════════════════════════════════
//  End to End
// ══════════════════════════════════════════════════════════════════════════════

/// A large compressed bundle split across many datagrams arrives intact.
#[tokio::test]
async fn test_fragmented_bundle_reaches_the_handler() {
    let recorder = Recorder::new();
    let wired = Wired::start(ANY_DESTINATION, 2, |m| {
        m.register(Registration::new("ClustersPerPolicy", 3, recorder.clone()))
            .unwrap();
    });

    let bundle = big_bundle("hub1", "ClustersPerPolicy", 4, 200);
    let positions = wired.send(&bundle, "").await;
    assert!(positions.len() > 1, "bundle should need several fragments");

    assert!(wait_for(Duration::from_secs(3), || recorder.calls().len() == 1).await);
    let call = &recorder.calls()[0];
    assert_eq!(call.source, "hub1");
    assert_eq!(call.version, BundleVersion::new(1, 4));
    assert_eq!(call.records, bundle.data);
    assert_eq!(wired.assembler.in_progress(), 0);

    let manager = wired.pipeline.manager.clone();
    wired.stop().await;
    let snap = manager.stats().snapshot();
    assert_eq!(snap.fragments_received, positions.len() as u64);
    assert_eq!(snap.messages_assembled, 1);
}

/// A receiver bound to a hub name ignores traffic addressed elsewhere but
/// keeps broadcast traffic.
#[tokio::test]
async fn test_receiver_filters_by_destination() {
    let recorder = Recorder::new();
    let wired = Wired::start(hub_hash("global-hub-a"), 1, |m| {
        m.register(Registration::new("Policies", 2, recorder.clone()))
            .unwrap();
    });

    wired.send(&envelope("hub1", "Policies", 1), "global-hub-b").await;
    wired.send(&envelope("hub2", "Policies", 1), "global-hub-a").await;
    wired.send(&envelope("hub3", "Policies", 1), "").await;

    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let mut sources: Vec<String> = recorder.calls().into_iter().map(|c| c.source).collect();
    sources.sort();
    assert_eq!(sources, vec!["hub2", "hub3"]);

    let manager = wired.pipeline.manager.clone();
    wired.stop().await;
    assert!(manager.stats().snapshot().fragments_dropped > 0);
}

/// Processed output lands on disk through the file sink.
#[tokio::test]
async fn test_file_sink_stores_latest_bundle() {
    let root = std::env::temp_dir().join(format!("hubstat-it-sink-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&root);
    let sink = Arc::new(FileSink::new(&root));
    let path = sink.path_for("hub1", "ManagedClusters");

    let wired = Wired::start(ANY_DESTINATION, 1, |m| {
        m.register(Registration::new("ManagedClusters", 1, sink.clone()))
            .unwrap();
    });
    wired.send(&big_bundle("hub1", "ManagedClusters", 2, 50), "").await;

    assert!(wait_for(Duration::from_secs(3), || path.exists()).await);
    let manager = wired.pipeline.manager.clone();
    wired.stop().await;
    assert_eq!(manager.stats().snapshot().bundles_processed, 1);

    let stored: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(stored["version"], "1.2");
    assert_eq!(stored["bundle"]["source"], "hub1");
    assert_eq!(stored["bundle"]["data"].as_array().map(Vec::len), Some(50));
    let _ = std::fs::remove_dir_all(&root);
}

// ══════════════════════════════════════════════════════════════════════════════
//  Offset Commit
// ══════════════════════════════════════════════════════════════════════════════

/// A half-received message pins the committed offset at its first fragment
/// even when later messages are fully processed.
#[tokio::test]
async fn test_partial_message_holds_commit_back() {
    let recorder = Recorder::new();
    let wired = Wired::start(ANY_DESTINATION, 2, |m| {
        m.register(Registration::new("Policies", 2, recorder.clone()))
            .unwrap();
    });
    let (_stop_tx, stop_rx) = broadcast::channel(1);
    let mut committer = wired.committer(stop_rx);

    let first = wired.send(&envelope("hub1", "Policies", 1), "").await;
    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 1).await);
    committer.commit_once().await;
    let after_first = first.last().unwrap().offset + 1;
    assert_eq!(
        wired.transport.committed(),
        vec![TransportPosition::new("status", 0, after_first)]
    );

    // Hold back all but the first fragment of hub2's bundle.
    let partial = TransportMessage::from_envelope(&big_bundle("hub2", "Policies", 1, 40), "").unwrap();
    let fragments = fragment_message(&partial, ContentEncoding::Identity, 64, now_millis()).unwrap();
    assert!(fragments.len() > 1);
    let mut fragments = fragments.into_iter();
    let head = wired
        .sender
        .send_datagram(Bytes::from(fragments.next().unwrap().to_bytes()))
        .await
        .unwrap();

    let third = wired.send(&envelope("hub3", "Policies", 1), "").await;
    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 2).await);
    assert_eq!(wired.assembler.in_progress(), 1);
    committer.commit_once().await;
    assert_eq!(wired.transport.committed(), vec![head.clone()]);
    assert!(third[0].offset > head.offset);

    let mut last = head.offset;
    for fragment in fragments {
        last = wired
            .sender
            .send_datagram(Bytes::from(fragment.to_bytes()))
            .await
            .unwrap()
            .offset;
    }
    assert!(wait_for(Duration::from_secs(2), || recorder.calls().len() == 3).await);
    committer.commit_once().await;
    assert_eq!(
        wired.transport.committed(),
        vec![TransportPosition::new("status", 0, last + 1)]
    );

    wired.stop().await;
}

/// Shutdown lets the in-flight handler finish, then the committer's final
/// pass records it.
#[tokio::test]
async fn test_shutdown_drains_and_commits() {
    let recorder = Recorder::with_delay(Duration::from_millis(150));
    let wired = Wired::start(ANY_DESTINATION, 1, |m| {
        m.register(Registration::new("Policies", 2, recorder.clone()))
            .unwrap();
    });
    let (stop_tx, stop_rx) = broadcast::channel(1);
    let committer = tokio::spawn(wired.committer(stop_rx).run());

    let sent = wired.send(&envelope("hub1", "Policies", 1), "").await;
    let manager = wired.pipeline.manager.clone();
    assert!(
        wait_for(Duration::from_secs(2), || {
            manager.queue().is_empty() && manager.metadatas().iter().any(|m| !m.processed)
        })
        .await
    );
    assert!(recorder.calls().is_empty());

    let transport = wired.transport.clone();
    wired.stop().await;
    assert_eq!(recorder.calls().len(), 1, "in-flight bundle finished before exit");

    stop_tx.send(()).unwrap();
    committer.await.unwrap().unwrap();
    assert_eq!(
        transport.committed(),
        vec![TransportPosition::new("status", 0, sent.last().unwrap().offset + 1)]
    );
}
