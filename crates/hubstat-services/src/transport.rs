//! Transport seam — where fragments come from and where offsets go.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use hubstat_core::config::TransportConfig;
use hubstat_core::wire::{fragment_message, ContentEncoding, Fragment};
use hubstat_core::{TransportMessage, TransportPosition, WireError};

/// One datagram (wire header + fragment payload) and where it sat in the log.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub datagram: Bytes,
    pub position: TransportPosition,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Next delivery, or None once the transport is closed.
    async fn recv(&self) -> anyhow::Result<Option<Delivery>>;

    /// Record that everything before each position has been handled.
    async fn commit(&self, positions: &[TransportPosition]) -> anyhow::Result<()>;
}

/// Producer-side fragmentation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragmenter {
    pub encoding: ContentEncoding,
    pub max_fragment: usize,
}

impl Fragmenter {
    pub fn new(encoding: ContentEncoding, max_fragment: usize) -> Self {
        Self {
            encoding,
            max_fragment,
        }
    }

    /// Encode and split `message`, stamped with the current time.
    pub fn fragment(&self, message: &TransportMessage) -> Result<Vec<Fragment>, WireError> {
        fragment_message(message, self.encoding, self.max_fragment, now_millis())
    }
}

impl From<&TransportConfig> for Fragmenter {
    fn from(config: &TransportConfig) -> Self {
        Self::new(config.encoding, config.max_fragment_bytes)
    }
}

/// In-process transport backed by an mpsc channel.
pub struct ChannelTransport {
    rx: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
    committed: Mutex<Vec<TransportPosition>>,
}

/// Producer half of [`channel`]. Assigns consecutive offsets on one
/// partition.
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<Delivery>,
    topic: String,
    next_offset: std::sync::Arc<Mutex<u64>>,
}

pub fn channel(topic: impl Into<String>, capacity: usize) -> (ChannelSender, ChannelTransport) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ChannelSender {
            tx,
            topic: topic.into(),
            next_offset: Default::default(),
        },
        ChannelTransport {
            rx: tokio::sync::Mutex::new(rx),
            committed: Mutex::new(Vec::new()),
        },
    )
}

impl ChannelSender {
    pub async fn send_datagram(&self, datagram: Bytes) -> anyhow::Result<TransportPosition> {
        let position = {
            let mut next = self.next_offset.lock();
            let p = TransportPosition::new(self.topic.clone(), 0, *next);
            *next += 1;
            p
        };
        self.tx
            .send(Delivery {
                datagram,
                position: position.clone(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("transport closed"))?;
        Ok(position)
    }

    /// Fragment `message` and send every fragment.
    pub async fn send_message(
        &self,
        message: &TransportMessage,
        fragmenter: &Fragmenter,
    ) -> anyhow::Result<Vec<TransportPosition>> {
        let fragments = fragmenter.fragment(message)?;
        let mut positions = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            positions.push(self.send_datagram(Bytes::from(fragment.to_bytes())).await?);
        }
        Ok(positions)
    }
}

impl ChannelTransport {
    /// Positions passed to the most recent `commit`.
    pub fn committed(&self) -> Vec<TransportPosition> {
        self.committed.lock().clone()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn recv(&self) -> anyhow::Result<Option<Delivery>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn commit(&self, positions: &[TransportPosition]) -> anyhow::Result<()> {
        *self.committed.lock() = positions.to_vec();
        Ok(())
    }
}

/// Fragmentation timestamp: milliseconds since the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
