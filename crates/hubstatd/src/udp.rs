//! UDP transport — one datagram per fragment.
//!
//! UDP has no log, so offsets are a receive counter on partition 0 that
//! continues from the last committed offset of the previous run. The
//! producer side is [`send_message`].

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;

use hubstat_core::wire::{HEADER_LEN, MAX_FRAGMENT_PAYLOAD};
use hubstat_core::{TransportMessage, TransportPosition};
use hubstat_services::{Delivery, Fragmenter, OffsetStore, Transport};

const PARTITION: u32 = 0;

pub struct UdpTransport {
    socket: UdpSocket,
    topic: String,
    next_offset: AtomicU64,
    offsets: OffsetStore,
}

impl UdpTransport {
    pub async fn bind(addr: &str, topic: impl Into<String>, offsets: OffsetStore) -> Result<Self> {
        let topic = topic.into();
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind status socket on {addr}"))?;
        let start = offsets.get(&topic, PARTITION).unwrap_or(0);
        tracing::info!(
            addr = %socket.local_addr()?,
            topic,
            start_offset = start,
            "status transport bound"
        );
        Ok(Self {
            socket,
            topic,
            next_offset: AtomicU64::new(start),
            offsets,
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn recv(&self) -> Result<Option<Delivery>> {
        let mut buf = vec![0u8; HEADER_LEN + MAX_FRAGMENT_PAYLOAD];
        let (len, peer) = self
            .socket
            .recv_from(&mut buf)
            .await
            .context("status socket receive failed")?;
        buf.truncate(len);
        let offset = self.next_offset.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%peer, len, offset, "datagram received");
        Ok(Some(Delivery {
            datagram: Bytes::from(buf),
            position: TransportPosition::new(self.topic.clone(), PARTITION, offset),
        }))
    }

    async fn commit(&self, positions: &[TransportPosition]) -> Result<()> {
        let advanced = self.offsets.advance(positions)?;
        if advanced > 0 {
            tracing::debug!(advanced, "offsets persisted");
        }
        Ok(())
    }
}

/// Fragment `message` and send each fragment as one datagram to `target`.
/// Returns the number of datagrams sent.
pub async fn send_message(
    target: &str,
    message: &TransportMessage,
    fragmenter: &Fragmenter,
) -> Result<usize> {
    let fragments = fragmenter.fragment(message)?;
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind producer socket")?;
    socket
        .connect(target)
        .await
        .with_context(|| format!("failed to resolve {target}"))?;
    for fragment in &fragments {
        socket
            .send(&fragment.to_bytes())
            .await
            .with_context(|| format!("failed to send to {target}"))?;
    }
    tracing::debug!(
        target,
        key = %message.key,
        fragments = fragments.len(),
        "message sent"
    );
    Ok(fragments.len())
}
