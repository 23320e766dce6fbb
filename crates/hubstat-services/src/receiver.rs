//! Receiver — transport deliveries in, conflation inserts out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use hubstat_core::wire::{Fragment, ANY_DESTINATION};

use crate::assembler::MessageAssembler;
use crate::manager::{ConflationManager, InsertOutcome};
use crate::transport::{Delivery, Transport};

pub struct Receiver {
    transport: Arc<dyn Transport>,
    assembler: Arc<MessageAssembler>,
    manager: Arc<ConflationManager>,
    /// `hub_hash` of this aggregator's name. ANY_DESTINATION accepts all.
    hub: [u8; 32],
    shutdown: broadcast::Receiver<()>,
}

impl Receiver {
    pub fn new(
        transport: Arc<dyn Transport>,
        assembler: Arc<MessageAssembler>,
        manager: Arc<ConflationManager>,
        hub: [u8; 32],
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            transport,
            assembler,
            manager,
            hub,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("receiver shutting down");
                    return Ok(());
                }

                delivery = self.transport.recv() => match delivery {
                    Ok(Some(delivery)) => {
                        handle_delivery(&self.assembler, &self.manager, &self.hub, delivery);
                    }
                    Ok(None) => {
                        tracing::info!("transport closed");
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "transport receive failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }
}

/// Push one delivery through the assembler and, once a message is
/// complete, into the conflation manager.
pub fn handle_delivery(
    assembler: &MessageAssembler,
    manager: &ConflationManager,
    hub: &[u8; 32],
    delivery: Delivery,
) -> Option<InsertOutcome> {
    let stats = manager.stats();
    stats.fragments_received();

    let fragment = match Fragment::from_bytes(&delivery.datagram) {
        Ok(f) => f,
        Err(e) => {
            stats.fragments_dropped();
            tracing::debug!(error = %e, position = ?delivery.position, "undecodable datagram");
            return None;
        }
    };
    if *hub != ANY_DESTINATION && !fragment.header.is_for(hub) {
        stats.fragments_dropped();
        return None;
    }

    // Until the insert below, a completed message is in neither the
    // assembler nor the manager.
    let _handoff = assembler.hand_off();
    let assembled = match assembler.add(fragment, delivery.position) {
        Ok(Some(assembled)) => assembled,
        Ok(None) => return None,
        Err(e) if e.is_benign() => {
            stats.fragments_dropped();
            tracing::debug!(error = %e, "fragment ignored");
            return None;
        }
        Err(e) => {
            stats.assemblies_failed();
            tracing::warn!(error = %e, "message assembly failed");
            return None;
        }
    };
    stats.messages_assembled();

    let message = assembled.message;
    let envelope = match message.to_envelope() {
        Ok(envelope) => envelope,
        Err(e) => {
            stats.envelopes_malformed();
            tracing::warn!(key = %message.key, error = %e, "malformed envelope dropped");
            return None;
        }
    };
    if message.source() != Some(envelope.source.as_str()) {
        stats.envelopes_malformed();
        tracing::warn!(
            key = %message.key,
            source = %envelope.source,
            "envelope source does not match stream key"
        );
        return None;
    }

    Some(manager.insert_spanning(
        envelope,
        assembled.position,
        assembled.last_offset,
    ))
}

/// Evict abandoned partial assemblies on a fixed interval.
pub async fn sweep_loop(
    assembler: Arc<MessageAssembler>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {
                assembler.evict_expired();
            }
        }
    }
}
