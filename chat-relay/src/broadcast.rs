//! Fan-out of one envelope to the current registry members.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    config::{DeliveryPolicy, WireFormat},
    envelope::Envelope,
    error::SendFailure,
    registry::{ConnectionId, ConnectionRegistry},
};

/// Outcome of one broadcast, per recipient.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<ConnectionId>,
    pub failed: Vec<(ConnectionId, SendFailure)>,
}

impl DeliveryReport {
    pub fn recipients(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastEngine {
    registry: Arc<ConnectionRegistry>,
    policy: DeliveryPolicy,
    wire_format: WireFormat,
}

impl BroadcastEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        policy: DeliveryPolicy,
        wire_format: WireFormat,
    ) -> Self {
        Self {
            registry,
            policy,
            wire_format,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Broadcasts with the configured [`DeliveryPolicy`].
    pub async fn broadcast_from(
        &self,
        originator: ConnectionId,
        envelope: &Envelope,
    ) -> DeliveryReport {
        self.broadcast(originator, envelope, self.policy.includes_originator())
            .await
    }

    /// Queues the encoded envelope on every open member of a registry snapshot.
    ///
    /// A failing recipient is unregistered; the others still get the frame.
    pub async fn broadcast(
        &self,
        originator: ConnectionId,
        envelope: &Envelope,
        include_originator: bool,
    ) -> DeliveryReport {
        let frame: Arc<str> = Arc::from(envelope.encode(self.wire_format));
        let mut report = DeliveryReport::default();

        for member in self.registry.snapshot().await {
            if !member.is_open() || (member.id() == originator && !include_originator) {
                continue;
            }
            match member.try_send(Arc::clone(&frame)) {
                Ok(()) => report.delivered.push(member.id()),
                Err(failure) => {
                    warn!(
                        conn_id = member.id(),
                        peer = ?member.peer(),
                        error = %failure,
                        "dropping recipient"
                    );
                    report.failed.push((member.id(), failure));
                }
            }
        }

        for (id, _) in &report.failed {
            self.registry.unregister(*id).await;
        }

        debug!(
            originator,
            sender = %envelope.sender,
            recipients = report.recipients(),
            failed = report.failed.len(),
            "broadcast envelope"
        );
        report
    }
}
