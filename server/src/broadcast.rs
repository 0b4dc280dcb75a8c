//! Fan-out of server messages to connected clients.
//!
//! Every publish sends the *entire* player table, not a delta. Clients never
//! reconcile partial updates; they replace their view with the latest
//! snapshot. Bandwidth grows with players², which caps this design at small
//! sessions.

use bytes::Bytes;
use log::{debug, error, warn};
use overworld_shared::{encode_payload, ConnectionId, ServerMessage};
use std::sync::Arc;

use crate::config::BroadcastPolicy;
use crate::error::{SendError, ServerError};
use crate::session::{SessionHandle, SessionRegistry};

pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
    policy: BroadcastPolicy,
}

impl Broadcaster {
    pub fn new(registry: Arc<SessionRegistry>, policy: BroadcastPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> BroadcastPolicy {
        self.policy
    }

    /// Sends the current snapshot to every live connection.
    ///
    /// `origin` is the connection whose update triggered the publish, if any;
    /// it is skipped under [`BroadcastPolicy::ExcludeOriginator`]. Returns the
    /// number of connections the snapshot was queued for.
    pub async fn publish(&self, origin: Option<ConnectionId>) -> usize {
        let view = self.registry.broadcast_view().await;
        let message = ServerMessage::Snapshot {
            players: view.players,
        };
        let exclude = match self.policy {
            BroadcastPolicy::IncludeOriginator => None,
            BroadcastPolicy::ExcludeOriginator => origin,
        };
        self.fan_out(&message, view.recipients, exclude).await
    }

    /// Sends an arbitrary message to every live connection.
    pub async fn broadcast(&self, message: &ServerMessage) -> usize {
        let view = self.registry.broadcast_view().await;
        self.fan_out(message, view.recipients, None).await
    }

    /// Sends a message to one connection.
    pub async fn send_to(&self, id: ConnectionId, message: &ServerMessage) -> Result<(), ServerError> {
        let handle = self
            .registry
            .handle(&id)
            .await
            .ok_or(ServerError::UnknownId(id))?;
        let payload = encode_payload(message)?;
        if let Err(source) = handle.try_send(payload) {
            self.drop_recipient(id, source).await;
            return Err(ServerError::Send { id, source });
        }
        Ok(())
    }

    async fn fan_out(
        &self,
        message: &ServerMessage,
        recipients: Vec<(ConnectionId, SessionHandle)>,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let payload: Bytes = match encode_payload(message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode broadcast: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, handle) in recipients {
            if Some(id) == exclude {
                continue;
            }
            match handle.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((id, e)),
            }
        }

        for (id, e) in failed {
            self.drop_recipient(id, e).await;
        }

        debug!("Broadcast {} bytes to {} connections", payload.len(), delivered);
        delivered
    }

    async fn drop_recipient(&self, id: ConnectionId, reason: SendError) {
        warn!("Failed to send to {}: {}; dropping connection", id, reason);
        self.registry.remove(&id).await;
    }
}
