//! Administrative operations against a running server.
//!
//! `ControlHandle` is what an admin panel, a test or the admin channel holds.
//! Every call goes through the same registry and world locks the connection
//! tasks use, so it can be invoked from any task at any time.

use log::info;
use overworld_shared::{
    ConnectionId, PlayerEntry, ProtocolError, ServerMessage, TileMap, MAX_TEXT_LEN,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;
use crate::network::ServerState;
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct ControlHandle {
    state: Arc<ServerState>,
}

impl ControlHandle {
    pub(crate) fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Connected players in join order.
    pub async fn list_players(&self) -> Vec<PlayerEntry> {
        self.state.registry.entries().await
    }

    /// Disconnects a player as if its connection had failed.
    ///
    /// The session is removed and its socket closed immediately; the
    /// connection task notices and exits without touching the registry again.
    pub async fn kick_player(&self, id: &ConnectionId) -> Result<(), ServerError> {
        if !self.state.registry.remove(id).await {
            return Err(ServerError::UnknownId(*id));
        }
        info!("Kicked {}", id);
        self.state.broadcaster.publish(None).await;
        Ok(())
    }

    /// Sends a text message to every connected client. Returns the number of
    /// clients it was queued for.
    pub async fn broadcast_message(&self, text: &str) -> Result<usize, ServerError> {
        let len = text.chars().count();
        if len > MAX_TEXT_LEN {
            return Err(ProtocolError::TextTooLong(len).into());
        }
        let message = ServerMessage::Message {
            text: text.to_string(),
        };
        Ok(self.state.broadcaster.broadcast(&message).await)
    }

    /// Replaces the tile map and pushes it to every connected client.
    pub async fn replace_world_config(&self, map: TileMap) -> usize {
        self.state.world.replace(map.clone()).await;
        self.state
            .broadcaster
            .broadcast(&ServerMessage::World { grid: map })
            .await
    }

    pub async fn world(&self) -> TileMap {
        self.state.world.current().await
    }

    /// Asks the server to stop; `Server::run` returns once connections drain.
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        self.state.config.idle_timeout
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.state.registry
    }
}
