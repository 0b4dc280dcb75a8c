use overworld_shared::{TileMap, DEFAULT_PORT, MAX_FRAME_LENGTH};
use std::time::Duration;

/// Whether a snapshot triggered by an update is also sent to the client
/// that sent the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BroadcastPolicy {
    /// Everyone, originator included, receives every snapshot.
    #[default]
    IncludeOriginator,
    /// The originator is skipped for snapshots caused by its own update.
    ExcludeOriginator,
}

/// Runtime settings for [`crate::network::Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Game listener address.
    pub bind_addr: String,
    /// Admin listener address; no admin channel when `None`.
    pub admin_addr: Option<String>,
    pub max_sessions: usize,
    pub max_frame_length: usize,
    /// Frames buffered per connection before it is treated as stalled.
    pub outbound_queue: usize,
    /// A connection that sends nothing for this long is closed.
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    /// How long `run` waits for handlers to finish after shutdown.
    pub shutdown_grace: Duration,
    pub broadcast_policy: BroadcastPolicy,
    pub world: TileMap,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            admin_addr: None,
            max_sessions: 128,
            max_frame_length: MAX_FRAME_LENGTH,
            outbound_queue: 1024,
            idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            broadcast_policy: BroadcastPolicy::default(),
            world: TileMap::default(),
        }
    }
}
