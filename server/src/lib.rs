//! # Overworld Server Library
//!
//! This library provides the position-sync server for the tile-based
//! multiplayer overworld. It tracks every connected player's last reported
//! position and rebroadcasts the aggregate state to all clients whenever it
//! changes.
//!
//! ## Core Responsibilities
//!
//! ### Session Tracking
//! Each accepted TCP connection becomes a session keyed by its remote
//! address. The session registry is the single table of live sessions and
//! their player states, guarded by one lock.
//!
//! ### State Broadcasting
//! Every accepted update triggers a full snapshot of the registry, encoded
//! once and queued to every connection. Clients replace their view with the
//! latest snapshot instead of merging deltas.
//!
//! ### Administration
//! A [`ControlHandle`] lists, kicks and messages players and swaps the tile
//! map while the server runs. The same operations are optionally exposed on
//! a separate admin TCP listener.
//!
//! ## Architecture Design
//!
//! ### Task Per Connection
//! The accept loop never touches connection I/O; it registers the session
//! and spawns a handler task. Each handler splits its socket into a reader
//! loop and a writer sub-task that drains a bounded outbound queue, so a slow
//! client only ever fills its own queue.
//!
//! ### Framing
//! Both directions use a 4-byte big-endian length prefix followed by a JSON
//! payload (see `overworld_shared::codec`). A message never depends on how
//! the byte stream happened to be chunked.
//!
//! ### Shutdown
//! All session tokens descend from one root token. Cancelling it stops the
//! accept loop and every handler, which then exit through their normal close
//! path.
//!
//! ## Module Organization
//!
//! - `session`: session registry and per-connection handles
//! - `connection`: per-connection reader/writer tasks
//! - `broadcast`: snapshot and message fan-out
//! - `network`: listeners, accept loop and shared server state
//! - `control` / `admin`: in-process and out-of-process administration
//! - `world`: the shared tile map
//! - `config`, `error`: settings and error types
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use overworld_server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(ServerConfig {
//!         bind_addr: "0.0.0.0:12345".to_string(),
//!         ..ServerConfig::default()
//!     })
//!     .await?;
//!
//!     let control = server.control();
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         control.shutdown();
//!     });
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod network;
pub mod session;
pub mod world;

pub use config::{BroadcastPolicy, ServerConfig};
pub use control::ControlHandle;
pub use error::{SendError, ServerError};
pub use network::Server;
pub use session::{SessionHandle, SessionRegistry};
