//! Session registry for the position-sync server
//!
//! This module owns the only piece of shared per-connection state:
//! - Which connections are live and in what order they joined
//! - Each connection's last reported player state
//! - The handle used to push frames to (and close) each connection
//!
//! State and handle are stored in the same entry, so a connection is either
//! fully registered or not registered at all. Every operation takes the
//! table-wide lock for the duration of a map operation and never awaits
//! anything else while holding it.

use bytes::Bytes;
use log::{debug, info};
use overworld_shared::{ConnectionId, PlayerEntry, PlayerState};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::SendError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateId(ConnectionId),
    #[error("registry is at capacity ({0} sessions)")]
    Full(usize),
}

/// The server's grip on one live connection.
///
/// Frames pushed here are written to the socket by the connection's writer
/// task. Closing the handle cancels the session token, which makes both the
/// reader and the writer of that connection wind down.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    outbound: mpsc::Sender<Bytes>,
    token: CancellationToken,
}

impl SessionHandle {
    pub fn new(outbound: mpsc::Sender<Bytes>, token: CancellationToken) -> Self {
        Self { outbound, token }
    }

    /// Queues a frame without waiting; a full queue is an error, not a wait.
    pub fn try_send(&self, payload: Bytes) -> Result<(), SendError> {
        if self.token.is_cancelled() {
            return Err(SendError::Disconnected);
        }
        self.outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[derive(Debug)]
struct Session {
    state: PlayerState,
    handle: SessionHandle,
    joined: u64,
}

#[derive(Debug, Default)]
struct SessionTable {
    sessions: HashMap<ConnectionId, Session>,
    next_join: u64,
}

impl SessionTable {
    fn in_join_order(&self) -> Vec<(&ConnectionId, &Session)> {
        let mut sessions: Vec<_> = self.sessions.iter().collect();
        sessions.sort_by_key(|(_, session)| session.joined);
        sessions
    }
}

/// Player states and recipient handles captured under one lock acquisition.
#[derive(Debug)]
pub struct BroadcastView {
    pub players: BTreeMap<ConnectionId, PlayerState>,
    pub recipients: Vec<(ConnectionId, SessionHandle)>,
}

/// Thread-safe table of live sessions.
pub struct SessionRegistry {
    table: RwLock<SessionTable>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            table: RwLock::new(SessionTable::default()),
            max_sessions,
        }
    }

    /// Registers a new connection with its initial state.
    pub async fn add(
        &self,
        id: ConnectionId,
        state: PlayerState,
        handle: SessionHandle,
    ) -> Result<(), RegistryError> {
        let mut table = self.table.write().await;
        if table.sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        if table.sessions.len() >= self.max_sessions {
            return Err(RegistryError::Full(self.max_sessions));
        }

        let joined = table.next_join;
        table.next_join += 1;
        table.sessions.insert(
            id,
            Session {
                state,
                handle,
                joined,
            },
        );
        info!("Session {} registered ({} live)", id, table.sessions.len());
        Ok(())
    }

    /// Replaces a session's state wholesale.
    ///
    /// Returns false when the session is already gone, which happens when a
    /// kick or disconnect races with an in-flight update.
    pub async fn update(&self, id: &ConnectionId, state: PlayerState) -> bool {
        let mut table = self.table.write().await;
        match table.sessions.get_mut(id) {
            Some(session) => {
                session.state = state;
                true
            }
            None => {
                debug!("Dropping update for departed session {}", id);
                false
            }
        }
    }

    /// Removes a session and closes its handle.
    ///
    /// Idempotent: returns true only for the call that actually removed it.
    pub async fn remove(&self, id: &ConnectionId) -> bool {
        let removed = {
            let mut table = self.table.write().await;
            table.sessions.remove(id).map(|s| (s, table.sessions.len()))
        };

        match removed {
            Some((session, live)) => {
                session.handle.close();
                info!("Session {} removed ({} live)", id, live);
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of every player's state.
    pub async fn snapshot(&self) -> BTreeMap<ConnectionId, PlayerState> {
        let table = self.table.read().await;
        table
            .sessions
            .iter()
            .map(|(id, session)| (*id, session.state.clone()))
            .collect()
    }

    /// Snapshot plus the handles to deliver it to, consistent with each other.
    pub async fn broadcast_view(&self) -> BroadcastView {
        let table = self.table.read().await;
        let mut players = BTreeMap::new();
        let mut recipients = Vec::with_capacity(table.sessions.len());
        for (id, session) in &table.sessions {
            players.insert(*id, session.state.clone());
            recipients.push((*id, session.handle.clone()));
        }
        BroadcastView {
            players,
            recipients,
        }
    }

    /// Connection ids in join order.
    pub async fn list(&self) -> Vec<ConnectionId> {
        let table = self.table.read().await;
        table.in_join_order().into_iter().map(|(id, _)| *id).collect()
    }

    /// Ids with their states, in join order.
    pub async fn entries(&self) -> Vec<PlayerEntry> {
        let table = self.table.read().await;
        table
            .in_join_order()
            .into_iter()
            .map(|(id, session)| PlayerEntry {
                id: *id,
                state: session.state.clone(),
            })
            .collect()
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<PlayerState> {
        let table = self.table.read().await;
        table.sessions.get(id).map(|s| s.state.clone())
    }

    pub async fn handle(&self, id: &ConnectionId) -> Option<SessionHandle> {
        let table = self.table.read().await;
        table.sessions.get(id).map(|s| s.handle.clone())
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.table.read().await.sessions.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.sessions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_sessions
    }
}
