//! Server network layer: TCP accept loop and task coordination

use bytes::Bytes;
use log::{error, info, warn};
use overworld_shared::{encode_payload, ConnectionId, PlayerState, ServerMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::admin;
use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::control::ControlHandle;
use crate::error::ServerError;
use crate::session::{SessionHandle, SessionRegistry};
use crate::world::World;

/// State shared by the accept loop, every connection task and the control
/// surface.
pub struct ServerState {
    pub config: ServerConfig,
    pub registry: Arc<SessionRegistry>,
    pub broadcaster: Broadcaster,
    pub world: World,
    /// Root of every session token; cancelling it shuts the server down.
    pub shutdown: CancellationToken,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        let broadcaster = Broadcaster::new(Arc::clone(&registry), config.broadcast_policy);
        let world = World::new(config.world.clone());
        Self {
            config,
            registry,
            broadcaster,
            world,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Bound listeners plus the shared state they serve.
pub struct Server {
    listener: TcpListener,
    admin_listener: Option<TcpListener>,
    state: Arc<ServerState>,
}

impl Server {
    /// Binds the game listener and, if configured, the admin listener.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = bind_listener(&config.bind_addr).await?;
        let admin_listener = match &config.admin_addr {
            Some(addr) => Some(bind_listener(addr).await?),
            None => None,
        };

        Ok(Server {
            listener,
            admin_listener,
            state: Arc::new(ServerState::new(config)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Handle for operating the server while `run` is in progress.
    pub fn control(&self) -> ControlHandle {
        ControlHandle::new(Arc::clone(&self.state))
    }

    /// Accepts connections until shutdown is requested, then waits for the
    /// connection tasks to finish.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            listener,
            admin_listener,
            state,
        } = self;
        let addr = listener.local_addr()?;
        let mut tasks = JoinSet::new();

        if let Some(admin_listener) = admin_listener {
            let control = ControlHandle::new(Arc::clone(&state));
            tasks.spawn(admin::run_admin(admin_listener, control));
        }

        info!("Server listening on {}", addr);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => admit(&state, &mut tasks, stream, peer).await,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        sleep(Duration::from_millis(10)).await;
                    }
                },

                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Connection task panicked: {}", e);
                        }
                    }
                },
            }
        }

        info!("Server shutting down ({} tasks live)", tasks.len());
        drop(listener);

        // Every session token is a child of `shutdown`, so each handler is
        // already on its way through Closing.
        let drained = timeout(state.config.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} tasks still running after {:?}, aborting",
                tasks.len(),
                state.config.shutdown_grace
            );
            tasks.shutdown().await;
        }

        info!("Server stopped");
        Ok(())
    }
}

async fn bind_listener(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Registers a freshly accepted connection and spawns its handler.
///
/// Never waits on the connection itself, so a slow peer cannot hold up the
/// accept loop.
async fn admit(
    state: &Arc<ServerState>,
    tasks: &mut JoinSet<()>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let id = ConnectionId::new(peer);
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Could not set TCP_NODELAY for {}: {}", id, e);
    }

    let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(state.config.outbound_queue);
    let handle = SessionHandle::new(outbound_tx, state.shutdown.child_token());

    // The welcome is queued before the session becomes visible to publishers,
    // so it is always the first frame on the wire.
    let welcome = ServerMessage::Welcome {
        id,
        world: state.world.current().await,
    };
    let queued = encode_payload(&welcome)
        .map_err(ServerError::from)
        .and_then(|payload| {
            handle
                .try_send(payload)
                .map_err(|source| ServerError::Send { id, source })
        });
    if let Err(e) = queued {
        warn!("Could not greet {}: {}", id, e);
        return;
    }

    if let Err(e) = state
        .registry
        .add(id, PlayerState::default(), handle.clone())
        .await
    {
        error!("Rejecting connection from {}: {}", peer, e);
        return;
    }

    info!("Client {} connected", id);
    tasks.spawn(handle_connection(
        stream,
        id,
        handle,
        outbound_rx,
        Arc::clone(state),
    ));
}
