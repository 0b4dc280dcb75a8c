//! Out-of-process control channel.
//!
//! A second TCP listener speaking the same length-prefixed JSON framing as
//! the game channel, carrying [`ControlRequest`]s and answering each with one
//! [`ControlReply`]. Requests are plain data: a malformed frame gets an
//! `error` reply and the admin connection is closed.

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use overworld_shared::{ControlReply, ControlRequest, MessageCodec};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;

use crate::control::ControlHandle;

type AdminFrames = Framed<TcpStream, MessageCodec<ControlRequest, ControlReply>>;

/// Accepts admin connections until the server shuts down.
pub async fn run_admin(listener: TcpListener, control: ControlHandle) {
    if let Ok(addr) = listener.local_addr() {
        info!("Admin channel listening on {}", addr);
    }
    let shutdown = control.shutdown_token();
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("Admin connected from {}", peer);
                    sessions.spawn(serve_admin(stream, peer, control.clone()));
                }
                Err(e) => {
                    error!("Failed to accept admin connection: {}", e);
                    sleep(Duration::from_millis(10)).await;
                }
            },

            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    sessions.shutdown().await;
}

async fn serve_admin(stream: TcpStream, peer: SocketAddr, control: ControlHandle) {
    let idle = control.idle_timeout();
    let shutdown = control.shutdown_token();
    let mut frames: AdminFrames = Framed::new(stream, MessageCodec::new());

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = timeout(idle, frames.next()) => next,
        };

        let request = match next {
            Err(_) | Ok(None) => break,
            Ok(Some(Ok(request))) => request,
            Ok(Some(Err(e))) => {
                warn!("Malformed admin request from {}: {}", peer, e);
                let reply = ControlReply::Error {
                    reason: e.to_string(),
                };
                if let Err(e) = frames.send(reply).await {
                    debug!("Could not report error to admin {}: {}", peer, e);
                }
                break;
            }
        };

        let reply = execute(&control, request).await;
        if let Err(e) = frames.send(reply).await {
            warn!("Failed to reply to admin {}: {}", peer, e);
            break;
        }
    }

    info!("Admin {} disconnected", peer);
}

/// Runs one request against the control surface.
pub async fn execute(control: &ControlHandle, request: ControlRequest) -> ControlReply {
    if let Err(e) = request.validate() {
        return ControlReply::Error {
            reason: e.to_string(),
        };
    }

    match request {
        ControlRequest::ListPlayers => ControlReply::Players {
            players: control.list_players().await,
        },
        ControlRequest::Kick { id } => match control.kick_player(&id).await {
            Ok(()) => ControlReply::Ok,
            Err(e) => ControlReply::Error {
                reason: e.to_string(),
            },
        },
        ControlRequest::BroadcastMessage { text } => match control.broadcast_message(&text).await {
            Ok(_) => ControlReply::Ok,
            Err(e) => ControlReply::Error {
                reason: e.to_string(),
            },
        },
        ControlRequest::ReplaceMap { grid } => {
            control.replace_world_config(grid).await;
            ControlReply::Ok
        }
    }
}
