//! Per-connection task.
//!
//! A connection moves through `Connected → Active → Closing → Closed`. The
//! reader loop below is the Active state; everything after it returns is
//! Closing, and the function returning is Closed. The socket is split so a
//! writer sub-task can drain the outbound queue while the reader waits for
//! the next frame.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use overworld_shared::{
    frame_codec, ClientMessage, CodecError, ConnectionId, MessageCodec, PlayerState,
    ProtocolError, ServerMessage,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::network::ServerState;
use crate::session::SessionHandle;

type ClientFrames = FramedRead<OwnedReadHalf, MessageCodec<ClientMessage, ServerMessage>>;

/// Why a connection entered Closing.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed its end of the stream.
    PeerClosed,
    /// The peer sent `leave`.
    Left,
    /// Kicked, dropped by the broadcaster, or server shutdown.
    Cancelled,
    IdleTimeout,
    Codec(CodecError),
    Invalid(ProtocolError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed the connection"),
            CloseReason::Left => write!(f, "client left"),
            CloseReason::Cancelled => write!(f, "closed by server"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Codec(e) => write!(f, "{}", e),
            CloseReason::Invalid(e) => write!(f, "invalid message: {}", e),
        }
    }
}

enum Flow {
    Continue,
    Close(CloseReason),
}

/// Drives one accepted connection until it closes.
///
/// The session must already be registered under `id` with `handle`, with
/// its `welcome` frame queued; this function removes it again on the way out.
pub async fn handle_connection(
    stream: TcpStream,
    id: ConnectionId,
    handle: SessionHandle,
    outbound: mpsc::Receiver<Bytes>,
    state: Arc<ServerState>,
) {
    let config = &state.config;
    let (read_half, write_half) = stream.into_split();
    let frames = FramedRead::new(
        read_half,
        MessageCodec::with_max_frame_length(config.max_frame_length),
    );
    let sink = FramedWrite::new(write_half, frame_codec(config.max_frame_length));
    let token = handle.token().clone();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        token.clone(),
        config.write_timeout,
        id,
    ));

    // Connected: the welcome is already queued; introduce the newcomer to
    // everyone else.
    state.broadcaster.publish(None).await;

    let reason = read_loop(frames, id, &token, &state).await;

    // Closing
    token.cancel();
    if state.registry.remove(&id).await {
        state.broadcaster.publish(None).await;
    }
    if let Err(e) = writer.await {
        warn!("Writer for {} failed: {}", id, e);
    }

    match reason {
        CloseReason::Codec(_) | CloseReason::Invalid(_) => {
            warn!("Connection {} closed: {}", id, reason)
        }
        _ => info!("Connection {} closed: {}", id, reason),
    }
}

async fn read_loop(
    mut frames: ClientFrames,
    id: ConnectionId,
    token: &CancellationToken,
    state: &ServerState,
) -> CloseReason {
    let idle = state.config.idle_timeout;
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return CloseReason::Cancelled,
            next = timeout(idle, frames.next()) => next,
        };

        let message = match next {
            Err(_) => return CloseReason::IdleTimeout,
            Ok(None) => return CloseReason::PeerClosed,
            Ok(Some(Err(e))) => return CloseReason::Codec(e),
            Ok(Some(Ok(message))) => message,
        };

        if let Flow::Close(reason) = handle_message(message, id, state).await {
            return reason;
        }
    }
}

async fn handle_message(message: ClientMessage, id: ConnectionId, state: &ServerState) -> Flow {
    if let Err(e) = message.validate() {
        return Flow::Close(CloseReason::Invalid(e));
    }

    match message {
        ClientMessage::Update { position, name } => {
            debug!("{} moved to ({}, {})", id, position.x, position.y);
            let player = PlayerState::new(position, name);
            if state.registry.update(&id, player).await {
                state.broadcaster.publish(Some(id)).await;
            }
            Flow::Continue
        }
        ClientMessage::RequestWorld => {
            let reply = ServerMessage::World {
                grid: state.world.current().await,
            };
            match state.broadcaster.send_to(id, &reply).await {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::Close(CloseReason::Cancelled),
            }
        }
        ClientMessage::Leave => Flow::Close(CloseReason::Left),
    }
}

async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    mut outbound: mpsc::Receiver<Bytes>,
    token: CancellationToken,
    write_timeout: Duration,
    id: ConnectionId,
) {
    loop {
        let payload = tokio::select! {
            _ = token.cancelled() => break,
            payload = outbound.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        match timeout(write_timeout, sink.send(payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Write to {} failed: {}", id, e);
                token.cancel();
                break;
            }
            Err(_) => {
                warn!("Write to {} timed out", id);
                token.cancel();
                break;
            }
        }
    }

    // Shuts down the write half so the peer sees end-of-stream.
    if timeout(write_timeout, SinkExt::<Bytes>::close(&mut sink))
        .await
        .is_err()
    {
        debug!("Closing write half of {} timed out", id);
    }
}
