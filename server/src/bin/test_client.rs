//! Headless client that random-walks across the map and prints the
//! snapshots it receives. Handy for poking a running server.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use overworld_shared::{
    ClientMessage, ConnectionId, MessageCodec, Position, ServerMessage, TileMap,
};
use rand::Rng;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{interval, timeout};
use tokio_util::codec::Framed;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:12345")]
    server: String,

    /// Display name to send with each update
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Number of moves before leaving
    #[arg(short = 'c', long, default_value = "10")]
    moves: u32,

    /// Delay between moves in milliseconds
    #[arg(short = 'd', long, default_value = "1000")]
    delay_ms: u64,
}

type ClientFrames = Framed<TcpStream, MessageCodec<ServerMessage, ClientMessage>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    println!("Connecting to {}", args.server);
    let stream = TcpStream::connect(&args.server).await?;
    let mut frames: ClientFrames = Framed::new(stream, MessageCodec::new());

    let (my_id, mut world) = match frames.next().await {
        Some(Ok(ServerMessage::Welcome { id, world })) => (id, world),
        Some(Ok(other)) => return Err(format!("expected welcome, got {:?}", other).into()),
        Some(Err(e)) => return Err(e.into()),
        None => return Err("server closed the connection".into()),
    };
    println!(
        "Joined as {} on a {}x{} map",
        my_id,
        world.width(),
        world.height()
    );

    let mut position = Position { x: 1, y: 1 };
    let mut ticker = interval(Duration::from_millis(args.delay_ms));
    let mut rng = rand::thread_rng();

    for _ in 0..args.moves {
        ticker.tick().await;
        position = step(position, &world, &mut rng);

        let update = ClientMessage::Update {
            position,
            name: args.name.clone(),
        };
        println!("Moving to ({}, {})", position.x, position.y);
        frames.send(update).await?;

        // Print whatever arrived since the last move.
        while let Ok(Some(message)) = timeout(Duration::from_millis(50), frames.next()).await {
            show(message?, my_id, &mut world);
        }
    }

    frames.send(ClientMessage::Leave).await?;
    println!("Test client finished");
    Ok(())
}

/// Prints a server message and adopts any replacement map.
fn show(message: ServerMessage, my_id: ConnectionId, world: &mut TileMap) {
    match message {
        ServerMessage::Snapshot { players } => {
            println!("Snapshot with {} players:", players.len());
            for (id, state) in players {
                let marker = if id == my_id { "*" } else { " " };
                println!(
                    " {} {} at ({}, {}) {}",
                    marker,
                    id,
                    state.x,
                    state.y,
                    state.name.as_deref().unwrap_or("")
                );
            }
        }
        ServerMessage::Message { text } => println!("Server says: {}", text),
        ServerMessage::World { grid } => {
            println!("Map replaced: {}x{}", grid.width(), grid.height());
            *world = grid;
        }
        ServerMessage::Welcome { .. } => {}
    }
}

/// One random step in a cardinal direction, kept inside the map.
fn step(from: Position, world: &TileMap, rng: &mut impl Rng) -> Position {
    let (dx, dy) = match rng.gen_range(0..4) {
        0 => (1, 0),
        1 => (-1, 0),
        2 => (0, 1),
        _ => (0, -1),
    };
    Position {
        x: (from.x + dx).clamp(0, world.width() as i32 - 1),
        y: (from.y + dy).clamp(0, world.height() as i32 - 1),
    }
}
