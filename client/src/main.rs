use clap::Parser;
use log::{debug, info, warn};
use netplay_client::{split_actions, LatencyHistory, NetplayClient};
use netplay_shared::{ConnectionType, GameId, DEFAULT_PORT};
use std::time::{Duration, Instant};

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const BYTES_PER_ACTION: usize = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay server address
    #[arg(short = 's', long, default_value_t = format!("127.0.0.1:{DEFAULT_PORT}"))]
    server: String,

    /// User name to log in with
    #[arg(short = 'n', long, default_value = "player")]
    name: String,

    /// Connection type, 1 (LAN) to 6 (bad)
    #[arg(short = 'c', long, default_value = "1")]
    connection_type: u8,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Host a game for this rom
    #[arg(long, conflicts_with = "join")]
    create: Option<String>,

    /// Join the game with this id
    #[arg(long)]
    join: Option<GameId>,

    /// Players to wait for before starting a hosted game
    #[arg(long, default_value = "2")]
    players: usize,

    /// Input frames to exchange once the game runs
    #[arg(short = 'f', long, default_value = "300")]
    frames: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let connection_type = ConnectionType::from_u8(args.connection_type)
        .ok_or_else(|| format!("unknown connection type {}", args.connection_type))?;
    let mut client = NetplayClient::connect(args.server.parse()?)
        .await?
        .with_fake_ping(Duration::from_millis(args.fake_ping));

    let rtt = client.ping_server(REPLY_TIMEOUT).await?;
    info!("Server answered PING in {:?}", rtt);
    let user_id = client
        .join_server(&args.name, connection_type, REPLY_TIMEOUT)
        .await?;
    info!(
        "Logged in as user {}: {} users, {} games",
        user_id,
        client.state().users.len(),
        client.state().games.len()
    );

    let player_number = if let Some(rom) = &args.create {
        let game_id = client.create_game(rom, REPLY_TIMEOUT).await?;
        info!("Hosting game {}, waiting for {} players", game_id, args.players);
        while client.state().players.len() < args.players {
            client.recv(Duration::from_secs(60)).await?;
        }
        client.start_game().await?;
        Some(client.wait_for_start(REPLY_TIMEOUT).await?)
    } else if let Some(game_id) = args.join {
        let number = client.join_game(game_id, REPLY_TIMEOUT).await?;
        info!("Joined game {} as player {}", game_id, number);
        Some(client.wait_for_start(Duration::from_secs(300)).await?)
    } else {
        None
    };

    if let Some(player_number) = player_number {
        client.ready(player_number).await?;
        client.wait_all_ready(REPLY_TIMEOUT).await?;
        let num_players = usize::from(client.state().num_players);
        let actions = connection_type.actions_per_message();
        info!(
            "Playing as player {} of {} (frame delay {})",
            player_number,
            num_players,
            client.state().frame_delay
        );

        let mut history = LatencyHistory::default();
        for frame in 0..args.frames {
            let input = vec![(frame % 256) as u8; actions * BYTES_PER_ACTION];
            let sent = Instant::now();
            client.send_game_data(input).await?;
            match client.next_game_data(REPLY_TIMEOUT).await {
                Ok(block) => {
                    history.record(sent.elapsed().as_secs_f32() * 1000.0);
                    let columns = split_actions(&block, num_players, BYTES_PER_ACTION);
                    debug!("Frame {}: {:?}", frame, columns);
                }
                Err(e) => {
                    warn!("Frame {} failed: {}", frame, e);
                    break;
                }
            }
        }
        if let (Some(avg), Some(min), Some(max)) =
            (history.average(), history.min(), history.max())
        {
            info!(
                "{} frames, round trip avg {:.1} ms (min {:.1}, max {:.1})",
                history.len(),
                avg,
                min,
                max
            );
        }
        client.quit_game().await?;
    }

    client.quit("client exiting").await?;
    Ok(())
}
