use clap::Parser;
use client::bot;
use client::connection::Connection;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::{GameSnapshot, Message, Side};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Name to register under
    #[arg(short = 'u', long, default_value = "bot")]
    username: String,

    /// User id to challenge; without it the bot waits to be challenged
    #[arg(short = 'c', long)]
    challenge: Option<u32>,

    /// Pause before each move in milliseconds
    #[arg(long, default_value = "300")]
    move_delay: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let move_delay = Duration::from_millis(args.move_delay);
    let mut rng = StdRng::from_entropy();

    info!("Connecting to {} as {}", args.server, args.username);
    let mut connection = Connection::connect(&args.server).await?;
    connection.register(&args.username).await?;

    let mut my_side: Option<Side> = None;
    let mut position: Option<GameSnapshot> = None;

    while let Some(message) = connection.next_message().await? {
        match message {
            Message::UserRegistration { user_id } => {
                info!("Registered as user {}", user_id);
                connection.request_user_list().await?;
                if let Some(target_id) = args.challenge {
                    info!("Challenging user {}", target_id);
                    connection.request_match(target_id).await?;
                } else {
                    info!("Waiting to be challenged");
                }
            }

            Message::SendUserList { users } => {
                info!("{} other users online", users.len());
                for user in &users {
                    let status = if user.in_game { " (playing)" } else { "" };
                    info!("  {} is user {}{}", user.username, user.user_id, status);
                }
            }

            Message::MatchProposition {
                requester_id,
                requester_name,
            } => {
                info!(
                    "Accepting a challenge from {} (user {})",
                    requester_name, requester_id
                );
                connection.respond(true).await?;
            }

            // Only ever a denial of our own challenge.
            Message::MatchResponse { .. } => {
                info!("The challenge was declined");
                if args.challenge.is_some() {
                    break;
                }
            }

            Message::GameStart {
                opponent_name,
                side,
                snapshot,
            } => {
                info!("Playing {:?} against {}", side, opponent_name);
                my_side = Some(side);
                position = Some(snapshot);
                play_if_my_turn(&mut connection, &position, my_side, move_delay, &mut rng).await?;
            }

            Message::GameUpdate { snapshot } => {
                position = Some(snapshot);
                play_if_my_turn(&mut connection, &position, my_side, move_delay, &mut rng).await?;
            }

            Message::IllegalMove => {
                warn!("Server refused the move, trying another house");
                play_if_my_turn(&mut connection, &position, my_side, move_delay, &mut rng).await?;
            }

            Message::GameEnd { winner, snapshot } => {
                let verdict = if my_side == Some(winner) { "Won" } else { "Lost" };
                info!(
                    "{} {} to {}",
                    verdict,
                    snapshot.points[winner as usize],
                    snapshot.points[winner.opposite() as usize]
                );
                my_side = None;
                position = None;
                if args.challenge.is_some() {
                    break;
                }
                info!("Waiting to be challenged");
            }

            Message::MatchCancellation => {
                info!("The game was called off");
                my_side = None;
                position = None;
                if args.challenge.is_some() {
                    break;
                }
                info!("Waiting to be challenged");
            }

            Message::Chat {
                text, sender_name, ..
            } => {
                info!("{}: {}", sender_name, text);
            }

            other => {
                debug!("Ignoring {:?}", other);
            }
        }
    }

    info!("Disconnected");
    Ok(())
}

/// Plays one random legal house when the position says it is our move.
async fn play_if_my_turn(
    connection: &mut Connection,
    position: &Option<GameSnapshot>,
    my_side: Option<Side>,
    move_delay: Duration,
    rng: &mut StdRng,
) -> Result<(), Box<dyn std::error::Error>> {
    let (Some(snapshot), Some(side)) = (position, my_side) else {
        return Ok(());
    };
    if snapshot.turn != side {
        return Ok(());
    }

    sleep(move_delay).await;
    match bot::choose_house(snapshot, side, rng) {
        Some(house) => {
            debug!("Playing house {}", house);
            connection.play(house).await?;
        }
        None => debug!("No playable house, waiting for the position to change"),
    }
    Ok(())
}
