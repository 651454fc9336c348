use clap::Parser;
use log::{error, info};
use server::network::Server;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Maximum number of simultaneous connections
    #[clap(long, default_value = "64")]
    max_clients: usize,
    /// Maximum number of observers per game
    #[clap(long, default_value_t = shared::MAX_OBSERVERS)]
    max_observers: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    let mut server = Server::new(&address, args.max_clients, args.max_observers).await?;

    // Serve until interrupted
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped with an error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
