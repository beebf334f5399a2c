use clap::Parser;
use client::network::Client;
use log::info;
use shared::nav::Direction;
use std::time::Duration;

/// Connects to a server, completes the handshake, and either idles as an
/// observer or walks the player in a loop when `--walk` is given.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to connect to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server TCP port
        #[clap(long, default_value_t = shared::DEFAULT_TCP_PORT)]
        tcp_port: u16,
        /// Server UDP port
        #[clap(long, default_value_t = shared::DEFAULT_UDP_PORT)]
        udp_port: u16,
        /// Send a movement input every second after connecting
        #[clap(long)]
        walk: bool,
    }

    env_logger::init();
    let args = Args::parse();

    let tcp_addr = format!("{}:{}", args.host, args.tcp_port);
    let udp_addr = format!("{}:{}", args.host, args.udp_port);
    let mut client = Client::connect(&tcp_addr, &udp_addr).await?;
    client.run_until_connected().await?;
    info!(
        "connected, tracking {} objects as player {:?}",
        client.world().len(),
        client.player_id()
    );

    if !args.walk {
        client.run().await?;
        return Ok(());
    }

    let directions = [
        Direction::Right,
        Direction::Down,
        Direction::Left,
        Direction::Up,
    ];
    let mut step = 0usize;
    loop {
        client.send_input(directions[step % directions.len()]).await?;
        step += 1;
        client.process_for(Duration::from_secs(1)).await?;
    }
}
