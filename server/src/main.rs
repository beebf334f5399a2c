use clap::Parser;
use server::network::Server;

/// Parses command-line arguments, binds both sockets and runs the event
/// loop until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// TCP port for handshake and state synchronization
        #[clap(long, default_value_t = shared::DEFAULT_TCP_PORT)]
        tcp_port: u16,
        /// UDP port for gameplay traffic
        #[clap(long, default_value_t = shared::DEFAULT_UDP_PORT)]
        udp_port: u16,
        /// Edge length of the cube-net region figure
        #[clap(long, default_value_t = shared::DEFAULT_FIGURE_SIZE)]
        figure_size: i32,
    }

    env_logger::init();
    let args = Args::parse();

    let tcp_addr = format!("{}:{}", args.host, args.tcp_port);
    let udp_addr = format!("{}:{}", args.host, args.udp_port);
    let mut server = Server::bind(&tcp_addr, &udp_addr, args.figure_size).await?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
            Ok(())
        }
    }
}
