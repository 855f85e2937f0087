use anyhow::anyhow;
use cap::error::CapError;
use cap::socket::CapSocket;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing::{info, Level};

#[derive(Parser)]
#[command(about = "CAP demo: reliable message transfer over UDP")]
struct Args {
    #[command(subcommand)]
    role: Role,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Role {
    /// bind, listen, accept and print every received message until the peer closes
    Server {
        /// local address to bind, e.g. 127.0.0.1:9000
        addr: SocketAddr,
    },
    /// connect, send a message and close
    Client {
        /// server address to connect to
        addr: SocketAddr,

        #[clap(long, default_value = "hello from CAP")]
        message: String,

        /// how often to send the message
        #[clap(long, default_value_t = 1)]
        repeat: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    match args.role {
        Role::Server { addr } => run_server(addr).await,
        Role::Client { addr, message, repeat } => run_client(addr, &message, repeat).await,
    }
}

async fn run_server(addr: SocketAddr) -> anyhow::Result<()> {
    let socket = CapSocket::bind(addr).await?;
    info!("listening on {}", socket.local_addr());

    socket.listen().await;
    let peer = socket.accept().await?;
    info!("accepted connection from {}", peer);

    loop {
        match socket.recv().await {
            Ok(message) => {
                println!("{}", String::from_utf8_lossy(&message));
            }
            Err(CapError::ConnectionClosed) => {
                info!("peer closed the connection");
                socket.close().await?;
                return Ok(());
            }
            Err(e) => return Err(anyhow!("protocol error: {}", e)),
        }
    }
}

async fn run_client(addr: SocketAddr, message: &str, repeat: usize) -> anyhow::Result<()> {
    let socket = CapSocket::bind("0.0.0.0:0".parse()?).await?;

    socket.connect(addr).await?;
    info!("connected to {}", addr);

    for _ in 0..repeat {
        socket.sendto(message.as_bytes()).await?;
    }
    socket.close().await?;
    info!("closed cleanly");

    Ok(())
}
