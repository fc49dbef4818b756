use clap::Parser;
use std::io::Write;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, BufReader};

mod session;

use session::Session;

#[derive(Parser, Debug)]
#[command(name = "netfs-client", about = "Interactive client for the network file system")]
struct Cli {
    /// Naming server to connect to
    #[arg(long, env = "NETFS_NAMING_ADDR", default_value = "127.0.0.1:8090")]
    naming: SocketAddr,

    /// Log at DEBUG instead of INFO
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let mut session = Session::connect(cli.naming).await?;
    println!("Connected to naming server at {}", cli.naming);
    println!("Commands: READ, WRITE [--SYNC] <path> <data>, INFO, STREAM, LIST [filter],");
    println!("          CREATE_DIR, CREATE_FILE, DELETE, COPY <src> <dst>, EXIT");

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = input.next_line().await? else {
            break;
        };
        match session.execute(&line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                break;
            }
        }
    }

    println!("Exiting.");
    Ok(())
}
