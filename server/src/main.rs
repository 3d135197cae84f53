use clap::Parser;
use log::info;
use server::Server;
use shared::Timings;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "UDP chat server", long_about = None)]
struct Args {
    /// Port to listen on
    port: u16,

    /// Address to bind to
    #[arg(default_value = "0.0.0.0")]
    bind: IpAddr,

    /// JSON file overriding protocol timings
    #[arg(short = 't', long)]
    timings: Option<PathBuf>,

    /// Fraction of inbound datagrams to drop, for testing recovery
    #[arg(short = 'd', long, default_value = "0")]
    drop_rate: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let timings = match &args.timings {
        Some(path) => Timings::load(path)?,
        None => Timings::default(),
    };

    if args.drop_rate > 0.0 {
        info!("Simulating {:.0}% inbound packet loss", args.drop_rate * 100.0);
    }

    let mut server = Server::bind((args.bind, args.port), timings)
        .await?
        .with_drop_rate(args.drop_rate);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
