use clap::Parser;
use client::terminal::{spawn_stdin_reader, TerminalSink};
use client::{Client, ClientError};
use log::info;
use shared::Timings;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "UDP chat client", long_about = None)]
struct Args {
    /// Username to log in with
    name: String,

    /// Server host name or address
    host: String,

    /// Server port
    port: u16,

    /// JSON file overriding protocol timings
    #[arg(short = 't', long)]
    timings: Option<PathBuf>,

    /// Fraction of inbound datagrams to drop, for testing recovery
    #[arg(short = 'd', long, default_value = "0")]
    drop_rate: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();

    let timings = match &args.timings {
        Some(path) => Timings::load(path)?,
        None => Timings::default(),
    };

    let server = tokio::net::lookup_host((args.host.as_str(), args.port))
        .await?
        .next()
        .ok_or_else(|| ClientError::Resolve(args.host.clone()))?;

    if args.drop_rate > 0.0 {
        info!("Simulating {:.0}% inbound packet loss", args.drop_rate * 100.0);
    }

    let (client, handle) =
        Client::connect(&args.name, server, timings, Box::new(TerminalSink)).await?;
    let client = client.with_drop_rate(args.drop_rate);

    println!("Connected as {}. Type a message, /typing or /quit.", args.name);
    spawn_stdin_reader(handle.clone());

    let mut session = tokio::spawn(client.run());

    tokio::select! {
        result = &mut session => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, disconnecting");
            handle.exit();
            session.await??;
        }
    }

    Ok(())
}
