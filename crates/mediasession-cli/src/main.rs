//! mediasession CLI: negotiate one WebRTC session with a media server.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use mediasession_common::{Direction, SessionConfig};
use mediasession_core::negotiation::build_negotiation;
use mediasession_core::{Session, SessionError, SessionInfo};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "mediasession")]
#[command(about = "Offer/answer media session client")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Negotiate a session and keep it up until Ctrl-C
    Run(Overrides),

    /// Print the effective configuration as JSON
    Config(Overrides),

    /// Show version information
    Version,
}

/// Settings layered over the config file, flags winning.
#[derive(ClapArgs, Debug, Default)]
struct Overrides {
    /// JSON config file
    #[arg(short, long, env = "MEDIASESSION_CONFIG")]
    config: Option<PathBuf>,

    /// Server protocol (http or https)
    #[arg(long, env = "MEDIASESSION_SERVER_PROTOCOL")]
    protocol: Option<String>,

    /// Server address
    #[arg(long, env = "MEDIASESSION_SERVER_ADDRESS")]
    address: Option<String>,

    /// Server port
    #[arg(long, env = "MEDIASESSION_SERVER_PORT")]
    port: Option<u16>,

    /// Demo path on the server
    #[arg(long, env = "MEDIASESSION_DEMO_PATH")]
    path: Option<String>,

    /// STUN/TURN server url, repeatable
    #[arg(long = "stun", env = "MEDIASESSION_STUN_SERVERS", value_delimiter = ',')]
    stun_servers: Vec<String>,

    /// Audio direction (sendrecv, sendonly, recvonly, inactive)
    #[arg(long, value_parser = parse_direction)]
    audio: Option<Direction>,

    /// Video direction (sendrecv, sendonly, recvonly, inactive)
    #[arg(long, value_parser = parse_direction)]
    video: Option<Direction>,
}

fn parse_direction(value: &str) -> std::result::Result<Direction, String> {
    Direction::from_sdp_attribute(&value.to_ascii_lowercase())
        .ok_or_else(|| format!("unknown direction '{value}'"))
}

impl Overrides {
    fn resolve(self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_json_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => SessionConfig::default(),
        };

        if let Some(protocol) = self.protocol {
            config.server.protocol = protocol;
        }
        if let Some(address) = self.address {
            config.server.address = address;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(path) = self.path {
            config.server.path = path;
        }
        if !self.stun_servers.is_empty() {
            config.stun_servers = self.stun_servers;
        }
        if let Some(audio) = self.audio {
            config.constraints.audio = audio;
        }
        if let Some(video) = self.video {
            config.constraints.video = video;
        }

        config.validate()?;
        Ok(config)
    }
}

enum Outcome {
    Established(SessionInfo),
    Failed(SessionError),
}

async fn run(config: SessionConfig) -> Result<()> {
    info!(url = %config.server.url(), "starting media session");

    let negotiation = build_negotiation(&config, Handle::current())
        .await
        .context("creating peer connection")?;

    let (tx, mut outcome) = mpsc::unbounded_channel();
    let failed = tx.clone();
    let session = Session::builder(config)
        .negotiation(negotiation)
        .on_established(move |info| {
            let _ = tx.send(Outcome::Established(info.clone()));
        })
        .on_exception(move |_, err| {
            let _ = failed.send(Outcome::Failed(err.clone()));
        })
        .build()?;

    session.start();

    let result = tokio::select! {
        next = outcome.recv() => match next {
            Some(Outcome::Established(info)) => {
                println!(
                    "Session established: {}",
                    info.remote_session_id.as_deref().unwrap_or("-")
                );
                println!("Press Ctrl-C to terminate");
                tokio::signal::ctrl_c().await.map_err(anyhow::Error::from)
            }
            Some(Outcome::Failed(err)) => {
                error!(kind = ?err.kind(), "session failed: {err}");
                Err(anyhow::Error::new(err).context("session failed"))
            }
            None => Ok(()),
        },
        signal = tokio::signal::ctrl_c() => {
            info!("interrupted before the session was established");
            signal.map_err(anyhow::Error::from)
        }
    };

    session.terminate();
    session.closed().await;
    println!("Session {}", session.state());
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    mediasession_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Run(overrides) => run(overrides.resolve()?).await?,
        Command::Config(overrides) => {
            let config = overrides.resolve()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Version => {
            println!("mediasession {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
