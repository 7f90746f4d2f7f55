//! cors-sim — synthetic station network and RTCM3 stream generator for
//! exercising a running cors-engine over NTRIP, standing in for the real
//! receivers and rovers this service was designed against.
//!
//! Two subcommands:
//!   - `serve <scenario>`: runs a caster simulator streaming one or more
//!     synthetic physical sources, for cors-engine's ingest pool to connect
//!     to (configure the matching `addr`/`port`/`mntpnt` rows in its
//!     sources CSV).
//!   - `drive <scenario>`: runs a rover simulator against a running
//!     cors-engine's Agent, logging each received RTCM3 message number so
//!     mountpoint remaps and steady streaming are observable.

mod caster_sim;
mod rover_sim;
mod scenarios;

use clap::{Parser, Subcommand};
use cors_types::Ecef;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cors-sim", about = "Synthetic CORS network and RTCM3 stream generator")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the available canned scenarios.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Run a caster simulator serving one scenario's synthetic sources.
    Serve {
        scenario: String,
        #[arg(long, default_value = "0.0.0.0:7001")]
        bind: String,
    },
    /// Run a rover simulator against a running cors-engine's Agent.
    Drive {
        scenario: String,
        #[arg(long, default_value = "127.0.0.1")]
        agent_addr: String,
        #[arg(long, default_value_t = 2102)]
        agent_port: u16,
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "cors_sim=info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::List { json } => {
            if json {
                let entries: Vec<_> = scenarios::all_names()
                    .iter()
                    .map(|name| {
                        let s = scenarios::by_name(name).expect("listed scenario must resolve");
                        serde_json::json!({ "name": s.name, "description": s.description, "n_sources": s.sources.len() })
                    })
                    .collect();
                println!("{}", serde_json::Value::Array(entries));
            } else {
                for name in scenarios::all_names() {
                    let s = scenarios::by_name(name).expect("listed scenario must resolve");
                    println!("{:<4} {}", s.name, s.description);
                }
            }
        }
        Command::Serve { scenario, bind } => {
            let Some(s) = scenarios::by_name(&scenario) else {
                error!(%scenario, "unknown scenario");
                std::process::exit(1);
            };
            info!(scenario = s.name, %bind, "starting caster simulator");
            if let Err(e) = caster_sim::run(bind, s.sources).await {
                error!(error = %e, "caster simulator exited with error");
                std::process::exit(1);
            }
        }
        Command::Drive { scenario, agent_addr, agent_port, seconds } => {
            let Some(s) = scenarios::by_name(&scenario) else {
                error!(%scenario, "unknown scenario");
                std::process::exit(1);
            };
            let mut rover = s.rover.unwrap_or_else(|| rover_sim::RoverConfig {
                addr: agent_addr.clone(),
                port: agent_port,
                mountpoint: "RTCM32".to_string(),
                user: "sim".to_string(),
                passwd: "sim".to_string(),
                gga_period: Duration::from_secs(3),
            });
            rover.addr = agent_addr;
            rover.port = agent_port;
            let fixes: Vec<Ecef> = s.sources.iter().map(|src| src.pos).collect();
            info!(scenario = s.name, "starting rover simulator");
            if let Err(e) = rover_sim::run(rover, fixes, Duration::from_secs(seconds)).await {
                error!(error = %e, "rover simulator exited with error");
                std::process::exit(1);
            }
        }
    }
}
