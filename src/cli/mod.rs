//! CLI for the membership manager
//!
//! Provides command-line access to:
//! - The effective configuration
//! - A single-process simulation of joins and removals
//! - Decoding of marshalled membership lists

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::RosterConfig;
use crate::membership::{codec, LimboRecord, MembershipList, Reply, RosterManager, SiteAddr, SiteStatus};
use crate::replication::LoopbackReplication;
use crate::store::MemoryStore;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file; searched in the default locations when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the effective configuration as YAML
    Config,
    /// Run a loopback master, join and remove sites, print the roster
    Simulate {
        /// Sites to join, as host:port
        #[arg(short, long = "join", value_delimiter = ',')]
        join: Vec<SiteAddr>,
        /// Sites to remove after the joins
        #[arg(short, long = "remove", value_delimiter = ',')]
        remove: Vec<SiteAddr>,
        /// Never acknowledge writes, leaving changes in limbo
        #[arg(long)]
        withhold_acks: bool,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Decode a hex-encoded membership list
    Decode {
        hex: String,
        #[arg(long)]
        json: bool,
    },
}

/// What a simulation run produced
#[derive(Debug, Clone, serde::Serialize)]
pub struct SimulationReport {
    pub replies: Vec<(String, String)>,
    pub generation: u32,
    pub change_counter: u32,
    pub limbo: Option<String>,
    pub sites: Vec<SiteStatus>,
}

pub fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RosterConfig> {
    let config = match path {
        Some(path) => RosterConfig::load_from_file(path)?,
        None => RosterConfig::load()?,
    };
    Ok(config)
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Commands::Simulate {
            join,
            remove,
            withhold_acks,
            json,
        } => {
            let report = simulate(config, &join, &remove, withhold_acks).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for (request, reply) in &report.replies {
                    println!("{:<28} {}", request, reply);
                }
                println!();
                println!(
                    "generation {}  change {}  limbo {}",
                    report.generation,
                    report.change_counter,
                    report.limbo.as_deref().unwrap_or("-")
                );
                print_sites(&report.sites);
            }
        }
        Commands::Decode { hex, json } => {
            let list = decode_hex(&hex)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                println!(
                    "format {}  generation {}  change {}",
                    list.format_version, list.generation, list.change_counter
                );
                print_sites(&list.sites);
            }
        }
    }
    Ok(())
}

pub fn decode_hex(input: &str) -> anyhow::Result<MembershipList> {
    let bytes = hex::decode(input.trim()).context("input is not valid hex")?;
    let list = codec::decode_list(&bytes).context("input is not a membership list")?;
    Ok(list)
}

/// Run joins then removals against an in-process master
pub async fn simulate(
    config: RosterConfig,
    join: &[SiteAddr],
    remove: &[SiteAddr],
    withhold_acks: bool,
) -> anyhow::Result<SimulationReport> {
    let store = Arc::new(MemoryStore::new());
    let repl = Arc::new(LoopbackReplication::as_master(
        config.local_site.clone(),
        config.ack_policy,
    ));
    if !withhold_acks {
        repl.set_responsive_peers(usize::MAX);
    }

    let manager = RosterManager::new(config, store, repl)?;
    manager.start().await?;
    info!("Simulating {} joins and {} removals", join.len(), remove.len());

    let mut replies = Vec::new();
    for addr in join {
        let reply = manager.join_via_dispatch(addr).await?;
        debug!("join {} -> {:?}", addr, reply);
        replies.push((format!("join {}", addr), describe(&reply)));
    }
    for addr in remove {
        let reply = manager.remove_via_dispatch(addr).await?;
        debug!("remove {} -> {:?}", addr, reply);
        replies.push((format!("remove {}", addr), describe(&reply)));
    }

    let report = SimulationReport {
        replies,
        generation: manager.generation(),
        change_counter: manager.change_counter(),
        limbo: manager.limbo().map(|r: LimboRecord| format!("{} {}", r.victim, r.failure_position)),
        sites: manager.current_membership_snapshot(),
    };
    manager.shutdown().await;
    Ok(report)
}

fn describe(reply: &Reply) -> String {
    match reply {
        Reply::Accepted(list) => format!("accepted ({} bytes)", list.len()),
        Reply::Forward(master) => format!("forward to {}", master),
        Reply::Rejected(reason) => format!("rejected {:?}", reason),
    }
}

fn print_sites(sites: &[SiteStatus]) {
    println!("{:<32} {:>6}  {}", "HOST", "PORT", "STATUS");
    for site in sites {
        println!("{:<32} {:>6}  {}", site.host, site.port, site.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipStatus;

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::try_parse_from([
            "roster",
            "simulate",
            "--join",
            "a:1,b:2",
            "--remove",
            "a:1",
            "--withhold-acks",
        ])
        .unwrap();
        match cli.command {
            Commands::Simulate {
                join,
                remove,
                withhold_acks,
                json,
            } => {
                assert_eq!(join, vec![SiteAddr::new("a", 1), SiteAddr::new("b", 2)]);
                assert_eq!(remove, vec![SiteAddr::new("a", 1)]);
                assert!(withhold_acks);
                assert!(!json);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_decode_hex() {
        let list = MembershipList {
            format_version: codec::FORMAT_VERSION,
            generation: 2,
            change_counter: 2,
            sites: vec![SiteStatus {
                host: "a".into(),
                port: 1,
                status: MembershipStatus::Present,
            }],
        };
        let encoded = hex::encode(codec::encode_list(&list).unwrap());
        assert_eq!(decode_hex(&encoded).unwrap(), list);
        assert!(decode_hex("zz").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_simulate_with_and_without_acks() {
        let mut config = RosterConfig::default();
        config.ack_timeout_ms = 20;
        let peer = SiteAddr::new("peer", 7001);

        let report = simulate(config.clone(), &[peer.clone()], &[], false).await.unwrap();
        assert!(report.limbo.is_none());
        assert_eq!(report.sites.len(), 2);

        let report = simulate(config, &[peer], &[], true).await.unwrap();
        assert!(report.limbo.is_some());
        assert_eq!(report.replies[0].1, "rejected Unavailable");
    }
}
