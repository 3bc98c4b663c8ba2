use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use relay_network::{
    load_identity, load_or_generate_identity_file, persist_identity, IdentityLoad, PeerIdentity,
};
use relay_p2p::{ListenerStatus, RelayNode, StartupReport};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod version;

use crate::config::{parse_multiaddrs, resolve_config_path, AppConfig};
use crate::version::{git_commit_hash, RELAY_VERSION};

fn cli() -> Command {
    Command::new("relay-node")
        .version(RELAY_VERSION)
        .about("libp2p circuit relay node")
        .disable_version_flag(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true),
        )
        .arg(
            Arg::new("version_flag")
                .short('V')
                .long("version")
                .action(ArgAction::SetTrue)
                .help("Print detailed version information and exit")
                .global(true),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Validate configuration, then exit")
                .global(true),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("Port of the default WebSocket listener")
                .global(true),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .value_name("MULTIADDR")
                .action(ArgAction::Append)
                .help("Listen address; replaces the configured set when given")
                .global(true),
        )
        .arg(
            Arg::new("announce")
                .long("announce")
                .value_name("MULTIADDR")
                .action(ArgAction::Append)
                .help("Externally reachable address to advertise")
                .global(true),
        )
        .arg(
            Arg::new("identity-file")
                .long("identity-file")
                .value_name("FILE")
                .help("Load the peer identity from FILE, creating it on first start")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "compact"])
                .help("Select log output format")
                .global(true),
        )
        .subcommand(Command::new("start").about("Run the relay node (default)"))
        .subcommand(
            Command::new("keygen")
                .about("Generate a peer identity and print it as JSON")
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .help("Write the identity to FILE instead of stdout"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    if let Some(("keygen", sub)) = matches.subcommand() {
        return run_keygen(sub);
    }

    let mut config = AppConfig::load(matches.get_one::<String>("config").map(String::as_str))?;
    apply_overrides(&mut config, &matches);

    if matches.get_flag("version_flag") {
        print_version_info();
        return Ok(());
    }

    config.validate()?;

    if matches.get_flag("check") {
        println!("Configuration OK");
        if let Some(path) = &config.config_path {
            println!("  file: {}", resolve_config_path(path).display());
        }
        println!("  listen: {}", join(&config.listen));
        println!("  announce: {}", join(&config.announce));
        return Ok(());
    }

    init_logging(&config)?;

    info!(
        version = RELAY_VERSION,
        commit = git_commit_hash(),
        "Starting relay node"
    );

    let IdentityLoad { identity, source } = resolve_identity(&config)?;
    debug!(?source, "Resolved peer identity");

    let node = RelayNode::start(identity, config.node_config())
        .await
        .context("failed to start relay node")?;
    print_banner(node.startup_report());

    let discovery_task = node.take_discovery_receiver().map(|mut rx| {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                debug!(
                    from = %message.propagation_source,
                    source = ?message.source,
                    bytes = message.data.len(),
                    "Peer discovery message"
                );
            }
        })
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", err);
    }
    info!("Shutdown signal received");

    node.shutdown().await;
    if let Some(task) = discovery_task {
        task.abort();
    }
    info!("Relay node stopped");
    Ok(())
}

fn run_keygen(matches: &ArgMatches) -> Result<()> {
    let identity = PeerIdentity::generate();
    match matches.get_one::<String>("output") {
        Some(path) => {
            persist_identity(&identity, &PathBuf::from(path))?;
            println!("{}", identity.peer_id());
        }
        None => {
            let encoded = identity
                .to_json()
                .map_err(|e| anyhow::anyhow!("encode peer identity: {e}"))?;
            println!("{encoded}");
        }
    }
    Ok(())
}

/// `RELAY_PEER_ID` wins over an identity file; with neither the node runs
/// with a throwaway identity.
fn resolve_identity(config: &AppConfig) -> Result<IdentityLoad> {
    if config.peer_id.is_some() {
        return Ok(load_identity(config.peer_id.as_deref()));
    }
    if let Some(path) = &config.identity_file {
        return load_or_generate_identity_file(path);
    }
    Ok(load_identity(None))
}

fn apply_overrides(config: &mut AppConfig, matches: &ArgMatches) {
    if let Some(port) = matches.get_one::<u16>("port") {
        config.set_port(*port);
    }
    if let Some(values) = matches.get_many::<String>("listen") {
        let values: Vec<String> = values.cloned().collect();
        let listen = parse_multiaddrs(&values, "listen");
        if listen.is_empty() {
            warn!("Ignoring --listen: no valid multiaddr given");
        } else {
            config.listen = listen;
        }
    }
    if let Some(values) = matches.get_many::<String>("announce") {
        let values: Vec<String> = values.cloned().collect();
        config.announce = parse_multiaddrs(&values, "announce");
    }
    if let Some(path) = matches.get_one::<String>("identity-file") {
        config.identity_file = Some(PathBuf::from(path));
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.log_format = format.clone();
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "compact" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?;
    }

    Ok(())
}

fn print_banner(report: &StartupReport) {
    println!("Relay node started");
    println!("  peer id: {}", report.peer_id);
    println!("  transports: {}", join(&report.transports));
    for listener in &report.listeners {
        match &listener.status {
            ListenerStatus::Bound(addrs) => {
                println!("  listening on {} -> {}", listener.address, join(addrs))
            }
            ListenerStatus::Failed(reason) => {
                println!("  failed to listen on {}: {}", listener.address, reason)
            }
        }
    }
    println!("  reachable at:");
    for address in &report.reachable {
        println!("    {address}");
    }
}

fn print_version_info() {
    println!("relay-node {} (commit {})", RELAY_VERSION, git_commit_hash());
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    if items.is_empty() {
        return "-".to_string();
    }
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
