use clap::{Arg, ArgAction, ArgMatches, Command};
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use decrep::config::Config;
use decrep::logging::*;
use decrep::store::RedbRecordStore;
use decrep::transport::{CommandTransport, TcpPeerClient};
use decrep::{Node, SyncEngine};

///////////////////////
// Utility functions //
///////////////////////

/// Config file and environment, then the global command line flags
fn load_config(matches: &ArgMatches) -> Result<Config, Box<dyn Error>> {
	let path = matches.get_one::<String>("config").map(PathBuf::from);
	let mut config = Config::load(path.as_deref())?;
	if let Some(dir) = matches.get_one::<String>("data-dir") {
		config.data_dir = PathBuf::from(dir);
	}
	Ok(config)
}

/// Flags of the `node` subcommand
fn apply_node_flags(config: &mut Config, matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
	if let Some(username) = matches.get_one::<String>("username") {
		config.username = username.clone();
	}
	if let Some(port) = matches.get_one::<u16>("port") {
		config.command_port = *port;
	}
	if let Some(peers) = matches.get_many::<SocketAddr>("peer") {
		config.static_peers.extend(peers.copied());
	}
	if matches.get_flag("no-discovery") {
		config.discovery.enabled = false;
	}
	config.validate()?;
	Ok(())
}

/// Submit command lines typed on stdin until EOF or Ctrl-C
async fn console(node: &Node) -> Result<(), Box<dyn Error>> {
	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	loop {
		let line = tokio::select! {
			_ = tokio::signal::ctrl_c() => break,
			line = lines.next_line() => match line? {
				Some(line) => line,
				None => break,
			},
		};
		let line = line.trim();
		match line {
			"" => continue,
			"tree" => println!("{}", node.engine().render_tree().await),
			"peers" => match node.discovery() {
				Some(discovery) => {
					for peer in discovery.peers().await {
						println!("{}", peer);
					}
				}
				None => println!("discovery disabled"),
			},
			_ => match node.propagator().submit(line).await {
				Ok(propagation) => {
					println!("OK ({} deliveries)", propagation.delivery_count());
				}
				Err(e) => println!("ERR {}", e),
			},
		}
	}
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let matches = Command::new("DecRep")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Decentralized file repository")
		.subcommand_required(true)
		.arg(Arg::new("config").short('c').long("config").value_name("FILE").help("Config file"))
		.arg(Arg::new("data-dir").short('d').long("data-dir").value_name("DIR").help("Data directory"))
		.subcommand(
			Command::new("node")
				.about("Run a node; command lines are read from stdin")
				.arg(Arg::new("username").short('u').long("username").help("Local identity"))
				.arg(
					Arg::new("port")
						.short('p')
						.long("port")
						.value_parser(clap::value_parser!(u16))
						.help("Command port"),
				)
				.arg(
					Arg::new("peer")
						.long("peer")
						.value_parser(clap::value_parser!(SocketAddr))
						.action(ArgAction::Append)
						.help("Static peer address"),
				)
				.arg(
					Arg::new("no-discovery")
						.long("no-discovery")
						.action(ArgAction::SetTrue)
						.help("Do not announce or listen for peers"),
				),
		)
		.subcommand(
			Command::new("exec")
				.about("Send one command line to a running node")
				.arg(Arg::new("peer").required(true).value_parser(clap::value_parser!(SocketAddr)))
				.arg(Arg::new("line").required(true)),
		)
		.subcommand(Command::new("tree").about("Print the repository tree from the local database"))
		.get_matches();

	if let Some(sub_matches) = matches.subcommand_matches("node") {
		let mut config = load_config(&matches)?;
		apply_node_flags(&mut config, sub_matches)?;
		init_tracing(&config.log_level);

		let node = Node::start(config).await?;
		let result = console(&node).await;
		node.shutdown().await;
		return result;
	} else if let Some(sub_matches) = matches.subcommand_matches("exec") {
		init_tracing("warn");
		let peer = *sub_matches.get_one::<SocketAddr>("peer").ok_or("exec: peer argument required")?;
		let line = sub_matches.get_one::<String>("line").ok_or("exec: line argument required")?;
		let client = TcpPeerClient::new(Duration::from_secs(5));
		client.deliver(peer, line).await?;
		println!("OK");
	} else if matches.subcommand_matches("tree").is_some() {
		let config = load_config(&matches)?;
		init_tracing(&config.log_level);
		debug!("Reading {}", config.database_path().display());
		let store = RedbRecordStore::open(&config.database_path())?;
		let engine = SyncEngine::new(Box::new(store))?;
		print!("{}", engine.render_tree().await);
	}

	Ok(())
}

// vim: ts=4
