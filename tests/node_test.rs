//! Node lifecycle: persistence, bootstrap and discovery

mod common;

use std::time::Duration;
use tempfile::TempDir;

use common::{add_file_line, free_udp_port, localhost, node_config};
use decrep::Node;

#[tokio::test]
async fn test_records_survive_restart() {
	let tmp = TempDir::new().unwrap();
	let local = tmp.path().join("kept.txt");
	std::fs::write(&local, b"kept across restarts").unwrap();

	let node = Node::start(node_config(tmp.path(), "alice", 0, vec![])).await.unwrap();
	node.propagator().submit(&add_file_line(&local, "/archive", "alice")).await.unwrap();
	node.propagator().submit("add_user/bob").await.unwrap();
	let before = node.engine().snapshot().await;
	node.shutdown().await;

	let node = Node::start(node_config(tmp.path(), "alice", 0, vec![])).await.unwrap();
	assert!(node.engine().inspect(|tree, _| tree.contains_file("/archive/kept.txt")).await);
	assert_eq!(node.engine().snapshot().await, before);
	assert_eq!(node.engine().local_username().await.as_deref(), Some("alice"));
	node.shutdown().await;
}

#[tokio::test]
async fn test_empty_node_bootstraps_from_peer() {
	let tmp = TempDir::new().unwrap();
	let a = Node::start(node_config(tmp.path(), "alice", 0, vec![])).await.unwrap();
	let local = tmp.path().join("seed.txt");
	std::fs::write(&local, b"seed").unwrap();
	a.propagator().submit(&add_file_line(&local, "/seed", "alice")).await.unwrap();

	let mut config = node_config(tmp.path(), "bob", 0, vec![a.command_addr()]);
	config.bootstrap = true;
	let b = Node::start(config).await.unwrap();

	assert!(b.engine().inspect(|tree, _| tree.contains_file("/seed/seed.txt")).await);
	assert!(b.engine().inspect(|_, store| store.user("alice").is_some()).await);
	assert_eq!(b.engine().local_username().await.as_deref(), Some("bob"));

	a.shutdown().await;
	b.shutdown().await;
}

#[tokio::test]
async fn test_nodes_find_each_other_and_sync() {
	let tmp = TempDir::new().unwrap();
	let (udp_a, udp_b) = (free_udp_port(), free_udp_port());
	let interval = Duration::from_millis(200);

	let mut config_a = node_config(tmp.path(), "alice", 0, vec![]);
	config_a.discovery.enabled = true;
	config_a.discovery.bind_addr = localhost(0).ip();
	config_a.discovery.port = udp_a;
	config_a.discovery.interval_ms = 200;
	config_a.discovery.announce_targets = vec![localhost(udp_b)];
	let mut config_b = config_a.clone();
	config_b.username = "bob".to_string();
	config_b.data_dir = tmp.path().join("bob");
	config_b.discovery.port = udp_b;
	config_b.discovery.announce_targets = vec![localhost(udp_a)];

	let a = Node::start(config_a).await.unwrap();
	let b = Node::start(config_b).await.unwrap();

	let converged = tokio::time::timeout(interval * 2 + Duration::from_millis(200), async {
		loop {
			let seen_by_a = a.discovery().unwrap().peers().await;
			let seen_by_b = b.discovery().unwrap().peers().await;
			if seen_by_a == vec![b.command_addr()] && seen_by_b == vec![a.command_addr()] {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await;
	assert!(converged.is_ok());

	a.propagator().submit("add_user/frank").await.unwrap().wait().await;
	assert!(b.engine().inspect(|_, store| store.user("frank").is_some()).await);

	a.shutdown().await;
	b.shutdown().await;
}

// vim: ts=4
