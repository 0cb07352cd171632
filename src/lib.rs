//! # DecRep - Decentralized File Repository
//!
//! Every node keeps a virtual directory tree of tracked files, backed by a
//! record store that maps each tracked file to its content fingerprint and
//! to the users holding a local copy. Mutations are line-oriented commands;
//! a node applies a command locally and then forwards it to the peers it
//! found through UDP discovery.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use decrep::{Config, Node};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::start(Config::load(None)?).await?;
//!     node.propagator().submit(r#"add_file/"/home/me/notes.txt"/"/docs"/me"#).await?;
//!     println!("{}", node.engine().render_tree().await);
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
pub mod content;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod logging;
pub mod node;
pub mod propagator;
pub mod store;
pub mod transport;
pub mod tree;
pub mod watcher;

// Re-export commonly used types
pub use command::{Command, CommandKind};
pub use config::Config;
pub use engine::{Applied, SyncEngine};
pub use error::{ParseError, StoreError, SyncError, TransportError, TreeError};
pub use node::Node;
pub use propagator::{ChangePropagator, DeliveryOutcome, Propagation};
pub use store::{MemoryRecordStore, RecordStore, RedbRecordStore};
pub use tree::PathTree;

// vim: ts=4
