//! # keyspace — a Kademlia-style distributed hash table
//!
//! A DHT core built around the XOR metric:
//!
//! - **Identifiers**: 256-bit ids; keys map into the same space via blake3
//! - **Routing**: per-bucket LRU tables that probe before they evict, so
//!   long-lived contacts are never displaced by newcomers
//! - **Lookups**: iterative α-parallel queries converging on the k closest
//!   nodes to a target
//! - **Transport**: token-correlated request/response over plain UDP
//!   datagrams
//!
//! ## Architecture
//!
//! Shared state lives behind the **actor pattern**: [`DhtNode`] is a cheap
//! to clone handle, the actor owns the routing table and value store and
//! processes commands sequentially. The transport and storage are trait
//! seams ([`protocols`]), so the core runs against in-memory fakes in tests
//! and the UDP stack in production.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `id` | Identifiers, XOR distance, contacts |
//! | `dht` | Routing table, value store, lookup engine, node actor |
//! | `messages` | Wire format and bounded bincode codec |
//! | `protocols` | Trait seams (`DhtRpc`, `ValueStore`, `RequestHandler`) |
//! | `rpc` | UDP messaging with token correlation |
//! | `node` | High-level facade: bind, join, put/get |
//!
//! ## Example
//!
//! ```no_run
//! use keyspace::Node;
//!
//! # async fn run() -> keyspace::Result<()> {
//! let node = Node::bind("0.0.0.0:6881").await?;
//! node.join("198.51.100.7:6881".parse().unwrap()).await?;
//! let id = node.put(b"greeting", b"hello".to_vec()).await?;
//! let (_, value) = node.get(&id).await?;
//! # Ok(())
//! # }
//! ```

pub mod dht;
mod error;
pub mod id;
pub mod messages;
mod node;
pub mod protocols;
pub mod rpc;

pub use dht::{DEFAULT_ALPHA, DEFAULT_K, DEFAULT_REQUEST_TIMEOUT, DhtNode, MemoryStore, RoutingTable};
pub use error::Error;
pub use id::{Contact, HASH_BITS, ID_BYTES, Id};
pub use node::{Node, NodeBuilder};

/// Alias Result to be the crate Result.
pub type Result<T, E = Error> = core::result::Result<T, E>;
