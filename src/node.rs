//! High-level node facade.
//!
//! [`Node`] wires the UDP transport, the in-memory value store, and the DHT
//! core together: bind a socket, start the serve loop, and expose the public
//! operations. Construction goes through [`NodeBuilder`] when the defaults
//! for `k`, `α`, timeouts, or TTL need changing.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::info;

use crate::Result;
use crate::dht::{DEFAULT_ALPHA, DEFAULT_K, DEFAULT_REQUEST_TIMEOUT, DhtNode, MemoryStore};
use crate::error::Error;
use crate::id::{Contact, Id};
use crate::rpc::UdpRpc;

pub struct NodeBuilder {
    id: Option<Id>,
    k: usize,
    alpha: usize,
    request_timeout: Duration,
    value_ttl: Option<Duration>,
}

impl NodeBuilder {
    fn new() -> Self {
        Self {
            id: None,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            value_ttl: None,
        }
    }

    /// Use a fixed identifier instead of a random one.
    pub fn id(mut self, id: Id) -> Self {
        self.id = Some(id);
        self
    }

    /// Bucket capacity and replication width.
    pub fn k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Lookup concurrency factor.
    pub fn alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha;
        self
    }

    /// Deadline for each outbound request.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Time-to-live for locally stored values.
    pub fn value_ttl(mut self, ttl: Duration) -> Self {
        self.value_ttl = Some(ttl);
        self
    }

    /// Bind the socket, spawn the actor and the serve loop.
    pub async fn bind(self, addr: SocketAddr) -> Result<Node> {
        let id = self.id.unwrap_or_else(Id::random);
        let rpc = Arc::new(
            UdpRpc::bind(addr, id)
                .await?
                .with_request_timeout(self.request_timeout),
        );
        let store = match self.value_ttl {
            Some(ttl) => MemoryStore::with_ttl(ttl),
            None => MemoryStore::new(),
        };
        let dht = DhtNode::new(
            id,
            rpc.clone(),
            Box::new(store),
            self.k,
            self.alpha,
            self.request_timeout,
        );
        let serve_task = rpc.serve(dht.clone());
        let local_addr = rpc.local_addr()?;
        info!(%id, %local_addr, "node listening");

        Ok(Node {
            dht,
            local_addr,
            serve_task,
        })
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running DHT node.
pub struct Node {
    dht: DhtNode<UdpRpc>,
    local_addr: SocketAddr,
    serve_task: JoinHandle<()>,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    /// Bind with defaults on `addr`, e.g. `"0.0.0.0:6881"`.
    pub async fn bind(addr: &str) -> Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| Error::Config("invalid bind address"))?;
        Self::builder().bind(addr).await
    }

    pub fn id(&self) -> Id {
        self.dht.id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Enter the network via a known peer.
    pub async fn join(&self, bootstrap: SocketAddr) -> Result<()> {
        self.dht.join(bootstrap).await
    }

    /// Probe `addr`; a responder lands in the routing table.
    pub async fn ping(&self, addr: SocketAddr) -> Result<Id> {
        self.dht.ping(addr).await
    }

    /// Store `value` under the hash of `key` on the k closest nodes.
    pub async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<Id> {
        self.dht.put(key, value).await
    }

    /// Store `value` under an explicit identifier.
    pub async fn put_at(&self, key: Id, value: Vec<u8>) -> Result<()> {
        self.dht.put_at(key, value).await
    }

    /// Retrieve the value under `key`, local store first.
    pub async fn get(&self, key: &Id) -> Result<(Vec<Contact>, Option<Vec<u8>>)> {
        self.dht.get(key).await
    }

    /// Find the contacts closest to `target`; an exact match is surfaced as
    /// the second element.
    pub async fn find_contact(&self, target: Id) -> Result<(Vec<Contact>, Option<Contact>)> {
        self.dht.find_contact(target).await
    }

    /// Number of contacts currently known.
    pub async fn table_size(&self) -> usize {
        self.dht.table_size().await
    }

    /// Stop the serve loop and the actor.
    pub async fn shutdown(&self) {
        self.dht.quit().await;
        self.serve_task.abort();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.serve_task.abort();
    }
}
