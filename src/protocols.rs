//! Trait definitions for the seams of the DHT core.
//!
//! The core consumes these interfaces and makes no assumption about their
//! implementation: [`crate::rpc::UdpRpc`] provides the production transport,
//! and tests inject in-memory fakes with controllable failures.
//!
//! | Seam | Trait | Provided by |
//! |------|-------|-------------|
//! | Outbound RPC | [`DhtRpc`] | `rpc::UdpRpc`, test fakes |
//! | Value storage | [`ValueStore`] | `dht::MemoryStore` |
//! | Inbound dispatch | [`RequestHandler`] | `dht::DhtNode` |
//!
//! Traits live here, separate from the implementations, so the lookup engine
//! depends only on interfaces and no module cycle forms between the core and
//! the transport.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::Result;
use crate::id::Id;
use crate::messages::{PeerInfo, Request, Response};

/// The four outbound DHT RPCs, addressed by transport endpoint.
///
/// Every method suspends until the reply arrives, the request times out, or
/// the transport fails; the latter two surface as
/// [`Error::Unreachable`](crate::Error::Unreachable).
#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Liveness probe. Returns the responder's identifier on a matching
    /// pong.
    async fn ping(&self, to: SocketAddr) -> Result<Id>;

    /// Ask a node to store a key-value pair. Returns the responder's
    /// identifier on acknowledgement.
    async fn store(&self, to: SocketAddr, key: Id, value: Vec<u8>) -> Result<Id>;

    /// Ask a node for its contacts closest to `target`.
    async fn find_contact(&self, to: SocketAddr, target: Id) -> Result<Vec<PeerInfo>>;

    /// Ask a node for the value under `target`, or its closest contacts if
    /// it does not hold the value.
    async fn find_value(
        &self,
        to: SocketAddr,
        target: Id,
    ) -> Result<(Option<Vec<u8>>, Vec<PeerInfo>)>;
}

/// Local key-value storage for the DHT.
///
/// Implementations decide retention; reads return `None` for absent or
/// expired entries. Both methods are synchronous and non-suspending — the
/// owning actor serializes access.
pub trait ValueStore: Send + 'static {
    fn put(&mut self, key: Id, value: Vec<u8>);

    fn get(&mut self, key: &Id) -> Option<Vec<u8>>;
}

/// Inbound request dispatch, installed into the messaging layer.
///
/// The messaging layer delivers each inbound request exactly once and
/// transmits the returned reply, if any, back to `from`. Handlers must be
/// idempotent: the transport may retransmit.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one inbound request; `None` drops it without replying.
    async fn handle_request(&self, from: SocketAddr, request: Request) -> Option<Response>;
}
