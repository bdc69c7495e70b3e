//! Crate error taxonomy.

/// Errors surfaced by DHT operations.
///
/// Per-RPC failures are absorbed by the lookup engine (the failing contact
/// is dropped from the routing table); only operation-level failures reach
/// the caller.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A single request timed out or the transport failed.
    #[error("peer did not respond within the request timeout")]
    Unreachable,

    /// The routing table was empty at the start of a lookup.
    #[error("no known contacts to seed a lookup")]
    NoKnownContacts,

    /// Every replication RPC of a store failed.
    #[error("store failed on all replication targets")]
    StoreFailed,

    /// A peer replied with something the request cannot accept, e.g. a
    /// mismatched reply shape or an over-limit payload.
    #[error("configuration mismatch: {0}")]
    Config(&'static str),

    /// Transparent [`std::io::Error`], from socket setup.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
