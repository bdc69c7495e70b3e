//! # Kademlia-style DHT core
//!
//! This module implements the heart of the DHT: the routing table, the local
//! value store, inbound command dispatch, and the iterative lookup engine.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `ping(addr)` | Liveness probe; a responder is inserted into routing |
//! | `put(key, value)` | Store a value on the k closest nodes |
//! | `get(key)` | Retrieve a value via iterative lookup |
//! | `find_contact(id)` | Find contacts closest to an identifier |
//! | `join(addr)` | Enter the network via a known peer |
//!
//! ## Routing Table
//!
//! The routing table uses [`HASH_BITS`] buckets indexed by the common-prefix
//! length with the local identifier. Each bucket holds up to `k` contacts,
//! most recently seen first. A full bucket probes its least recently seen
//! contact before admitting a newcomer: responsive contacts are never
//! displaced.
//!
//! ## Actor Architecture
//!
//! - [`DhtNode`]: public handle for DHT operations, cheap to clone
//! - `DhtActor`: internal actor owning routing table and storage
//! - Commands are sent via async channels for thread-safe access
//!
//! Liveness probes triggered by a full bucket run on spawned tasks and feed
//! their outcome back to the actor as a command, so inserts never block the
//! inbound path on a remote round-trip.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, timeout};
use tracing::{debug, trace, warn};

use crate::Result;
use crate::error::Error;
use crate::id::{Contact, HASH_BITS, Id, bucket_index, distance_cmp};
use crate::messages::{MAX_VALUE_SIZE, PeerInfo, Request, Response};
use crate::protocols::{DhtRpc, RequestHandler, ValueStore};

/// Default bucket capacity and replication width.
pub const DEFAULT_K: usize = 20;

/// Default lookup concurrency factor.
pub const DEFAULT_ALPHA: usize = 3;

/// Default deadline for a single outbound request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Routing Table (XOR metric)
// ============================================================================
//
// Bucket organization:
//   Bucket 0:   contacts whose distance has 0 leading zeros (furthest half)
//   Bucket 1:   1 leading zero (next quarter)
//   ...
//   Bucket 255: 255 leading zeros (closest)
//
// Within a bucket, contacts are ordered most recently seen first; the
// eviction candidate is always the tail.

#[derive(Debug, Clone, Default)]
struct Bucket {
    contacts: Vec<Contact>,
}

#[derive(Debug)]
enum BucketInsert {
    Inserted,
    Refreshed,
    Full {
        newcomer: Box<Contact>,
        tail: Box<Contact>,
    },
}

/// A deferred liveness probe produced by inserting into a full bucket.
///
/// The caller pings `tail` and feeds the outcome back through
/// [`RoutingTable::apply_probe_result`].
#[derive(Clone, Debug)]
pub struct PendingProbe {
    bucket: usize,
    pub(crate) tail: Contact,
    newcomer: Contact,
}

impl PendingProbe {
    /// The contact whose liveness decides the eviction.
    pub fn tail(&self) -> &Contact {
        &self.tail
    }
}

impl Bucket {
    fn insert(&mut self, contact: Contact, k: usize) -> BucketInsert {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            // Same identifier: refresh to the head, adopting a changed
            // address rather than keeping two entries.
            self.contacts.remove(pos);
            self.contacts.insert(0, contact);
            return BucketInsert::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.insert(0, contact);
            return BucketInsert::Inserted;
        }

        debug_assert!(!self.contacts.is_empty(), "full bucket with no contacts");
        let tail = self
            .contacts
            .last()
            .cloned()
            .unwrap_or_else(|| contact.clone());
        BucketInsert::Full {
            newcomer: Box::new(contact),
            tail: Box::new(tail),
        }
    }

    fn refresh(&mut self, id: &Id) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.id == id) {
            let mut existing = self.contacts.remove(pos);
            existing.mark_seen();
            self.contacts.insert(0, existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &Id) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.id == id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Kademlia routing table: [`HASH_BITS`] buckets of up to `k` contacts each,
/// indexed by common-prefix length with the local identifier.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: Id,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: Id, k: usize) -> Self {
        Self {
            self_id,
            k,
            buckets: vec![Bucket::default(); HASH_BITS],
        }
    }

    pub fn self_id(&self) -> &Id {
        &self.self_id
    }

    /// Ensure `contact` is represented, refreshing it to the head of its
    /// bucket if already known.
    ///
    /// Inserting the local identifier is a no-op. A full bucket yields a
    /// [`PendingProbe`] instead of evicting outright: the least recently
    /// seen contact gets a chance to prove liveness first.
    pub fn insert(&mut self, contact: Contact) -> Option<PendingProbe> {
        if contact.id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, &contact.id);
        match self.buckets[idx].insert(contact, self.k) {
            BucketInsert::Inserted | BucketInsert::Refreshed => None,
            BucketInsert::Full { newcomer, tail } => Some(PendingProbe {
                bucket: idx,
                tail: *tail,
                newcomer: *newcomer,
            }),
        }
    }

    /// Resolve a probe issued for a full bucket.
    ///
    /// A live tail is refreshed to the head and the newcomer is discarded;
    /// a dead tail is removed and the newcomer takes its place. Applied
    /// against current state: if the bucket changed while the probe was in
    /// flight, stale outcomes degrade to no-ops.
    pub fn apply_probe_result(&mut self, probe: PendingProbe, tail_alive: bool) {
        let bucket = &mut self.buckets[probe.bucket];
        if tail_alive {
            bucket.refresh(&probe.tail.id);
            return;
        }

        bucket.remove(&probe.tail.id);
        let already_present = bucket.contacts.iter().any(|c| c.id == probe.newcomer.id);
        if already_present {
            return;
        }
        if bucket.contacts.len() < self.k {
            bucket.contacts.insert(0, probe.newcomer);
        }
    }

    pub fn remove(&mut self, id: &Id) {
        if *id == self.self_id {
            return;
        }
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].remove(id);
    }

    /// Look up a contact by identifier.
    pub fn get(&self, id: &Id) -> Option<Contact> {
        if *id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx]
            .contacts
            .iter()
            .find(|c| &c.id == id)
            .cloned()
    }

    /// Up to `n` contacts sorted ascending by XOR distance to `target`,
    /// ties broken by lower identifier. Never includes the local node.
    ///
    /// Collection starts at the bucket the target itself would occupy and
    /// walks outward, alternating between higher and lower indices, until
    /// enough contacts are gathered or all buckets are exhausted.
    pub fn k_closest(&self, target: &Id, n: usize) -> Vec<Contact> {
        if n == 0 {
            return Vec::new();
        }

        let start = if *target == self.self_id {
            HASH_BITS - 1
        } else {
            bucket_index(&self.self_id, target)
        };

        let mut collected = self.buckets[start].contacts.clone();
        let mut above = start + 1;
        let mut below = start as isize - 1;
        while collected.len() < n && (above < HASH_BITS || below >= 0) {
            if above < HASH_BITS {
                collected.extend_from_slice(&self.buckets[above].contacts);
                above += 1;
            }
            if collected.len() >= n {
                break;
            }
            if below >= 0 {
                collected.extend_from_slice(&self.buckets[below as usize].contacts);
                below -= 1;
            }
        }

        collected.sort_by(|a, b| {
            distance_cmp(&a.id.xor_distance(target), &b.id.xor_distance(target))
                .then_with(|| a.id.cmp(&b.id))
        });
        collected.truncate(n);
        collected
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.contacts.is_empty())
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        let mut seen = std::collections::HashSet::new();
        for (idx, bucket) in self.buckets.iter().enumerate() {
            assert!(
                bucket.contacts.len() <= self.k,
                "bucket {idx} holds {} contacts, k = {}",
                bucket.contacts.len(),
                self.k
            );
            for contact in &bucket.contacts {
                assert_ne!(contact.id, self.self_id, "local id stored in bucket {idx}");
                assert_eq!(
                    bucket_index(&self.self_id, &contact.id),
                    idx,
                    "contact {} landed in the wrong bucket",
                    contact.id
                );
                assert!(
                    seen.insert(contact.id),
                    "contact {} appears more than once",
                    contact.id
                );
            }
        }
    }
}

// ============================================================================
// Value Store
// ============================================================================

/// Time-to-live for stored entries (24 hours).
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on stored entries; least recently used entries are evicted
/// beyond this.
const MAX_STORED_ENTRIES: usize = 64 * 1024;

#[derive(Debug)]
struct StoredEntry {
    value: Vec<u8>,
    stored_at: Instant,
}

/// In-memory [`ValueStore`] with a single TTL and a bounded entry count.
pub struct MemoryStore {
    entries: LruCache<Id, StoredEntry>,
    ttl: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(
                NonZeroUsize::new(MAX_STORED_ENTRIES).expect("entry cap is non-zero"),
            ),
            ttl,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueStore for MemoryStore {
    fn put(&mut self, key: Id, value: Vec<u8>) {
        self.entries.put(
            key,
            StoredEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    fn get(&mut self, key: &Id) -> Option<Vec<u8>> {
        let expired = match self.entries.peek(key) {
            Some(entry) => entry.stored_at.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            self.entries.pop(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }
}

// ============================================================================
// Iterative Lookup + Node Handle
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LookupMode {
    Contact,
    Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CandidateState {
    Unqueried,
    InFlight,
    Responded,
    Failed,
}

#[derive(Debug)]
struct Candidate {
    contact: Contact,
    state: CandidateState,
}

enum QueryReply {
    Contacts(Vec<PeerInfo>),
    Value {
        value: Option<Vec<u8>>,
        closer: Vec<PeerInfo>,
    },
    Failed,
}

struct LookupOutcome {
    contacts: Vec<Contact>,
    value: Option<Vec<u8>>,
}

fn sort_by_distance(candidates: &mut [Candidate], target: &Id) {
    candidates.sort_by(|a, b| {
        distance_cmp(
            &a.contact.id.xor_distance(target),
            &b.contact.id.xor_distance(target),
        )
        .then_with(|| a.contact.id.cmp(&b.contact.id))
    });
}

/// Index of the closest unqueried candidate within the top-`k` slots.
fn next_unqueried(candidates: &[Candidate], k: usize) -> Option<usize> {
    candidates
        .iter()
        .take(k)
        .position(|c| c.state == CandidateState::Unqueried)
}

fn mark_state(candidates: &mut [Candidate], id: &Id, state: CandidateState) {
    if let Some(candidate) = candidates.iter_mut().find(|c| &c.contact.id == id) {
        candidate.state = state;
        if state == CandidateState::Responded {
            candidate.contact.mark_seen();
        }
    }
}

fn responded_top_k(candidates: &[Candidate], k: usize) -> Vec<Contact> {
    candidates
        .iter()
        .filter(|c| c.state == CandidateState::Responded)
        .take(k)
        .map(|c| c.contact.clone())
        .collect()
}

/// Public handle for DHT operations.
///
/// Cheap to clone; all handles talk to the same actor. Public operations are
/// safe to invoke concurrently from independent tasks.
pub struct DhtNode<N: DhtRpc> {
    cmd_tx: mpsc::Sender<Command>,
    id: Id,
    network: Arc<N>,
    k: usize,
    alpha: usize,
    request_timeout: Duration,
}

impl<N: DhtRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            network: self.network.clone(),
            k: self.k,
            alpha: self.alpha,
            request_timeout: self.request_timeout,
        }
    }
}

struct DhtActor<N: DhtRpc> {
    routing: RoutingTable,
    store: Box<dyn ValueStore>,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
    id: Id,
    k: usize,
    request_timeout: Duration,
}

enum Command {
    // State updates
    ObserveContact(Contact),
    RemoveContact(Id),
    ApplyProbeResult(PendingProbe, bool),

    // Queries
    KClosest(Id, usize, oneshot::Sender<Vec<Contact>>),
    GetContact(Id, oneshot::Sender<Option<Contact>>),
    GetLocal(Id, oneshot::Sender<Option<Vec<u8>>>),
    StoreLocal(Id, Vec<u8>),
    TableSize(oneshot::Sender<usize>),

    // Inbound RPC handlers: refresh the sender, then answer from local state
    HandlePing(Contact, oneshot::Sender<()>),
    HandleStore(Contact, Id, Vec<u8>, oneshot::Sender<()>),
    HandleFindContact(Contact, Id, oneshot::Sender<Vec<Contact>>),
    HandleFindValue(Contact, Id, oneshot::Sender<(Option<Vec<u8>>, Vec<Contact>)>),

    Quit,
}

impl<N: DhtRpc> DhtNode<N> {
    /// Spawn the actor and return a handle to it.
    ///
    /// `k` is the bucket capacity and replication width, `alpha` the lookup
    /// concurrency, `request_timeout` the deadline for each outbound RPC.
    pub fn new(
        id: Id,
        network: Arc<N>,
        store: Box<dyn ValueStore>,
        k: usize,
        alpha: usize,
        request_timeout: Duration,
    ) -> Self {
        debug_assert!(k >= 1 && alpha >= 1, "k and alpha must be at least 1");
        let (cmd_tx, cmd_rx) = mpsc::channel(100);

        let actor = DhtActor {
            routing: RoutingTable::new(id, k),
            store,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            network: network.clone(),
            id,
            k,
            request_timeout,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            id,
            network,
            k,
            alpha,
            request_timeout,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    pub async fn observe_contact(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::ObserveContact(contact)).await;
    }

    async fn remove_contact(&self, id: Id) {
        let _ = self.cmd_tx.send(Command::RemoveContact(id)).await;
    }

    /// The routing table's contacts closest to `target`.
    pub async fn k_closest(&self, target: Id, n: usize) -> Vec<Contact> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::KClosest(target, n, tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Look up a contact by identifier in the routing table.
    pub async fn contact(&self, id: Id) -> Option<Contact> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetContact(id, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Number of contacts currently in the routing table.
    pub async fn table_size(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::TableSize(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn get_local(&self, key: &Id) -> Option<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetLocal(*key, tx)).await.is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    async fn store_local(&self, key: Id, value: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::StoreLocal(key, value)).await;
    }

    /// Probe `addr` for liveness.
    ///
    /// A responder is inserted into the routing table. Fails with
    /// [`Error::Unreachable`] if no matching pong arrives in time.
    pub async fn ping(&self, addr: SocketAddr) -> Result<Id> {
        let id = match timeout(self.request_timeout, self.network.ping(addr)).await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::Unreachable),
        };
        self.observe_contact(Contact::new(id, addr)).await;
        Ok(id)
    }

    /// Store `value` under the hash of `key` on the k closest nodes.
    ///
    /// Returns the identifier the value was stored under.
    pub async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<Id> {
        let id = Id::hash(key);
        self.put_at(id, value).await?;
        Ok(id)
    }

    /// Store `value` under an explicit identifier.
    ///
    /// The local node persists the value as well. With no known peers the
    /// operation degrades to a local-only store; [`Error::StoreFailed`] is
    /// returned only when replication targets existed and every RPC failed.
    pub async fn put_at(&self, key: Id, value: Vec<u8>) -> Result<()> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::Config("value exceeds the maximum storable size"));
        }

        self.store_local(key, value.clone()).await;

        let closest = match self.lookup(key, LookupMode::Contact).await {
            Ok(outcome) => outcome.contacts,
            Err(Error::NoKnownContacts) => {
                debug!(%key, "no peers known, value stored locally only");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if closest.is_empty() {
            debug!(%key, "no live peers found, value stored locally only");
            return Ok(());
        }

        let mut replications = JoinSet::new();
        for contact in closest.into_iter().take(self.k) {
            let network = self.network.clone();
            let value = value.clone();
            let request_timeout = self.request_timeout;
            replications.spawn(async move {
                match timeout(request_timeout, network.store(contact.addr, key, value)).await {
                    Ok(Ok(responder)) => Some((responder, contact.addr)),
                    Ok(Err(_)) | Err(_) => {
                        debug!(peer = %contact.id, "replication store failed");
                        None
                    }
                }
            });
        }

        let mut stored = 0usize;
        while let Some(joined) = replications.join_next().await {
            if let Ok(Some((responder, addr))) = joined {
                stored += 1;
                self.observe_contact(Contact::new(responder, addr)).await;
            }
        }

        if stored == 0 {
            return Err(Error::StoreFailed);
        }
        debug!(%key, stored, "value replicated");
        Ok(())
    }

    /// Retrieve the value under `key`.
    ///
    /// The local store is consulted first; a local hit returns with an empty
    /// contact list. Otherwise an iterative value lookup runs and returns
    /// the contacts that responded along with the value, if any node held
    /// it.
    pub async fn get(&self, key: &Id) -> Result<(Vec<Contact>, Option<Vec<u8>>)> {
        if let Some(value) = self.get_local(key).await {
            trace!(%key, "local store hit");
            return Ok((Vec::new(), Some(value)));
        }

        let outcome = self.lookup(*key, LookupMode::Value).await?;
        Ok((outcome.contacts, outcome.value))
    }

    /// Find the contacts closest to `target`.
    ///
    /// If one of them is the target itself it is surfaced as the second
    /// element.
    pub async fn find_contact(&self, target: Id) -> Result<(Vec<Contact>, Option<Contact>)> {
        let outcome = self.lookup(target, LookupMode::Contact).await?;
        let exact = outcome.contacts.iter().find(|c| c.id == target).cloned();
        Ok((outcome.contacts, exact))
    }

    /// Enter the network via a known peer: ping it, then look up our own
    /// identifier to populate the routing table with nearby contacts.
    pub async fn join(&self, bootstrap: SocketAddr) -> Result<()> {
        self.ping(bootstrap).await?;
        let _ = self.find_contact(self.id).await?;
        let table_size = self.table_size().await;
        debug!(table_size, "joined the network");
        Ok(())
    }

    /// Shut down the actor. Outstanding handles become inert.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    /// Iterative lookup: query the closest known contacts with up to
    /// `alpha` requests outstanding, merging every reply into the shortlist,
    /// until the top-k contacts have all answered or a full window of
    /// replies brings nothing closer.
    async fn lookup(&self, target: Id, mode: LookupMode) -> Result<LookupOutcome> {
        let seed = self.k_closest(target, self.k).await;
        if seed.is_empty() {
            return Err(Error::NoKnownContacts);
        }

        let mut shortlist: Vec<Candidate> = seed
            .into_iter()
            .map(|contact| Candidate {
                contact,
                state: CandidateState::Unqueried,
            })
            .collect();
        sort_by_distance(&mut shortlist, &target);

        let mut best_distance = shortlist[0].contact.id.xor_distance(&target);
        let mut resolved_since_improvement = 0usize;
        let mut in_flight = 0usize;
        let mut queries: JoinSet<(Id, SocketAddr, QueryReply)> = JoinSet::new();

        loop {
            // Stop issuing new queries once a full window of replies has
            // brought nothing closer; the remaining in-flight ones drain.
            if resolved_since_improvement < self.alpha {
                while in_flight < self.alpha {
                    let Some(pos) = next_unqueried(&shortlist, self.k) else {
                        break;
                    };
                    shortlist[pos].state = CandidateState::InFlight;
                    in_flight += 1;

                    let contact = shortlist[pos].contact.clone();
                    let network = self.network.clone();
                    let request_timeout = self.request_timeout;
                    queries.spawn(async move {
                        let reply = match mode {
                            LookupMode::Contact => {
                                match timeout(
                                    request_timeout,
                                    network.find_contact(contact.addr, target),
                                )
                                .await
                                {
                                    Ok(Ok(peers)) => QueryReply::Contacts(peers),
                                    Ok(Err(_)) | Err(_) => QueryReply::Failed,
                                }
                            }
                            LookupMode::Value => {
                                match timeout(
                                    request_timeout,
                                    network.find_value(contact.addr, target),
                                )
                                .await
                                {
                                    Ok(Ok((value, closer))) => QueryReply::Value { value, closer },
                                    Ok(Err(_)) | Err(_) => QueryReply::Failed,
                                }
                            }
                        };
                        (contact.id, contact.addr, reply)
                    });
                }
            }

            if in_flight == 0 {
                break;
            }

            let Some(joined) = queries.join_next().await else {
                break;
            };
            in_flight -= 1;
            let Ok((responder, responder_addr, reply)) = joined else {
                continue;
            };

            let (value, learned) = match reply {
                QueryReply::Failed => {
                    mark_state(&mut shortlist, &responder, CandidateState::Failed);
                    self.remove_contact(responder).await;
                    resolved_since_improvement += 1;
                    continue;
                }
                QueryReply::Contacts(peers) => (None, peers),
                QueryReply::Value { value, closer } => (value, closer),
            };

            mark_state(&mut shortlist, &responder, CandidateState::Responded);
            self.observe_contact(Contact::new(responder, responder_addr))
                .await;

            // Merge returned contacts before anything else; a value-bearing
            // response still teaches us the peers it arrived with.
            for peer in learned {
                if peer.id == self.id {
                    continue;
                }
                if shortlist.iter().any(|c| c.contact.id == peer.id) {
                    continue;
                }
                self.observe_contact(peer.into_contact()).await;
                shortlist.push(Candidate {
                    contact: peer.into_contact(),
                    state: CandidateState::Unqueried,
                });
            }
            sort_by_distance(&mut shortlist, &target);

            if let Some(value) = value {
                self.cache_forward(&shortlist, &responder, target, &value)
                    .await;
                return Ok(LookupOutcome {
                    contacts: responded_top_k(&shortlist, self.k),
                    value: Some(value),
                });
            }

            let closest = shortlist[0].contact.id.xor_distance(&target);
            if distance_cmp(&closest, &best_distance) == std::cmp::Ordering::Less {
                best_distance = closest;
                resolved_since_improvement = 0;
            } else {
                resolved_since_improvement += 1;
            }
        }

        trace!(
            %target,
            candidates = shortlist.len(),
            "iterative lookup completed"
        );
        Ok(LookupOutcome {
            contacts: responded_top_k(&shortlist, self.k),
            value: None,
        })
    }

    /// Replicate a found value to the closest responded contact that did not
    /// hold it, so the next lookup for the same key terminates a hop
    /// earlier. Fire and forget.
    async fn cache_forward(
        &self,
        shortlist: &[Candidate],
        holder: &Id,
        target: Id,
        value: &[u8],
    ) {
        let Some(nearest_miss) = shortlist
            .iter()
            .find(|c| c.state == CandidateState::Responded && &c.contact.id != holder)
        else {
            return;
        };

        let network = self.network.clone();
        let addr = nearest_miss.contact.addr;
        let value = value.to_vec();
        let request_timeout = self.request_timeout;
        tokio::spawn(async move {
            if timeout(request_timeout, network.store(addr, target, value))
                .await
                .is_err()
            {
                trace!(%addr, "cache-forward store timed out");
            }
        });
    }
}

#[async_trait]
impl<N: DhtRpc> RequestHandler for DhtNode<N> {
    async fn handle_request(&self, from: SocketAddr, request: Request) -> Option<Response> {
        let sender = Contact::new(request.sender_id(), from);
        trace!(%from, kind = request.kind(), "inbound request");

        match request {
            Request::Ping { nonce, .. } => {
                let (tx, rx) = oneshot::channel();
                self.cmd_tx
                    .send(Command::HandlePing(sender, tx))
                    .await
                    .ok()?;
                rx.await.ok()?;
                Some(Response::Pong {
                    sender_id: self.id,
                    nonce,
                })
            }
            Request::Store { key, value, .. } => {
                if value.len() > MAX_VALUE_SIZE {
                    warn!(%from, size = value.len(), "dropping oversized store request");
                    return None;
                }
                let (tx, rx) = oneshot::channel();
                self.cmd_tx
                    .send(Command::HandleStore(sender, key, value, tx))
                    .await
                    .ok()?;
                rx.await.ok()?;
                Some(Response::StoreOk {
                    sender_id: self.id,
                    key,
                })
            }
            Request::FindContact { target, .. } => {
                let (tx, rx) = oneshot::channel();
                self.cmd_tx
                    .send(Command::HandleFindContact(sender, target, tx))
                    .await
                    .ok()?;
                let contacts = rx.await.ok()?;
                Some(Response::Contacts {
                    sender_id: self.id,
                    contacts: contacts.iter().map(PeerInfo::from).collect(),
                })
            }
            Request::FindValue { target, .. } => {
                let (tx, rx) = oneshot::channel();
                self.cmd_tx
                    .send(Command::HandleFindValue(sender, target, tx))
                    .await
                    .ok()?;
                let (value, contacts) = rx.await.ok()?;
                let contacts = contacts.iter().map(PeerInfo::from).collect();
                Some(match value {
                    Some(value) => Response::FoundValue {
                        sender_id: self.id,
                        value,
                        contacts,
                    },
                    None => Response::Contacts {
                        sender_id: self.id,
                        contacts,
                    },
                })
            }
        }
    }
}

impl<N: DhtRpc> DhtActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::ObserveContact(contact) => {
                    self.observe_contact(contact);
                }
                Command::RemoveContact(id) => {
                    self.routing.remove(&id);
                }
                Command::ApplyProbeResult(probe, tail_alive) => {
                    self.routing.apply_probe_result(probe, tail_alive);
                }
                Command::KClosest(target, n, reply) => {
                    let _ = reply.send(self.routing.k_closest(&target, n));
                }
                Command::GetContact(id, reply) => {
                    let _ = reply.send(self.routing.get(&id));
                }
                Command::GetLocal(key, reply) => {
                    let _ = reply.send(self.store.get(&key));
                }
                Command::StoreLocal(key, value) => {
                    self.store.put(key, value);
                }
                Command::TableSize(reply) => {
                    let _ = reply.send(self.routing.len());
                }
                Command::HandlePing(sender, reply) => {
                    self.observe_contact(sender);
                    let _ = reply.send(());
                }
                Command::HandleStore(sender, key, value, reply) => {
                    self.observe_contact(sender);
                    self.store.put(key, value);
                    let _ = reply.send(());
                }
                Command::HandleFindContact(sender, target, reply) => {
                    self.observe_contact(sender);
                    let _ = reply.send(self.routing.k_closest(&target, self.k));
                }
                Command::HandleFindValue(sender, key, reply) => {
                    self.observe_contact(sender);
                    let value = self.store.get(&key);
                    let closest = self.routing.k_closest(&key, self.k);
                    let _ = reply.send((value, closest));
                }
                Command::Quit => {
                    break;
                }
            }
        }
    }

    /// Insert a contact, deferring the tail probe of a full bucket to a
    /// spawned task so the actor loop never waits on the network.
    fn observe_contact(&mut self, contact: Contact) {
        if contact.id == self.id {
            return;
        }

        if let Some(probe) = self.routing.insert(contact) {
            let network = self.network.clone();
            let cmd_tx = self.cmd_tx.clone();
            let request_timeout = self.request_timeout;
            tokio::spawn(async move {
                let tail_alive =
                    match timeout(request_timeout, network.ping(probe.tail.addr)).await {
                        Ok(Ok(id)) => id == probe.tail.id,
                        Ok(Err(_)) | Err(_) => false,
                    };
                let _ = cmd_tx
                    .send(Command::ApplyProbeResult(probe, tail_alive))
                    .await;
            });
        }
    }
}
