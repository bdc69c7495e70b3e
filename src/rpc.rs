//! UDP messaging layer: request/response correlation over datagrams.
//!
//! Every outbound request carries a random `u64` token; the matching waiter
//! is parked in a shared pending table until the response datagram echoes
//! the token back, the request times out, or the caller goes away. A waiter
//! that is dropped for any reason removes its table entry, so abandoned
//! lookups never leak correlation state.
//!
//! The serve loop owns the receive half: responses complete their waiter,
//! requests are dispatched to the installed [`RequestHandler`] on a spawned
//! task, and anything that fails to decode is logged and dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, trace, warn};

use crate::Result;
use crate::dht::DEFAULT_REQUEST_TIMEOUT;
use crate::error::Error;
use crate::id::Id;
use crate::messages::{
    MAX_CONTACTS_PER_RESPONSE, MAX_PACKET_SIZE, MAX_VALUE_SIZE, Packet, PeerInfo, Request,
    Response, deserialize_packet, serialize_packet,
};
use crate::protocols::{DhtRpc, RequestHandler};

type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// Token-correlated DHT messaging over a UDP socket.
///
/// Implements [`DhtRpc`] for the outbound direction; call [`UdpRpc::serve`]
/// to start the receive loop and install the inbound handler.
pub struct UdpRpc {
    socket: Arc<UdpSocket>,
    self_id: Id,
    pending: PendingTable,
    request_timeout: Duration,
}

impl UdpRpc {
    pub async fn bind(addr: SocketAddr, self_id: Id) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            self_id,
            pending: Arc::new(Mutex::new(HashMap::new())),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Deadline for each outbound request.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn self_id(&self) -> Id {
        self.self_id
    }

    /// Spawn the receive loop, dispatching inbound requests to `handler`.
    ///
    /// The loop runs until the returned handle is aborted or the socket
    /// fails irrecoverably.
    pub fn serve<H: RequestHandler>(&self, handler: H) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let pending = self.pending.clone();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "udp receive failed");
                        continue;
                    }
                };

                let packet = match deserialize_packet(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!(%from, error = %e, "dropping malformed datagram");
                        continue;
                    }
                };

                match packet {
                    Packet::Response { token, response } => {
                        let waiter = lock_pending(&pending).remove(&token);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => {
                                // Late reply after timeout, or a duplicate
                                // from a retransmit. Idempotent to ignore.
                                trace!(%from, token, "response with no waiter");
                            }
                        }
                    }
                    Packet::Request { token, request } => {
                        let handler = handler.clone();
                        let socket = socket.clone();
                        tokio::spawn(async move {
                            let Some(response) = handler.handle_request(from, request).await
                            else {
                                return;
                            };
                            let packet = Packet::Response { token, response };
                            match serialize_packet(&packet) {
                                Ok(bytes) => {
                                    if let Err(e) = socket.send_to(&bytes, from).await {
                                        debug!(%from, error = %e, "failed to send reply");
                                    }
                                }
                                Err(e) => {
                                    warn!(%from, error = %e, "failed to encode reply");
                                }
                            }
                        });
                    }
                }
            }
        })
    }

    /// Send one request and wait for the matching response.
    async fn send_request(&self, to: SocketAddr, request: Request) -> Result<Response> {
        let (token, rx) = self.register_waiter();
        let _guard = WaiterGuard {
            pending: self.pending.clone(),
            token,
        };

        let packet = Packet::Request { token, request };
        let bytes =
            serialize_packet(&packet).map_err(|_| Error::Config("request does not encode"))?;
        if let Err(e) = self.socket.send_to(&bytes, to).await {
            debug!(%to, error = %e, "udp send failed");
            return Err(Error::Unreachable);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Channel closed (serve loop gone) or deadline passed; the
            // guard clears the pending entry either way.
            Ok(Err(_)) | Err(_) => Err(Error::Unreachable),
        }
    }

    fn register_waiter(&self) -> (u64, oneshot::Receiver<Response>) {
        let mut pending = lock_pending(&self.pending);
        let token = loop {
            let candidate: u64 = rand::random();
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        let (tx, rx) = oneshot::channel();
        pending.insert(token, tx);
        (token, rx)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        lock_pending(&self.pending).len()
    }
}

fn lock_pending(
    pending: &PendingTable,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Response>>> {
    // The table is only touched for insert/remove; a poisoned lock means a
    // panic mid-operation, which is already fatal for the process.
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes the pending entry when the requester goes away, whether by
/// timeout, cancellation, or normal completion.
struct WaiterGuard {
    pending: PendingTable,
    token: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.token);
    }
}

fn truncate_contacts(mut contacts: Vec<PeerInfo>, from: SocketAddr) -> Vec<PeerInfo> {
    if contacts.len() > MAX_CONTACTS_PER_RESPONSE {
        warn!(
            %from,
            count = contacts.len(),
            max = MAX_CONTACTS_PER_RESPONSE,
            "peer returned too many contacts, truncating"
        );
        contacts.truncate(MAX_CONTACTS_PER_RESPONSE);
    }
    contacts
}

#[async_trait]
impl DhtRpc for UdpRpc {
    async fn ping(&self, to: SocketAddr) -> Result<Id> {
        let nonce: u64 = rand::random();
        let request = Request::Ping {
            sender_id: self.self_id,
            nonce,
        };
        match self.send_request(to, request).await? {
            Response::Pong {
                sender_id,
                nonce: echoed,
            } if echoed == nonce => Ok(sender_id),
            // A wrong nonce or reply shape is a failed ping, same as silence.
            _ => {
                debug!(%to, "ping reply did not match, treating as unreachable");
                Err(Error::Unreachable)
            }
        }
    }

    async fn store(&self, to: SocketAddr, key: Id, value: Vec<u8>) -> Result<Id> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::Config("value exceeds the maximum storable size"));
        }
        let request = Request::Store {
            sender_id: self.self_id,
            key,
            value,
        };
        match self.send_request(to, request).await? {
            Response::StoreOk {
                sender_id,
                key: acked,
            } if acked == key => Ok(sender_id),
            _ => Err(Error::Config("unexpected reply to store")),
        }
    }

    async fn find_contact(&self, to: SocketAddr, target: Id) -> Result<Vec<PeerInfo>> {
        let request = Request::FindContact {
            sender_id: self.self_id,
            target,
        };
        match self.send_request(to, request).await? {
            Response::Contacts { contacts, .. } => Ok(truncate_contacts(contacts, to)),
            _ => Err(Error::Config("unexpected reply to find_contact")),
        }
    }

    async fn find_value(
        &self,
        to: SocketAddr,
        target: Id,
    ) -> Result<(Option<Vec<u8>>, Vec<PeerInfo>)> {
        let request = Request::FindValue {
            sender_id: self.self_id,
            target,
        };
        match self.send_request(to, request).await? {
            Response::FoundValue {
                value, contacts, ..
            } => Ok((Some(value), truncate_contacts(contacts, to))),
            Response::Contacts { contacts, .. } => Ok((None, truncate_contacts(contacts, to))),
            _ => Err(Error::Config("unexpected reply to find_value")),
        }
    }
}
