//! Wire messages and the bounded bincode codec.
//!
//! Every datagram carries exactly one [`Packet`]: either a request or a
//! response, tagged with the `u64` token that correlates them. Tokens are
//! chosen by the requester; a responder echoes the token back unchanged.
//!
//! All four request kinds carry the sender's identifier so the receiver can
//! refresh its routing table before answering.

use std::net::SocketAddr;

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::id::{Contact, Id};

/// Maximum size of a stored value (32 KiB).
///
/// A value must fit in a single datagram together with the packet envelope.
pub const MAX_VALUE_SIZE: usize = 32 * 1024;

/// Upper bound on a whole encoded packet, and the receive buffer size.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Contacts past this count in a single response are discarded.
pub const MAX_CONTACTS_PER_RESPONSE: usize = 64;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_PACKET_SIZE as u64)
        .with_fixint_encoding()
}

pub fn serialize_packet(packet: &Packet) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(packet)
}

/// Deserialize with the size limit enforced; use this instead of raw
/// `bincode::deserialize` for anything that arrived off the wire.
pub fn deserialize_packet(bytes: &[u8]) -> Result<Packet, bincode::Error> {
    deserialize_bounded(bytes)
}

pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// A contact as it appears on the wire: identifier and address only.
///
/// The local `last_seen` timestamp never crosses the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: Id,
    pub addr: SocketAddr,
}

impl PeerInfo {
    pub fn into_contact(self) -> Contact {
        Contact::new(self.id, self.addr)
    }
}

impl From<&Contact> for PeerInfo {
    fn from(contact: &Contact) -> Self {
        Self {
            id: contact.id,
            addr: contact.addr,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Ping {
        sender_id: Id,
        nonce: u64,
    },
    Store {
        sender_id: Id,
        key: Id,
        value: Vec<u8>,
    },
    FindContact {
        sender_id: Id,
        target: Id,
    },
    FindValue {
        sender_id: Id,
        target: Id,
    },
}

impl Request {
    pub fn sender_id(&self) -> Id {
        match self {
            Request::Ping { sender_id, .. } => *sender_id,
            Request::Store { sender_id, .. } => *sender_id,
            Request::FindContact { sender_id, .. } => *sender_id,
            Request::FindValue { sender_id, .. } => *sender_id,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Ping { .. } => "ping",
            Request::Store { .. } => "store",
            Request::FindContact { .. } => "find_contact",
            Request::FindValue { .. } => "find_value",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Pong {
        sender_id: Id,
        nonce: u64,
    },
    StoreOk {
        sender_id: Id,
        key: Id,
    },
    Contacts {
        sender_id: Id,
        contacts: Vec<PeerInfo>,
    },
    FoundValue {
        sender_id: Id,
        value: Vec<u8>,
        contacts: Vec<PeerInfo>,
    },
}

impl Response {
    pub fn sender_id(&self) -> Id {
        match self {
            Response::Pong { sender_id, .. } => *sender_id,
            Response::StoreOk { sender_id, .. } => *sender_id,
            Response::Contacts { sender_id, .. } => *sender_id,
            Response::FoundValue { sender_id, .. } => *sender_id,
        }
    }
}

/// The envelope written to the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Request { token: u64, request: Request },
    Response { token: u64, response: Response },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_round_trip_preserves_token_and_fields() {
        let packet = Packet::Request {
            token: 0xDEAD_BEEF,
            request: Request::FindValue {
                sender_id: Id::hash(b"sender"),
                target: Id::hash(b"target"),
            },
        };

        let bytes = serialize_packet(&packet).unwrap();
        let decoded = deserialize_packet(&bytes).unwrap();

        match decoded {
            Packet::Request { token, request } => {
                assert_eq!(token, 0xDEAD_BEEF);
                assert_eq!(request.sender_id(), Id::hash(b"sender"));
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn oversized_packet_is_rejected() {
        let packet = Packet::Request {
            token: 1,
            request: Request::Store {
                sender_id: Id::hash(b"sender"),
                key: Id::hash(b"key"),
                value: vec![0u8; MAX_PACKET_SIZE],
            },
        };
        assert!(serialize_packet(&packet).is_err());
    }

    #[test]
    fn garbage_input_is_rejected() {
        assert!(deserialize_packet(&[0xFF, 0x13, 0x37]).is_err());
    }

    #[test]
    fn value_response_round_trip() {
        let peer = PeerInfo {
            id: Id::hash(b"peer"),
            addr: "10.0.0.1:7000".parse().unwrap(),
        };
        let packet = Packet::Response {
            token: 7,
            response: Response::FoundValue {
                sender_id: Id::hash(b"peer"),
                value: b"payload".to_vec(),
                contacts: vec![peer],
            },
        };

        let bytes = serialize_packet(&packet).unwrap();
        match deserialize_packet(&bytes).unwrap() {
            Packet::Response {
                response: Response::FoundValue { value, contacts, .. },
                ..
            } => {
                assert_eq!(value, b"payload");
                assert_eq!(contacts.len(), 1);
                assert_eq!(contacts[0].addr, "10.0.0.1:7000".parse().unwrap());
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }
}
