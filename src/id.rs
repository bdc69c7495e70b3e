//! Node identifiers, the XOR metric, and contacts.
//!
//! Every node and every stored value lives in the same 256-bit identifier
//! space. Closeness between identifiers is the XOR of their bytes read as a
//! big-endian unsigned integer; the routing table in [`crate::dht`] groups
//! contacts by the number of leading zero bits of that distance.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Width of an identifier in bytes.
///
/// Fixed per network: peers speaking a different width fail to decode and
/// their datagrams are dropped.
pub const ID_BYTES: usize = 32;

/// Width of an identifier in bits; also the number of routing buckets.
pub const HASH_BITS: usize = ID_BYTES * 8;

/// A node identifier or lookup target.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id([u8; ID_BYTES]);

impl Id {
    #[inline]
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Derive the identifier of an arbitrary byte key.
    ///
    /// Every node in a network must use the same hash, otherwise keys map to
    /// different points of the identifier space on different nodes.
    pub fn hash(key: &[u8]) -> Self {
        Self(*blake3::hash(key).as_bytes())
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Bytewise XOR with `other`.
    #[inline]
    pub fn xor_distance(&self, other: &Id) -> [u8; ID_BYTES] {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_BYTES {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_BYTES];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({}…)", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; ID_BYTES]> for Id {
    fn from(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }
}

/// Compare two XOR distances as big-endian unsigned integers.
pub fn distance_cmp(a: &[u8; ID_BYTES], b: &[u8; ID_BYTES]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Routing bucket index for `other` relative to `self_id`: the number of
/// leading zero bits of their XOR distance.
///
/// Callers must not pass two equal identifiers; the local node itself has no
/// bucket.
pub fn bucket_index(self_id: &Id, other: &Id) -> usize {
    debug_assert_ne!(self_id, other, "bucket index of self is undefined");
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    HASH_BITS - 1
}

/// A remote node: identifier, transport address, and when we last heard
/// from it.
///
/// Two contacts are the same node iff their identifiers are equal; a new
/// address for a known identifier is an update, not a second contact.
#[derive(Clone, Debug)]
pub struct Contact {
    pub id: Id,
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

impl Contact {
    pub fn new(id: Id, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
        }
    }

    pub fn mark_seen(&mut self) {
        self.last_seen = Instant::now();
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first_byte(b: u8) -> Id {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = b;
        Id::from_bytes(bytes)
    }

    #[test]
    fn xor_metric_is_symmetric_and_zero_on_self() {
        let a = Id::random();
        let b = Id::random();

        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&a), [0u8; ID_BYTES]);
    }

    #[test]
    fn xor_metric_respects_or_upper_bound() {
        let a = Id::random();
        let b = Id::random();
        let c = Id::random();

        let ab = a.xor_distance(&b);
        let bc = b.xor_distance(&c);
        let ac = a.xor_distance(&c);

        let mut bound = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            bound[i] = ab[i] | bc[i];
        }
        assert_ne!(
            distance_cmp(&ac, &bound),
            std::cmp::Ordering::Greater,
            "d(a,c) must not exceed d(a,b) | d(b,c)"
        );
    }

    #[test]
    fn bucket_index_counts_leading_zeros() {
        let zero = id_with_first_byte(0x00);

        assert_eq!(bucket_index(&zero, &id_with_first_byte(0x80)), 0);
        assert_eq!(bucket_index(&zero, &id_with_first_byte(0x40)), 1);
        assert_eq!(bucket_index(&zero, &id_with_first_byte(0x01)), 7);

        let mut last = [0u8; ID_BYTES];
        last[ID_BYTES - 1] = 0x01;
        assert_eq!(bucket_index(&zero, &Id::from_bytes(last)), HASH_BITS - 1);
    }

    #[test]
    fn distance_cmp_orders_big_endian() {
        let near = id_with_first_byte(0x01);
        let far = id_with_first_byte(0x80);
        let target = id_with_first_byte(0x00);

        assert_eq!(
            distance_cmp(&target.xor_distance(&near), &target.xor_distance(&far)),
            std::cmp::Ordering::Less
        );
    }

    #[test]
    fn hash_is_deterministic_and_id_width() {
        let a = Id::hash(b"hello");
        let b = Id::hash(b"hello");
        let c = Id::hash(b"world");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_bytes().len(), ID_BYTES);
    }

    #[test]
    fn hex_round_trip() {
        let id = Id::random();
        assert_eq!(Id::from_hex(&id.to_hex()).unwrap(), id);
        assert!(Id::from_hex("abcd").is_err());
    }

    #[test]
    fn contacts_are_equal_by_id_only() {
        let id = Id::random();
        let a = Contact::new(id, "127.0.0.1:6001".parse().unwrap());
        let b = Contact::new(id, "127.0.0.1:6002".parse().unwrap());

        assert_eq!(a, b);
    }
}
