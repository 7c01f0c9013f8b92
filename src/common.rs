use std::net::SocketAddr;

use bincode::Options;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Process identity. Static membership is a set of these; nothing else
/// identifies a process.
pub type Address = SocketAddr;

/// Application-level value. Everything that crosses a module boundary as a
/// payload is an opaque byte string with a deterministic encoding.
pub type Opaque = Vec<u8>;

pub type MessageId = u64;

pub fn generate_id() -> MessageId {
    rand::thread_rng().gen()
}

pub type Digest = [u8; 32];

/// Digest of an encoded message, used for dedup sets and causal-past keys.
pub fn digest(bytes: &[u8]) -> Digest {
    Sha256::digest(bytes).into()
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MalformedMessage;

// providing deserialize to avoid accidentially using bincode::deserialize
// not unwrap by default: datagrams from the network may be garbage
pub fn deserialize<M: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<M, MalformedMessage> {
    bincode::DefaultOptions::new()
        .allow_trailing_bytes()
        .deserialize(bytes)
        .map_err(|_| MalformedMessage)
}

pub fn serialize<M: Serialize>(message: &M) -> Opaque {
    bincode::DefaultOptions::new()
        .serialize(message)
        .expect("message serializable")
}

/// Paxos proposal identifier, ordered lexicographically. The address part
/// breaks ties between proposers that pick the same round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot {
    pub round: u64,
    pub addr: Address,
}

/// Static membership of a run: this process plus its peers, sorted. Rank is
/// the index into the sorted member list.
#[derive(Debug, Clone)]
pub struct Membership {
    addr: Address,
    members: Vec<Address>,
}

impl Membership {
    pub fn new(addr: Address, members: impl IntoIterator<Item = Address>) -> Self {
        let mut members: Vec<_> = members.into_iter().collect();
        if !members.contains(&addr) {
            members.push(addr);
        }
        members.sort_unstable();
        members.dedup();
        Self { addr, members }
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn members(&self) -> &[Address] {
        &self.members
    }

    pub fn peers(&self) -> impl Iterator<Item = Address> + '_ {
        let addr = self.addr;
        self.members.iter().copied().filter(move |p| *p != addr)
    }

    pub fn n(&self) -> usize {
        self.members.len()
    }

    pub fn rank(&self, p: Address) -> usize {
        self.members
            .binary_search(&p)
            .expect("address in membership")
    }

    pub fn by_rank(&self, rank: usize) -> Address {
        self.members[rank]
    }

    pub fn self_rank(&self) -> usize {
        self.rank(self.addr)
    }

    pub fn max(&self) -> Address {
        *self.members.last().expect("membership not empty")
    }

    /// Quorum test, strictly more than half of the members.
    pub fn majority(&self, count: usize) -> bool {
        count * 2 > self.n()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn membership_ranks_sorted() {
        let members = Membership::new(addr(5002), [addr(5000), addr(5001), addr(5002)]);
        assert_eq!(members.n(), 3);
        assert_eq!(members.rank(addr(5000)), 0);
        assert_eq!(members.self_rank(), 2);
        assert_eq!(members.max(), addr(5002));
        assert_eq!(members.peers().count(), 2);
    }

    #[test]
    fn majority_boundaries() {
        let members = Membership::new(addr(5000), (5000..5004).map(addr));
        assert!(!members.majority(2));
        assert!(members.majority(3));
        let single = Membership::new(addr(5000), [addr(5000)]);
        assert!(single.majority(1));
    }

    #[test]
    fn ballot_order_breaks_ties_by_address() {
        let low = Ballot { round: 1, addr: addr(5000) };
        let high = Ballot { round: 1, addr: addr(5001) };
        assert!(low < high);
        assert!(high < Ballot { round: 2, addr: addr(5000) });
    }

    #[test]
    fn encoding_is_byte_equal() {
        let a = serialize(&(String::from("beb"), vec![1u8, 2, 3]));
        let b = serialize(&(String::from("beb"), vec![1u8, 2, 3]));
        assert_eq!(a, b);
        assert_eq!(digest(&a), digest(&b));
    }
}
