use crate::bloom::BloomFilter;
use crate::core::{Block, Header, ServiceTransaction, Transaction};
use crate::merkle_block::MerkleBlock;
use bitflags::bitflags;
use ckb_fixed_hash::H256;
use std::net::{IpAddr, SocketAddr};

bitflags! {
    /// Services a node advertises in its version message and address gossip.
    pub struct ServiceFlags: u64 {
        const NONE    = 0;
        /// Serves full blocks.
        const NETWORK = 1;
        /// Accepts bloom-filtered connections.
        const BLOOM   = 1 << 2;
    }
}

impl Default for ServiceFlags {
    fn default() -> Self {
        ServiceFlags::NONE
    }
}

/// A gossiped peer address: endpoint, advertised services, last-seen time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetAddress {
    pub addr: SocketAddr,
    pub services: ServiceFlags,
    /// Seconds since the epoch, as claimed by whoever gossiped it.
    pub time: u64,
}

impl NetAddress {
    pub fn new(addr: SocketAddr, services: ServiceFlags, time: u64) -> Self {
        NetAddress {
            addr,
            services,
            time,
        }
    }

    /// Stable key for dedup filters and relay hashing.
    pub fn key(&self) -> Vec<u8> {
        let mut key = match self.addr.ip() {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        key.extend_from_slice(&self.addr.port().to_be_bytes());
        key
    }

    /// Whether the address is globally addressable. Loopback, private and
    /// unspecified ranges never leave the local network.
    pub fn is_routable(&self) -> bool {
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                !(ip.is_loopback()
                    || ip.is_private()
                    || ip.is_unspecified()
                    || ip.is_link_local()
                    || ip.is_broadcast())
            }
            IpAddr::V6(ip) => !(ip.is_loopback() || ip.is_unspecified()),
        }
    }
}

/// Inventory item kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InvKind {
    Block,
    FilteredBlock,
    Tx,
    Stx,
}

/// A typed hash announcement.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: H256,
}

impl Inv {
    pub fn new(kind: InvKind, hash: H256) -> Self {
        Inv { kind, hash }
    }

    pub fn block(hash: H256) -> Self {
        Inv::new(InvKind::Block, hash)
    }

    pub fn tx(hash: H256) -> Self {
        Inv::new(InvKind::Tx, hash)
    }

    pub fn stx(hash: H256) -> Self {
        Inv::new(InvKind::Stx, hash)
    }
}

impl std::fmt::Display for Inv {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?} {:#x}", self.kind, self.hash)
    }
}

/// Reject message codes. `Internal` marks local-only rejections that must
/// never cross the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Dust,
    InsufficientFee,
    Checkpoint,
    Internal,
}

impl RejectCode {
    /// Byte value on the wire; `None` for local-only codes.
    pub fn to_byte(self) -> Option<u8> {
        match self {
            RejectCode::Malformed => Some(0x01),
            RejectCode::Invalid => Some(0x10),
            RejectCode::Obsolete => Some(0x11),
            RejectCode::Duplicate => Some(0x12),
            RejectCode::Nonstandard => Some(0x40),
            RejectCode::Dust => Some(0x41),
            RejectCode::InsufficientFee => Some(0x42),
            RejectCode::Checkpoint => Some(0x43),
            RejectCode::Internal => None,
        }
    }

    /// Whether this code may be sent to a peer.
    pub fn is_wire_visible(self) -> bool {
        self.to_byte().is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reject {
    /// Command the rejection refers to.
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
    pub hash: Option<H256>,
}

/// Payload of a `version` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: u32,
    pub services: ServiceFlags,
    /// Sender clock, seconds since the epoch.
    pub timestamp: i64,
    pub receiver: NetAddress,
    pub sender: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i64,
    pub relay: bool,
}

/// A fully parsed peer message. The connection layer owns framing; the
/// message handler only ever sees these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkMessage {
    Version(VersionPayload),
    Verack,
    Addr(Vec<NetAddress>),
    Inv(Vec<Inv>),
    GetData(Vec<Inv>),
    GetBlocks {
        locator: Vec<H256>,
        hash_stop: H256,
    },
    GetHeaders {
        locator: Vec<H256>,
        hash_stop: H256,
    },
    Tx(Transaction),
    Stx(ServiceTransaction),
    Headers(Vec<Header>),
    Block(Block),
    GetAddr,
    Mempool,
    Ping(u64),
    Pong(u64),
    FilterLoad(BloomFilter),
    FilterAdd(Vec<u8>),
    FilterClear,
    Reject(Reject),
    SendHeaders,
    NotFound(Vec<Inv>),
    MerkleBlock(MerkleBlock),
}

impl NetworkMessage {
    /// The 12-byte ASCII command this message travels under.
    pub fn command(&self) -> &'static str {
        match self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::Verack => "verack",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::GetBlocks { .. } => "getblocks",
            NetworkMessage::GetHeaders { .. } => "getheaders",
            NetworkMessage::Tx(_) => "tx",
            NetworkMessage::Stx(_) => "stx",
            NetworkMessage::Headers(_) => "headers",
            NetworkMessage::Block(_) => "block",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::Mempool => "mempool",
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
            NetworkMessage::FilterLoad(_) => "filterload",
            NetworkMessage::FilterAdd(_) => "filteradd",
            NetworkMessage::FilterClear => "filterclear",
            NetworkMessage::Reject(_) => "reject",
            NetworkMessage::SendHeaders => "sendheaders",
            NetworkMessage::NotFound(_) => "notfound",
            NetworkMessage::MerkleBlock(_) => "merkleblock",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routable_addresses() {
        let mk = |ip: &str| {
            NetAddress::new(
                format!("{}:31469", ip).parse().unwrap(),
                ServiceFlags::NETWORK,
                0,
            )
        };
        assert!(mk("8.8.8.8").is_routable());
        assert!(!mk("127.0.0.1").is_routable());
        assert!(!mk("192.168.1.9").is_routable());
        assert!(!mk("0.0.0.0").is_routable());
    }

    #[test]
    fn address_keys_differ_by_port() {
        let a = NetAddress::new("8.8.8.8:1".parse().unwrap(), ServiceFlags::NONE, 0);
        let b = NetAddress::new("8.8.8.8:2".parse().unwrap(), ServiceFlags::NONE, 0);
        assert_ne!(a.key(), b.key());
    }
}
