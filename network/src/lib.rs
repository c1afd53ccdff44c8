//! The boundary between the message handler and the connection layer.
//!
//! Socket I/O, framing, the address manager and the ban list live on the
//! other side of [`NetworkContext`]; the handler drives them exclusively
//! through this trait, and the connection layer drives the handler through
//! the `MessageHandler` value it is given at startup.

mod peer_index;

pub use peer_index::PeerIndex;

use ember_types::{NetAddress, NetworkMessage, ServiceFlags};
use std::time::Duration;

/// Static facts about a connection, decided when the socket was opened.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub address: NetAddress,
    /// Human-readable name for logs, usually the address string.
    pub name: String,
    pub is_inbound: bool,
    pub is_whitelist: bool,
    /// Opened only to gossip our address and leave.
    pub is_oneshot: bool,
    /// Opened only to probe liveness of an address-book entry.
    pub is_feeler: bool,
    /// Pinned by operator configuration.
    pub is_addnode: bool,
    /// Connected over a local interface.
    pub is_local: bool,
    /// Services this connection was opened for; a `version` that does not
    /// offer them gets the peer disconnected.
    pub expected_services: ServiceFlags,
}

/// Error pushing to a peer's send queue.
#[derive(Debug)]
pub struct SendError(pub String);

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "send error: {}", self.0)
    }
}

impl std::error::Error for SendError {}

/// Handle into the connection layer. Calls never block: outbound messages
/// land on a bounded per-peer queue, disconnects and bans are scheduled.
pub trait NetworkContext {
    fn send_message(&self, peer: PeerIndex, message: NetworkMessage) -> Result<(), SendError>;

    fn disconnect(&self, peer: PeerIndex, reason: &str);

    /// Ban at the socket level and disconnect.
    fn ban_peer(&self, peer: PeerIndex, duration: Duration, reason: &str);

    fn connected_peers(&self) -> Vec<PeerIndex>;

    fn peer_info(&self, peer: PeerIndex) -> Option<PeerInfo>;

    /// Whether `nonce` belongs to one of our own outbound connections; used
    /// to detect connecting to ourselves.
    fn check_incoming_nonce(&self, nonce: u64) -> bool;

    /// Nonce our side sent in `version` on this connection.
    fn local_nonce(&self, peer: PeerIndex) -> u64;

    fn local_services(&self) -> ServiceFlags;

    /// Height we report in outgoing `version` messages.
    fn local_start_height(&self) -> i64;

    /// Our best externally routable address as this peer would see it.
    fn local_address(&self, peer: PeerIndex) -> Option<NetAddress>;

    /// Keep the connection layer's notion of the chain height current.
    fn set_best_height(&self, height: u64);

    // Address manager.
    fn address_count(&self) -> usize;
    fn add_addresses(&self, addresses: Vec<NetAddress>, source: &NetAddress);
    fn mark_address_good(&self, address: &NetAddress);
    fn addresses_snapshot(&self) -> Vec<NetAddress>;
    fn is_reachable(&self, address: &NetAddress) -> bool;

    /// Whether the outbound bandwidth target is spent; `historical` asks
    /// about the budget reserved for serving old blocks.
    fn outbound_target_reached(&self, historical: bool) -> bool;

    /// The peer's send queue is over its flood threshold.
    fn send_paused(&self, peer: PeerIndex) -> bool;
}
