use std::time::Duration;

/// How long a misbehaving peer stays banned at the socket level.
pub const MISBEHAVING_BAN_TIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Current protocol version spoken by this node.
pub const PROTOCOL_VERSION: u32 = 70015;

/// Disconnect peers that speak anything older than this.
pub const MIN_PROTO_VERSION: u32 = 70012;

/// Peers at or above this version understand `sendheaders`.
pub const SENDHEADERS_VERSION: u32 = 70012;

/// Peers at or above this version may be punished for bloom messages when we
/// do not offer the bloom service.
pub const NO_BLOOM_VERSION: u32 = 70011;

/// Maximum number of inventory entries in a single `inv`/`getdata` message.
pub const MAX_INV_SZ: usize = 50_000;

/// Maximum number of headers in a single `headers` message. A full-size
/// message signals the sender has more.
pub const MAX_HEADERS_RESULTS: usize = 2_000;

/// Maximum number of addresses in a single `addr` message.
pub const MAX_ADDR_SZ: usize = 1_000;

/// Number of block hashes a `getblocks` walk returns before asking the peer
/// to come back for more.
pub const MAX_GETBLOCKS_RESULTS: usize = 500;

/// Maximum number of block hashes queued for headers announcement before we
/// fall back to announcing only the tip by inv.
pub const MAX_BLOCKS_TO_ANNOUNCE: usize = 8;

/// Number of blocks that may be requested from a single peer at one time.
pub const MAX_BLOCKS_IN_TRANSIT_PER_PEER: usize = 16;

/// How far ahead of the last common block the download window reaches.
// Larger windows tolerate larger download speed differences between peers,
// but increase the potential degree of disordering of blocks.
pub const BLOCK_DOWNLOAD_WINDOW: u64 = 1_024;

/// A peer pinning the edge of the download window is dropped after this long.
pub const BLOCK_STALLING_TIMEOUT: u64 = 2_000; // 2 seconds

/// Per-block download timeout, in milliseconds per second of target spacing:
/// `downloading_since + spacing_secs * (BASE + PER_PEER * n)` where `n`
/// counts other peers with validated in-flight downloads.
pub const BLOCK_DOWNLOAD_TIMEOUT_BASE: u64 = 500;
/// See [`BLOCK_DOWNLOAD_TIMEOUT_BASE`].
pub const BLOCK_DOWNLOAD_TIMEOUT_PER_PEER: u64 = 100;

/// Interval between keepalive pings.
pub const PING_INTERVAL: u64 = 2 * 60 * 1_000; // 2 minutes

/// User agents longer than this are truncated before storing.
pub const MAX_SUBVERSION_LENGTH: usize = 256;

/// Reject reasons longer than this are truncated before sending.
pub const MAX_REJECT_MESSAGE_LENGTH: usize = 111;

/// Orphan transactions kept in memory, before random eviction.
pub const DEFAULT_MAX_ORPHAN_TRANSACTIONS: usize = 100;

/// Serialized orphans bigger than this are never stored.
pub const MAX_ORPHAN_TRANSACTION_SIZE: usize = 5_000;

/// Misbehavior score at which a peer is scheduled for disconnect.
pub const DEFAULT_BANSCORE_THRESHOLD: u32 = 100;

/// Direct block fetch is allowed while the tip is within this many target
/// spacings of the current time.
pub const DIRECT_FETCH_SPACING_FACTOR: u64 = 20;

/// Entries in the process-wide recent-reject filter.
pub const RECENT_REJECTS_FILTER_SIZE: usize = 120_000;
/// False-positive rate of the recent-reject filter.
pub const RECENT_REJECTS_FILTER_RATE: f64 = 0.000_001;

/// Average interval between advertisements of our own address.
pub const AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL: u64 = 24 * 60 * 60 * 1_000;

/// Average interval between `addr` broadcasts to a peer.
pub const AVG_ADDRESS_BROADCAST_INTERVAL: u64 = 30 * 1_000;

/// Average interval between transaction inventory trickles; halved for
/// outbound peers.
pub const INVENTORY_BROADCAST_INTERVAL: u64 = 5 * 1_000;

/// Transactions relayed per inventory trickle.
pub const INVENTORY_BROADCAST_MAX: usize = 35;

/// Relayed transactions stay servable through `getdata` for this long.
pub const RELAY_CACHE_EXPIRY: u64 = 15 * 60 * 1_000;

/// Re-request backoff recorded in the ask-for dedup table.
pub const ASK_FOR_RETRY_INTERVAL: u64 = 2 * 60 * 1_000;

/// Blocks older than this (by time and by equivalent proof-of-work time
/// against the best header) are not served off the active chain.
pub const HISTORICAL_BLOCK_AGE: u64 = 30 * 24 * 60 * 60; // one month, seconds

/// Age past which a block counts as historical for the outbound serving
/// limit.
pub const HISTORICAL_SERVING_AGE: u64 = 7 * 24 * 60 * 60; // one week, seconds

/// How far behind our starting height a new tip may be and still be
/// announced to a peer.
pub const ANNOUNCE_STARTING_HEIGHT_SLACK: u64 = 2_000;
