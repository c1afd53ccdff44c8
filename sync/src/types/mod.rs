use crate::config::SyncConfig;
use crate::filter::{KnownFilter, RecentRejects, INV_KNOWN_BUCKETS};
use crate::net_time_checker::NetTimeChecker;
use crate::orphan_tx_pool::OrphanTxPool;
use crate::pending_stx_pool::PendingStxPool;
use crate::provider::ChainProvider;
use crate::relay_cache::RelayCache;
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use ember_constant::sync::ASK_FOR_RETRY_INTERVAL;
use ember_network::{PeerIndex, PeerInfo};
use ember_types::{
    Block, BloomFilter, Header, Inv, NetAddress, RejectCode, ServiceFlags, H256, U256,
};
use faketime::unix_time_as_millis;
use keyed_priority_queue::KeyedPriorityQueue;
use log::{debug, info};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::cmp;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

const ALREADY_ASKED_FOR_SIZE: usize = 50_000;

/// A header together with its height and cumulative work, the unit of
/// chain navigation everywhere in this crate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderView {
    inner: Header,
    hash: H256,
    height: u64,
    total_work: U256,
}

impl HeaderView {
    pub fn new(inner: Header, height: u64, total_work: U256) -> Self {
        let hash = inner.hash();
        HeaderView {
            inner,
            hash,
            height,
            total_work,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn hash(&self) -> &H256 {
        &self.hash
    }

    pub fn parent_hash(&self) -> &H256 {
        &self.inner.parent_hash
    }

    /// Header timestamp, seconds.
    pub fn timestamp(&self) -> u64 {
        self.inner.timestamp
    }

    pub fn total_work(&self) -> &U256 {
        &self.total_work
    }

    pub fn inner(&self) -> &Header {
        &self.inner
    }

    pub fn into_inner(self) -> Header {
        self.inner
    }

    pub fn is_better_than(&self, total_work: &U256) -> bool {
        self.total_work() > total_work
    }
}

/// Facts about the connection that never change while it lives.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerFlags {
    pub is_inbound: bool,
    pub is_whitelist: bool,
    pub is_oneshot: bool,
    pub is_feeler: bool,
    pub is_addnode: bool,
    pub is_local: bool,
}

impl From<&PeerInfo> for PeerFlags {
    fn from(info: &PeerInfo) -> Self {
        PeerFlags {
            is_inbound: info.is_inbound,
            is_whitelist: info.is_whitelist,
            is_oneshot: info.is_oneshot,
            is_feeler: info.is_feeler,
            is_addnode: info.is_addnode,
            is_local: info.is_local,
        }
    }
}

/// Version handshake progress and what it negotiated.
#[derive(Clone, Debug, Default)]
pub struct PeerHandshake {
    /// Protocol version the peer announced; zero until `version` arrives.
    pub version: u32,
    /// Version we serialize messages with: `min(remote, ours)`.
    pub send_version: u32,
    pub services: ServiceFlags,
    pub start_height: i64,
    pub user_agent: String,
    /// The peer wants transaction relay (version relay flag, later
    /// overridden by filter messages).
    pub relay_txs: bool,
    /// Verack received, handshake complete.
    pub successfully_connected: bool,
    /// Outbound connection that completed the handshake; its address-book
    /// entry gets its timestamp refreshed on disconnect.
    pub currently_connected: bool,
    pub prefer_headers: bool,
    /// We sent `getaddr` and are expecting a flood.
    pub getaddr_sent: bool,
    /// The one allowed `getaddr` reply has been spent.
    pub getaddr_served: bool,
    pub time_offset: i64,
}

/// Header-sync progress for one peer.
#[derive(Clone, Debug, Default)]
pub struct PeerSync {
    pub sync_started: bool,
    pub preferred_download: bool,
    /// Best header this peer is known to have.
    pub best_known_header: Option<HeaderView>,
    /// Hash the peer announced that we could not resolve yet.
    pub last_unknown_block_hash: Option<H256>,
    /// Highest block both sides are known to have.
    pub last_common_header: Option<HeaderView>,
    /// Last header we sent this peer in an announcement.
    pub best_header_sent: Option<HeaderView>,
}

/// Deadline-ordered entry of the per-peer ask-for queue; earliest deadline
/// pops first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AskForPriority {
    pub deadline: u64,
}

impl Ord for AskForPriority {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.deadline.cmp(&other.deadline).reverse()
    }
}

impl PartialOrd for AskForPriority {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Outbound gossip queues and dedup filters.
pub struct PeerGossip {
    pub known_addrs: KnownFilter,
    pub known_inv: KnownFilter,
    /// Service data this peer has been served or announced.
    pub service_data_known: KnownFilter,
    pub addrs_to_send: Vec<NetAddress>,
    pub tx_to_send: BTreeSet<H256>,
    pub stx_to_send: BTreeSet<H256>,
    pub blocks_to_send: Vec<H256>,
    pub block_hashes_to_announce: Vec<H256>,
    pub ask_for: KeyedPriorityQueue<Inv, AskForPriority>,
    pub recv_get_data: VecDeque<Inv>,
    /// Resume point of a truncated `getblocks` walk.
    pub continue_hash: Option<H256>,
    pub next_addr_send: u64,
    pub next_local_addr_send: u64,
    pub next_inv_send: u64,
}

impl Default for PeerGossip {
    fn default() -> Self {
        PeerGossip {
            known_addrs: KnownFilter::default(),
            known_inv: KnownFilter::new(INV_KNOWN_BUCKETS),
            service_data_known: KnownFilter::default(),
            addrs_to_send: Vec::new(),
            tx_to_send: BTreeSet::new(),
            stx_to_send: BTreeSet::new(),
            blocks_to_send: Vec::new(),
            block_hashes_to_announce: Vec::new(),
            ask_for: KeyedPriorityQueue::new(),
            recv_get_data: VecDeque::new(),
            continue_hash: None,
            next_addr_send: 0,
            next_local_addr_send: 0,
            next_inv_send: 0,
        }
    }
}

/// Ping bookkeeping. Times are milliseconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerPing {
    /// Nonce of the outstanding ping; zero when none.
    pub nonce_sent: u64,
    pub started_at: u64,
    pub rtt: Option<u64>,
    pub min_rtt: Option<u64>,
    /// An RPC asked for a ping on the next send pass.
    pub queued: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PeerMisbehavior {
    pub score: u32,
    pub should_disconnect: bool,
}

/// A reject reply waiting for the next flush.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedReject {
    pub command: &'static str,
    pub code: RejectCode,
    pub reason: String,
    pub hash: H256,
}

/// Everything this subsystem knows about one peer. Created on attach,
/// destroyed on detach; per-peer in-flight download state lives in
/// [`InflightBlocks`] instead so the registry stays globally consistent.
pub struct PeerState {
    pub flags: PeerFlags,
    pub address: NetAddress,
    pub name: String,
    pub handshake: PeerHandshake,
    pub sync: PeerSync,
    pub gossip: PeerGossip,
    pub ping: PeerPing,
    pub misbehavior: PeerMisbehavior,
    pub rejects: Vec<QueuedReject>,
    /// BIP37 filter uploaded by the peer, if any.
    pub bloom_filter: Option<BloomFilter>,
}

impl PeerState {
    pub fn new(flags: PeerFlags, address: NetAddress, name: String) -> PeerState {
        PeerState {
            flags,
            address,
            name,
            handshake: PeerHandshake::default(),
            sync: PeerSync::default(),
            gossip: PeerGossip::default(),
            ping: PeerPing::default(),
            misbehavior: PeerMisbehavior::default(),
            rejects: Vec::new(),
            bloom_filter: None,
        }
    }

    /// The peer cannot serve us blocks (did not offer the network service).
    pub fn is_client(&self) -> bool {
        !self.handshake.services.contains(ServiceFlags::NETWORK)
    }
}

/// Per-peer scoreboard plus the global counters whose sums the scoreboard
/// must match.
#[derive(Default)]
pub struct Peers {
    pub state: DashMap<PeerIndex, PeerState>,
    pub n_sync_started: AtomicUsize,
    pub n_preferred_download: AtomicUsize,
}

impl Peers {
    pub fn attach(&self, peer: PeerIndex, info: &PeerInfo) {
        let flags = PeerFlags::from(info);
        self.state.insert(
            peer,
            PeerState::new(flags, info.address.clone(), info.name.clone()),
        );
    }

    /// Remove the peer, returning its final state for the caller to unwind
    /// counters and cross-references.
    pub fn detach(&self, peer: PeerIndex) -> Option<PeerState> {
        let (_, state) = self.state.remove(&peer)?;
        if state.sync.sync_started {
            assert_ne!(
                self.n_sync_started.fetch_sub(1, Ordering::AcqRel),
                0,
                "n_sync_started underflow on detach"
            );
        }
        if state.sync.preferred_download {
            assert_ne!(
                self.n_preferred_download.fetch_sub(1, Ordering::AcqRel),
                0,
                "n_preferred_download underflow on detach"
            );
        }
        Some(state)
    }

    /// Add to a peer's misbehavior score. Crossing the threshold (and only
    /// crossing it) schedules a disconnect.
    pub fn misbehave(&self, peer: PeerIndex, delta: u32, reason: &str, banscore: u32) {
        if delta == 0 {
            return;
        }
        if let Some(mut state) = self.state.get_mut(&peer) {
            let before = state.misbehavior.score;
            let after = before + delta;
            state.misbehavior.score = after;
            if after >= banscore && before < banscore {
                state.misbehavior.should_disconnect = true;
                info!(
                    target: "net",
                    "misbehaving: {} peer={} ({} -> {}) reason: {} ban threshold exceeded",
                    state.name, peer, before, after, reason
                );
            } else {
                debug!(
                    target: "net",
                    "misbehaving: {} peer={} ({} -> {}) reason: {}",
                    state.name, peer, before, after, reason
                );
            }
        }
    }

    /// Recompute the peer's preferred-download flag, keeping the global
    /// counter in step.
    pub fn update_preferred_download(&self, peer: PeerIndex) {
        if let Some(mut state) = self.state.get_mut(&peer) {
            let preferred = (!state.flags.is_inbound || state.flags.is_whitelist)
                && !state.flags.is_oneshot
                && !state.is_client();
            if preferred != state.sync.preferred_download {
                state.sync.preferred_download = preferred;
                if preferred {
                    self.n_preferred_download.fetch_add(1, Ordering::AcqRel);
                } else {
                    assert_ne!(
                        self.n_preferred_download.fetch_sub(1, Ordering::AcqRel),
                        0,
                        "n_preferred_download underflow"
                    );
                }
            }
        }
    }

    pub fn mark_sync_started(&self, peer: PeerIndex) {
        if let Some(mut state) = self.state.get_mut(&peer) {
            if !state.sync.sync_started {
                state.sync.sync_started = true;
                self.n_sync_started.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    pub fn get_best_known_header(&self, peer: PeerIndex) -> Option<HeaderView> {
        self.state
            .get(&peer)
            .and_then(|state| state.sync.best_known_header.clone())
    }

    /// Replace the best-known header when the new one carries at least as
    /// much work.
    pub fn may_set_best_known_header(&self, peer: PeerIndex, header_view: HeaderView) {
        if let Some(mut state) = self.state.get_mut(&peer) {
            match state.sync.best_known_header {
                Some(ref best) if header_view.total_work() < best.total_work() => {}
                _ => state.sync.best_known_header = Some(header_view),
            }
        }
    }

    pub fn get_last_common_header(&self, peer: PeerIndex) -> Option<HeaderView> {
        self.state
            .get(&peer)
            .and_then(|state| state.sync.last_common_header.clone())
    }

    pub fn set_last_common_header(&self, peer: PeerIndex, header: HeaderView) {
        if let Some(mut state) = self.state.get_mut(&peer) {
            state.sync.last_common_header = Some(header);
        }
    }

    pub fn should_disconnect(&self, peer: PeerIndex) -> bool {
        self.state
            .get(&peer)
            .map(|state| state.misbehavior.should_disconnect)
            .unwrap_or(false)
    }
}

/// One requested block in a peer's download pipeline.
#[derive(Clone, Debug)]
pub struct BlockInFlight {
    pub hash: H256,
    /// Index entry when the request came from validated headers; direct
    /// fetches carry none.
    pub header: Option<HeaderView>,
    pub validated_header: bool,
}

#[derive(Default, Debug)]
struct PeerDownloadState {
    /// Request order is preserved; the head entry gates the download timeout.
    blocks: Vec<BlockInFlight>,
    valid_headers_count: usize,
    downloading_since: u64,
    /// Zero when the peer is not suspected of stalling the window.
    stalling_since: u64,
}

/// Process-wide registry of requested-but-not-received blocks. A hash lives
/// in exactly one peer's list and the owner map at any time, so a block can
/// never be assigned to two peers.
#[derive(Default)]
pub struct InflightBlocks {
    download_states: HashMap<PeerIndex, PeerDownloadState>,
    owners: HashMap<H256, PeerIndex>,
    peers_with_validated_downloads: usize,
}

impl InflightBlocks {
    pub fn contains(&self, hash: &H256) -> bool {
        self.owners.contains_key(hash)
    }

    pub fn owner(&self, hash: &H256) -> Option<PeerIndex> {
        self.owners.get(hash).copied()
    }

    pub fn total_inflight_count(&self) -> usize {
        self.owners.len()
    }

    pub fn peer_inflight_count(&self, peer: PeerIndex) -> usize {
        self.download_states
            .get(&peer)
            .map(|state| state.blocks.len())
            .unwrap_or(0)
    }

    pub fn peer_valid_headers_count(&self, peer: PeerIndex) -> usize {
        self.download_states
            .get(&peer)
            .map(|state| state.valid_headers_count)
            .unwrap_or(0)
    }

    pub fn peers_with_validated_downloads(&self) -> usize {
        self.peers_with_validated_downloads
    }

    pub fn downloading_since(&self, peer: PeerIndex) -> Option<u64> {
        self.download_states
            .get(&peer)
            .filter(|state| !state.blocks.is_empty())
            .map(|state| state.downloading_since)
    }

    pub fn first_in_flight(&self, peer: PeerIndex) -> Option<&BlockInFlight> {
        self.download_states
            .get(&peer)
            .and_then(|state| state.blocks.first())
    }

    pub fn stalling_since(&self, peer: PeerIndex) -> u64 {
        self.download_states
            .get(&peer)
            .map(|state| state.stalling_since)
            .unwrap_or(0)
    }

    /// Start the stall clock if it is not already running.
    pub fn mark_stalling(&mut self, peer: PeerIndex, now: u64) {
        let state = self.download_states.entry(peer).or_default();
        if state.stalling_since == 0 {
            state.stalling_since = now;
            debug!(target: "sync", "stall started peer={}", peer);
        }
    }

    /// Record a request. Returns false when the block is already owned by
    /// some peer (including this one).
    pub fn insert(&mut self, peer: PeerIndex, hash: H256, header: Option<HeaderView>) -> bool {
        if self.owners.contains_key(&hash) {
            return false;
        }
        self.owners.insert(hash.clone(), peer);
        let state = self.download_states.entry(peer).or_default();
        let validated_header = header.is_some();
        if state.blocks.is_empty() {
            state.downloading_since = unix_time_as_millis();
        }
        if validated_header {
            state.valid_headers_count += 1;
            if state.valid_headers_count == 1 {
                self.peers_with_validated_downloads += 1;
            }
        }
        state.blocks.push(BlockInFlight {
            hash,
            header,
            validated_header,
        });
        true
    }

    /// A block arrived (or its request is being released). Returns the peer
    /// it was in flight from, if any.
    pub fn mark_received(&mut self, hash: &H256) -> Option<PeerIndex> {
        let peer = self.owners.remove(hash)?;
        let now = unix_time_as_millis();
        let mut drop_peer_entry = false;
        if let Some(state) = self.download_states.get_mut(&peer) {
            if let Some(position) = state.blocks.iter().position(|entry| &entry.hash == hash) {
                let entry = state.blocks.remove(position);
                if entry.validated_header {
                    state.valid_headers_count -= 1;
                    if state.valid_headers_count == 0 {
                        self.peers_with_validated_downloads -= 1;
                    }
                }
                if position == 0 {
                    // Head of the queue arrived; restart the clock for the
                    // next one.
                    state.downloading_since = cmp::max(state.downloading_since, now);
                }
            }
            state.stalling_since = 0;
            drop_peer_entry = state.blocks.is_empty();
        }
        if drop_peer_entry {
            self.download_states.remove(&peer);
        }
        Some(peer)
    }

    /// Release everything a detaching peer held.
    pub fn remove_by_peer(&mut self, peer: PeerIndex) -> bool {
        self.download_states
            .remove(&peer)
            .map(|state| {
                for entry in &state.blocks {
                    self.owners.remove(&entry.hash);
                }
                if state.valid_headers_count > 0 {
                    self.peers_with_validated_downloads -= 1;
                }
            })
            .is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty() && self.download_states.is_empty()
    }

    /// Registry-wide invariants, checked when the last peer detaches and by
    /// tests: ownership is mutual and counters match their sums.
    pub fn is_consistent(&self) -> bool {
        let forward = self.owners.iter().all(|(hash, peer)| {
            self.download_states
                .get(peer)
                .map(|state| state.blocks.iter().any(|entry| &entry.hash == hash))
                .unwrap_or(false)
        });
        let backward = self.download_states.iter().all(|(peer, state)| {
            state.valid_headers_count
                == state
                    .blocks
                    .iter()
                    .filter(|entry| entry.validated_header)
                    .count()
                && state
                    .blocks
                    .iter()
                    .all(|entry| self.owners.get(&entry.hash) == Some(peer))
        });
        let validated = self.peers_with_validated_downloads
            == self
                .download_states
                .values()
                .filter(|state| state.valid_headers_count > 0)
                .count();
        forward && backward && validated
    }
}

/// State shared by the dispatcher, the send scheduler and the validation
/// listener.
pub struct SyncState {
    peers: Peers,
    inflight_blocks: RwLock<InflightBlocks>,
    /// Origin of blocks handed to validation: peer plus whether a rejection
    /// should punish it (unsolicited whitelisted blocks do not).
    block_source: Mutex<HashMap<H256, (PeerIndex, bool)>>,
    orphan_pool: OrphanTxPool,
    recent_rejects: Mutex<RecentRejects>,
    relay_cache: Mutex<RelayCache>,
    pending_stx: PendingStxPool,
    already_asked_for: Mutex<LruCache<Inv, u64>>,
    most_recent_block: ArcSwapOption<(H256, Block)>,
    highest_fast_announce: AtomicU64,
    net_time: Mutex<NetTimeChecker>,
    /// Keys of the deterministic address-relay hasher, fixed per process.
    addr_relay_key: (u64, u64),
    config: SyncConfig,
    interrupt: AtomicBool,
}

impl SyncState {
    pub fn new(config: SyncConfig) -> SyncState {
        SyncState {
            peers: Peers::default(),
            inflight_blocks: RwLock::new(InflightBlocks::default()),
            block_source: Mutex::new(HashMap::new()),
            orphan_pool: OrphanTxPool::new(),
            recent_rejects: Mutex::new(RecentRejects::new()),
            relay_cache: Mutex::new(RelayCache::new()),
            pending_stx: PendingStxPool::new(),
            already_asked_for: Mutex::new(LruCache::new(ALREADY_ASKED_FOR_SIZE)),
            most_recent_block: ArcSwapOption::const_empty(),
            highest_fast_announce: AtomicU64::new(0),
            net_time: Mutex::new(NetTimeChecker::default()),
            addr_relay_key: (rand::random(), rand::random()),
            config,
            interrupt: AtomicBool::new(false),
        }
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn orphan_pool(&self) -> &OrphanTxPool {
        &self.orphan_pool
    }

    pub fn pending_stx(&self) -> &PendingStxPool {
        &self.pending_stx
    }

    pub fn read_inflight_blocks(&self) -> parking_lot::RwLockReadGuard<'_, InflightBlocks> {
        self.inflight_blocks.read()
    }

    pub fn write_inflight_blocks(&self) -> parking_lot::RwLockWriteGuard<'_, InflightBlocks> {
        self.inflight_blocks.write()
    }

    pub fn recent_rejects(&self) -> parking_lot::MutexGuard<'_, RecentRejects> {
        self.recent_rejects.lock()
    }

    pub fn relay_cache(&self) -> parking_lot::MutexGuard<'_, RelayCache> {
        self.relay_cache.lock()
    }

    pub fn net_time(&self) -> parking_lot::MutexGuard<'_, NetTimeChecker> {
        self.net_time.lock()
    }

    pub fn addr_relay_key(&self) -> (u64, u64) {
        self.addr_relay_key
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    /// Ask handlers to wind down promptly; in-progress batches stop between
    /// items.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    pub fn misbehave(&self, peer: PeerIndex, delta: u32, reason: &str) {
        self.peers
            .misbehave(peer, delta, reason, self.config.banscore);
    }

    pub fn queue_reject(
        &self,
        peer: PeerIndex,
        command: &'static str,
        code: RejectCode,
        reason: String,
        hash: H256,
    ) {
        use ember_constant::sync::MAX_REJECT_MESSAGE_LENGTH;
        let mut reason = reason;
        reason.truncate(MAX_REJECT_MESSAGE_LENGTH);
        if let Some(mut state) = self.peers.state.get_mut(&peer) {
            state.rejects.push(QueuedReject {
                command,
                code,
                reason,
                hash,
            });
        }
    }

    pub fn record_block_source(&self, hash: &H256, peer: PeerIndex, punish: bool) {
        self.block_source
            .lock()
            .insert(hash.clone(), (peer, punish));
    }

    pub fn take_block_source(&self, hash: &H256) -> Option<(PeerIndex, bool)> {
        self.block_source.lock().remove(hash)
    }

    pub fn clear_block_sources_for(&self, peer: PeerIndex) {
        self.block_source
            .lock()
            .retain(|_, (source, _)| *source != peer);
    }

    pub fn block_source_len(&self) -> usize {
        self.block_source.lock().len()
    }

    /// Queue a transaction announcement to every connected peer; the known
    /// filter dedups at send time.
    pub fn relay_transaction(&self, hash: &H256) {
        for mut entry in self.peers.state.iter_mut() {
            entry.gossip.tx_to_send.insert(hash.clone());
        }
    }

    pub fn relay_service_transaction(&self, hash: &H256) {
        for mut entry in self.peers.state.iter_mut() {
            entry.gossip.stx_to_send.insert(hash.clone());
        }
    }

    /// Schedule a `getdata` for `inv` from this peer. A hash another peer
    /// was already asked for gets a deadline one retry interval out.
    pub fn ask_for(&self, state: &mut PeerState, inv: Inv, now: u64) {
        let mut asked = self.already_asked_for.lock();
        let deadline = match asked.get(&inv) {
            Some(last) => cmp::max(now, last + ASK_FOR_RETRY_INTERVAL),
            None => now,
        };
        asked.put(inv.clone(), deadline);
        if state.gossip.ask_for.get_priority(&inv).is_none() {
            state.gossip.ask_for.push(inv, AskForPriority { deadline });
        }
    }

    pub fn forget_asked_for(&self, inv: &Inv) {
        self.already_asked_for.lock().pop(inv);
    }

    pub fn most_recent_block(&self) -> Option<Arc<(H256, Block)>> {
        self.most_recent_block.load_full()
    }

    pub fn set_most_recent_block(&self, hash: H256, block: Block) {
        self.most_recent_block.store(Some(Arc::new((hash, block))));
    }

    /// Monotonic watermark gating the fast-announce path; returns whether
    /// `height` advanced it.
    pub fn advance_fast_announce_height(&self, height: u64) -> bool {
        self.highest_fast_announce
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if height > current {
                    Some(height)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

/// Chain access plus sync state, the package every component works against.
pub struct SyncShared<C> {
    chain: Arc<C>,
    state: SyncState,
}

impl<C> SyncShared<C> {
    pub fn new(chain: Arc<C>, config: SyncConfig) -> SyncShared<C> {
        SyncShared {
            chain,
            state: SyncState::new(config),
        }
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }
}

impl<C: ChainProvider> SyncShared<C> {
    /// Ancestor of `base` at `height`, following parents with a main-chain
    /// shortcut.
    pub fn get_ancestor(&self, base: &H256, height: u64) -> Option<HeaderView> {
        let mut current = self.chain.get_header_view(base)?;
        if height > current.height() {
            return None;
        }
        while current.height() > height {
            if self.chain.is_main_chain(current.hash()) {
                return self
                    .chain
                    .get_block_hash(height)
                    .and_then(|hash| self.chain.get_header_view(&hash));
            }
            let parent = current.parent_hash().clone();
            current = self.chain.get_header_view(&parent)?;
        }
        Some(current)
    }

    /// Deepest header both chains contain.
    pub fn last_common_ancestor(&self, pa: &HeaderView, pb: &HeaderView) -> Option<HeaderView> {
        let (mut m_left, mut m_right) = if pa.height() > pb.height() {
            (pb.clone(), pa.clone())
        } else {
            (pa.clone(), pb.clone())
        };
        let right_base = m_right.hash().clone();
        m_right = self.get_ancestor(&right_base, m_left.height())?;
        if m_left == m_right {
            return Some(m_left);
        }
        debug_assert!(m_left.height() == m_right.height());
        while m_left != m_right {
            if m_left.height() == 0 {
                return None;
            }
            let left_base = m_left.hash().clone();
            let right_base = m_right.hash().clone();
            m_left = self.get_ancestor(&left_base, m_left.height() - 1)?;
            m_right = self.get_ancestor(&right_base, m_right.height() - 1)?;
        }
        Some(m_left)
    }

    /// Exponentially spaced locator back from `start`, ending at genesis.
    pub fn get_locator(&self, start: &HeaderView) -> Vec<H256> {
        let mut step = 1u64;
        let mut locator = Vec::with_capacity(32);
        let mut index = start.height();
        let mut base = start.hash().clone();

        loop {
            let header_hash = match self.get_ancestor(&base, index) {
                Some(header) => header.hash().clone(),
                None => break,
            };
            locator.push(header_hash.clone());

            if locator.len() >= 10 {
                step <<= 1;
            }
            if index < step {
                break;
            }
            index -= step;
            base = header_hash;
        }
        let genesis = self.chain.genesis_hash();
        if locator.last() != Some(&genesis) {
            locator.push(genesis);
        }
        locator
    }

    /// First locator entry on our active chain; the fork point the peer and
    /// we agree on.
    pub fn find_fork_in_locator(&self, locator: &[H256]) -> Option<HeaderView> {
        locator.iter().find_map(|hash| {
            if self.chain.is_main_chain(hash) {
                self.chain.get_header_view(hash)
            } else {
                None
            }
        })
    }

    /// Resolve a previously unknown announced hash against the header index.
    pub fn process_block_availability(&self, peer: PeerIndex) {
        let unknown = self
            .state
            .peers()
            .state
            .get(&peer)
            .and_then(|state| state.sync.last_unknown_block_hash.clone());
        if let Some(hash) = unknown {
            if let Some(header_view) = self.chain.get_header_view(&hash) {
                self.state
                    .peers()
                    .may_set_best_known_header(peer, header_view);
                if let Some(mut state) = self.state.peers().state.get_mut(&peer) {
                    state.sync.last_unknown_block_hash = None;
                }
            }
        }
    }

    /// Track which blocks the peer is assumed to have after it announced
    /// `hash`.
    pub fn update_block_availability(&self, peer: PeerIndex, hash: &H256) {
        self.process_block_availability(peer);
        match self.chain.get_header_view(hash) {
            Some(header_view) => {
                self.state
                    .peers()
                    .may_set_best_known_header(peer, header_view);
            }
            None => {
                if let Some(mut state) = self.state.peers().state.get_mut(&peer) {
                    state.sync.last_unknown_block_hash = Some(hash.clone());
                }
            }
        }
    }

    /// Whether direct block fetch is allowed: the tip must be recent.
    pub fn can_direct_fetch(&self) -> bool {
        let tip_time = self.chain.tip_header().timestamp();
        let spacing = self.chain.target_spacing();
        let now = unix_time_as_millis() / 1_000;
        tip_time + spacing * ember_constant::sync::DIRECT_FETCH_SPACING_FACTOR > now
    }
}
