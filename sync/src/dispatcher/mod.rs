mod addr_process;
mod block_process;
mod filter_process;
mod getblocks_process;
mod getdata_process;
mod getheaders_process;
mod handshake_process;
mod headers_process;
mod inv_process;
mod mempool_process;
mod ping_process;
mod stx_process;
mod tx_process;

pub(crate) use self::getdata_process::GetDataProcess;

use self::addr_process::{AddrProcess, GetAddrProcess};
use self::block_process::BlockProcess;
use self::filter_process::FilterProcess;
use self::getblocks_process::GetBlocksProcess;
use self::getheaders_process::GetHeadersProcess;
use self::handshake_process::{VerackProcess, VersionProcess};
use self::headers_process::HeadersProcess;
use self::inv_process::InvProcess;
use self::mempool_process::MempoolProcess;
use self::ping_process::{PingProcess, PongProcess};
use self::stx_process::StxProcess;
use self::tx_process::TxProcess;

use crate::block_status::BlockStatus;
use crate::provider::{ChainProvider, TxPoolProvider};
use crate::types::SyncShared;
use crate::{Status, StatusCode};
use ember_constant::sync::{MISBEHAVING_BAN_TIME, NO_BLOOM_VERSION, PROTOCOL_VERSION};
use ember_network::{NetworkContext, PeerIndex};
use ember_types::{
    Inv, InvKind, NetAddress, NetworkMessage, Reject, ServiceFlags, VersionPayload,
};
use faketime::unix_time_as_millis;
use log::{debug, info, trace, warn};
use rand::Rng;
use std::sync::Arc;

/// The peer message-handling core, handed to the connection layer at
/// startup. One value serves every peer; all state lives in
/// [`SyncShared`].
pub struct MessageHandler<C> {
    shared: Arc<SyncShared<C>>,
}

impl<C> Clone for MessageHandler<C> {
    fn clone(&self) -> Self {
        MessageHandler {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C> MessageHandler<C> {
    pub fn new(shared: Arc<SyncShared<C>>) -> MessageHandler<C> {
        MessageHandler { shared }
    }

    pub fn shared(&self) -> &Arc<SyncShared<C>> {
        &self.shared
    }
}

impl<C: ChainProvider + TxPoolProvider> MessageHandler<C> {
    /// A peer attached. Creates its scoreboard entry and, for outbound
    /// connections, opens the handshake.
    pub fn initialize_node(&self, nc: &dyn NetworkContext, peer: PeerIndex) {
        let info = match nc.peer_info(peer) {
            Some(info) => info,
            None => return,
        };
        self.shared.state().peers().attach(peer, &info);
        info!(target: "net", "peer={} attached ({})", peer, info.name);
        if !info.is_inbound {
            self.push_node_version(nc, peer);
        }
    }

    /// A peer detached. Release everything that references it and check
    /// global consistency once the room is empty.
    pub fn finalize_node(&self, peer: PeerIndex) {
        let state = self.shared.state();
        {
            let mut inflight = state.write_inflight_blocks();
            inflight.remove_by_peer(peer);
        }
        state.clear_block_sources_for(peer);
        state.orphan_pool().erase_for_peer(peer);
        state.peers().detach(peer);
        info!(target: "net", "peer={} detached", peer);

        if state.peers().state.is_empty() {
            let inflight = state.read_inflight_blocks();
            assert!(inflight.is_empty(), "in-flight registry leaked entries");
            assert!(inflight.is_consistent());
            assert_eq!(
                state
                    .peers()
                    .n_preferred_download
                    .load(std::sync::atomic::Ordering::Acquire),
                0,
                "preferred-download counter leaked"
            );
            assert_eq!(state.block_source_len(), 0, "block source map leaked");
        }
    }

    /// Process one parsed message from `peer`. Returns whether more work is
    /// immediately available (an unfinished `getdata` backlog).
    pub fn process_messages(
        &self,
        nc: &dyn NetworkContext,
        peer: PeerIndex,
        message: NetworkMessage,
    ) -> bool {
        let state = self.shared.state();

        // Serve any backlog first so replies keep their order.
        if self.has_get_data_backlog(peer) {
            GetDataProcess::drain(self, nc, peer);
        }

        if state.interrupted() {
            return false;
        }

        let command = message.command();
        trace!(target: "net", "received: {} peer={}", command, peer);

        let drop_rate = state.config().drop_messages_test;
        if drop_rate > 0 && rand::thread_rng().gen_range(0..drop_rate) == 0 {
            debug!(target: "net", "dropmessagestest dropping recv message");
            return false;
        }

        let status = self.dispatch(nc, peer, message);
        if !status.is_ok() {
            if status.should_warn() {
                warn!(target: "net", "process {} peer={}, {}", command, peer, status);
            } else {
                debug!(target: "net", "process {} peer={}, {}", command, peer, status);
            }
        }

        let more_work = self.has_get_data_backlog(peer);
        self.send_rejects_and_check_if_banned(nc, peer);
        more_work
    }

    fn dispatch(
        &self,
        nc: &dyn NetworkContext,
        peer: PeerIndex,
        message: NetworkMessage,
    ) -> Status {
        if let Some(status) = self.reject_bloom_without_service(nc, peer, &message) {
            return status;
        }

        // Everything but `version` requires the handshake to have started.
        if !matches!(message, NetworkMessage::Version(_)) && !self.version_received(peer) {
            self.shared.state().misbehave(peer, 1, "missing-version");
            return StatusCode::ProtocolViolation
                .with_context(format!("{} before version", message.command()));
        }

        match message {
            NetworkMessage::Version(payload) => {
                VersionProcess::new(payload, self, peer, nc).execute()
            }
            NetworkMessage::Verack => VerackProcess::new(self, peer, nc).execute(),
            NetworkMessage::Addr(addresses) => {
                AddrProcess::new(addresses, self, peer, nc).execute()
            }
            NetworkMessage::Inv(inventory) => InvProcess::new(inventory, self, peer, nc).execute(),
            NetworkMessage::GetData(inventory) => {
                GetDataProcess::new(inventory, self, peer, nc).execute()
            }
            NetworkMessage::GetBlocks { locator, hash_stop } => {
                GetBlocksProcess::new(locator, hash_stop, self, peer).execute()
            }
            NetworkMessage::GetHeaders { locator, hash_stop } => {
                GetHeadersProcess::new(locator, hash_stop, self, peer, nc).execute()
            }
            NetworkMessage::Tx(tx) => TxProcess::new(tx, self, peer).execute(),
            NetworkMessage::Stx(stx) => StxProcess::new(stx, self, peer).execute(),
            NetworkMessage::Headers(headers) => {
                HeadersProcess::new(headers, self, peer, nc).execute()
            }
            NetworkMessage::Block(block) => BlockProcess::new(block, self, peer).execute(),
            NetworkMessage::GetAddr => GetAddrProcess::new(self, peer, nc).execute(),
            NetworkMessage::Mempool => MempoolProcess::new(self, peer, nc).execute(),
            NetworkMessage::Ping(nonce) => PingProcess::new(nonce, self, peer, nc).execute(),
            NetworkMessage::Pong(nonce) => PongProcess::new(nonce, self, peer).execute(),
            NetworkMessage::FilterLoad(filter) => {
                FilterProcess::load(filter, self, peer).execute()
            }
            NetworkMessage::FilterAdd(data) => FilterProcess::add(data, self, peer).execute(),
            NetworkMessage::FilterClear => FilterProcess::clear(self, peer).execute(),
            NetworkMessage::Reject(reject) => {
                if self.shared.state().config().debug {
                    self.log_reject(peer, &reject);
                }
                Status::ok()
            }
            NetworkMessage::SendHeaders => {
                if let Some(mut state) = self.shared.state().peers().state.get_mut(&peer) {
                    state.handshake.prefer_headers = true;
                }
                Status::ok()
            }
            NetworkMessage::NotFound(inventory) => {
                debug!(
                    target: "net",
                    "notfound of {} items from peer={}",
                    inventory.len(),
                    peer
                );
                Status::ok()
            }
            NetworkMessage::MerkleBlock(_) => {
                // We never request filtered blocks; ignore for extensibility.
                Status::ignored()
            }
        }
    }

    /// Bloom messages from peers we offer no bloom service to: punishable
    /// at modern versions, disconnectable by configuration below that.
    fn reject_bloom_without_service(
        &self,
        nc: &dyn NetworkContext,
        peer: PeerIndex,
        message: &NetworkMessage,
    ) -> Option<Status> {
        let is_filter_message = matches!(
            message,
            NetworkMessage::FilterLoad(_)
                | NetworkMessage::FilterAdd(_)
                | NetworkMessage::FilterClear
        );
        if !is_filter_message || nc.local_services().contains(ServiceFlags::BLOOM) {
            return None;
        }
        let state = self.shared.state();
        let version = self
            .shared
            .state()
            .peers()
            .state
            .get(&peer)
            .map(|peer_state| peer_state.handshake.version)
            .unwrap_or(0);
        if version >= NO_BLOOM_VERSION {
            state.misbehave(peer, 100, "no-bloom-version");
            Some(StatusCode::ProtocolViolation.with_context("bloom message without bloom service"))
        } else if state.config().enforce_node_bloom {
            nc.disconnect(peer, "no bloom service");
            Some(StatusCode::Ignored.into())
        } else {
            None
        }
    }

    fn version_received(&self, peer: PeerIndex) -> bool {
        self.shared
            .state()
            .peers()
            .state
            .get(&peer)
            .map(|state| state.handshake.version != 0)
            .unwrap_or(false)
    }

    fn has_get_data_backlog(&self, peer: PeerIndex) -> bool {
        self.shared
            .state()
            .peers()
            .state
            .get(&peer)
            .map(|state| !state.gossip.recv_get_data.is_empty())
            .unwrap_or(false)
    }

    fn log_reject(&self, peer: PeerIndex, reject: &Reject) {
        debug!(
            target: "net",
            "reject from peer={}: {} code {:?}: {} {}",
            peer,
            reject.message,
            reject.code,
            reject.reason,
            reject
                .hash
                .as_ref()
                .map(|hash| format!("hash {:#x}", hash))
                .unwrap_or_default(),
        );
    }

    /// Send our `version` to a peer (outbound at attach, inbound in reply).
    pub(crate) fn push_node_version(&self, nc: &dyn NetworkContext, peer: PeerIndex) {
        let info = match nc.peer_info(peer) {
            Some(info) => info,
            None => return,
        };
        let services = nc.local_services();
        let addr_you = if info.address.is_routable() {
            info.address.clone()
        } else {
            NetAddress::new(info.address.addr, info.address.services, 0)
        };
        let addr_me = nc
            .local_address(peer)
            .unwrap_or_else(|| NetAddress::new(([0, 0, 0, 0], 0).into(), services, 0));
        let payload = VersionPayload {
            version: PROTOCOL_VERSION,
            services,
            timestamp: (unix_time_as_millis() / 1_000) as i64,
            receiver: addr_you,
            sender: addr_me,
            nonce: nc.local_nonce(peer),
            user_agent: format!("/ember:{}/", env!("CARGO_PKG_VERSION")),
            start_height: nc.local_start_height(),
            relay: true,
        };
        debug!(
            target: "net",
            "send version message: version {}, blocks={}, peer={}",
            payload.version, payload.start_height, peer
        );
        if let Err(err) = nc.send_message(peer, NetworkMessage::Version(payload)) {
            debug!(target: "net", "push version error: {}", err);
        }
    }

    /// Flush queued rejects and act on a pending disconnect mark. Returns
    /// whether the peer is gone.
    pub(crate) fn send_rejects_and_check_if_banned(
        &self,
        nc: &dyn NetworkContext,
        peer: PeerIndex,
    ) -> bool {
        let state = self.shared.state();
        let (rejects, should_disconnect, flags, name) = {
            match state.peers().state.get_mut(&peer) {
                Some(mut peer_state) => {
                    let rejects = std::mem::take(&mut peer_state.rejects);
                    let should_disconnect = peer_state.misbehavior.should_disconnect;
                    peer_state.misbehavior.should_disconnect = false;
                    (
                        rejects,
                        should_disconnect,
                        peer_state.flags,
                        peer_state.name.clone(),
                    )
                }
                None => return true,
            }
        };

        for queued in rejects {
            let message = NetworkMessage::Reject(Reject {
                message: queued.command.to_string(),
                code: queued.code,
                reason: queued.reason,
                hash: Some(queued.hash),
            });
            if let Err(err) = nc.send_message(peer, message) {
                debug!(target: "net", "send reject error: {}", err);
            }
        }

        if !should_disconnect {
            return false;
        }
        if flags.is_whitelist {
            warn!(target: "net", "not punishing whitelisted peer {}", name);
            false
        } else if flags.is_addnode {
            warn!(target: "net", "not punishing manually-added peer {}", name);
            false
        } else if flags.is_local {
            warn!(target: "net", "disconnecting but not banning local peer {}", name);
            nc.disconnect(peer, "misbehaving");
            true
        } else {
            nc.ban_peer(peer, MISBEHAVING_BAN_TIME, "misbehaving");
            true
        }
    }

    /// Whether we already have (or recently refused) the announced object.
    pub(crate) fn already_have(&self, inv: &Inv) -> bool {
        let chain = self.shared.chain();
        let state = self.shared.state();
        match inv.kind {
            InvKind::Tx => {
                {
                    let mut rejects = state.recent_rejects();
                    rejects.reset_if_tip_changed(chain.tip_header().hash());
                    if rejects.contains(&inv.hash) {
                        return true;
                    }
                }
                chain.mempool_contains(&inv.hash)
                    || state.orphan_pool().contains(&inv.hash)
                    || chain.utxo_exists(&inv.hash)
            }
            InvKind::Block | InvKind::FilteredBlock => {
                chain.get_block_status(&inv.hash) != BlockStatus::UNKNOWN
            }
            InvKind::Stx => chain.stx_pool_contains(&inv.hash),
        }
    }
}
