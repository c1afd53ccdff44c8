use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, Rejection, TxPoolProvider};
use crate::types::HeaderView;
use ember_constant::sync::{ANNOUNCE_STARTING_HEIGHT_SLACK, MAX_BLOCKS_TO_ANNOUNCE};
use ember_network::{NetworkContext, PeerIndex};
use ember_types::{Block, NetworkMessage, H256};
use log::debug;

/// Callbacks the validation engine drives as blocks move through it. They
/// run on the validation thread and only touch shared sync state.
impl<C: ChainProvider + TxPoolProvider> MessageHandler<C> {
    /// A block joined the active chain: orphans spending its transactions
    /// are settled one way or the other and can go.
    pub fn block_connected(&self, block: &Block) {
        let state = self.shared().state();
        let mut to_erase: Vec<H256> = Vec::new();
        for tx in &block.transactions {
            let tx_hash = tx.hash();
            to_erase.extend(state.orphan_pool().dependents_of(&tx_hash));
        }
        if !to_erase.is_empty() {
            debug!(
                target: "mempool",
                "erasing {} orphans settled by connected block {:#x}",
                to_erase.len(),
                block.hash()
            );
            for hash in to_erase {
                state.orphan_pool().remove_orphan_tx(&hash);
            }
        }
    }

    /// A block passed proof-of-work checks: announce the single header
    /// straight away to every peer that has its parent but not it.
    pub fn new_pow_valid_block(
        &self,
        nc: &dyn NetworkContext,
        view: &HeaderView,
        block: &Block,
    ) {
        let shared = self.shared();
        let state = shared.state();

        // Each height fast-announces at most once.
        if !state.advance_fast_announce_height(view.height()) {
            return;
        }
        state.set_most_recent_block(view.hash().clone(), block.clone());

        let parent = shared.chain().get_header_view(view.parent_hash());

        for peer in nc.connected_peers() {
            if state.peers().should_disconnect(peer) {
                continue;
            }
            shared.process_block_availability(peer);
            let has_block = self.peer_has_header(peer, view);
            let has_parent = match parent {
                Some(ref parent) => self.peer_has_header(peer, parent),
                None => false,
            };
            if !has_block && has_parent {
                debug!(
                    target: "net",
                    "fast-announcing header {:#x} to peer={}",
                    view.hash(),
                    peer
                );
                let message = NetworkMessage::Headers(vec![view.inner().clone()]);
                if let Err(err) = nc.send_message(peer, message) {
                    debug!(target: "net", "send headers error: {}", err);
                    continue;
                }
                if let Some(mut peer_state) = state.peers().state.get_mut(&peer) {
                    peer_state.sync.best_header_sent = Some(view.clone());
                }
            }
        }
    }

    /// The active tip moved: queue the new branch for announcement to every
    /// peer that could plausibly care.
    pub fn updated_block_tip(
        &self,
        nc: &dyn NetworkContext,
        new_tip: &HeaderView,
        fork_point: &HeaderView,
        is_initial_download: bool,
    ) {
        let shared = self.shared();
        let state = shared.state();
        nc.set_best_height(new_tip.height());

        if is_initial_download {
            return;
        }

        // Hashes from the new tip down to the fork, capped; a huge reorg
        // falls back to the regular sync mechanism.
        let mut new_hashes: Vec<H256> = Vec::new();
        let mut walk = Some(new_tip.clone());
        while let Some(view) = walk {
            if view.hash() == fork_point.hash() {
                break;
            }
            new_hashes.push(view.hash().clone());
            if new_hashes.len() == MAX_BLOCKS_TO_ANNOUNCE {
                break;
            }
            walk = shared.chain().get_header_view(view.parent_hash());
        }

        let new_height = new_tip.height();
        for mut entry in state.peers().state.iter_mut() {
            let starting = entry.handshake.start_height;
            let floor = if starting >= 0 {
                (starting as u64).saturating_sub(ANNOUNCE_STARTING_HEIGHT_SLACK)
            } else {
                0
            };
            if new_height > floor {
                for hash in new_hashes.iter().rev() {
                    entry.gossip.block_hashes_to_announce.push(hash.clone());
                }
            }
        }
    }

    /// Validation finished checking a block: attribute the verdict to the
    /// peer that sourced it.
    pub fn block_checked(&self, block_hash: &H256, result: &Result<(), Rejection>) {
        let state = self.shared().state();
        let source = state.take_block_source(block_hash);
        if let Err(rejection) = result {
            if let Some((peer, punish)) = source {
                if rejection.code.is_wire_visible() {
                    state.queue_reject(
                        peer,
                        "block",
                        rejection.code,
                        rejection.reason.clone(),
                        block_hash.clone(),
                    );
                }
                if rejection.dos > 0 && punish {
                    state.misbehave(peer, rejection.dos, &rejection.reason);
                }
            }
        }
    }

    /// Ancestor-of check against what the peer is known or told to have.
    pub(crate) fn peer_has_header(&self, peer: PeerIndex, view: &HeaderView) -> bool {
        let shared = self.shared();
        let (best_known, best_sent) = {
            match shared.state().peers().state.get(&peer) {
                Some(peer_state) => (
                    peer_state.sync.best_known_header.clone(),
                    peer_state.sync.best_header_sent.clone(),
                ),
                None => return false,
            }
        };
        for candidate in [best_known, best_sent].iter().flatten() {
            if candidate.height() >= view.height()
                && shared
                    .get_ancestor(candidate.hash(), view.height())
                    .map(|ancestor| ancestor.hash() == view.hash())
                    .unwrap_or(false)
            {
                return true;
            }
        }
        false
    }
}
