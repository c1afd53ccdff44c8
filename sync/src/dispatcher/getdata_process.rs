use crate::block_status::BlockStatus;
use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, TxPoolProvider};
use crate::{Status, StatusCode};
use ember_constant::sync::{HISTORICAL_BLOCK_AGE, HISTORICAL_SERVING_AGE, MAX_INV_SZ};
use ember_network::{NetworkContext, PeerIndex};
use ember_types::{Inv, InvKind, MerkleBlock, NetworkMessage};
use log::debug;

/// `getdata` intake: requests join the peer's queue, then the queue drains
/// until the send buffer pauses or a (merkle)block reply yields the floor.
pub struct GetDataProcess<'a, C> {
    inventory: Vec<Inv>,
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
    nc: &'a dyn NetworkContext,
}

impl<'a, C: ChainProvider + TxPoolProvider> GetDataProcess<'a, C> {
    pub fn new(
        inventory: Vec<Inv>,
        handler: &'a MessageHandler<C>,
        peer: PeerIndex,
        nc: &'a dyn NetworkContext,
    ) -> Self {
        GetDataProcess {
            inventory,
            handler,
            peer,
            nc,
        }
    }

    pub fn execute(self) -> Status {
        let state = self.handler.shared().state();
        if self.inventory.len() > MAX_INV_SZ {
            state.misbehave(self.peer, 20, "too-many-inv");
            return StatusCode::ProtocolViolation
                .with_context(format!("getdata size {}", self.inventory.len()));
        }
        debug!(
            target: "net",
            "received getdata ({} invsz) peer={}",
            self.inventory.len(),
            self.peer
        );
        if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
            peer_state.gossip.recv_get_data.extend(self.inventory);
        }
        Self::drain(self.handler, self.nc, self.peer);
        Status::ok()
    }

    /// Serve queued requests. Yields after each block-bearing reply so one
    /// bulk download cannot starve other peers, and stops when the peer's
    /// send buffer pauses or the process is interrupted.
    pub fn drain(handler: &MessageHandler<C>, nc: &dyn NetworkContext, peer: PeerIndex) {
        let state = handler.shared().state();
        let mut not_found: Vec<Inv> = Vec::new();

        loop {
            if state.interrupted() || nc.send_paused(peer) {
                break;
            }
            let inv = {
                match state.peers().state.get_mut(&peer) {
                    Some(mut peer_state) => match peer_state.gossip.recv_get_data.pop_front() {
                        Some(inv) => inv,
                        None => break,
                    },
                    None => return,
                }
            };

            match inv.kind {
                InvKind::Block | InvKind::FilteredBlock => {
                    Self::serve_block(handler, nc, peer, &inv);
                    // Yield after a block so interleaved requests get served.
                    break;
                }
                InvKind::Tx => {
                    let cached = state.relay_cache().get(&inv.hash).cloned();
                    match cached {
                        Some(tx) => {
                            if let Err(err) = nc.send_message(peer, NetworkMessage::Tx(tx)) {
                                debug!(target: "net", "send tx error: {}", err);
                            }
                        }
                        None => not_found.push(inv),
                    }
                }
                InvKind::Stx => match handler.shared().chain().stx_pool_get(&inv.hash) {
                    Some(stx) => {
                        if let Err(err) = nc.send_message(peer, NetworkMessage::Stx(stx)) {
                            debug!(target: "net", "send stx error: {}", err);
                        }
                        if let Some(mut peer_state) = state.peers().state.get_mut(&peer) {
                            peer_state.gossip.service_data_known.insert(&inv.hash);
                        }
                    }
                    None => not_found.push(inv),
                },
            }
        }

        if !not_found.is_empty() {
            // Tell the peer so it does not wait around forever; thin clients
            // walking dependency graphs rely on this.
            if let Err(err) = nc.send_message(peer, NetworkMessage::NotFound(not_found)) {
                debug!(target: "net", "send notfound error: {}", err);
            }
        }
    }

    fn serve_block(
        handler: &MessageHandler<C>,
        nc: &dyn NetworkContext,
        peer: PeerIndex,
        inv: &Inv,
    ) {
        let shared = handler.shared();
        let chain = shared.chain();
        let state = shared.state();

        let header_view = match chain.get_header_view(&inv.hash) {
            Some(view) => view,
            None => return,
        };

        let mut send = chain.is_main_chain(&inv.hash);
        let best_header = chain.best_header();
        if !send {
            // Only serve off-chain blocks that are script-valid and no more
            // than a month stale by both clock time and equivalent
            // proof-of-work time, to keep our fork knowledge unprobeable.
            let status = chain.get_block_status(&inv.hash);
            let fresh_by_time =
                best_header.timestamp().saturating_sub(header_view.timestamp())
                    < HISTORICAL_BLOCK_AGE;
            let fresh_by_work = best_header
                .height()
                .saturating_sub(header_view.height())
                .saturating_mul(chain.target_spacing())
                < HISTORICAL_BLOCK_AGE;
            send = status.contains(BlockStatus::BLOCK_VALID) && fresh_by_time && fresh_by_work;
            if !send {
                debug!(
                    target: "net",
                    "ignoring request from peer={} for old block not on the main chain",
                    peer
                );
            }
        }

        let whitelisted = state
            .peers()
            .state
            .get(&peer)
            .map(|peer_state| peer_state.flags.is_whitelist)
            .unwrap_or(false);
        let historical = best_header.timestamp().saturating_sub(header_view.timestamp())
            > HISTORICAL_SERVING_AGE;
        if send
            && nc.outbound_target_reached(true)
            && (historical || inv.kind == InvKind::FilteredBlock)
            && !whitelisted
        {
            debug!(
                target: "net",
                "historical block serving limit reached, disconnect peer={}",
                peer
            );
            nc.disconnect(peer, "historical block serving limit");
            send = false;
        }

        if !send
            || !chain
                .get_block_status(&inv.hash)
                .contains(BlockStatus::BLOCK_STORED)
        {
            return;
        }

        // A block we claim to have must be readable; anything else is local
        // corruption.
        let block = chain
            .get_block(&inv.hash)
            .unwrap_or_else(|| panic!("cannot load block {:#x} from store", inv.hash));

        match inv.kind {
            InvKind::Block => {
                if let Err(err) = nc.send_message(peer, NetworkMessage::Block(block.clone())) {
                    debug!(target: "net", "send block error: {}", err);
                }
            }
            InvKind::FilteredBlock => {
                let merkle = {
                    state.peers().state.get(&peer).and_then(|peer_state| {
                        peer_state
                            .bloom_filter
                            .as_ref()
                            .map(|filter| MerkleBlock::from_block(&block, filter))
                    })
                };
                if let Some(merkle) = merkle {
                    let matched = merkle.matched_indices();
                    if let Err(err) = nc.send_message(peer, NetworkMessage::MerkleBlock(merkle)) {
                        debug!(target: "net", "send merkleblock error: {}", err);
                    }
                    // Push the matched transactions right behind; the peer
                    // cannot request them individually.
                    for index in matched {
                        let tx = block.transactions[index].clone();
                        if let Err(err) = nc.send_message(peer, NetworkMessage::Tx(tx)) {
                            debug!(target: "net", "send tx error: {}", err);
                        }
                    }
                }
                // No filter loaded: no response.
            }
            _ => unreachable!("serve_block called for block kinds only"),
        }

        // Chain the peer's next getblocks batch.
        let continue_requested = {
            match state.peers().state.get_mut(&peer) {
                Some(mut peer_state) => {
                    if peer_state.gossip.continue_hash.as_ref() == Some(&inv.hash) {
                        peer_state.gossip.continue_hash = None;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if continue_requested {
            let tip_hash = chain.tip_header().hash().clone();
            let message = NetworkMessage::Inv(vec![Inv::block(tip_hash)]);
            if let Err(err) = nc.send_message(peer, message) {
                debug!(target: "net", "send inv error: {}", err);
            }
        }
    }
}
