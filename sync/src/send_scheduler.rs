use crate::block_fetcher::BlockFetcher;
use crate::dispatcher::{GetDataProcess, MessageHandler};
use crate::provider::{ChainProvider, TxPoolProvider};
use crate::types::HeaderView;
use ember_constant::sync::{
    AVG_ADDRESS_BROADCAST_INTERVAL, AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL,
    BLOCK_DOWNLOAD_TIMEOUT_BASE, BLOCK_DOWNLOAD_TIMEOUT_PER_PEER, BLOCK_STALLING_TIMEOUT,
    INVENTORY_BROADCAST_INTERVAL, INVENTORY_BROADCAST_MAX, MAX_ADDR_SZ, MAX_BLOCKS_IN_TRANSIT_PER_PEER,
    MAX_BLOCKS_TO_ANNOUNCE, MAX_INV_SZ, PING_INTERVAL,
};
use ember_network::{NetworkContext, PeerIndex};
use ember_types::{Header, Inv, InvKind, NetAddress, NetworkMessage, H256};
use faketime::unix_time_as_millis;
use log::{debug, info, trace};
use rand::Rng;

fn poisson_next_send(now: u64, average_interval_ms: u64) -> u64 {
    let uniform: f64 = rand::thread_rng().gen();
    now + (-(1.0 - uniform).ln() * average_interval_ms as f64) as u64 + 1
}

impl<C: ChainProvider + TxPoolProvider> MessageHandler<C> {
    /// One pass of the per-peer send schedule: pings, address gossip, sync
    /// kick-off, announcements, inventory trickle, stall/timeout policing,
    /// and `getdata` batching.
    pub fn send_messages(&self, nc: &dyn NetworkContext, peer: PeerIndex) {
        let shared = self.shared();
        let state = shared.state();

        // Nothing goes out until the handshake completes.
        let ready = state
            .peers()
            .state
            .get(&peer)
            .map(|peer_state| peer_state.handshake.successfully_connected)
            .unwrap_or(false);
        if !ready {
            return;
        }

        self.maybe_ping(nc, peer);

        if self.send_rejects_and_check_if_banned(nc, peer) {
            return;
        }

        let now = unix_time_as_millis();
        let ibd = shared.chain().is_initial_block_download();

        self.advertise_local_address(nc, peer, now, ibd);
        self.flush_addr_queue(nc, peer, now);
        self.maybe_start_sync(nc, peer, now, ibd);

        if !ibd {
            shared.chain().rebroadcast_wallet_transactions();
        }

        self.announce_blocks(nc, peer);
        self.flush_inventory(nc, peer, now);

        if self.police_downloads(nc, peer, now) {
            return;
        }

        self.request_blocks(nc, peer, now, ibd);
        self.request_non_block_data(nc, peer, now);

        // Serve whatever getdata backlog back-pressure left behind.
        GetDataProcess::drain(self, nc, peer);
    }

    fn maybe_ping(&self, nc: &dyn NetworkContext, peer: PeerIndex) {
        let state = self.shared().state();
        let now = unix_time_as_millis();
        let nonce = {
            match state.peers().state.get_mut(&peer) {
                Some(mut peer_state) => {
                    let ping = &mut peer_state.ping;
                    let due = ping.nonce_sent == 0 && ping.started_at + PING_INTERVAL < now;
                    if !(ping.queued || due) {
                        return;
                    }
                    let mut nonce: u64 = 0;
                    while nonce == 0 {
                        nonce = rand::thread_rng().gen();
                    }
                    ping.queued = false;
                    ping.started_at = now;
                    ping.nonce_sent = nonce;
                    nonce
                }
                None => return,
            }
        };
        if let Err(err) = nc.send_message(peer, NetworkMessage::Ping(nonce)) {
            debug!(target: "net", "send ping error: {}", err);
        }
    }

    fn advertise_local_address(
        &self,
        nc: &dyn NetworkContext,
        peer: PeerIndex,
        now: u64,
        ibd: bool,
    ) {
        if ibd {
            return;
        }
        let state = self.shared().state();
        let due = {
            match state.peers().state.get_mut(&peer) {
                Some(mut peer_state) => {
                    if peer_state.gossip.next_local_addr_send < now {
                        peer_state.gossip.next_local_addr_send =
                            poisson_next_send(now, AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if !due {
            return;
        }
        if let Some(local) = nc.local_address(peer) {
            if local.is_routable() {
                if let Some(mut peer_state) = state.peers().state.get_mut(&peer) {
                    peer_state.gossip.addrs_to_send.push(local);
                }
            }
        }
    }

    fn flush_addr_queue(&self, nc: &dyn NetworkContext, peer: PeerIndex, now: u64) {
        let state = self.shared().state();
        let batches: Vec<Vec<NetAddress>> = {
            match state.peers().state.get_mut(&peer) {
                Some(mut peer_state) => {
                    if peer_state.gossip.next_addr_send >= now {
                        return;
                    }
                    peer_state.gossip.next_addr_send =
                        poisson_next_send(now, AVG_ADDRESS_BROADCAST_INTERVAL);
                    let queued = std::mem::take(&mut peer_state.gossip.addrs_to_send);
                    let mut batches = Vec::new();
                    let mut current: Vec<NetAddress> = Vec::new();
                    for address in queued {
                        let key = address.key();
                        if peer_state.gossip.known_addrs.contains(&key) {
                            continue;
                        }
                        peer_state.gossip.known_addrs.insert(&key);
                        current.push(address);
                        // The receiver rejects bigger addr messages.
                        if current.len() >= MAX_ADDR_SZ {
                            batches.push(std::mem::take(&mut current));
                        }
                    }
                    if !current.is_empty() {
                        batches.push(current);
                    }
                    batches
                }
                None => return,
            }
        };
        for batch in batches {
            if let Err(err) = nc.send_message(peer, NetworkMessage::Addr(batch)) {
                debug!(target: "net", "send addr error: {}", err);
            }
        }
    }

    /// Start header sync with this peer when it is our pick (or headers are
    /// nearly caught up, when syncing from everyone is harmless).
    fn maybe_start_sync(&self, nc: &dyn NetworkContext, peer: PeerIndex, now: u64, _ibd: bool) {
        let shared = self.shared();
        let state = shared.state();
        let best_header = shared.chain().best_header();

        let eligible = {
            match state.peers().state.get(&peer) {
                Some(peer_state) => {
                    !peer_state.sync.sync_started
                        && !peer_state.is_client()
                        && (peer_state.sync.preferred_download
                            && state
                                .peers()
                                .n_sync_started
                                .load(std::sync::atomic::Ordering::Acquire)
                                == 0
                            || best_header.timestamp().saturating_mul(1_000) + 24 * 60 * 60 * 1_000
                                > now)
                }
                None => false,
            }
        };
        if !eligible {
            return;
        }
        state.peers().mark_sync_started(peer);

        // Ask starting one below our best header so the reply is never
        // empty and seeds the peer's best-known block.
        let start = shared
            .chain()
            .get_header_view(best_header.parent_hash())
            .unwrap_or(best_header);
        info!(
            target: "net",
            "initial getheaders ({}) to peer={}",
            start.height(),
            peer
        );
        let locator = shared.get_locator(&start);
        let message = NetworkMessage::GetHeaders {
            locator,
            hash_stop: H256::default(),
        };
        if let Err(err) = nc.send_message(peer, message) {
            debug!(target: "net", "send getheaders error: {}", err);
        }
    }

    /// Announce new tips: a connected headers batch when the peer prefers
    /// headers and continuity holds, otherwise an inv of the tip.
    fn announce_blocks(&self, nc: &dyn NetworkContext, peer: PeerIndex) {
        let shared = self.shared();
        let chain = shared.chain();
        let state = shared.state();

        let (to_announce, prefer_headers) = {
            match state.peers().state.get_mut(&peer) {
                Some(mut peer_state) => (
                    std::mem::take(&mut peer_state.gossip.block_hashes_to_announce),
                    peer_state.handshake.prefer_headers,
                ),
                None => return,
            }
        };
        if to_announce.is_empty() {
            return;
        }

        shared.process_block_availability(peer);

        let mut revert_to_inv =
            (!prefer_headers && to_announce.len() > 1) || to_announce.len() > MAX_BLOCKS_TO_ANNOUNCE;
        let mut headers: Vec<Header> = Vec::new();
        let mut best_index: Option<HeaderView> = None;

        if !revert_to_inv {
            let mut found_start = false;
            // Find the first header the peer lacks whose parent it has, then
            // send everything from there; bail to inv if the sequence does
            // not connect.
            for hash in &to_announce {
                let view = match chain.get_header_view(hash) {
                    Some(view) => view,
                    None => {
                        revert_to_inv = true;
                        break;
                    }
                };
                if !chain.is_main_chain(hash) {
                    // Reorged away from this block in the meantime.
                    revert_to_inv = true;
                    break;
                }
                if let Some(ref best) = best_index {
                    if view.parent_hash() != best.hash() {
                        // Announced blocks that don't connect to each other;
                        // happens only through repeated tip invalidation.
                        revert_to_inv = true;
                        break;
                    }
                }
                best_index = Some(view.clone());
                if found_start {
                    headers.push(view.into_inner());
                } else if self.peer_has_header(peer, &view) {
                    // Keep looking for the first new block.
                } else {
                    let parent_known = match chain.get_header_view(view.parent_hash()) {
                        Some(parent) => self.peer_has_header(peer, &parent),
                        None => view.height() == 0,
                    };
                    if parent_known || view.height() == 0 {
                        found_start = true;
                        headers.push(view.into_inner());
                    } else {
                        // Nothing will connect.
                        revert_to_inv = true;
                        break;
                    }
                }
            }
        }

        if !revert_to_inv && !headers.is_empty() {
            if prefer_headers {
                if headers.len() > 1 {
                    debug!(
                        target: "net",
                        "{} headers, range ({:#x}, {:#x}), to peer={}",
                        headers.len(),
                        headers.first().expect("checked non-empty").hash(),
                        headers.last().expect("checked non-empty").hash(),
                        peer
                    );
                } else {
                    debug!(
                        target: "net",
                        "sending header {:#x} to peer={}",
                        headers[0].hash(),
                        peer
                    );
                }
                if let Err(err) = nc.send_message(peer, NetworkMessage::Headers(headers)) {
                    debug!(target: "net", "send headers error: {}", err);
                }
                if let Some(best) = best_index {
                    if let Some(mut peer_state) = state.peers().state.get_mut(&peer) {
                        peer_state.sync.best_header_sent = Some(best);
                    }
                }
                return;
            }
            revert_to_inv = true;
        }

        if revert_to_inv {
            // The last entry was our tip at some point in the past.
            if let Some(tip_hash) = to_announce.last() {
                if !chain.is_main_chain(tip_hash) {
                    debug!(
                        target: "net",
                        "announcing block {:#x} not on main chain (tip={:#x})",
                        tip_hash,
                        chain.tip_header().hash()
                    );
                }
                let skip = chain
                    .get_header_view(tip_hash)
                    .map(|view| self.peer_has_header(peer, &view))
                    .unwrap_or(false);
                if !skip {
                    if let Some(mut peer_state) = state.peers().state.get_mut(&peer) {
                        peer_state.gossip.blocks_to_send.push(tip_hash.clone());
                    }
                    trace!(target: "net", "sending inv peer={} hash={:#x}", peer, tip_hash);
                }
            }
        }
    }

    /// Queued block invs go out at once; transaction invs trickle on a
    /// Poisson schedule through the known-inventory filter.
    fn flush_inventory(&self, nc: &dyn NetworkContext, peer: PeerIndex, now: u64) {
        let shared = self.shared();
        let chain = shared.chain();
        let state = shared.state();
        let mut inventory: Vec<Inv> = Vec::new();
        let mut chunks: Vec<Vec<Inv>> = Vec::new();

        if let Some(mut peer_state) = state.peers().state.get_mut(&peer) {
            for hash in std::mem::take(&mut peer_state.gossip.blocks_to_send) {
                inventory.push(Inv::block(hash));
                if inventory.len() == MAX_INV_SZ {
                    chunks.push(std::mem::take(&mut inventory));
                }
            }

            let mut trickle = peer_state.flags.is_whitelist;
            if peer_state.gossip.next_inv_send < now {
                trickle = true;
                // Outbound peers get half the delay; less privacy concern.
                let interval = INVENTORY_BROADCAST_INTERVAL
                    >> u64::from(!peer_state.flags.is_inbound);
                peer_state.gossip.next_inv_send = poisson_next_send(now, interval);
            }

            if trickle {
                if !peer_state.handshake.relay_txs {
                    peer_state.gossip.tx_to_send.clear();
                }
                let mut relayed = 0usize;
                while relayed < INVENTORY_BROADCAST_MAX {
                    let hash = match peer_state.gossip.tx_to_send.iter().next_back() {
                        Some(hash) => hash.clone(),
                        None => break,
                    };
                    peer_state.gossip.tx_to_send.remove(&hash);
                    if peer_state.gossip.known_inv.contains(&hash) {
                        continue;
                    }
                    // Dropped from the mempool since queuing: don't bother.
                    if !chain.mempool_contains(&hash) {
                        continue;
                    }
                    peer_state.gossip.known_inv.insert(&hash);
                    inventory.push(Inv::tx(hash));
                    relayed += 1;
                    if inventory.len() == MAX_INV_SZ {
                        chunks.push(std::mem::take(&mut inventory));
                    }
                }

                let mut relayed_stx = 0usize;
                while relayed_stx < INVENTORY_BROADCAST_MAX {
                    let hash = match peer_state.gossip.stx_to_send.iter().next_back() {
                        Some(hash) => hash.clone(),
                        None => break,
                    };
                    peer_state.gossip.stx_to_send.remove(&hash);
                    if peer_state.gossip.service_data_known.contains(&hash) {
                        continue;
                    }
                    inventory.push(Inv::stx(hash));
                    relayed_stx += 1;
                    if inventory.len() == MAX_INV_SZ {
                        chunks.push(std::mem::take(&mut inventory));
                    }
                }
            }
        }

        if !inventory.is_empty() {
            chunks.push(inventory);
        }
        for chunk in chunks {
            if let Err(err) = nc.send_message(peer, NetworkMessage::Inv(chunk)) {
                debug!(target: "net", "send inv error: {}", err);
            }
        }
    }

    /// Stall and per-block download timeouts. Returns true when the peer
    /// was disconnected.
    fn police_downloads(&self, nc: &dyn NetworkContext, peer: PeerIndex, now: u64) -> bool {
        let shared = self.shared();
        let state = shared.state();

        let (stalling_since, downloading_since, first_hash, valid_headers, others_validated) = {
            let inflight = state.read_inflight_blocks();
            (
                inflight.stalling_since(peer),
                inflight.downloading_since(peer),
                inflight
                    .first_in_flight(peer)
                    .map(|entry| entry.hash.clone()),
                inflight.peer_valid_headers_count(peer),
                inflight.peers_with_validated_downloads(),
            )
        };

        if stalling_since > 0 && stalling_since + BLOCK_STALLING_TIMEOUT < now {
            // Stalling only triggers when the download window cannot move,
            // which in steady state means initial download.
            info!(
                target: "net",
                "peer={} is stalling block download, disconnecting",
                peer
            );
            nc.disconnect(peer, "block download stall");
            return true;
        }

        if let (Some(since), Some(hash)) = (downloading_since, first_hash) {
            // Compensate for other busy peers so our own saturated link does
            // not get peers killed; only validated downloads count so peers
            // cannot inflate our timeout with fake hashes.
            let other = others_validated.saturating_sub(usize::from(valid_headers > 0)) as u64;
            let spacing = shared.chain().target_spacing();
            let timeout = spacing
                * (BLOCK_DOWNLOAD_TIMEOUT_BASE + BLOCK_DOWNLOAD_TIMEOUT_PER_PEER * other);
            if now > since + timeout {
                info!(
                    target: "net",
                    "timeout downloading block {:#x} from peer={}, disconnecting",
                    hash, peer
                );
                nc.disconnect(peer, "block download timeout");
                return true;
            }
        }
        false
    }

    /// Fill this peer's download pipeline from the planner.
    fn request_blocks(&self, nc: &dyn NetworkContext, peer: PeerIndex, now: u64, ibd: bool) {
        let shared = self.shared();
        let state = shared.state();

        let (is_client, preferred) = {
            match state.peers().state.get(&peer) {
                Some(peer_state) => (
                    peer_state.is_client(),
                    peer_state.sync.preferred_download,
                ),
                None => return,
            }
        };
        let fetch = preferred
            || (state
                .peers()
                .n_preferred_download
                .load(std::sync::atomic::Ordering::Acquire)
                == 0
                && !is_client);
        if is_client || !(fetch || !ibd) {
            return;
        }
        let in_flight = state.read_inflight_blocks().peer_inflight_count(peer);
        if in_flight >= MAX_BLOCKS_IN_TRANSIT_PER_PEER {
            return;
        }

        let plan = BlockFetcher::new(self, peer).fetch(MAX_BLOCKS_IN_TRANSIT_PER_PEER - in_flight);

        let mut get_data: Vec<Inv> = Vec::new();
        {
            let mut inflight = state.write_inflight_blocks();
            for view in &plan.blocks {
                let hash = view.hash().clone();
                if inflight.insert(peer, hash.clone(), Some(view.clone())) {
                    debug!(
                        target: "net",
                        "requesting block {:#x} ({}) peer={}",
                        hash,
                        view.height(),
                        peer
                    );
                    get_data.push(Inv::block(hash));
                }
            }
            if get_data.is_empty() {
                if let Some(staller) = plan.staller {
                    inflight.mark_stalling(staller, now);
                }
            }
        }
        if !get_data.is_empty() {
            if let Err(err) = nc.send_message(peer, NetworkMessage::GetData(get_data)) {
                debug!(target: "net", "send getdata error: {}", err);
            }
        }
    }

    /// Drain due ask-for entries into `getdata`, skipping what we already
    /// have.
    fn request_non_block_data(&self, nc: &dyn NetworkContext, peer: PeerIndex, now: u64) {
        let state = self.shared().state();
        let mut get_data: Vec<Inv> = Vec::new();
        let mut chunks: Vec<Vec<Inv>> = Vec::new();

        loop {
            let inv = {
                match state.peers().state.get_mut(&peer) {
                    Some(mut peer_state) => {
                        match peer_state.gossip.ask_for.peek() {
                            Some((_, priority)) if priority.deadline <= now => {}
                            _ => break,
                        }
                        match peer_state.gossip.ask_for.pop() {
                            Some((inv, _)) => {
                                if inv.kind == InvKind::Stx
                                    && peer_state.gossip.service_data_known.contains(&inv.hash)
                                {
                                    continue;
                                }
                                inv
                            }
                            None => break,
                        }
                    }
                    None => return,
                }
            };
            if self.already_have(&inv) {
                // Not asking means not expecting a response.
                state.forget_asked_for(&inv);
                continue;
            }
            trace!(target: "net", "requesting {} peer={}", inv, peer);
            get_data.push(inv);
            if get_data.len() >= 1_000 {
                chunks.push(std::mem::take(&mut get_data));
            }
        }

        if !get_data.is_empty() {
            chunks.push(get_data);
        }
        for chunk in chunks {
            if let Err(err) = nc.send_message(peer, NetworkMessage::GetData(chunk)) {
                debug!(target: "net", "send getdata error: {}", err);
            }
        }
    }
}
