use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, TxAcceptance, TxPoolProvider};
use crate::{Status, StatusCode};
use ember_network::PeerIndex;
use ember_types::{Inv, Transaction, H256};
use faketime::unix_time_as_millis;
use log::debug;
use std::collections::{HashSet, VecDeque};

/// Transaction intake: mempool admission, recursive orphan resolution,
/// parent requests for new orphans, reject bookkeeping.
pub struct TxProcess<'a, C> {
    tx: Transaction,
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
}

impl<'a, C: ChainProvider + TxPoolProvider> TxProcess<'a, C> {
    pub fn new(tx: Transaction, handler: &'a MessageHandler<C>, peer: PeerIndex) -> Self {
        TxProcess { tx, handler, peer }
    }

    pub fn execute(self) -> Status {
        let shared = self.handler.shared();
        let state = shared.state();
        let chain = shared.chain();

        let (relay_allowed, whitelisted) = state
            .peers()
            .state
            .get(&self.peer)
            .map(|peer_state| {
                (
                    peer_state.handshake.relay_txs,
                    peer_state.flags.is_whitelist,
                )
            })
            .unwrap_or((true, false));
        if !relay_allowed && !(whitelisted && state.config().whitelist_relay) {
            debug!(
                target: "net",
                "transaction sent in violation of protocol peer={}",
                self.peer
            );
            return StatusCode::Ignored.with_context("transaction in blocks-only mode");
        }

        let tx = self.tx.clone();
        let hash = tx.hash();
        let inv = Inv::tx(hash.clone());
        let now = unix_time_as_millis();

        if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
            peer_state.gossip.known_inv.insert(&hash);
            peer_state.gossip.ask_for.remove(&inv);
        }
        state.forget_asked_for(&inv);

        if !self.handler.already_have(&inv) {
            match chain.accept_to_mempool(tx.clone()) {
                TxAcceptance::Accepted => {
                    state.relay_cache().insert(tx.clone(), now);
                    state.relay_transaction(&hash);
                    debug!(
                        target: "mempool",
                        "accepted {:#x} from peer={}",
                        hash, self.peer
                    );
                    self.process_orphan_descendants(hash);
                    return Status::ok();
                }
                TxAcceptance::MissingInputs => {
                    return self.handle_missing_inputs(tx);
                }
                TxAcceptance::Rejected(rejection) => {
                    if !rejection.corruption_possible {
                        state.recent_rejects().insert(&hash);
                    }
                    if whitelisted && state.config().whitelist_force_relay {
                        // Let a gateway peer's transactions through even when
                        // our policy keeps them out of the mempool, unless
                        // relaying would earn us a DoS score elsewhere.
                        if rejection.dos == 0 {
                            debug!(
                                target: "net",
                                "force relaying tx {:#x} from whitelisted peer={}",
                                hash, self.peer
                            );
                            state.relay_cache().insert(tx.clone(), now);
                            state.relay_transaction(&hash);
                        } else {
                            debug!(
                                target: "net",
                                "not relaying invalid transaction {:#x} from \
                                 whitelisted peer={} ({})",
                                hash, self.peer, rejection.reason
                            );
                        }
                    }
                    debug!(
                        target: "mempool",
                        "{:#x} from peer={} was not accepted: {}",
                        hash, self.peer, rejection.reason
                    );
                    if rejection.code.is_wire_visible() {
                        state.queue_reject(
                            self.peer,
                            "tx",
                            rejection.code,
                            rejection.reason.clone(),
                            hash.clone(),
                        );
                    }
                    if rejection.dos > 0 {
                        state.misbehave(self.peer, rejection.dos, &rejection.reason);
                    }
                    return StatusCode::InvalidData.with_context(rejection.reason);
                }
            }
        } else if whitelisted && state.config().whitelist_force_relay {
            debug!(
                target: "net",
                "force relaying known tx {:#x} from whitelisted peer={}",
                hash, self.peer
            );
            state.relay_cache().insert(tx, now);
            state.relay_transaction(&hash);
        }
        Status::ok()
    }

    /// Re-offer every orphan that was waiting on `accepted`, walking the
    /// dependency graph breadth-first as acceptances cascade.
    fn process_orphan_descendants(&self, accepted: H256) {
        let shared = self.handler.shared();
        let state = shared.state();
        let chain = shared.chain();
        let now = unix_time_as_millis();

        let mut work_queue: VecDeque<H256> = VecDeque::new();
        let mut erase_queue: Vec<H256> = Vec::new();
        let mut punished_peers: HashSet<PeerIndex> = HashSet::new();
        work_queue.push_back(accepted);

        while let Some(parent_hash) = work_queue.pop_front() {
            if state.interrupted() {
                break;
            }
            for orphan_hash in state.orphan_pool().dependents_of(&parent_hash) {
                let entry = match state.orphan_pool().get(&orphan_hash) {
                    Some(entry) => entry,
                    None => continue,
                };
                if punished_peers.contains(&entry.from_peer) {
                    continue;
                }
                match chain.accept_to_mempool(entry.tx.clone()) {
                    TxAcceptance::Accepted => {
                        debug!(target: "mempool", "accepted orphan tx {:#x}", orphan_hash);
                        state.relay_cache().insert(entry.tx.clone(), now);
                        state.relay_transaction(&orphan_hash);
                        work_queue.push_back(orphan_hash.clone());
                        erase_queue.push(orphan_hash);
                    }
                    TxAcceptance::MissingInputs => {
                        // Still waiting on more parents; leave it alone.
                    }
                    TxAcceptance::Rejected(rejection) => {
                        if rejection.dos > 0 {
                            // Punish whoever fed us the invalid orphan, not
                            // the peer that resolved its parent.
                            state.misbehave(
                                entry.from_peer,
                                rejection.dos,
                                "invalid-orphan-tx",
                            );
                            punished_peers.insert(entry.from_peer);
                            debug!(target: "mempool", "invalid orphan tx {:#x}", orphan_hash);
                        }
                        debug!(target: "mempool", "removed orphan tx {:#x}", orphan_hash);
                        erase_queue.push(orphan_hash.clone());
                        if !rejection.corruption_possible {
                            state.recent_rejects().insert(&orphan_hash);
                        }
                    }
                }
            }
        }

        for hash in erase_queue {
            state.orphan_pool().remove_orphan_tx(&hash);
        }
    }

    /// The transaction spends outputs we do not know: request its parents
    /// and park it, unless its parents were recently rejected.
    fn handle_missing_inputs(&self, tx: Transaction) -> Status {
        let state = self.handler.shared().state();
        let hash = tx.hash();
        let now = unix_time_as_millis();

        let rejected_parents = {
            let rejects = state.recent_rejects();
            tx.parent_hashes()
                .iter()
                .any(|parent| rejects.contains(parent))
        };
        if rejected_parents {
            debug!(
                target: "mempool",
                "not keeping orphan with rejected parents {:#x}",
                hash
            );
            // Keep refusing it without re-requesting from other peers.
            state.recent_rejects().insert(&hash);
            return StatusCode::Transient.with_context("orphan with rejected parents");
        }

        for parent in tx.parent_hashes() {
            let parent_inv = Inv::tx(parent);
            if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
                peer_state.gossip.known_inv.insert(&parent_inv.hash);
            }
            if !self.handler.already_have(&parent_inv) {
                if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
                    state.ask_for(&mut peer_state, parent_inv, now);
                }
            }
        }
        state.orphan_pool().add_orphan_tx(tx, self.peer);
        let max_orphans = state.config().max_orphan_tx;
        state.orphan_pool().limit_size(max_orphans);
        StatusCode::Transient.with_context(format!("orphan tx {:#x}", hash))
    }
}
