use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, TxPoolProvider};
use crate::{Status, StatusCode};
use ember_constant::sync::{MAX_BLOCKS_IN_TRANSIT_PER_PEER, MAX_INV_SZ};
use ember_network::{NetworkContext, PeerIndex};
use ember_types::{Inv, InvKind, NetworkMessage};
use faketime::unix_time_as_millis;
use log::{debug, trace};

/// Inventory announcements: track block availability, chase unknown blocks
/// with `getheaders` (plus direct fetch when the tip is fresh), and
/// schedule `getdata` for unknown transactions.
pub struct InvProcess<'a, C> {
    inventory: Vec<Inv>,
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
    nc: &'a dyn NetworkContext,
}

impl<'a, C: ChainProvider + TxPoolProvider> InvProcess<'a, C> {
    pub fn new(
        inventory: Vec<Inv>,
        handler: &'a MessageHandler<C>,
        peer: PeerIndex,
        nc: &'a dyn NetworkContext,
    ) -> Self {
        InvProcess {
            inventory,
            handler,
            peer,
            nc,
        }
    }

    pub fn execute(self) -> Status {
        let shared = self.handler.shared();
        let state = shared.state();

        if self.inventory.len() > MAX_INV_SZ {
            state.misbehave(self.peer, 20, "oversized-inv");
            return StatusCode::ProtocolViolation
                .with_context(format!("inv size {}", self.inventory.len()));
        }

        let (mut blocks_only, whitelisted) = state
            .peers()
            .state
            .get(&self.peer)
            .map(|peer_state| {
                (
                    !peer_state.handshake.relay_txs,
                    peer_state.flags.is_whitelist,
                )
            })
            .unwrap_or((false, false));
        // Whitelisted peers may gossip transactions even in blocks-only mode.
        if whitelisted && state.config().whitelist_relay {
            blocks_only = false;
        }

        let can_direct_fetch = shared.can_direct_fetch();
        let ibd = shared.chain().is_initial_block_download();
        let now = unix_time_as_millis();
        let mut to_fetch: Vec<Inv> = Vec::new();

        for inv in &self.inventory {
            if state.interrupted() {
                return Status::ok();
            }
            let already_have = self.handler.already_have(inv);
            trace!(
                target: "net",
                "got inv: {} {} peer={}",
                inv,
                if already_have { "have" } else { "new" },
                self.peer
            );

            match inv.kind {
                InvKind::Block | InvKind::FilteredBlock => {
                    shared.update_block_availability(self.peer, &inv.hash);
                    let in_flight = state.read_inflight_blocks().contains(&inv.hash);
                    if !already_have && !in_flight {
                        // Headers announcements are the primary path; an inv
                        // here usually means a reorg on the peer's side, so
                        // ask for headers first and only direct-fetch the
                        // block when our tip is fresh enough for it to be
                        // plausibly next.
                        let best = shared.chain().best_header();
                        let locator = shared.get_locator(&best);
                        let message = NetworkMessage::GetHeaders {
                            locator,
                            hash_stop: inv.hash.clone(),
                        };
                        if let Err(err) = self.nc.send_message(self.peer, message) {
                            debug!(target: "net", "send getheaders error: {}", err);
                        }
                        debug!(
                            target: "net",
                            "getheaders ({}) {:#x} to peer={}",
                            best.height(),
                            inv.hash,
                            self.peer
                        );
                        if can_direct_fetch {
                            let mut inflight = state.write_inflight_blocks();
                            if inflight.peer_inflight_count(self.peer)
                                < MAX_BLOCKS_IN_TRANSIT_PER_PEER
                                && inflight.insert(self.peer, inv.hash.clone(), None)
                            {
                                to_fetch.push(Inv::block(inv.hash.clone()));
                            }
                        }
                    }
                }
                InvKind::Tx | InvKind::Stx => {
                    if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
                        peer_state.gossip.known_inv.insert(&inv.hash);
                    }
                    if blocks_only {
                        debug!(
                            target: "net",
                            "transaction inv {:#x} in violation of protocol, peer={}",
                            inv.hash, self.peer
                        );
                    } else if !already_have && !ibd {
                        if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
                            state.ask_for(&mut peer_state, inv.clone(), now);
                        }
                    }
                }
            }
        }

        if !to_fetch.is_empty() {
            if let Err(err) = self
                .nc
                .send_message(self.peer, NetworkMessage::GetData(to_fetch))
            {
                debug!(target: "net", "send getdata error: {}", err);
            }
        }
        Status::ok()
    }
}
