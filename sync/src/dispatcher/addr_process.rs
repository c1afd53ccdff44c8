use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, TxPoolProvider};
use crate::{Status, StatusCode};
use ember_constant::sync::MAX_ADDR_SZ;
use ember_network::{NetworkContext, PeerIndex};
use ember_types::{NetAddress, ServiceFlags};
use faketime::unix_time_as_millis;
use log::debug;
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

const ADDR_FRESHNESS: u64 = 10 * 60; // seconds
const STALE_PENALTY: u64 = 5 * 24 * 60 * 60; // seconds

/// Address gossip intake: validate, clamp timestamps, relay fresh entries
/// to a deterministic pair of peers, store the reachable remainder.
pub struct AddrProcess<'a, C> {
    addresses: Vec<NetAddress>,
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
    nc: &'a dyn NetworkContext,
}

impl<'a, C: ChainProvider + TxPoolProvider> AddrProcess<'a, C> {
    pub fn new(
        addresses: Vec<NetAddress>,
        handler: &'a MessageHandler<C>,
        peer: PeerIndex,
        nc: &'a dyn NetworkContext,
    ) -> Self {
        AddrProcess {
            addresses,
            handler,
            peer,
            nc,
        }
    }

    pub fn execute(mut self) -> Status {
        let state = self.handler.shared().state();

        if self.addresses.len() > MAX_ADDR_SZ {
            state.misbehave(self.peer, 20, "oversized-addr");
            return StatusCode::ProtocolViolation
                .with_context(format!("addr size {}", self.addresses.len()));
        }

        let now = unix_time_as_millis() / 1_000;
        let since = now.saturating_sub(ADDR_FRESHNESS);
        let addresses = std::mem::take(&mut self.addresses);
        let batch_size = addresses.len();
        let getaddr_pending = state
            .peers()
            .state
            .get(&self.peer)
            .map(|peer_state| peer_state.handshake.getaddr_sent)
            .unwrap_or(false);

        let mut reachable = Vec::with_capacity(batch_size);
        for mut address in addresses {
            if state.interrupted() {
                break;
            }
            if !address.services.contains(ServiceFlags::NETWORK) {
                continue;
            }
            // Clamp nonsense timestamps to five days old.
            if address.time <= 100_000_000 || address.time > now + ADDR_FRESHNESS {
                address.time = now.saturating_sub(STALE_PENALTY);
            }
            if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
                peer_state.gossip.known_addrs.insert(&address.key());
            }
            let is_reachable = self.nc.is_reachable(&address);
            if address.time > since
                && !getaddr_pending
                && batch_size <= 10
                && address.is_routable()
            {
                self.relay_address(&address, now);
            }
            if is_reachable {
                reachable.push(address);
            }
        }

        let source = state
            .peers()
            .state
            .get(&self.peer)
            .map(|peer_state| peer_state.address.clone());
        if let Some(source) = source {
            self.nc.add_addresses(reachable, &source);
        }

        if batch_size < MAX_ADDR_SZ {
            if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
                peer_state.handshake.getaddr_sent = false;
            }
        }
        let oneshot = state
            .peers()
            .state
            .get(&self.peer)
            .map(|peer_state| peer_state.flags.is_oneshot)
            .unwrap_or(false);
        if oneshot {
            self.nc.disconnect(self.peer, "oneshot done");
        }
        Status::ok()
    }

    /// Queue `address` to the two best peers chosen by a keyed hash of
    /// (address, day, peer), so for 24 hours the same nodes keep receiving
    /// it and their known-address filters suppress repeats.
    fn relay_address(&self, address: &NetAddress, now: u64) {
        let state = self.handler.shared().state();
        let (k0, k1) = state.addr_relay_key();
        let addr_key = address.key();
        let addr_hash = {
            let mut hasher = SipHasher24::new_with_keys(k0, k1);
            hasher.write(&addr_key);
            hasher.finish()
        };
        let day = (now + addr_hash) / (24 * 60 * 60);

        let mut best: [(u64, Option<PeerIndex>); 2] = [(0, None), (0, None)];
        for entry in state.peers().state.iter() {
            let peer = *entry.key();
            if peer == self.peer || !entry.handshake.successfully_connected {
                continue;
            }
            let mut hasher = SipHasher24::new_with_keys(k0, k1);
            hasher.write(&addr_key);
            hasher.write_u64(day);
            hasher.write_u64(peer.value() as u64);
            let key = hasher.finish();
            if key > best[0].0 {
                best[1] = best[0];
                best[0] = (key, Some(peer));
            } else if key > best[1].0 {
                best[1] = (key, Some(peer));
            }
        }

        for (_, candidate) in best.iter() {
            if let Some(peer) = candidate {
                if let Some(mut peer_state) = state.peers().state.get_mut(peer) {
                    if !peer_state.gossip.known_addrs.contains(&addr_key) {
                        peer_state.gossip.addrs_to_send.push(address.clone());
                    }
                }
            }
        }
    }
}

/// `getaddr` service: inbound connections only, once per connection.
pub struct GetAddrProcess<'a, C> {
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
    nc: &'a dyn NetworkContext,
}

impl<'a, C: ChainProvider + TxPoolProvider> GetAddrProcess<'a, C> {
    pub fn new(handler: &'a MessageHandler<C>, peer: PeerIndex, nc: &'a dyn NetworkContext) -> Self {
        GetAddrProcess { handler, peer, nc }
    }

    pub fn execute(self) -> Status {
        let state = self.handler.shared().state();
        let is_inbound = self
            .nc
            .peer_info(self.peer)
            .map(|info| info.is_inbound)
            .unwrap_or(false);
        if !is_inbound {
            // An attacker could stuff our address manager and read it back;
            // outbound connections don't get to ask.
            debug!(
                target: "net",
                "ignoring getaddr from outbound connection, peer={}",
                self.peer
            );
            return Status::ignored();
        }

        let already_served = {
            match state.peers().state.get_mut(&self.peer) {
                Some(mut peer_state) => {
                    let served = peer_state.handshake.getaddr_served;
                    peer_state.handshake.getaddr_served = true;
                    served
                }
                None => return Status::ignored(),
            }
        };
        if already_served {
            debug!(target: "net", "ignoring repeated getaddr, peer={}", self.peer);
            return Status::ignored();
        }

        let snapshot = self.nc.addresses_snapshot();
        if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
            peer_state.gossip.addrs_to_send.clear();
            peer_state.gossip.addrs_to_send.extend(snapshot);
        }
        Status::ok()
    }
}
