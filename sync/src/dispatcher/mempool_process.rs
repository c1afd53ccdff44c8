use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, TxPoolProvider};
use crate::Status;
use ember_constant::sync::MAX_INV_SZ;
use ember_network::{NetworkContext, PeerIndex};
use ember_types::{Inv, NetworkMessage};
use log::debug;

/// `mempool` request: announce the pool's contents, run through the peer's
/// bloom filter when one is loaded, chunked at the inv size limit.
pub struct MempoolProcess<'a, C> {
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
    nc: &'a dyn NetworkContext,
}

impl<'a, C: ChainProvider + TxPoolProvider> MempoolProcess<'a, C> {
    pub fn new(handler: &'a MessageHandler<C>, peer: PeerIndex, nc: &'a dyn NetworkContext) -> Self {
        MempoolProcess { handler, peer, nc }
    }

    pub fn execute(self) -> Status {
        let shared = self.handler.shared();
        let chain = shared.chain();
        let state = shared.state();

        let mut inventory: Vec<Inv> = Vec::new();
        for hash in chain.mempool_hashes() {
            if state.interrupted() {
                break;
            }
            let filtered_out = {
                state
                    .peers()
                    .state
                    .get(&self.peer)
                    .and_then(|peer_state| {
                        peer_state.bloom_filter.as_ref().map(|filter| {
                            match chain.mempool_get(&hash) {
                                // Gone since the snapshot, maybe a race with
                                // eviction; skip it.
                                None => true,
                                Some(tx) => !filter.is_relevant(&tx),
                            }
                        })
                    })
                    .unwrap_or(false)
            };
            if filtered_out {
                continue;
            }
            inventory.push(Inv::tx(hash));
            if inventory.len() == MAX_INV_SZ {
                self.send_chunk(std::mem::take(&mut inventory));
            }
        }
        if !inventory.is_empty() {
            self.send_chunk(inventory);
        }
        Status::ok()
    }

    fn send_chunk(&self, inventory: Vec<Inv>) {
        if let Err(err) = self
            .nc
            .send_message(self.peer, NetworkMessage::Inv(inventory))
        {
            debug!(target: "net", "send inv error: {}", err);
        }
    }
}
