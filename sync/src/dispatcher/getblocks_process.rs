use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, TxPoolProvider};
use crate::{Status, StatusCode};
use ember_constant::sync::MAX_GETBLOCKS_RESULTS;
use ember_network::PeerIndex;
use ember_types::H256;
use log::debug;

/// Legacy block-inventory walk: find the fork point from the locator and
/// queue up to 500 following block hashes as inv announcements.
pub struct GetBlocksProcess<'a, C> {
    locator: Vec<H256>,
    hash_stop: H256,
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
}

impl<'a, C: ChainProvider + TxPoolProvider> GetBlocksProcess<'a, C> {
    pub fn new(
        locator: Vec<H256>,
        hash_stop: H256,
        handler: &'a MessageHandler<C>,
        peer: PeerIndex,
    ) -> Self {
        GetBlocksProcess {
            locator,
            hash_stop,
            handler,
            peer,
        }
    }

    pub fn execute(self) -> Status {
        let shared = self.handler.shared();
        let chain = shared.chain();
        let state = shared.state();

        let fork = shared.find_fork_in_locator(&self.locator);
        let mut height = match fork {
            Some(fork) => fork.height() + 1,
            None => {
                return StatusCode::Ignored
                    .with_context("getblocks locator shares no block with us")
            }
        };
        let tip_height = chain.tip_header().height();
        debug!(
            target: "net",
            "getblocks {} to {:#x} limit {} from peer={}",
            height, self.hash_stop, MAX_GETBLOCKS_RESULTS, self.peer
        );

        let mut sent = 0usize;
        while height <= tip_height {
            let hash = match chain.get_block_hash(height) {
                Some(hash) => hash,
                None => break,
            };
            if hash == self.hash_stop {
                debug!(target: "net", "getblocks stopping at {} {:#x}", height, hash);
                break;
            }
            sent += 1;
            let at_limit = sent >= MAX_GETBLOCKS_RESULTS;
            if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
                peer_state.gossip.blocks_to_send.push(hash.clone());
                if at_limit {
                    // When this block is requested we send an inv of our tip,
                    // prompting the peer to getblocks the next batch.
                    debug!(
                        target: "net",
                        "getblocks stopping at limit {} {:#x}",
                        height, hash
                    );
                    peer_state.gossip.continue_hash = Some(hash);
                }
            }
            if at_limit {
                break;
            }
            height += 1;
        }
        Status::ok()
    }
}
