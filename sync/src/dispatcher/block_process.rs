use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, TxPoolProvider};
use crate::{Status, StatusCode};
use ember_network::PeerIndex;
use ember_types::Block;
use log::debug;

/// A full block arrived: attribute it, release its in-flight slot, and hand
/// it to validation.
pub struct BlockProcess<'a, C> {
    block: Block,
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
}

impl<'a, C: ChainProvider + TxPoolProvider> BlockProcess<'a, C> {
    pub fn new(block: Block, handler: &'a MessageHandler<C>, peer: PeerIndex) -> Self {
        BlockProcess {
            block,
            handler,
            peer,
        }
    }

    pub fn execute(self) -> Status {
        let shared = self.handler.shared();
        let chain = shared.chain();
        let state = shared.state();
        let hash = self.block.hash();
        debug!(target: "net", "received block {:#x} peer={}", hash, self.peer);

        // Whitelisted peers get their blocks processed even unrequested,
        // once we are out of initial download.
        let whitelisted = state
            .peers()
            .state
            .get(&self.peer)
            .map(|peer_state| peer_state.flags.is_whitelist)
            .unwrap_or(false);
        let mut force_processing = whitelisted && !chain.is_initial_block_download();

        let requested = state.write_inflight_blocks().mark_received(&hash).is_some();
        // A block we asked for is processed unconditionally; we may need it
        // even when it cannot become the new tip.
        force_processing |= requested;

        // Attribution decides who eats a later rejection.
        state.record_block_source(&hash, self.peer, true);

        match chain.process_new_block(self.block, self.peer, force_processing) {
            Ok(()) => Status::ok(),
            Err(rejection) => {
                // Blocks are never rejected with internal codes.
                debug_assert!(rejection.code.is_wire_visible());
                if rejection.code.is_wire_visible() {
                    state.queue_reject(
                        self.peer,
                        "block",
                        rejection.code,
                        rejection.reason.clone(),
                        hash.clone(),
                    );
                }
                if rejection.dos > 0 {
                    state.misbehave(self.peer, rejection.dos, "invalid-blk");
                }
                state.take_block_source(&hash);
                StatusCode::InvalidData.with_context(rejection.reason)
            }
        }
    }
}
