use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, TxPoolProvider};
use crate::{Status, StatusCode};
use ember_network::PeerIndex;
use ember_types::{BloomFilter, MAX_FILTER_DATA_SIZE};

enum FilterOp {
    Load(BloomFilter),
    Add(Vec<u8>),
    Clear,
}

/// `filterload`/`filteradd`/`filterclear`: maintain the peer's uploaded
/// BIP37 filter. Size violations are worth an immediate ban score; there is
/// no honest reason to send them.
pub struct FilterProcess<'a, C> {
    op: FilterOp,
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
}

impl<'a, C: ChainProvider + TxPoolProvider> FilterProcess<'a, C> {
    pub fn load(filter: BloomFilter, handler: &'a MessageHandler<C>, peer: PeerIndex) -> Self {
        FilterProcess {
            op: FilterOp::Load(filter),
            handler,
            peer,
        }
    }

    pub fn add(data: Vec<u8>, handler: &'a MessageHandler<C>, peer: PeerIndex) -> Self {
        FilterProcess {
            op: FilterOp::Add(data),
            handler,
            peer,
        }
    }

    pub fn clear(handler: &'a MessageHandler<C>, peer: PeerIndex) -> Self {
        FilterProcess {
            op: FilterOp::Clear,
            handler,
            peer,
        }
    }

    pub fn execute(self) -> Status {
        let state = self.handler.shared().state();
        match self.op {
            FilterOp::Load(mut filter) => {
                if !filter.is_within_size_constraints() {
                    state.misbehave(self.peer, 100, "oversized-bloom-filter");
                    return StatusCode::ProtocolViolation.with_context("oversized bloom filter");
                }
                filter.update_empty_full();
                if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
                    peer_state.bloom_filter = Some(filter);
                    peer_state.handshake.relay_txs = true;
                }
                Status::ok()
            }
            FilterOp::Add(data) => {
                // The max matched object is a script push; nothing bigger
                // can legitimately be added.
                if data.len() > MAX_FILTER_DATA_SIZE {
                    state.misbehave(self.peer, 100, "invalid-filteradd");
                    return StatusCode::ProtocolViolation.with_context("oversized filteradd");
                }
                let mut missing_filter = false;
                if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
                    match peer_state.bloom_filter.as_mut() {
                        Some(filter) => filter.insert(&data),
                        None => missing_filter = true,
                    }
                }
                if missing_filter {
                    state.misbehave(self.peer, 100, "invalid-filteradd");
                    return StatusCode::ProtocolViolation.with_context("filteradd without filter");
                }
                Status::ok()
            }
            FilterOp::Clear => {
                if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
                    peer_state.bloom_filter = Some(BloomFilter::empty());
                    peer_state.handshake.relay_txs = true;
                }
                Status::ok()
            }
        }
    }
}
