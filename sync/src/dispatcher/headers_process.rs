use crate::block_status::BlockStatus;
use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, TxPoolProvider};
use crate::types::HeaderView;
use crate::{Status, StatusCode};
use ember_constant::sync::{MAX_BLOCKS_IN_TRANSIT_PER_PEER, MAX_HEADERS_RESULTS};
use ember_network::{NetworkContext, PeerIndex};
use ember_types::{Header, Inv, NetworkMessage};
use log::debug;

/// Headers intake: continuity enforcement, header admission, follow-up
/// requests, and direct fetch of the blocks the new headers make known.
pub struct HeadersProcess<'a, C> {
    headers: Vec<Header>,
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
    nc: &'a dyn NetworkContext,
}

impl<'a, C: ChainProvider + TxPoolProvider> HeadersProcess<'a, C> {
    pub fn new(
        headers: Vec<Header>,
        handler: &'a MessageHandler<C>,
        peer: PeerIndex,
        nc: &'a dyn NetworkContext,
    ) -> Self {
        HeadersProcess {
            headers,
            handler,
            peer,
            nc,
        }
    }

    fn is_continuous(&self) -> bool {
        self.headers.windows(2).all(|window| {
            if let [parent, header] = window {
                header.parent_hash == parent.hash()
            } else {
                true
            }
        })
    }

    pub fn execute(self) -> Status {
        let shared = self.handler.shared();
        let chain = shared.chain();
        let state = shared.state();

        if self.headers.len() > MAX_HEADERS_RESULTS {
            state.misbehave(self.peer, 20, "too-many-headers");
            return StatusCode::ProtocolViolation
                .with_context(format!("headers size {}", self.headers.len()));
        }
        if self.headers.is_empty() {
            // Nothing interesting; the peer has no more headers for us.
            return Status::ok();
        }
        if !self.is_continuous() {
            state.misbehave(self.peer, 20, "disconnected-header");
            return StatusCode::ProtocolViolation.with_context("non-continuous headers sequence");
        }

        let count = self.headers.len();
        let mut last_view: Option<HeaderView> = None;
        for header in &self.headers {
            match chain.accept_block_header(header) {
                Ok(view) => last_view = Some(view),
                Err(rejection) => {
                    if rejection.dos > 0 {
                        state.misbehave(self.peer, rejection.dos, &rejection.reason);
                    }
                    return StatusCode::InvalidData
                        .with_context(format!("invalid header received: {}", rejection.reason));
                }
            }
        }
        let last_view = match last_view {
            Some(view) => view,
            None => return Status::ok(),
        };

        shared.update_block_availability(self.peer, last_view.hash());

        if count == MAX_HEADERS_RESULTS {
            // A full-size reply means the peer has more headers; continue
            // from the batch's end.
            debug!(
                target: "net",
                "more getheaders ({}) to end to peer={}",
                last_view.height(),
                self.peer
            );
            let locator = shared.get_locator(&last_view);
            let message = NetworkMessage::GetHeaders {
                locator,
                hash_stop: Default::default(),
            };
            if let Err(err) = self.nc.send_message(self.peer, message) {
                debug!(target: "net", "send getheaders error: {}", err);
            }
        }

        // If the chain these headers end on carries at least as much work as
        // our tip and the tip is fresh, fetch the missing blocks directly.
        let tip = chain.tip_header();
        if shared.can_direct_fetch() && tip.total_work() <= last_view.total_work() {
            self.direct_fetch(&last_view);
        }
        Status::ok()
    }

    fn direct_fetch(&self, last_view: &HeaderView) {
        let shared = self.handler.shared();
        let chain = shared.chain();
        let state = shared.state();

        // Walk back to the highest ancestor we have, collecting the gap.
        let mut to_fetch: Vec<HeaderView> = Vec::new();
        let mut walk = Some(last_view.clone());
        let mut reached_chain = false;
        while let Some(view) = walk {
            if chain.is_main_chain(view.hash()) {
                reached_chain = true;
                break;
            }
            if to_fetch.len() > MAX_BLOCKS_IN_TRANSIT_PER_PEER {
                break;
            }
            let status = chain.get_block_status(view.hash());
            let in_flight = state.read_inflight_blocks().contains(view.hash());
            if !status.contains(BlockStatus::BLOCK_STORED) && !in_flight {
                to_fetch.push(view.clone());
            }
            walk = chain.get_header_view(view.parent_hash());
        }
        if !reached_chain {
            // A reorg this deep while we think we're caught up is not a
            // direct-fetch situation; parallel download handles it.
            debug!(
                target: "net",
                "large reorg, won't direct fetch to {:#x} ({})",
                last_view.hash(),
                last_view.height()
            );
            return;
        }

        let mut get_data: Vec<Inv> = Vec::new();
        {
            let mut inflight = state.write_inflight_blocks();
            // Earliest blocks first.
            for view in to_fetch.into_iter().rev() {
                if inflight.peer_inflight_count(self.peer) >= MAX_BLOCKS_IN_TRANSIT_PER_PEER {
                    break;
                }
                let hash = view.hash().clone();
                if inflight.insert(self.peer, hash.clone(), Some(view)) {
                    debug!(
                        target: "net",
                        "requesting block {:#x} from peer={}",
                        hash, self.peer
                    );
                    get_data.push(Inv::block(hash));
                }
            }
        }
        if get_data.len() > 1 {
            debug!(
                target: "net",
                "downloading blocks toward {:#x} ({}) via headers direct fetch",
                last_view.hash(),
                last_view.height()
            );
        }
        if !get_data.is_empty() {
            if let Err(err) = self
                .nc
                .send_message(self.peer, NetworkMessage::GetData(get_data))
            {
                debug!(target: "net", "send getdata error: {}", err);
            }
        }
    }
}
