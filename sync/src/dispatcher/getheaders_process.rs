use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, TxPoolProvider};
use crate::{Status, StatusCode};
use ember_constant::sync::MAX_HEADERS_RESULTS;
use ember_network::{NetworkContext, PeerIndex};
use ember_types::{Header, NetworkMessage, H256};
use log::debug;

/// Serve a headers walk from the fork point the locator resolves to, or
/// from the named block when the locator is empty.
pub struct GetHeadersProcess<'a, C> {
    locator: Vec<H256>,
    hash_stop: H256,
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
    nc: &'a dyn NetworkContext,
}

impl<'a, C: ChainProvider + TxPoolProvider> GetHeadersProcess<'a, C> {
    pub fn new(
        locator: Vec<H256>,
        hash_stop: H256,
        handler: &'a MessageHandler<C>,
        peer: PeerIndex,
        nc: &'a dyn NetworkContext,
    ) -> Self {
        GetHeadersProcess {
            locator,
            hash_stop,
            handler,
            peer,
            nc,
        }
    }

    pub fn execute(self) -> Status {
        let shared = self.handler.shared();
        let chain = shared.chain();
        let state = shared.state();

        let whitelisted = state
            .peers()
            .state
            .get(&self.peer)
            .map(|peer_state| peer_state.flags.is_whitelist)
            .unwrap_or(false);
        if chain.is_initial_block_download() && !whitelisted {
            return StatusCode::Ignored.with_context(format!(
                "ignoring getheaders from peer={} during initial block download",
                self.peer
            ));
        }

        // Resolve where to start: the block after the locator fork point, or
        // the named block itself for a direct request.
        let start = if self.locator.is_empty() {
            match chain.get_header_view(&self.hash_stop) {
                Some(view) => Some(view),
                None => return Status::ignored(),
            }
        } else {
            shared.find_fork_in_locator(&self.locator).and_then(|fork| {
                chain
                    .get_block_hash(fork.height() + 1)
                    .and_then(|hash| chain.get_header_view(&hash))
            })
        };

        debug!(
            target: "net",
            "getheaders {} to {:#x} from peer={}",
            start.as_ref().map(|view| view.height() as i64).unwrap_or(-1),
            self.hash_stop,
            self.peer
        );

        let mut headers: Vec<Header> = Vec::new();
        let mut cursor = start;
        let mut last_sent = None;
        while let Some(view) = cursor {
            headers.push(view.inner().clone());
            let stop = headers.len() >= MAX_HEADERS_RESULTS || view.hash() == &self.hash_stop;
            let next_height = view.height() + 1;
            last_sent = Some(view);
            if stop {
                break;
            }
            cursor = chain
                .get_block_hash(next_height)
                .and_then(|hash| chain.get_header_view(&hash));
        }

        // Record what we told the peer about, unconditionally resetting to
        // our tip on an empty reply: the peer may be asking because of an
        // announcement raced with the connecting block, and a stale
        // best-header-sent would suppress re-announcing it.
        let best_sent = last_sent.unwrap_or_else(|| chain.tip_header());
        if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
            peer_state.sync.best_header_sent = Some(best_sent);
        }

        if let Err(err) = self
            .nc
            .send_message(self.peer, NetworkMessage::Headers(headers))
        {
            return StatusCode::Network.with_context(format!("send headers: {}", err));
        }
        Status::ok()
    }
}
