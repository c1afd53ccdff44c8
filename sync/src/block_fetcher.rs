use crate::block_status::BlockStatus;
use crate::dispatcher::MessageHandler;
use crate::provider::ChainProvider;
use crate::types::HeaderView;
use ember_constant::sync::BLOCK_DOWNLOAD_WINDOW;
use ember_network::PeerIndex;
use log::trace;
use std::cmp;

// Batch size of the ancestor walk; resolving an ancestor can cost about as
// much as iterating this many index entries.
const PER_FETCH_BLOCK_LIMIT: usize = 128;

/// Plan of one fetch pass: blocks to request now, plus the peer pinning the
/// window edge when nothing could be scheduled because of it.
#[derive(Default, Debug)]
pub struct FetchPlan {
    pub blocks: Vec<HeaderView>,
    pub staller: Option<PeerIndex>,
}

/// Picks the next blocks to download from one peer: advance the last common
/// block toward the peer's best known header and request the not-yet-owned
/// successors inside the download window.
pub struct BlockFetcher<'a, C> {
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
    tip: HeaderView,
}

impl<'a, C: ChainProvider> BlockFetcher<'a, C> {
    pub fn new(handler: &'a MessageHandler<C>, peer: PeerIndex) -> Self {
        let tip = handler.shared().chain().tip_header();
        BlockFetcher { handler, peer, tip }
    }

    fn peer_best_known_header(&self) -> Option<HeaderView> {
        let shared = self.handler.shared();
        shared.process_block_availability(self.peer);
        shared.state().peers().get_best_known_header(self.peer)
    }

    /// The last common block, corrected for any reorg on the peer's side.
    fn last_common_header(&self, best_known: &HeaderView) -> Option<HeaderView> {
        let shared = self.handler.shared();
        let last_common = match shared.state().peers().get_last_common_header(self.peer) {
            Some(header) => Some(header),
            None => {
                // Bootstrap by guessing an ancestor of our tip is the fork
                // point; wrong guesses fix themselves below.
                let height = cmp::min(best_known.height(), self.tip.height());
                shared
                    .chain()
                    .get_block_hash(height)
                    .and_then(|hash| shared.chain().get_header_view(&hash))
            }
        }?;

        let fixed = shared.last_common_ancestor(&last_common, best_known)?;
        if fixed != last_common {
            shared
                .state()
                .peers()
                .set_last_common_header(self.peer, fixed.clone());
        }
        Some(fixed)
    }

    /// Produce up to `count` block requests. Does not mark them in flight;
    /// the caller owns that so the registry write happens next to the send.
    pub fn fetch(self, count: usize) -> FetchPlan {
        let mut plan = FetchPlan::default();
        if count == 0 {
            return plan;
        }
        let shared = self.handler.shared();
        let chain = shared.chain();

        let best_known = match self.peer_best_known_header() {
            Some(best) => best,
            None => {
                trace!(
                    target: "sync",
                    "[block downloader] peer_best_known_header not found peer={}",
                    self.peer
                );
                return plan;
            }
        };

        // This peer has nothing interesting.
        if best_known.total_work() < self.tip.total_work() {
            trace!(
                target: "sync",
                "[block downloader] best known work {} below chain {}",
                best_known.total_work(),
                self.tip.total_work()
            );
            return plan;
        }

        let mut last_common = match self.last_common_header(&best_known) {
            Some(header) => header,
            None => return plan,
        };
        if &last_common == &best_known {
            return plan;
        }

        // Never fetch past the window, plus one block so a full window still
        // detects which peer blocks further progress.
        let window_end = last_common.height() + BLOCK_DOWNLOAD_WINDOW;
        let max_height = cmp::min(best_known.height(), window_end + 1);
        let mut waiting_for: Option<PeerIndex> = None;

        let state = shared.state();
        let mut walk_height = last_common.height();
        // The last common block may only advance across blocks whose whole
        // ancestry we already have; a gap freezes it (and the window) until
        // the missing block arrives.
        let mut ancestry_complete = true;
        while walk_height < max_height {
            // Resolve a batch of successors toward the peer's best known
            // block, then scan it forward.
            let batch = cmp::min(
                (max_height - walk_height) as usize,
                cmp::max(count - plan.blocks.len(), PER_FETCH_BLOCK_LIMIT),
            );
            let batch_top_height = walk_height + batch as u64;
            let mut batch_views: Vec<HeaderView> = Vec::with_capacity(batch);
            {
                let top = match shared.get_ancestor(best_known.hash(), batch_top_height) {
                    Some(view) => view,
                    None => return plan,
                };
                batch_views.push(top);
                for _ in 1..batch {
                    let parent_hash = batch_views
                        .last()
                        .expect("batch_views starts non-empty")
                        .parent_hash()
                        .clone();
                    match chain.get_header_view(&parent_hash) {
                        Some(view) => batch_views.push(view),
                        None => return plan,
                    }
                }
                batch_views.reverse();
            }
            walk_height = batch_top_height;

            for view in batch_views {
                let status = chain.get_block_status(view.hash());
                if status.contains(BlockStatus::BLOCK_INVALID) {
                    // We consider the chain this peer is on invalid.
                    return plan;
                }
                if status.contains(BlockStatus::BLOCK_STORED)
                    || chain.is_main_chain(view.hash())
                {
                    if ancestry_complete {
                        last_common = view.clone();
                        state
                            .peers()
                            .set_last_common_header(self.peer, last_common.clone());
                    }
                    continue;
                }
                ancestry_complete = false;
                let owner = state.read_inflight_blocks().owner(view.hash());
                match owner {
                    None => {
                        if view.height() > window_end {
                            // The window cannot move; remember who we are
                            // waiting on if we scheduled nothing at all.
                            if plan.blocks.is_empty() {
                                if let Some(waiting) = waiting_for {
                                    if waiting != self.peer {
                                        plan.staller = Some(waiting);
                                    }
                                }
                            }
                            return plan;
                        }
                        plan.blocks.push(view);
                        if plan.blocks.len() == count {
                            return plan;
                        }
                    }
                    Some(owner) => {
                        if waiting_for.is_none() {
                            // First already-in-flight block on the walk.
                            waiting_for = Some(owner);
                        }
                    }
                }
            }
        }
        plan
    }
}
