use crate::block_fetcher::BlockFetcher;
use crate::provider::ChainProvider;
use crate::tests::util::setup;
use ember_constant::sync::{
    BLOCK_DOWNLOAD_TIMEOUT_BASE, BLOCK_DOWNLOAD_WINDOW, BLOCK_STALLING_TIMEOUT,
    MAX_BLOCKS_IN_TRANSIT_PER_PEER,
};
use ember_network::PeerIndex;

const T0: u64 = 1_700_000_000_000;

#[test]
fn planner_fills_the_transit_pipeline() {
    let (handler, chain, nc) = setup(1);
    let peer = PeerIndex::from(0);

    let views = chain.index_headers(&chain.genesis(), 100);
    let best = views.last().unwrap().clone();
    handler
        .shared()
        .state()
        .peers()
        .may_set_best_known_header(peer, best);

    let plan = BlockFetcher::new(&handler, peer).fetch(MAX_BLOCKS_IN_TRANSIT_PER_PEER);
    assert_eq!(plan.blocks.len(), MAX_BLOCKS_IN_TRANSIT_PER_PEER);
    // Earliest heights first, in forward order.
    let heights: Vec<u64> = plan.blocks.iter().map(|view| view.height()).collect();
    assert_eq!(heights, (1..=MAX_BLOCKS_IN_TRANSIT_PER_PEER as u64).collect::<Vec<_>>());
    assert!(plan.staller.is_none());
    let _ = nc;
}

#[test]
fn planner_skips_blocks_in_flight_elsewhere() {
    let (handler, chain, _nc) = setup(2);
    let slow = PeerIndex::from(0);
    let fast = PeerIndex::from(1);

    let views = chain.index_headers(&chain.genesis(), 40);
    let best = views.last().unwrap().clone();
    let peers = handler.shared().state().peers();
    peers.may_set_best_known_header(slow, best.clone());
    peers.may_set_best_known_header(fast, best);

    {
        let mut inflight = handler.shared().state().write_inflight_blocks();
        for view in views.iter().take(4) {
            assert!(inflight.insert(slow, view.hash().clone(), Some(view.clone())));
        }
    }

    let plan = BlockFetcher::new(&handler, fast).fetch(8);
    let heights: Vec<u64> = plan.blocks.iter().map(|view| view.height()).collect();
    assert_eq!(heights, vec![5, 6, 7, 8, 9, 10, 11, 12]);
}

#[test]
fn planner_aborts_on_invalid_chain() {
    let (handler, chain, _nc) = setup(1);
    let peer = PeerIndex::from(0);

    let views = chain.index_headers(&chain.genesis(), 10);
    handler
        .shared()
        .state()
        .peers()
        .may_set_best_known_header(peer, views.last().unwrap().clone());
    chain.invalidate_block(views[2].hash());

    let plan = BlockFetcher::new(&handler, peer).fetch(8);
    // The walk hit an invalid block: the peer's chain is worthless to us.
    assert_eq!(plan.blocks.len(), 2);
}

#[cfg(not(disable_faketime))]
#[test]
fn window_edge_held_by_other_peer_flags_staller_and_disconnects() {
    let faketime_file = faketime::millis_tempfile(T0).expect("create faketime file");
    faketime::enable(&faketime_file);

    let (handler, chain, nc) = setup(2);
    let slow = PeerIndex::from(0);
    let keen = PeerIndex::from(1);

    // One unstored block at height 1 held by the slow peer; everything else
    // in the window already on disk. The window cannot move and the keen
    // peer has nothing left to fetch.
    let views = chain.index_headers(&chain.genesis(), BLOCK_DOWNLOAD_WINDOW + 1);
    for view in views.iter().skip(1) {
        chain.store_block(view.hash());
    }
    let best = views.last().unwrap().clone();
    let peers = handler.shared().state().peers();
    peers.may_set_best_known_header(slow, best.clone());
    peers.may_set_best_known_header(keen, best);
    {
        let mut inflight = handler.shared().state().write_inflight_blocks();
        assert!(inflight.insert(slow, views[0].hash().clone(), Some(views[0].clone())));
    }

    handler.send_messages(&nc, keen);
    {
        let inflight = handler.shared().state().read_inflight_blocks();
        assert!(inflight.stalling_since(slow) > 0);
    }
    assert!(!nc.was_disconnected(slow));

    // Past the stall timeout the slow peer's own send pass drops it.
    faketime::write_millis(&faketime_file, T0 + BLOCK_STALLING_TIMEOUT + 1)
        .expect("write millis");
    handler.send_messages(&nc, slow);
    assert!(nc.was_disconnected(slow));
}

#[cfg(not(disable_faketime))]
#[test]
fn download_timeout_disconnects_the_laggard() {
    let faketime_file = faketime::millis_tempfile(T0).expect("create faketime file");
    faketime::enable(&faketime_file);

    let (handler, chain, nc) = setup(1);
    let peer = PeerIndex::from(0);

    // Peer advertises a chain 100 ahead; the scheduler fills the pipeline.
    let views = chain.index_headers(&chain.genesis(), 100);
    handler
        .shared()
        .state()
        .peers()
        .may_set_best_known_header(peer, views.last().unwrap().clone());
    handler.send_messages(&nc, peer);
    {
        let inflight = handler.shared().state().read_inflight_blocks();
        assert_eq!(
            inflight.peer_inflight_count(peer),
            MAX_BLOCKS_IN_TRANSIT_PER_PEER
        );
    }
    assert!(!nc.was_disconnected(peer));

    // No delivery for spacing * BASE milliseconds (no other peers download
    // validated blocks, so no per-peer compensation applies).
    let timeout = chain.target_spacing() * BLOCK_DOWNLOAD_TIMEOUT_BASE;
    faketime::write_millis(&faketime_file, T0 + timeout + 1).expect("write millis");
    handler.send_messages(&nc, peer);
    assert!(nc.was_disconnected(peer));
}
