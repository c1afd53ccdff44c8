use crate::provider::{ChainProvider, Rejection, TxPoolProvider};
use crate::tests::util::{setup, transaction};
use ember_constant::sync::MAX_GETBLOCKS_RESULTS;
use ember_network::PeerIndex;
use ember_types::{
    BloomFilter, BloomFlags, Inv, InvKind, NetworkMessage, RejectCode, ServiceTransaction, H256,
};
use faketime::unix_time_as_millis;

#[test]
fn getblocks_walk_truncates_and_remembers_continue_hash() {
    let (handler, chain, nc) = setup(1);
    let peer = PeerIndex::from(0);
    chain.grow_main_chain(MAX_GETBLOCKS_RESULTS as u64 + 10);

    handler.process_messages(
        &nc,
        peer,
        NetworkMessage::GetBlocks {
            locator: vec![chain.genesis()],
            hash_stop: H256::default(),
        },
    );

    let state = handler.shared().state();
    let peer_state = state.peers().state.get(&peer).unwrap();
    assert_eq!(
        peer_state.gossip.blocks_to_send.len(),
        MAX_GETBLOCKS_RESULTS
    );
    let expected_continue = peer_state
        .gossip
        .blocks_to_send
        .last()
        .cloned()
        .unwrap();
    assert_eq!(peer_state.gossip.continue_hash, Some(expected_continue));
}

#[test]
fn getdata_serves_block_and_chains_continuation_inv() {
    let (handler, chain, nc) = setup(1);
    let peer = PeerIndex::from(0);
    let hashes = chain.grow_main_chain(3);
    let target = hashes[1].clone();

    {
        let state = handler.shared().state();
        let mut peer_state = state.peers().state.get_mut(&peer).unwrap();
        peer_state.gossip.continue_hash = Some(target.clone());
    }

    handler.process_messages(
        &nc,
        peer,
        NetworkMessage::GetData(vec![Inv::block(target.clone())]),
    );

    let sent = nc.take_sent();
    assert!(matches!(
        &sent[0].1,
        NetworkMessage::Block(block) if block.hash() == target
    ));
    // The continuation inv points the peer at our tip.
    let tip = chain.tip_header();
    assert!(sent.iter().any(|(_, message)| matches!(
        message,
        NetworkMessage::Inv(inventory)
            if inventory == &vec![Inv::block(tip.hash().clone())]
    )));
}

#[test]
fn getdata_tx_comes_from_relay_cache_or_notfound() {
    let (handler, _chain, nc) = setup(1);
    let peer = PeerIndex::from(0);

    let cached = transaction(&H256::from([0x71; 32]), 0);
    let cached_hash = cached.hash();
    handler
        .shared()
        .state()
        .relay_cache()
        .insert(cached.clone(), unix_time_as_millis());

    let missing = H256::from([0x72; 32]);
    handler.process_messages(
        &nc,
        peer,
        NetworkMessage::GetData(vec![
            Inv::tx(cached_hash.clone()),
            Inv::tx(missing.clone()),
        ]),
    );

    let sent = nc.take_sent();
    assert!(sent
        .iter()
        .any(|(_, message)| matches!(message, NetworkMessage::Tx(tx) if tx.hash() == cached_hash)));
    assert!(sent.iter().any(|(_, message)| matches!(
        message,
        NetworkMessage::NotFound(inventory) if inventory == &vec![Inv::tx(missing.clone())]
    )));
}

#[test]
fn mempool_request_respects_bloom_filter() {
    let (handler, chain, nc) = setup(1);
    let peer = PeerIndex::from(0);

    let wanted = transaction(&H256::from([0x81; 32]), 0);
    let unwanted = transaction(&H256::from([0x82; 32]), 0);
    handler.process_messages(&nc, peer, NetworkMessage::Tx(wanted.clone()));
    handler.process_messages(&nc, peer, NetworkMessage::Tx(unwanted.clone()));
    assert_eq!(chain.mempool_len(), 2);
    nc.take_sent();

    let mut filter = BloomFilter::new(10, 0.000_1, 5, BloomFlags::All);
    filter.insert(wanted.hash().as_bytes());
    handler.process_messages(&nc, peer, NetworkMessage::FilterLoad(filter));

    handler.process_messages(&nc, peer, NetworkMessage::Mempool);
    let announced: Vec<H256> = nc
        .take_sent()
        .into_iter()
        .filter_map(|(_, message)| match message {
            NetworkMessage::Inv(inventory) => Some(inventory),
            _ => None,
        })
        .flatten()
        .map(|inv| inv.hash)
        .collect();
    assert_eq!(announced, vec![wanted.hash()]);
}

#[test]
fn known_inventory_is_never_reannounced() {
    let (handler, chain, nc) = setup(2);
    let origin = PeerIndex::from(0);
    let peer = PeerIndex::from(1);

    let tx = transaction(&H256::from([0x83; 32]), 0);
    let hash = tx.hash();
    handler.process_messages(&nc, origin, NetworkMessage::Tx(tx));
    assert!(chain.mempool_contains(&hash));
    nc.take_sent();

    // First pass trickles the announcement and records it as known.
    handler.send_messages(&nc, peer);
    let announced = |sent: Vec<(PeerIndex, NetworkMessage)>| {
        sent.into_iter()
            .filter_map(|(_, message)| match message {
                NetworkMessage::Inv(inventory) => Some(inventory),
                _ => None,
            })
            .flatten()
            .filter(|inv| inv.hash == hash)
            .count()
    };
    assert_eq!(announced(nc.take_sent()), 1);

    // Queue it again; the known filter suppresses the repeat.
    handler.shared().state().relay_transaction(&hash);
    handler.send_messages(&nc, peer);
    assert_eq!(announced(nc.take_sent()), 0);
}

#[test]
fn filteradd_without_filterload_scores_hundred() {
    let (handler, _chain, nc) = setup(1);
    let peer = PeerIndex::from(0);
    handler.process_messages(&nc, peer, NetworkMessage::FilterAdd(vec![1, 2, 3]));
    let state = handler.shared().state();
    assert_eq!(
        state.peers().state.get(&peer).unwrap().misbehavior.score,
        100
    );
}

#[test]
fn pong_updates_rtt_only_for_matching_nonce() {
    let (handler, _chain, nc) = setup(1);
    let peer = PeerIndex::from(0);
    let state = handler.shared().state();

    {
        let mut peer_state = state.peers().state.get_mut(&peer).unwrap();
        peer_state.ping.nonce_sent = 42;
        peer_state.ping.started_at = unix_time_as_millis().saturating_sub(50);
    }

    // Mismatched nonce while a ping is outstanding is tolerated.
    handler.process_messages(&nc, peer, NetworkMessage::Pong(41));
    {
        let peer_state = state.peers().state.get(&peer).unwrap();
        assert_eq!(peer_state.ping.nonce_sent, 42);
        assert_eq!(peer_state.ping.rtt, None);
    }

    handler.process_messages(&nc, peer, NetworkMessage::Pong(42));
    let (rtt, min_rtt) = {
        let peer_state = state.peers().state.get(&peer).unwrap();
        assert_eq!(peer_state.ping.nonce_sent, 0);
        (peer_state.ping.rtt, peer_state.ping.min_rtt)
    };
    assert!(rtt.unwrap() >= 50);
    assert_eq!(rtt, min_rtt);

    // A repeat for the settled nonce is a no-op.
    handler.process_messages(&nc, peer, NetworkMessage::Pong(42));
    let peer_state = state.peers().state.get(&peer).unwrap();
    assert_eq!(peer_state.ping.rtt, rtt);
}

#[test]
fn ping_echoes_pong_with_same_nonce() {
    let (handler, _chain, nc) = setup(1);
    let peer = PeerIndex::from(0);
    handler.process_messages(&nc, peer, NetworkMessage::Ping(0x5150));
    let sent = nc.take_sent();
    assert!(sent
        .iter()
        .any(|(_, message)| matches!(message, NetworkMessage::Pong(0x5150))));
}

#[test]
fn stx_with_confirmed_payment_processes_and_relays() {
    let (handler, chain, nc) = setup(2);
    let peer = PeerIndex::from(0);

    let payment = transaction(&H256::from([0x91; 32]), 0);
    chain.add_confirmed_tx(payment.clone());
    let stx = ServiceTransaction {
        version: 1,
        payment_reference: payment.hash(),
        op_code: 7,
        payload: vec![1, 2, 3],
    };
    let stx_hash = stx.hash();

    handler.process_messages(&nc, peer, NetworkMessage::Stx(stx));

    let state = handler.shared().state();
    assert!(chain.stx_pool_contains(&stx_hash));
    let other = PeerIndex::from(1);
    assert!(state
        .peers()
        .state
        .get(&other)
        .unwrap()
        .gossip
        .stx_to_send
        .contains(&stx_hash));
}

#[test]
fn failing_stx_parks_in_pending_pool_and_scores() {
    let (handler, chain, nc) = setup(1);
    let peer = PeerIndex::from(0);

    let payment = transaction(&H256::from([0x92; 32]), 0);
    chain.add_confirmed_tx(payment.clone());
    let stx = ServiceTransaction {
        version: 1,
        payment_reference: payment.hash(),
        op_code: 9,
        payload: vec![9],
    };
    let stx_hash = stx.hash();
    chain.script_stx_verdict(
        &stx_hash,
        Rejection::new(15, RejectCode::Invalid, "bad-service-op"),
    );

    handler.process_messages(&nc, peer, NetworkMessage::Stx(stx));

    let state = handler.shared().state();
    assert!(state.pending_stx().contains(&stx_hash));
    assert_eq!(state.peers().state.get(&peer).unwrap().misbehavior.score, 15);
}

#[test]
fn stx_getdata_marks_service_data_known() {
    let (handler, chain, nc) = setup(1);
    let peer = PeerIndex::from(0);
    let stx = ServiceTransaction {
        version: 1,
        payment_reference: H256::from([0x93; 32]),
        op_code: 1,
        payload: vec![],
    };
    let stx_hash = stx.hash();
    chain.stx_pool_add(stx);

    handler.process_messages(
        &nc,
        peer,
        NetworkMessage::GetData(vec![Inv::new(InvKind::Stx, stx_hash.clone())]),
    );

    assert!(nc
        .take_sent()
        .iter()
        .any(|(_, message)| matches!(message, NetworkMessage::Stx(stx) if stx.hash() == stx_hash)));
    let state = handler.shared().state();
    assert!(state
        .peers()
        .state
        .get(&peer)
        .unwrap()
        .gossip
        .service_data_known
        .contains(&stx_hash));
}
