use crate::config::SyncConfig;
use crate::dispatcher::MessageHandler;
use crate::tests::util::{complete_handshake, MockChain, MockNetwork};
use crate::types::SyncShared;
use ember_constant::sync::{MIN_PROTO_VERSION, PROTOCOL_VERSION};
use ember_network::PeerIndex;
use ember_types::{NetAddress, NetworkMessage, ServiceFlags, VersionPayload};
use std::sync::Arc;

fn fresh() -> (MessageHandler<MockChain>, Arc<MockChain>, MockNetwork) {
    let chain = Arc::new(MockChain::new());
    let shared = Arc::new(SyncShared::new(Arc::clone(&chain), SyncConfig::default()));
    (MessageHandler::new(shared), chain, MockNetwork::new())
}

fn version_payload(version: u32, nonce: u64) -> VersionPayload {
    let remote = NetAddress::new(
        "198.51.100.1:31469".parse().unwrap(),
        ServiceFlags::NETWORK,
        0,
    );
    VersionPayload {
        version,
        services: ServiceFlags::NETWORK,
        timestamp: 1_600_000_000,
        receiver: remote.clone(),
        sender: remote,
        nonce,
        user_agent: "/other:1.0/".to_string(),
        start_height: 10,
        relay: true,
    }
}

#[test]
fn outbound_handshake_completes() {
    let (handler, _chain, nc) = fresh();
    let peer = PeerIndex::from(1);
    nc.add_peer(peer, false, false);

    handler.initialize_node(&nc, peer);
    assert_eq!(nc.sent_commands(), vec!["version"]);
    nc.take_sent();

    complete_handshake(&handler, &nc, peer);
    let commands = nc.sent_commands();
    assert!(commands.contains(&"verack"));
    assert!(commands.contains(&"sendheaders"));
    // Small address book: we also ask for addresses.
    assert!(commands.contains(&"getaddr"));

    let peers = handler.shared().state().peers();
    let state = peers.state.get(&peer).unwrap();
    assert!(state.handshake.successfully_connected);
    assert!(state.handshake.currently_connected);
    assert_eq!(state.handshake.send_version, PROTOCOL_VERSION);
    assert!(state.sync.preferred_download);
    drop(state);
    assert_eq!(
        peers
            .n_preferred_download
            .load(std::sync::atomic::Ordering::Acquire),
        1
    );
}

#[test]
fn self_connect_is_dropped_without_verack() {
    let (handler, _chain, nc) = fresh();
    let peer = PeerIndex::from(2);
    nc.add_peer(peer, true, false);
    handler.initialize_node(&nc, peer);
    nc.take_sent();

    // The nonce the "remote" presents is one of our own outbound nonces.
    nc.local_nonces.lock().insert(0xfeed);
    let mut payload = version_payload(PROTOCOL_VERSION, 0xfeed);
    payload.nonce = 0xfeed;
    handler.process_messages(&nc, peer, NetworkMessage::Version(payload));

    assert!(nc.was_disconnected(peer));
    assert!(!nc.sent_commands().contains(&"verack"));
}

#[test]
fn obsolete_version_is_rejected() {
    let (handler, _chain, nc) = fresh();
    let peer = PeerIndex::from(3);
    nc.add_peer(peer, true, false);
    handler.initialize_node(&nc, peer);
    nc.take_sent();

    handler.process_messages(
        &nc,
        peer,
        NetworkMessage::Version(version_payload(MIN_PROTO_VERSION - 1, 7)),
    );
    let sent = nc.take_sent();
    assert!(matches!(
        &sent[0].1,
        NetworkMessage::Reject(reject) if reject.message == "version"
    ));
    assert!(nc.was_disconnected(peer));
}

#[test]
fn duplicate_version_scores_misbehavior() {
    let (handler, _chain, nc) = fresh();
    let peer = PeerIndex::from(4);
    nc.add_peer(peer, true, false);
    handler.initialize_node(&nc, peer);

    handler.process_messages(
        &nc,
        peer,
        NetworkMessage::Version(version_payload(PROTOCOL_VERSION, 7)),
    );
    handler.process_messages(
        &nc,
        peer,
        NetworkMessage::Version(version_payload(PROTOCOL_VERSION, 8)),
    );

    let peers = handler.shared().state().peers();
    assert_eq!(peers.state.get(&peer).unwrap().misbehavior.score, 1);
}

#[test]
fn message_before_version_scores_misbehavior() {
    let (handler, _chain, nc) = fresh();
    let peer = PeerIndex::from(5);
    nc.add_peer(peer, true, false);
    handler.initialize_node(&nc, peer);

    handler.process_messages(&nc, peer, NetworkMessage::Ping(1));
    let peers = handler.shared().state().peers();
    assert_eq!(peers.state.get(&peer).unwrap().misbehavior.score, 1);
}

#[test]
fn getaddr_served_once_and_only_inbound() {
    let (handler, _chain, nc) = fresh();
    let inbound = PeerIndex::from(6);
    nc.add_peer(inbound, true, false);
    handler.initialize_node(&nc, inbound);
    handler.process_messages(
        &nc,
        inbound,
        NetworkMessage::Version(version_payload(PROTOCOL_VERSION, 9)),
    );
    handler.process_messages(&nc, inbound, NetworkMessage::Verack);
    nc.take_sent();

    handler.process_messages(&nc, inbound, NetworkMessage::GetAddr);
    {
        let peers = handler.shared().state().peers();
        let state = peers.state.get(&inbound).unwrap();
        assert!(state.handshake.getaddr_served);
    }

    // A second request changes nothing further.
    handler.process_messages(&nc, inbound, NetworkMessage::GetAddr);

    let outbound = PeerIndex::from(7);
    nc.add_peer(outbound, false, false);
    handler.initialize_node(&nc, outbound);
    nc.take_sent();
    complete_handshake(&handler, &nc, outbound);
    handler.process_messages(&nc, outbound, NetworkMessage::GetAddr);
    let peers = handler.shared().state().peers();
    assert!(!peers.state.get(&outbound).unwrap().handshake.getaddr_served);
}

#[test]
fn addr_size_boundary() {
    let (handler, _chain, nc) = fresh();
    let peer = PeerIndex::from(9);
    nc.add_peer(peer, true, false);
    handler.initialize_node(&nc, peer);
    handler.process_messages(
        &nc,
        peer,
        NetworkMessage::Version(version_payload(PROTOCOL_VERSION, 11)),
    );

    let addr = |index: usize| {
        NetAddress::new(
            format!("8.9.{}.{}:31469", index / 256, index % 256)
                .parse()
                .unwrap(),
            ServiceFlags::NETWORK,
            1_600_000_000,
        )
    };

    // Exactly the limit is fine.
    let full: Vec<NetAddress> = (0..1_000).map(addr).collect();
    handler.process_messages(&nc, peer, NetworkMessage::Addr(full));
    {
        let peers = handler.shared().state().peers();
        assert_eq!(peers.state.get(&peer).unwrap().misbehavior.score, 0);
    }

    // One more is a protocol violation.
    let oversized: Vec<NetAddress> = (0..1_001).map(addr).collect();
    handler.process_messages(&nc, peer, NetworkMessage::Addr(oversized));
    let peers = handler.shared().state().peers();
    assert_eq!(peers.state.get(&peer).unwrap().misbehavior.score, 20);
}

#[test]
fn misbehavior_threshold_crossing_sets_disconnect_once() {
    let (handler, _chain, nc) = fresh();
    let peer = PeerIndex::from(8);
    nc.add_peer(peer, true, false);
    handler.initialize_node(&nc, peer);

    let state = handler.shared().state();
    state.misbehave(peer, 60, "test");
    assert!(!state.peers().should_disconnect(peer));
    state.misbehave(peer, 60, "test");
    assert!(state.peers().should_disconnect(peer));

    // Clear the flag the way the flush path does, then verify that staying
    // above the threshold does not re-arm it.
    handler.send_rejects_and_check_if_banned(&nc, peer);
    assert!(!state.peers().should_disconnect(peer));
    state.misbehave(peer, 5, "test");
    assert!(!state.peers().should_disconnect(peer));

    // Score never decreases.
    assert_eq!(state.peers().state.get(&peer).unwrap().misbehavior.score, 125);
}
