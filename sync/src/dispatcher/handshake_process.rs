use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, TxPoolProvider};
use crate::{Status, StatusCode};
use ember_constant::sync::{
    MAX_SUBVERSION_LENGTH, MIN_PROTO_VERSION, PROTOCOL_VERSION, SENDHEADERS_VERSION,
};
use ember_network::{NetworkContext, PeerIndex};
use ember_types::{NetworkMessage, Reject, RejectCode, VersionPayload};
use faketime::unix_time_as_millis;
use log::{debug, info};

/// First message on every connection; everything else is a protocol
/// violation until it arrives.
pub struct VersionProcess<'a, C> {
    payload: VersionPayload,
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
    nc: &'a dyn NetworkContext,
}

impl<'a, C: ChainProvider + TxPoolProvider> VersionProcess<'a, C> {
    pub fn new(
        payload: VersionPayload,
        handler: &'a MessageHandler<C>,
        peer: PeerIndex,
        nc: &'a dyn NetworkContext,
    ) -> Self {
        VersionProcess {
            payload,
            handler,
            peer,
            nc,
        }
    }

    fn reply_reject(&self, code: RejectCode, reason: &str) {
        let message = NetworkMessage::Reject(Reject {
            message: "version".to_string(),
            code,
            reason: reason.to_string(),
            hash: None,
        });
        if let Err(err) = self.nc.send_message(self.peer, message) {
            debug!(target: "net", "send reject error: {}", err);
        }
    }

    pub fn execute(self) -> Status {
        let shared = self.handler.shared();
        let state = shared.state();
        let info = match self.nc.peer_info(self.peer) {
            Some(info) => info,
            None => return Status::ignored(),
        };

        // Each connection can only send one version message.
        let duplicate = state
            .peers()
            .state
            .get(&self.peer)
            .map(|peer_state| peer_state.handshake.version != 0)
            .unwrap_or(false);
        if duplicate {
            self.reply_reject(RejectCode::Duplicate, "Duplicate version message");
            state.misbehave(self.peer, 1, "multiple-version");
            return StatusCode::ProtocolViolation.with_context("duplicate version");
        }

        let payload = &self.payload;
        if info.expected_services.bits() & !payload.services.bits() != 0 {
            self.reply_reject(
                RejectCode::Nonstandard,
                &format!(
                    "Expected to offer services {:#x}",
                    info.expected_services.bits()
                ),
            );
            info!(
                target: "net",
                "peer={} does not offer the expected services \
                 ({:#x} offered, {:#x} expected); disconnecting",
                self.peer,
                payload.services.bits(),
                info.expected_services.bits()
            );
            self.nc.disconnect(self.peer, "missing expected services");
            return StatusCode::ProtocolViolation.with_context("missing expected services");
        }

        if payload.version < MIN_PROTO_VERSION {
            self.reply_reject(
                RejectCode::Obsolete,
                &format!("Version must be {} or greater", MIN_PROTO_VERSION),
            );
            info!(
                target: "net",
                "peer={} using obsolete version {}; disconnecting",
                self.peer, payload.version
            );
            self.nc.disconnect(self.peer, "obsolete version");
            return StatusCode::ProtocolViolation.with_context("obsolete version");
        }

        // Connected to ourselves through the network.
        if info.is_inbound && self.nc.check_incoming_nonce(payload.nonce) {
            info!(
                target: "net",
                "connected to self at {}, disconnecting",
                info.address.addr
            );
            self.nc.disconnect(self.peer, "connected to self");
            return Status::ok();
        }

        // Be shy and don't send version until we hear one.
        if info.is_inbound {
            self.handler.push_node_version(self.nc, self.peer);
        }

        if let Err(err) = self.nc.send_message(self.peer, NetworkMessage::Verack) {
            debug!(target: "net", "send verack error: {}", err);
        }

        let send_version = std::cmp::min(payload.version, PROTOCOL_VERSION);
        let mut user_agent = sanitize(&payload.user_agent);
        user_agent.truncate(MAX_SUBVERSION_LENGTH);
        let now = (unix_time_as_millis() / 1_000) as i64;
        let time_offset = payload.timestamp - now;

        if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
            peer_state.handshake.version = payload.version;
            peer_state.handshake.send_version = send_version;
            peer_state.handshake.services = payload.services;
            peer_state.handshake.start_height = payload.start_height;
            peer_state.handshake.user_agent = user_agent.clone();
            peer_state.handshake.relay_txs = payload.relay;
            peer_state.handshake.time_offset = time_offset;
        }
        state.peers().update_preferred_download(self.peer);
        state.net_time().observe(time_offset * 1_000);

        if !info.is_inbound {
            // Advertise our address so the network learns about us.
            if !shared.chain().is_initial_block_download() {
                if let Some(local) = self.nc.local_address(self.peer) {
                    if local.is_routable() {
                        debug!(target: "net", "advertising address {}", local.addr);
                        if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
                            peer_state.gossip.addrs_to_send.push(local);
                        }
                    }
                }
            }

            // Seed our address book while it is small.
            if info.is_oneshot || self.nc.address_count() < 1_000 {
                if let Err(err) = self.nc.send_message(self.peer, NetworkMessage::GetAddr) {
                    debug!(target: "net", "send getaddr error: {}", err);
                } else if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
                    peer_state.handshake.getaddr_sent = true;
                }
            }
            self.nc.mark_address_good(&info.address);
        }

        info!(
            target: "net",
            "receive version message: [{}] {}: version {}, blocks={}, peer={}",
            info.address.addr, user_agent, payload.version, payload.start_height, self.peer
        );

        // Feeler connections exist only to verify that an address is alive.
        if info.is_feeler {
            self.nc.disconnect(self.peer, "feeler complete");
        }
        Status::ok()
    }
}

/// Completes the handshake the `version` exchange opened.
pub struct VerackProcess<'a, C> {
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
    nc: &'a dyn NetworkContext,
}

impl<'a, C: ChainProvider + TxPoolProvider> VerackProcess<'a, C> {
    pub fn new(handler: &'a MessageHandler<C>, peer: PeerIndex, nc: &'a dyn NetworkContext) -> Self {
        VerackProcess { handler, peer, nc }
    }

    pub fn execute(self) -> Status {
        let state = self.handler.shared().state();
        let version = {
            match state.peers().state.get_mut(&self.peer) {
                Some(mut peer_state) => {
                    peer_state.handshake.send_version =
                        std::cmp::min(peer_state.handshake.version, PROTOCOL_VERSION);
                    if !peer_state.flags.is_inbound {
                        // Mark this node as currently connected, so we update
                        // its address-book timestamp later.
                        peer_state.handshake.currently_connected = true;
                    }
                    peer_state.handshake.successfully_connected = true;
                    peer_state.handshake.version
                }
                None => return Status::ignored(),
            }
        };

        if version >= SENDHEADERS_VERSION {
            // Tell our peer we prefer header announcements over invs. Sent
            // even to non-serving peers, which still announce blocks.
            if let Err(err) = self.nc.send_message(self.peer, NetworkMessage::SendHeaders) {
                debug!(target: "net", "send sendheaders error: {}", err);
            }
        }
        Status::ok()
    }
}

/// Control characters have no business in a remote-supplied string that
/// ends up in logs.
fn sanitize(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() && (' '..='~').contains(c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::sanitize;

    #[test]
    fn sanitize_strips_control_chars() {
        assert_eq!(sanitize("/ember:0.4.0/\n\x1b[31m"), "/ember:0.4.0/[31m");
        assert_eq!(sanitize("plain"), "plain");
    }
}
