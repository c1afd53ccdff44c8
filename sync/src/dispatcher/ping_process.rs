use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, TxPoolProvider};
use crate::Status;
use ember_network::{NetworkContext, PeerIndex};
use ember_types::NetworkMessage;
use faketime::unix_time_as_millis;
use log::debug;

/// Echo a `pong` carrying the same nonce. The nonce keeps overlapping
/// pings from confusing each other's timing.
pub struct PingProcess<'a, C> {
    nonce: u64,
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
    nc: &'a dyn NetworkContext,
}

impl<'a, C: ChainProvider + TxPoolProvider> PingProcess<'a, C> {
    pub fn new(
        nonce: u64,
        handler: &'a MessageHandler<C>,
        peer: PeerIndex,
        nc: &'a dyn NetworkContext,
    ) -> Self {
        PingProcess {
            nonce,
            handler,
            peer,
            nc,
        }
    }

    pub fn execute(self) -> Status {
        let _ = self.handler;
        if let Err(err) = self
            .nc
            .send_message(self.peer, NetworkMessage::Pong(self.nonce))
        {
            debug!(target: "net", "send pong error: {}", err);
        }
        Status::ok()
    }
}

/// Match a `pong` against the outstanding ping and record round-trip time.
pub struct PongProcess<'a, C> {
    nonce: u64,
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
}

impl<'a, C: ChainProvider + TxPoolProvider> PongProcess<'a, C> {
    pub fn new(nonce: u64, handler: &'a MessageHandler<C>, peer: PeerIndex) -> Self {
        PongProcess {
            nonce,
            handler,
            peer,
        }
    }

    pub fn execute(self) -> Status {
        let state = self.handler.shared().state();
        let now = unix_time_as_millis();
        let mut problem: Option<&'static str> = None;
        let mut finished = false;

        if let Some(mut peer_state) = state.peers().state.get_mut(&self.peer) {
            let ping = &mut peer_state.ping;
            if ping.nonce_sent != 0 {
                if self.nonce == ping.nonce_sent {
                    finished = true;
                    let rtt = now.saturating_sub(ping.started_at);
                    if rtt > 0 {
                        ping.rtt = Some(rtt);
                        ping.min_rtt = Some(match ping.min_rtt {
                            Some(min) => min.min(rtt),
                            None => rtt,
                        });
                    } else {
                        // This should never happen.
                        problem = Some("timing mishap");
                    }
                } else if self.nonce == 0 {
                    // Most likely a bug in another implementation; give up
                    // on this ping.
                    finished = true;
                    problem = Some("nonce zero");
                } else {
                    // Overlapping pings make mismatches normal.
                    problem = Some("nonce mismatch");
                }
            } else {
                problem = Some("unsolicited pong without ping");
            }
            if finished {
                ping.nonce_sent = 0;
            }
        }

        if let Some(problem) = problem {
            debug!(
                target: "net",
                "pong peer={}: {}, {:#x} received",
                self.peer, problem, self.nonce
            );
        }
        Status::ok()
    }
}
