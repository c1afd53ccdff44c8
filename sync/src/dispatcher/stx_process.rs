use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, TxPoolProvider};
use crate::{Status, StatusCode};
use ember_network::PeerIndex;
use ember_types::ServiceTransaction;
use faketime::unix_time_as_millis;
use log::debug;

/// Service-transaction intake: resolve the payment reference, validate,
/// apply and relay; park failures for a later retry.
pub struct StxProcess<'a, C> {
    stx: ServiceTransaction,
    handler: &'a MessageHandler<C>,
    peer: PeerIndex,
}

impl<'a, C: ChainProvider + TxPoolProvider> StxProcess<'a, C> {
    pub fn new(stx: ServiceTransaction, handler: &'a MessageHandler<C>, peer: PeerIndex) -> Self {
        StxProcess { stx, handler, peer }
    }

    pub fn execute(self) -> Status {
        let shared = self.handler.shared();
        let chain = shared.chain();
        let state = shared.state();

        if self.stx.payment_reference == ember_types::H256::default() {
            return StatusCode::InvalidData.with_context(format!(
                "service transaction {:#x} without payment reference",
                self.stx.hash()
            ));
        }

        let hash = self.stx.hash();
        chain.stx_pool_add(self.stx.clone());

        let payment = match chain.get_transaction(&self.stx.payment_reference) {
            Some(payment) => payment,
            None => {
                // Without the payment transaction there is nothing to check
                // against; the peer can announce again once it confirms.
                return StatusCode::Transient.with_context(format!(
                    "payment reference {:#x} not found",
                    self.stx.payment_reference
                ));
            }
        };

        match chain.check_service_tx(&self.stx, &payment) {
            Ok(()) => {
                chain.process_service_tx(&self.stx, &payment);
                state.relay_service_transaction(&hash);
                Status::ok()
            }
            Err(rejection) => {
                state
                    .pending_stx()
                    .insert(self.stx.clone(), unix_time_as_millis());
                debug!(
                    target: "net",
                    "{:#x} from peer={} was not accepted: {}",
                    hash, self.peer, rejection.reason
                );
                if rejection.code.is_wire_visible() {
                    state.queue_reject(
                        self.peer,
                        "stx",
                        rejection.code,
                        rejection.reason.clone(),
                        hash,
                    );
                }
                if rejection.dos > 0 {
                    state.misbehave(self.peer, rejection.dos, &rejection.reason);
                }
                StatusCode::InvalidData.with_context(rejection.reason)
            }
        }
    }
}
