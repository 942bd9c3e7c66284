use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
    message::{SipMethod, StatusCode},
    timer::{TimerKind, TimerSnapshot, TsxTimer},
    transaction::{State, Transaction, TsxType},
    transport::{IncomingRequest, OutgoingResponse, RequestHeaders},
};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    ops::Deref,
    sync::{Arc, Mutex},
    time::Duration,
};

/// How long the stack waits for the TU before answering an INVITE with a
/// 100 Trying itself.
const AUTO_TRYING_DELAY: Duration = Duration::from_millis(200);

use super::TransactionInner;

/// Represents a Server INVITE transaction.
#[derive(Clone)]
pub struct InvServerTransaction {
    transaction: TransactionInner,
    request_headers: Arc<RequestHeaders>,
    auto_trying: Arc<Mutex<Option<TsxTimer>>>,
}

impl InvServerTransaction {
    /// Creates the transaction for an incoming INVITE and attaches it to
    /// the request.
    pub fn new(endpoint: &Endpoint, request: &mut IncomingRequest) -> Result<Self> {
        let tsx_layer = endpoint.get_tsx_layer();
        let method = request.method();

        assert!(
            matches!(method, SipMethod::Invite),
            "Expected SipMethod::Invite for server INVITE transaction, but got: {}",
            method
        );

        let transaction =
            TransactionInner::new_tsx_uas(request, endpoint, TsxType::InviteServer, State::Proceeding)?;

        let uas_inv = InvServerTransaction {
            transaction,
            request_headers: Arc::new(request.request_headers.clone()),
            auto_trying: Default::default(),
        };

        tsx_layer.add_server_tsx_to_map(super::ServerTsx::Invite(uas_inv.clone()));
        request.set_tsx(super::ServerTsx::Invite(uas_inv.clone()));

        // Answer with 100 Trying ourselves if the TU stays quiet.
        let trying = {
            let uas_inv = uas_inv.clone();
            TsxTimer::schedule(AUTO_TRYING_DELAY, move || {
                let uas_inv = uas_inv.clone();
                async move { uas_inv.auto_trying().await }
            })
        };
        *uas_inv.auto_trying.lock().expect("Lock failed") = Some(trying);

        Ok(uas_inv)
    }

    /// Re-creates the transaction at a persisted state, re-arming timers
    /// with their remaining durations.
    pub(crate) fn resume(
        transaction: TransactionInner,
        request_headers: RequestHeaders,
        timers: &BTreeMap<TimerKind, TimerSnapshot>,
    ) -> Self {
        let uas_inv = InvServerTransaction {
            transaction,
            request_headers: Arc::new(request_headers),
            auto_trying: Default::default(),
        };

        for (kind, snap) in timers {
            uas_inv.arm(*kind, snap.remaining);
        }

        uas_inv
    }

    async fn auto_trying(&self) {
        if self.get_state() != State::Proceeding || self.last_status_code().is_some() {
            return;
        }

        let mut trying = self.endpoint().new_response_from_parts(
            &self.request_headers,
            self.transport().clone(),
            StatusCode::TRYING.into_i32(),
            StatusCode::TRYING.reason(),
        );

        if let Err(err) = self.respond(&mut trying).await {
            log::warn!("Failed to send automatic 100 Trying: {}", err);
        }
    }

    fn arm(&self, kind: TimerKind, duration: Duration) {
        let tsx = self.clone();
        self.transaction.arm_timer(kind, duration, move |kind| {
            let tsx = tsx.clone();
            async move { tsx.on_timer(kind).await }
        });
    }

    async fn on_timer(&self, kind: TimerKind) {
        match (self.get_state(), kind) {
            (State::Completed, TimerKind::G) => {
                match self.retransmit().await {
                    Ok(retrans) => {
                        let timing = self.timing();
                        let interval = timing.backoff(retrans, timing.t2);
                        self.arm(TimerKind::G, interval);
                    }
                    Err(err) => {
                        log::info!("Failed to retransmit: {}", err);
                    }
                }
            }
            (State::Completed, TimerKind::H) => {
                // The ACK never came.
                self.push_error(Error::TxTimeout).await;
                self.on_terminated();
            }
            (State::Confirmed, TimerKind::I) => self.on_terminated(),
            (State::Accepted, TimerKind::L) => self.on_terminated(),
            _ => (),
        }
    }

    /// Sends a response through the transaction.
    pub async fn respond(&self, response: &mut OutgoingResponse) -> Result<()> {
        let code = response.status_code().into_i32();
        let state = self.get_state();

        match (state, code) {
            (State::Proceeding, 100..=199) => {
                self.tsx_send_response(response).await?;
            }
            (State::Proceeding, 200..=299) => {
                self.tsx_send_response(response).await?;
                self.change_state_to(State::Accepted);
                self.arm(TimerKind::L, self.timing().timeout());
            }
            (State::Proceeding, 300..=699) => {
                self.tsx_send_response(response).await?;
                self.change_state_to(State::Completed);
                if !self.reliable() {
                    self.arm(TimerKind::G, self.timing().t1);
                }
                self.arm(TimerKind::H, self.timing().timeout());
            }
            (State::Accepted, 200..=299) => {
                // The TU retransmits its 2xx through the transaction.
                self.tsx_send_response(response).await?;
            }
            _ => {
                return Err(Error::InvalidMessage(
                    "Response not allowed in the current transaction state",
                ))
            }
        };

        if let Some(trying) = self.auto_trying.lock().expect("Lock failed").take() {
            trying.stop();
        }

        Ok(())
    }

    pub(crate) async fn receive_request(&self, request: &IncomingRequest) -> Result<bool> {
        match (self.get_state(), request.method()) {
            (State::Proceeding, SipMethod::Invite) => {
                // Retransmitted INVITE; replay the last provisional if any.
                if self.last_msg().await.is_some() {
                    self.retransmit().await?;
                }
                Ok(true)
            }
            (State::Completed, SipMethod::Invite) => {
                self.retransmit().await?;
                Ok(true)
            }
            (State::Completed, SipMethod::Ack) => {
                self.change_state_to(State::Confirmed);
                self.timers().stop(TimerKind::G);
                self.timers().stop(TimerKind::H);
                self.terminate();
                Ok(true)
            }
            (State::Accepted, SipMethod::Ack) => {
                // The ACK for a 2xx belongs to the TU.
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}

//The TU passes any number of provisional responses to the
// server transaction.
#[async_trait]
impl Transaction for InvServerTransaction {
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Start timer I
            self.arm(TimerKind::I, self.timing().t4);
        }
    }
}

impl Deref for InvServerTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}
