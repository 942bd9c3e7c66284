use std::{
    collections::BTreeMap,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    error::Result,
    headers::{CSeq, Header, Headers, RouteEntry},
    message::{Request, RequestLine, SipMethod},
    timer::{TimerKind, TimerSnapshot},
    transaction::{client::ClientTransaction, State, Transaction, TsxType},
    transport::{IncomingResponse, OutgoingRequest},
    Endpoint,
};

use super::TransactionInner;

/// Represents a Client INVITE transaction.
#[derive(Clone)]
pub struct InvClientTransaction {
    transaction: TransactionInner,
    /// Set while a user cancel waits for a provisional response.
    pending_cancel: Arc<AtomicBool>,
}

impl InvClientTransaction {
    /// Sends `request` and drives it as an INVITE client transaction.
    pub async fn send(mut request: OutgoingRequest, endpoint: &Endpoint) -> Result<InvClientTransaction> {
        let tsx_layer = endpoint.get_tsx_layer();
        let method = request.msg.method();

        assert!(
            matches!(method, SipMethod::Invite),
            "Invalid method for client INVITE transaction: expected INVITE, got: {}",
            method
        );

        let transaction =
            TransactionInner::new_tsx_uac(&request, endpoint, TsxType::InviteClient, State::Calling)?;
        transaction.tsx_send_request(&mut request).await?;

        let uac_inv = InvClientTransaction {
            transaction,
            pending_cancel: Arc::new(AtomicBool::new(false)),
        };

        tsx_layer.add_client_tsx_to_map(super::ClientTsx::Invite(uac_inv.clone()));

        let timing = *uac_inv.timing();
        if !uac_inv.reliable() {
            uac_inv.arm(TimerKind::A, timing.t1);
        }
        uac_inv.arm(TimerKind::B, timing.timeout());

        Ok(uac_inv)
    }

    /// Re-creates the transaction at a persisted state, re-arming timers
    /// with their remaining durations.
    pub(crate) fn resume(
        transaction: TransactionInner,
        timers: &BTreeMap<TimerKind, TimerSnapshot>,
    ) -> Self {
        let uac_inv = InvClientTransaction {
            transaction,
            pending_cancel: Arc::new(AtomicBool::new(false)),
        };

        for (kind, snap) in timers {
            uac_inv.arm(*kind, snap.remaining);
        }

        uac_inv
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
            (State::Calling, TimerKind::A) => {
                match self.retransmit().await {
                    Ok(retrans) => {
                        // Doubling is capped at 2·T2.
                        let timing = self.timing();
                        let interval = timing.backoff(retrans, 2 * timing.t2);
                        self.arm(TimerKind::A, interval);
                    }
                    Err(err) => {
                        log::info!("Failed to retransmit: {}", err);
                        self.push_error(crate::error::Error::TxTransport(err.to_string())).await;
                        self.on_terminated();
                    }
                }
            }
            (State::Calling, TimerKind::B) => {
                self.push_error(crate::error::Error::TxTimeout).await;
                self.on_terminated();
            }
            (State::Completed, TimerKind::D) => self.on_terminated(),
            (State::Accepted, TimerKind::M) => self.on_terminated(),
            _ => (),
        }
    }

    pub(crate) async fn receive(&self, response: &IncomingResponse) -> Result<bool> {
        let code = response.response.code();
        self.set_last_status_code(code);

        match self.get_state() {
            State::Calling if code.is_provisional() => {
                self.change_state_to(State::Proceeding);
                self.timers().stop(TimerKind::A);
                self.set_last_response(response.response.clone());
                self.push_response(response.response.clone()).await;

                if self.pending_cancel.swap(false, Ordering::SeqCst) {
                    self.send_cancel().await?;
                }
            }
            State::Proceeding if code.is_provisional() => {
                self.set_last_response(response.response.clone());
                self.push_response(response.response.clone()).await;
            }
            State::Calling | State::Proceeding if code.is_success() => {
                self.change_state_to(State::Accepted);
                self.timers().stop(TimerKind::A);
                self.set_last_response(response.response.clone());
                self.arm(TimerKind::M, self.timing().timeout());
                self.push_response(response.response.clone()).await;
            }
            State::Calling | State::Proceeding if code.is_final() => {
                self.change_state_to(State::Completed);
                self.timers().stop(TimerKind::A);
                self.set_last_response(response.response.clone());
                let mut ack = self.create_ack(response)?;

                self.tsx_send_request(&mut ack).await?;
                self.push_response(response.response.clone()).await;
                self.terminate();
            }
            State::Completed => {
                // 17.1.1.2 INVITE Client Transaction
                // Any retransmissions of the final response that are received while in
                // the "Completed" state MUST cause the ACK to be re-passed to the
                // transport layer for retransmission, but the newly received response
                // MUST NOT be passed up to the TU.
                self.retransmit().await?;
            }
            State::Accepted if code.is_success() => {
                // Additional 2xx retransmissions reach the TU so it can
                // answer each with an ACK.
                self.push_response(response.response.clone()).await;
            }
            _ => (),
        }
        Ok(true)
    }

    /// Cancels the pending INVITE.
    ///
    /// Before a provisional response has arrived the CANCEL is buffered;
    /// once one arrives it goes out on its own client transaction with its
    /// own timeout, leaving this transaction's timers alone.
    pub async fn cancel(&self) -> Result<()> {
        match self.get_state() {
            State::Calling => {
                self.pending_cancel.store(true, Ordering::SeqCst);
                Ok(())
            }
            State::Proceeding => self.send_cancel().await,
            _ => Ok(()),
        }
    }

    async fn send_cancel(&self) -> Result<()> {
        let Some(request) = self.original_request() else {
            return Err(crate::error::Error::InvalidArgument("No request to cancel"));
        };

        // 9.1: the CANCEL mirrors the INVITE, same Request-URI, same
        // branch, CSeq method rewritten.
        let mut headers = Headers::with_capacity(5);
        for header in request.headers.iter() {
            match header {
                Header::Via(via) => headers.push(Header::Via(via.clone())),
                Header::From(from) => headers.push(Header::From(from.clone())),
                Header::To(to) => headers.push(Header::To(to.clone())),
                Header::CallId(call_id) => headers.push(Header::CallId(call_id.clone())),
                Header::CSeq(cseq) => headers.push(Header::CSeq(CSeq {
                    method: SipMethod::Cancel,
                    cseq: cseq.cseq,
                })),
                Header::MaxForwards(hops) => headers.push(Header::MaxForwards(*hops)),
                _ => (),
            }
        }

        let cancel = OutgoingRequest {
            msg: Request {
                req_line: RequestLine {
                    method: SipMethod::Cancel,
                    uri: request.req_line.uri.clone(),
                },
                headers,
                body: None,
            },
            addr: self.addr(),
            buf: None,
            transport: self.transport().clone(),
        };

        ClientTransaction::send(cancel, self.endpoint()).await?;

        Ok(())
    }

    fn create_ack(&self, response: &IncomingResponse) -> Result<OutgoingRequest> {
        let request = self
            .original_request()
            .ok_or(crate::error::Error::InvalidArgument("No request to acknowledge"))?;

        let to = response
            .response
            .headers
            .to_hdr()
            .cloned()
            .unwrap_or_else(|| response.request_headers.to.clone());

        let cseq = CSeq {
            method: SipMethod::Ack,
            cseq: response.request_headers.cseq.cseq,
        };

        let mut ack_hdrs = Headers::with_capacity(6);

        if let Some(via) = request.headers.top_via() {
            ack_hdrs.push(Header::Via(via.clone()));
        }
        if let Some(from) = request.headers.from_hdr() {
            ack_hdrs.push(Header::From(from.clone()));
        }
        ack_hdrs.push(Header::To(to));
        ack_hdrs.push(Header::CallId(response.request_headers.call_id.clone()));
        ack_hdrs.push(Header::CSeq(cseq));

        // Route set: the request's own Route headers win; otherwise the
        // Record-Route of the response, reversed.
        let routes: Vec<RouteEntry> = request
            .headers
            .iter()
            .filter_map(|h| h.as_route().cloned())
            .collect();
        if routes.is_empty() {
            let mut record_routes: Vec<RouteEntry> = response
                .response
                .headers
                .iter()
                .filter_map(|h| h.as_record_route().cloned())
                .collect();
            record_routes.reverse();
            ack_hdrs.extend(record_routes.into_iter().map(Header::Route));
        } else {
            ack_hdrs.extend(routes.into_iter().map(Header::Route));
        }

        Ok(OutgoingRequest {
            msg: Request {
                req_line: RequestLine {
                    method: SipMethod::Ack,
                    uri: request.req_line.uri.clone(),
                },
                headers: ack_hdrs,
                body: None,
            },
            addr: self.addr(),
            buf: None,
            transport: self.transport().clone(),
        })
    }
}

#[async_trait::async_trait]
impl Transaction for InvClientTransaction {
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Start timer D
            self.arm(TimerKind::D, self.timing().td);
        }
    }
}

impl DerefMut for InvClientTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transaction
    }
}

impl Deref for InvClientTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}
