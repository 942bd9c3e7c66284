use async_trait::async_trait;

use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
    message::SipMethod,
    timer::{TimerKind, TimerSnapshot},
    transaction::{State, Transaction, TsxType},
    transport::{IncomingRequest, OutgoingResponse},
};
use std::{
    collections::BTreeMap,
    ops::{Deref, DerefMut},
    time::Duration,
};

use super::TransactionInner;

/// Represents a Server Non INVITE transaction.
#[derive(Clone)]
pub struct ServerTransaction {
    transaction: TransactionInner,
}

impl ServerTransaction {
    /// Creates the transaction for an incoming request and attaches it to
    /// the request.
    pub fn new(endpoint: &Endpoint, request: &mut IncomingRequest) -> Result<Self> {
        assert!(
            !matches!(
                request.method(),
                SipMethod::Ack | SipMethod::Invite
            ),
            "Request method cannot be Ack or Invite",
        );
        let tsx_layer = endpoint.get_tsx_layer();
        let transaction =
            TransactionInner::new_tsx_uas(request, endpoint, TsxType::NonInviteServer, State::Trying)?;
        let server_tsx = ServerTransaction { transaction };

        request.set_tsx(super::ServerTsx::NonInvite(server_tsx.clone()));
        tsx_layer.add_server_tsx_to_map(super::ServerTsx::NonInvite(server_tsx.clone()));

        Ok(server_tsx)
    }

    /// Re-creates the transaction at a persisted state, re-arming timers
    /// with their remaining durations.
    pub(crate) fn resume(
        transaction: TransactionInner,
        timers: &BTreeMap<TimerKind, TimerSnapshot>,
    ) -> Self {
        let uas = ServerTransaction { transaction };

        for (kind, snap) in timers {
            uas.arm(*kind, snap.remaining);
        }

        uas
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
            (State::Completed, TimerKind::J) => self.on_terminated(),
            _ => (),
        }
    }

    pub(crate) async fn receive_request(&self, _request: &IncomingRequest) -> Result<bool> {
        match self.get_state() {
            // A retransmission before any response is silently absorbed.
            State::Trying => Ok(true),
            State::Proceeding | State::Completed => {
                self.retransmit().await?;
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    /// Sends a response through the transaction.
    pub async fn respond(&self, msg: &mut OutgoingResponse) -> Result<()> {
        let code = msg.status_code().into_i32();
        let state = self.get_state();

        match (state, code) {
            (State::Trying, 100..=199) => {
                self.tsx_send_response(msg).await?;
                self.change_state_to(State::Proceeding);
            }
            (State::Proceeding, 100..=199) => {
                self.tsx_send_response(msg).await?;
            }
            (State::Trying | State::Proceeding, 200..=699) => {
                self.tsx_send_response(msg).await?;
                self.change_state_to(State::Completed);
                self.terminate();
            }
            _ => {
                return Err(Error::InvalidMessage(
                    "Response not allowed in the current transaction state",
                ))
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Transaction for ServerTransaction {
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Start timer J
            self.arm(TimerKind::J, self.timing().timeout());
        }
    }
}

impl DerefMut for ServerTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transaction
    }
}

impl Deref for ServerTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{self, Duration};

    use super::*;
    use crate::{
        message::StatusCode,
        transaction::mock,
    };

    #[tokio::test]
    async fn test_receives_100_trying() {
        let mut request = mock::request(SipMethod::Options);
        let endpoint = mock::default_endpoint().await;
        let tsx = ServerTransaction::new(&endpoint, &mut request).unwrap();
        let response = &mut mock::response(StatusCode::TRYING);

        tsx.respond(response).await.unwrap();

        assert!(tsx.last_status_code().unwrap().into_i32() == 100);
        assert!(tsx.get_state() == State::Proceeding);
    }

    #[tokio::test]
    async fn test_receives_200_ok() {
        let mut request = mock::request(SipMethod::Options);
        let endpoint = mock::default_endpoint().await;
        let tsx = ServerTransaction::new(&endpoint, &mut request).unwrap();
        let response = &mut mock::response(StatusCode::OK);

        tsx.respond(response).await.unwrap();

        assert!(tsx.last_status_code().unwrap().into_i32() == 200);
        assert!(tsx.get_state() == State::Completed);
    }

    #[tokio::test]
    async fn test_retransmission_in_trying_absorbed() {
        let mut request = mock::request(SipMethod::Options);
        let endpoint = mock::default_endpoint().await;
        let tsx = ServerTransaction::new(&endpoint, &mut request).unwrap();

        let retrans = mock::request(SipMethod::Options);
        assert!(tsx.receive_request(&retrans).await.unwrap());

        assert_eq!(tsx.retrans_count(), 0);
        assert_eq!(tsx.get_state(), State::Trying);
    }

    #[tokio::test]
    async fn test_retransmit_proceeding() {
        let mut request = mock::request(SipMethod::Options);
        let endpoint = mock::default_endpoint().await;
        let tsx = ServerTransaction::new(&endpoint, &mut request).unwrap();
        let response = &mut mock::response(StatusCode::TRYING);
        let request = &mock::request(SipMethod::Options);

        tsx.respond(response).await.unwrap();
        tsx.receive_request(request).await.unwrap();

        assert!(tsx.retrans_count() == 1);
        assert!(tsx.last_status_code().unwrap().into_i32() == 100);
        assert!(tsx.get_state() == State::Proceeding);
    }

    #[tokio::test]
    async fn test_retransmit_completed() {
        let mut request = mock::request(SipMethod::Options);
        let endpoint = mock::default_endpoint().await;
        let tsx = ServerTransaction::new(&endpoint, &mut request).unwrap();
        let response = &mut mock::response(StatusCode::OK);
        let request = &mock::request(SipMethod::Options);

        tsx.respond(response).await.unwrap();
        tsx.receive_request(request).await.unwrap();

        assert!(tsx.retrans_count() == 1);
        assert!(tsx.last_status_code().unwrap().into_i32() == 200);
        assert!(tsx.get_state() == State::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminated_timer_j() {
        let mut request = mock::request(SipMethod::Options);
        let endpoint = mock::default_endpoint().await;
        let tsx = ServerTransaction::new(&endpoint, &mut request).unwrap();
        let response = &mut mock::response(StatusCode::OK);

        tsx.respond(response).await.unwrap();

        time::sleep(ServerTransaction::T1 * 64 + Duration::from_millis(1)).await;

        assert!(tsx.last_status_code().unwrap().into_i32() == 200);
        assert!(tsx.get_state() == State::Terminated);
    }
}
