use std::collections::BTreeMap;
use std::ops::Deref;
use std::ops::DerefMut;
use std::time::Duration;

use crate::error::Error;
use crate::message::SipMethod;
use crate::timer::{TimerKind, TimerSnapshot};
use crate::transaction::{State, Transaction, TsxType};
use crate::transport::IncomingResponse;
use crate::transport::OutgoingRequest;
use crate::Endpoint;
use crate::Result;

use super::TransactionInner;

/// Represents a Client Non INVITE transaction.
#[derive(Clone)]
pub struct ClientTransaction {
    transaction: TransactionInner,
}

impl ClientTransaction {
    /// Sends `request` and drives it as a non-INVITE client transaction.
    pub async fn send(mut request: OutgoingRequest, endpoint: &Endpoint) -> Result<ClientTransaction> {
        let transactions = endpoint.get_tsx_layer();
        let method = request.msg.method();

        assert!(
            !matches!(method, SipMethod::Invite | SipMethod::Ack),
            "Invalid method for non-INVITE client transaction: expected non-INVITE/non-ACK, got: {}",
            method
        );

        let transaction =
            TransactionInner::new_tsx_uac(&request, endpoint, TsxType::NonInviteClient, State::Trying)?;

        let uac = Self { transaction };

        uac.tsx_send_request(&mut request).await?;

        transactions.add_client_tsx_to_map(super::ClientTsx::NonInvite(uac.clone()));

        let timing = *uac.timing();
        if !uac.reliable() {
            uac.arm(TimerKind::A, timing.t1);
        }
        uac.arm(TimerKind::B, timing.timeout());

        Ok(uac)
    }

    /// Re-creates the transaction at a persisted state, re-arming timers
    /// with their remaining durations.
    pub(crate) fn resume(
        transaction: TransactionInner,
        timers: &BTreeMap<TimerKind, TimerSnapshot>,
    ) -> Self {
        let uac = Self { transaction };

        for (kind, snap) in timers {
            uac.arm(*kind, snap.remaining);
        }

        uac
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
            (state @ (State::Trying | State::Proceeding), TimerKind::A) => {
                match self.retransmit().await {
                    Ok(retrans) => {
                        let timing = self.timing();
                        // Once proceeding, retransmissions stay at T2.
                        let interval = if state == State::Trying {
                            timing.backoff(retrans, timing.t2)
                        } else {
                            timing.t2
                        };
                        self.arm(TimerKind::A, interval);
                    }
                    Err(err) => {
                        log::info!("Failed to retransmit: {}", err);
                        self.push_error(Error::TxTransport(err.to_string())).await;
                        self.on_terminated();
                    }
                }
            }
            (State::Trying | State::Proceeding, TimerKind::B) => {
                self.push_error(Error::TxTimeout).await;
                self.on_terminated();
            }
            (State::Completed, TimerKind::K) => self.on_terminated(),
            _ => (),
        }
    }

    pub(crate) async fn receive(&self, response: &IncomingResponse) -> Result<bool> {
        let code = response.response.code();
        self.set_last_status_code(code);

        match self.get_state() {
            State::Trying if code.is_provisional() => {
                self.change_state_to(State::Proceeding);
                self.set_last_response(response.response.clone());
                self.push_response(response.response.clone()).await;
            }
            State::Proceeding if code.is_provisional() => {
                self.set_last_response(response.response.clone());
                self.push_response(response.response.clone()).await;
            }
            State::Trying | State::Proceeding if code.is_final() => {
                self.change_state_to(State::Completed);
                self.timers().stop(TimerKind::A);
                self.timers().stop(TimerKind::B);
                self.set_last_response(response.response.clone());
                self.push_response(response.response.clone()).await;
                self.terminate();
            }
            State::Completed => {
                // A retransmitted final response is absorbed.
            }
            _ => (),
        }

        Ok(true)
    }
}

#[async_trait::async_trait]
impl Transaction for ClientTransaction {
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Start timer K
            self.arm(TimerKind::K, self.timing().t4);
        }
    }
}

impl DerefMut for ClientTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transaction
    }
}

impl Deref for ClientTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Duration;
    use tokio::time::{self};

    use super::*;
    use crate::message::StatusCode;
    use crate::transaction::mock;

    #[tokio::test]
    async fn test_entered_trying() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Options);

        let uac = ClientTransaction::send(request, &endpoint).await.unwrap();

        assert_eq!(uac.get_state(), State::Trying);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_timer_b() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Options);

        let uac = ClientTransaction::send(request, &endpoint).await.unwrap();
        let mut errors = uac.errors().unwrap();

        assert_eq!(uac.get_state(), State::Trying);

        // Wait for the timer to fire
        time::sleep(ClientTransaction::T1 * 64 + Duration::from_millis(1)).await;

        assert_eq!(uac.get_state(), State::Terminated);
        assert_matches!(errors.recv().await, Some(Error::TxTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_timer_k() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Options);
        let response = mock::incoming_response(StatusCode::OK);

        let uac = ClientTransaction::send(request, &endpoint).await.unwrap();

        assert_eq!(uac.get_state(), State::Trying);

        uac.receive(&response).await.unwrap();
        // Wait for the timer to fire
        time::sleep(ClientTransaction::T4 + Duration::from_millis(1)).await;

        assert_eq!(uac.get_state(), State::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_a_retransmission() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Options);

        let uac = ClientTransaction::send(request, &endpoint).await.unwrap();

        assert!(uac.retrans_count() == 0);

        // For the default values of T1 and T2, this results in
        // intervals of 500 ms, 1 s, 2 s, 4 s, 4 s, 4 s, etc.
        assert_eq!(uac.get_state(), State::Trying);
        // 500 ms
        time::sleep(Duration::from_millis(500 + 1)).await;
        assert!(uac.retrans_count() == 1);
        // 1 s
        time::sleep(Duration::from_secs(1) + Duration::from_millis(1)).await;
        assert!(uac.retrans_count() == 2);
        // 2 s
        time::sleep(Duration::from_secs(2) + Duration::from_millis(1)).await;
        assert!(uac.retrans_count() == 3);
        // 4s
        time::sleep(Duration::from_secs(4) + Duration::from_millis(1)).await;
        assert!(uac.retrans_count() == 4);
        // 4s
        time::sleep(Duration::from_secs(4) + Duration::from_millis(1)).await;
        assert!(uac.retrans_count() == 5);
        // 4s
        time::sleep(Duration::from_secs(4) + Duration::from_millis(1)).await;
        assert!(uac.retrans_count() == 6);

        assert_eq!(uac.get_state(), State::Trying);
    }

    #[tokio::test]
    async fn test_receives_100_trying() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Options);

        let uac = ClientTransaction::send(request, &endpoint).await.unwrap();

        assert_eq!(uac.get_state(), State::Trying);

        let response = mock::incoming_response(StatusCode(100));
        uac.receive(&response).await.unwrap();

        assert_eq!(uac.get_state(), State::Proceeding);
    }

    #[tokio::test]
    async fn test_receives_200_ok() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Options);
        let response = mock::incoming_response(StatusCode::OK);

        let uac = ClientTransaction::send(request, &endpoint).await.unwrap();
        let mut responses = uac.responses().unwrap();

        assert_eq!(uac.get_state(), State::Trying);

        uac.receive(&response).await.unwrap();

        assert!(uac.last_status_code().unwrap().into_i32() == 200);
        assert!(uac.get_state() == State::Completed);
        assert_eq!(responses.recv().await.unwrap().code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_final_retransmission_absorbed() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Options);

        let uac = ClientTransaction::send(request, &endpoint).await.unwrap();
        let mut responses = uac.responses().unwrap();

        uac.receive(&mock::incoming_response(StatusCode::OK)).await.unwrap();
        uac.receive(&mock::incoming_response(StatusCode::OK)).await.unwrap();

        assert_eq!(uac.get_state(), State::Completed);
        assert_eq!(responses.recv().await.unwrap().code(), StatusCode::OK);
        // Only the first final response reached the user.
        assert!(responses.try_recv().is_err());
    }
}
