//! Transaction persistence.
//!
//! A snapshot is a canonical, JSON-compatible record of everything a
//! transaction needs to continue after a process restart: state, key,
//! messages in their wire form, timing constants and the remaining
//! duration of every armed timer. Callbacks are not part of it; the caller
//! re-registers by taking the response and error streams off the restored
//! handle.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::{Request, Response, SipMsg, TransportKind};
use crate::parser::Parser;
use crate::timer::{TimerKind, TimerSnapshot};
use crate::transaction::key::TsxKey;
use crate::transaction::{
    ClientTransaction, ClientTsx, InvClientTransaction, InvServerTransaction, Role,
    ServerTransaction, ServerTsx, State, TimingConfig, TransactionInner, TsxType,
};
use crate::transport::{render_request, render_response, RequestHeaders, Transport};
use crate::Endpoint;

/// The persisted form of a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsxSnapshot {
    /// Capture time.
    pub time: SystemTime,
    /// Which state machine the transaction runs.
    pub tsx_type: TsxType,
    /// The state at capture time.
    pub state: State,
    /// The matching key.
    pub key: TsxKey,
    /// The transaction's request in wire form.
    pub request: String,
    /// The last response, sent (server) or received (client), in wire
    /// form.
    pub last_response: Option<String>,
    /// The remote address the transaction talks to.
    pub addr: SocketAddr,
    /// The transport protocol in use at capture time.
    pub transport: TransportKind,
    /// The timing constants the transaction ran with.
    pub timing: TimingConfig,
    /// Remaining durations of every armed timer.
    pub timers: BTreeMap<TimerKind, TimerSnapshot>,
    /// Retransmissions already performed.
    pub retransmit_count: u32,
    /// The last status code seen.
    pub last_status_code: Option<u16>,
}

impl TransactionInner {
    /// Captures the transaction for persistence.
    pub fn snapshot(&self) -> Result<TsxSnapshot> {
        let request = self
            .original_request()
            .ok_or(Error::InvalidArgument("Transaction carries no request"))?;
        let request = String::from_utf8(render_request(&request)?.to_vec())
            .map_err(|_| Error::InvalidMessage("Request is not valid UTF-8"))?;

        let last_response = match self.last_response() {
            Some(response) => Some(
                String::from_utf8(render_response(&response)?.to_vec())
                    .map_err(|_| Error::InvalidMessage("Response is not valid UTF-8"))?,
            ),
            None => None,
        };

        Ok(TsxSnapshot {
            time: SystemTime::now(),
            tsx_type: self.tsx_type(),
            state: self.get_state(),
            key: self.key().clone(),
            request,
            last_response,
            addr: self.addr(),
            transport: self.transport().tp_kind(),
            timing: *self.timing(),
            timers: self.timers().snapshot(),
            retransmit_count: self.retrans_count(),
            last_status_code: self.last_status_code().map(|code| code.0),
        })
    }
}

/// A transaction brought back from a snapshot.
pub enum RestoredTsx {
    /// A client transaction, re-registered with the layer.
    Client(ClientTsx),
    /// A server transaction, re-registered with the layer.
    Server(ServerTsx),
}

/// Re-creates a transaction from `snapshot` on the given transport.
///
/// The state machine resumes exactly where it was captured; each timer is
/// re-armed with the remaining duration it had. The restored transaction
/// is registered with the endpoint's transaction layer.
pub async fn restore(
    snapshot: TsxSnapshot,
    transport: Arc<dyn Transport>,
    endpoint: &Endpoint,
) -> Result<RestoredTsx> {
    let request = parse_request(&snapshot.request)?;
    let last_response = snapshot
        .last_response
        .as_deref()
        .map(parse_response)
        .transpose()?;

    let role = match snapshot.tsx_type {
        TsxType::InviteClient | TsxType::NonInviteClient => Role::UAC,
        TsxType::InviteServer | TsxType::NonInviteServer => Role::UAS,
    };

    let mut builder = TransactionInner::builder();
    builder.role(role);
    builder.tsx_type(snapshot.tsx_type);
    builder.endpoint(endpoint.clone());
    builder.key(snapshot.key.clone());
    builder.transport(transport);
    builder.addr(snapshot.addr);
    builder.state(snapshot.state);
    builder.timing(snapshot.timing);
    builder.request(request.clone());
    builder.retransmit_count(snapshot.retransmit_count as usize);
    builder.status_code(snapshot.last_status_code.map(crate::message::StatusCode));

    let transaction = builder.build();

    // Restore the retransmission buffer: a client resends its request, a
    // server its last response.
    let last_msg = match (role, &last_response) {
        (Role::UAS, Some(response)) => Some(render_response(response)?),
        (Role::UAS, None) => None,
        (Role::UAC, _) => Some(render_request(&request)?),
    };
    if let Some(buf) = last_msg {
        transaction.set_last_msg(buf).await;
    }
    if let Some(response) = last_response {
        transaction.set_last_response(response);
    }

    let layer = endpoint.get_tsx_layer();
    let restored = match snapshot.tsx_type {
        TsxType::InviteClient => {
            let tsx = InvClientTransaction::resume(transaction, &snapshot.timers);
            let tsx = ClientTsx::Invite(tsx);
            layer.add_client_tsx_to_map(tsx.clone());
            RestoredTsx::Client(tsx)
        }
        TsxType::NonInviteClient => {
            let tsx = ClientTransaction::resume(transaction, &snapshot.timers);
            let tsx = ClientTsx::NonInvite(tsx);
            layer.add_client_tsx_to_map(tsx.clone());
            RestoredTsx::Client(tsx)
        }
        TsxType::InviteServer => {
            let request_headers = RequestHeaders::extract(&request.headers)?;
            let tsx = InvServerTransaction::resume(transaction, request_headers, &snapshot.timers);
            let tsx = ServerTsx::Invite(tsx);
            layer.add_server_tsx_to_map(tsx.clone());
            RestoredTsx::Server(tsx)
        }
        TsxType::NonInviteServer => {
            let tsx = ServerTransaction::resume(transaction, &snapshot.timers);
            let tsx = ServerTsx::NonInvite(tsx);
            layer.add_server_tsx_to_map(tsx.clone());
            RestoredTsx::Server(tsx)
        }
    };

    Ok(restored)
}

fn parse_request(text: &str) -> Result<Request> {
    match Parser.parse_sip_msg(text.as_bytes())?.msg {
        SipMsg::Request(request) => Ok(request),
        SipMsg::Response(_) => Err(Error::InvalidMessage("Snapshot request is a response")),
    }
}

fn parse_response(text: &str) -> Result<Response> {
    match Parser.parse_sip_msg(text.as_bytes())?.msg {
        SipMsg::Request(_) => Err(Error::InvalidMessage("Snapshot response is a request")),
        SipMsg::Response(response) => Ok(response),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{SipMethod, StatusCode};
    use crate::parser::Parser;
    use crate::transaction::mock;
    use crate::transport::{udp::mock::MockUdpTransport, IncomingRequest, Packet, Payload};
    use std::time::Duration;
    use tokio::time;

    const INVITE: &[u8] = b"INVITE sip:bob@127.0.0.1:5060 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 127.0.0.1:5080;branch=z9hG4bK.restore1;received=127.0.0.1\r\n\
        From: <sip:alice@h>;tag=a\r\n\
        To: <sip:bob@h>\r\n\
        Call-ID: restore@h\r\n\
        CSeq: 1 INVITE\r\n\
        Max-Forwards: 70\r\n\
        Content-Length: 0\r\n\r\n";

    fn incoming_invite() -> IncomingRequest {
        let parsed = Parser.parse_sip_msg(INVITE).unwrap();
        let SipMsg::Request(request) = parsed.msg else {
            unreachable!();
        };
        let request_headers = RequestHeaders::extract(&request.headers).unwrap();
        let transport: Arc<dyn Transport> = Arc::new(MockUdpTransport);
        let addr = transport.addr();

        IncomingRequest {
            request,
            transport,
            packet: Packet {
                payload: Payload::new(bytes::Bytes::new()),
                addr,
                time: SystemTime::now(),
            },
            transaction: None,
            request_headers,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_restore_invite_server_completed() {
        let endpoint = mock::default_endpoint().await;
        let mut request = incoming_invite();
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();

        let response = &mut mock::response(StatusCode::BUSY_HERE);
        tsx.respond(response).await.unwrap();
        assert_eq!(tsx.get_state(), State::Completed);

        time::sleep(Duration::from_millis(100)).await;

        let snapshot = tsx.snapshot().unwrap();

        // Survives serialization.
        let json = serde_json::to_string(&snapshot).unwrap();
        let snapshot: TsxSnapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(snapshot.state, State::Completed);
        assert_eq!(snapshot.tsx_type, TsxType::InviteServer);
        assert_eq!(snapshot.last_status_code, Some(486));

        let timer_g = snapshot.timers.get(&TimerKind::G).unwrap();
        assert_eq!(timer_g.remaining, Duration::from_millis(400));
        let timer_h = snapshot.timers.get(&TimerKind::H).unwrap();
        assert_eq!(timer_h.remaining, Duration::from_millis(31_900));

        // The process goes away.
        tsx.on_terminated();

        // ...and comes back.
        let transport: Arc<dyn Transport> = Arc::new(MockUdpTransport);
        let restored = restore(snapshot, transport, &endpoint).await.unwrap();
        let RestoredTsx::Server(ServerTsx::Invite(restored)) = restored else {
            panic!("expected an INVITE server transaction");
        };

        assert_eq!(restored.get_state(), State::Completed);
        assert_eq!(restored.last_status_code(), Some(StatusCode::BUSY_HERE));
        assert_eq!(restored.key(), tsx.key());

        // Timer G continues from its remaining duration.
        time::sleep(Duration::from_millis(401)).await;
        assert_eq!(restored.retrans_count(), 1);

        // The ACK still confirms the transaction.
        let ack = mock::request(SipMethod::Ack);
        assert!(restored.receive_request(&ack).await.unwrap());
        assert_eq!(restored.get_state(), State::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_restore_invite_client_calling() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Invite);

        let tsx = InvClientTransaction::send(request, &endpoint).await.unwrap();
        assert_eq!(tsx.get_state(), State::Calling);

        time::sleep(Duration::from_millis(100)).await;

        let snapshot = tsx.snapshot().unwrap();
        let timer_a = snapshot.timers.get(&TimerKind::A).unwrap();
        assert_eq!(timer_a.remaining, Duration::from_millis(400));
        assert!(snapshot.timers.contains_key(&TimerKind::B));

        tsx.on_terminated();

        let transport: Arc<dyn Transport> = Arc::new(MockUdpTransport);
        let restored = restore(snapshot, transport, &endpoint).await.unwrap();
        let RestoredTsx::Client(ClientTsx::Invite(restored)) = restored else {
            panic!("expected an INVITE client transaction");
        };

        assert_eq!(restored.get_state(), State::Calling);

        // The restored transaction keeps retransmitting.
        time::sleep(Duration::from_millis(401)).await;
        assert_eq!(restored.retrans_count(), 1);

        // A 180 still moves it forward.
        let response = mock::incoming_response_for(StatusCode::RINGING, SipMethod::Invite);
        restored.receive(&response).await.unwrap();
        assert_eq!(restored.get_state(), State::Proceeding);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_equivalence() {
        let endpoint = mock::default_endpoint().await;
        let mut request = incoming_invite();
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();

        let response = &mut mock::response(StatusCode::BUSY_HERE);
        tsx.respond(response).await.unwrap();

        let snapshot = tsx.snapshot().unwrap();
        tsx.on_terminated();

        let transport: Arc<dyn Transport> = Arc::new(MockUdpTransport);
        let restored = restore(snapshot.clone(), transport, &endpoint).await.unwrap();
        let RestoredTsx::Server(ServerTsx::Invite(restored)) = restored else {
            panic!("expected an INVITE server transaction");
        };

        let again = restored.snapshot().unwrap();
        assert_eq!(snapshot.state, again.state);
        assert_eq!(snapshot.key, again.key);
        assert_eq!(snapshot.request, again.request);
        assert_eq!(snapshot.last_response, again.last_response);
        assert_eq!(snapshot.timing, again.timing);
    }
}
