#![deny(missing_docs)]
//! SIP Transaction Layer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
    message::{Request, Response, StatusCode},
    timer::{TimerBag, TimerKind},
    transport::{
        IncomingRequest, IncomingResponse, OutgoingRequest, OutgoingResponse, ToBytes, Transport,
    },
};

use std::{
    collections::HashMap,
    io, mem,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use tokio::sync::{mpsc, watch};

pub(crate) mod client;
pub(crate) mod inv_client;
pub(crate) mod inv_server;
pub mod key;
pub(crate) mod server;
pub mod snapshot;

pub use client::ClientTransaction;
pub use inv_client::InvClientTransaction;
pub use inv_server::InvServerTransaction;
pub use server::ServerTransaction;
pub use snapshot::TsxSnapshot;

use key::TsxKey;

type LastMsg = tokio::sync::RwLock<Option<Bytes>>;
type LastStatusCode = RwLock<Option<StatusCode>>;

/// The RFC 3261 timing constants with the derived timer durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Round trip estimate.
    pub t1: Duration,
    /// Maximum retransmission interval.
    pub t2: Duration,
    /// Maximum time a message stays in the network.
    pub t4: Duration,
    /// Lifetime of a completed INVITE client transaction on unreliable
    /// transports.
    pub td: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            td: Duration::from_secs(32),
        }
    }
}

impl TimingConfig {
    /// 64·T1, the overall transaction timeout (Timers B, F, H, L and M).
    pub fn timeout(&self) -> Duration {
        self.t1 * 64
    }

    /// The retransmission interval after `retrans` retransmissions,
    /// doubling from T1 and capped at `cap`.
    pub fn backoff(&self, retrans: u32, cap: Duration) -> Duration {
        let doubled = self.t1.saturating_mul(1u32 << retrans.min(16));

        doubled.min(cap)
    }
}

#[async_trait::async_trait]
/// A trait for managing the behavior of a SIP transaction.
pub trait Transaction: Sync + Send + 'static {
    /// Estimated round‑trip time (RTT) for message exchanges.
    ///
    /// This value is used as the baseline when computing retransmission intervals.
    const T1: Duration = Duration::from_millis(500);

    /// Maximum retransmission interval for non‑INVITE requests and INVITE responses.
    ///
    /// Retransmissions back off exponentially, but will not exceed this value.
    const T2: Duration = Duration::from_secs(4);

    /// Maximum duration that a message may remain in the network before being discarded.
    ///
    /// Controls the overall lifetime of the transaction, including retransmissions.
    const T4: Duration = Duration::from_secs(5);

    /// Terminate the SIP Transaction.
    fn terminate(&self);
}

struct Inner {
    /// The role of the transaction (UAC or UAS).
    role: Role,
    /// Which of the four state machines this transaction runs.
    tsx_type: TsxType,
    /// The endpoint associated with the transaction.
    endpoint: Endpoint,
    /// The key used to identify the transaction.
    key: TsxKey,
    /// The transport layer used for communication.
    transport: Arc<dyn Transport>,
    /// The address of the remote endpoint.
    addr: SocketAddr,
    /// The current state of the transaction.
    state: Mutex<State>,
    /// The last status code sent or received in the transaction.
    status_code: LastStatusCode,
    /// The retransmission count for the transaction.
    retransmit_count: AtomicUsize,
    /// The last message sent in the transaction, kept rendered for
    /// retransmission.
    last_msg: LastMsg,
    /// The request that created the transaction.
    request: RwLock<Option<Request>>,
    /// The last response sent (UAS) or received (UAC).
    last_response: RwLock<Option<Response>>,
    /// The timing constants this transaction runs with.
    timing: TimingConfig,
    /// The named timers owned by this transaction.
    timers: TimerBag,
    /// Signals termination to anyone holding a handle.
    done: watch::Sender<bool>,
    /// Responses delivered to the transaction user (UAC only).
    responses_tx: mpsc::Sender<Response>,
    responses_rx: Mutex<Option<mpsc::Receiver<Response>>>,
    /// Errors (timeout, transport) delivered to the transaction user.
    errors_tx: mpsc::Sender<Error>,
    errors_rx: Mutex<Option<mpsc::Receiver<Error>>>,
}

#[derive(Clone)]
/// Represents a SIP Transaction.
///
/// A SIP Transaction consists of a set of messages exchanged
/// between a client (`UAC`) and a server (`UAS`) to complete
/// a certain action, such as establishing or terminating a call.
pub struct TransactionInner(Arc<Inner>);

impl TransactionInner {
    fn builder() -> Builder {
        Default::default()
    }

    pub(crate) fn new_tsx_uac(
        request: &OutgoingRequest,
        endpoint: &Endpoint,
        tsx_type: TsxType,
        state: State,
    ) -> Result<Self> {
        let headers = crate::transport::RequestHeaders::extract(&request.msg.headers)?;
        let key = TsxKey::create_client(
            &headers.via,
            &headers.cseq,
            &headers.from,
            &headers.to,
            &headers.call_id,
            &request.msg.req_line.uri,
        )?;

        let mut builder = Self::builder();

        builder.key(key);
        builder.role(Role::UAC);
        builder.tsx_type(tsx_type);
        builder.endpoint(endpoint.clone());
        builder.transport(request.transport.clone());
        builder.addr(request.addr);
        builder.state(state);
        builder.request(request.msg.clone());

        let tsx = builder.build();

        log::trace!("Transaction Created [{:#?}] ({:p})", tsx.0.role, tsx.0);

        Ok(tsx)
    }

    pub(crate) fn new_tsx_uas(
        request: &IncomingRequest,
        endpoint: &Endpoint,
        tsx_type: TsxType,
        state: State,
    ) -> Result<Self> {
        let hdrs = &request.request_headers;
        let key = TsxKey::create_server(
            &hdrs.via,
            &hdrs.cseq,
            &hdrs.from,
            &hdrs.to,
            &hdrs.call_id,
            &request.request.req_line.uri,
        )?;

        let mut builder = Self::builder();

        builder.key(key);
        builder.role(Role::UAS);
        builder.tsx_type(tsx_type);
        builder.endpoint(endpoint.clone());
        builder.transport(request.transport.clone());
        builder.addr(request.packet.addr);
        builder.state(state);
        builder.request(request.request.clone());

        let tsx = builder.build();

        log::trace!("Transaction Created [{:#?}] ({:p})", tsx.0.role, tsx.0);

        Ok(tsx)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.0.transport
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.0.addr
    }

    pub(crate) fn key(&self) -> &TsxKey {
        &self.0.key
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.0.endpoint
    }

    pub(crate) fn timing(&self) -> &TimingConfig {
        &self.0.timing
    }

    pub(crate) fn timers(&self) -> &TimerBag {
        &self.0.timers
    }

    pub(crate) fn tsx_type(&self) -> TsxType {
        self.0.tsx_type
    }

    pub(crate) fn original_request(&self) -> Option<Request> {
        self.0.request.read().expect("Lock failed").clone()
    }

    pub(crate) fn last_response(&self) -> Option<Response> {
        self.0.last_response.read().expect("Lock failed").clone()
    }

    pub(crate) fn set_last_response(&self, response: Response) {
        *self.0.last_response.write().expect("Lock failed") = Some(response);
    }

    #[inline]
    /// Checks if the transport is reliable.
    pub fn reliable(&self) -> bool {
        self.0.transport.reliable()
    }

    #[inline]
    /// Retrieves the current state of the Transaction.
    pub fn get_state(&self) -> State {
        *self.0.state.lock().expect("Lock failed")
    }

    #[inline]
    /// Gets the count of retransmissions.
    pub fn retrans_count(&self) -> u32 {
        self.0.retransmit_count.load(Ordering::SeqCst) as u32
    }

    #[inline]
    pub(crate) fn add_retrans_count(&self) -> u32 {
        self.0.retransmit_count.fetch_add(1, Ordering::SeqCst) as u32 + 1
    }

    #[inline]
    /// Retrieves the last status code sent.
    pub fn last_status_code(&self) -> Option<StatusCode> {
        *self.0.status_code.read().expect("Lock failed")
    }

    #[inline]
    /// Retrieves the last msg sent if any.
    pub(crate) async fn last_msg(&self) -> Option<Bytes> {
        self.0.last_msg.read().await.clone()
    }

    /// Takes the stream of responses delivered to this transaction.
    pub fn responses(&self) -> Option<mpsc::Receiver<Response>> {
        self.0.responses_rx.lock().expect("Lock failed").take()
    }

    /// Takes the stream of errors delivered to this transaction.
    pub fn errors(&self) -> Option<mpsc::Receiver<Error>> {
        self.0.errors_rx.lock().expect("Lock failed").take()
    }

    /// A watch that flips to `true` once the transaction terminates.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.0.done.subscribe()
    }

    pub(crate) async fn push_response(&self, response: Response) {
        let mut done = self.0.done.subscribe();
        if *done.borrow() {
            return;
        }
        tokio::select! {
            res = self.0.responses_tx.send(response) => {
                if res.is_err() {
                    log::trace!("Response receiver dropped ({:p})", self.0);
                }
            }
            _ = done.changed() => {}
        }
    }

    pub(crate) async fn push_error(&self, error: Error) {
        let mut done = self.0.done.subscribe();
        if *done.borrow() {
            return;
        }
        tokio::select! {
            res = self.0.errors_tx.send(error) => {
                if res.is_err() {
                    log::trace!("Error receiver dropped ({:p})", self.0);
                }
            }
            _ = done.changed() => {}
        }
    }

    pub(crate) fn on_terminated(&self) {
        self.change_state_to(State::Terminated);
        self.0.timers.stop_all();
        self.0.done.send_replace(true);

        let layer = self.0.endpoint.get_tsx_layer();
        let key = &self.0.key;

        match self.0.role {
            Role::UAC => {
                layer.remove_client_tsx(key);
            }
            Role::UAS => {
                layer.remove_server_tsx(key);
            }
        };
    }

    pub(crate) fn change_state_to(&self, state: State) {
        let old = {
            let mut guard = self.0.state.lock().expect("Lock failed");
            mem::replace(&mut *guard, state)
        };
        log::trace!("State Changed [{old:?} -> {state:?}] ({:p})", self.0);
    }

    #[inline]
    pub(crate) fn set_last_status_code(&self, code: StatusCode) {
        let mut guard = self.0.status_code.write().expect("Lock failed");
        *guard = Some(code);
    }

    pub(crate) async fn set_last_msg(&self, msg: Bytes) {
        let mut guard = self.0.last_msg.write().await;
        *guard = Some(msg);
    }

    pub(crate) fn is_calling(&self) -> bool {
        self.get_state() == State::Calling
    }

    pub(crate) async fn retransmit(&self) -> Result<u32> {
        let retransmited = {
            let lock = self.0.last_msg.read().await;
            if let Some(msg) = lock.as_ref() {
                self.0
                    .endpoint
                    .transport()
                    .send_buffer(&self.0.transport, msg, &self.0.addr, self.0.role == Role::UAC)
                    .await?;
                true
            } else {
                false
            }
        };

        if retransmited {
            Ok(self.add_retrans_count())
        } else {
            Err(Error::Io(io::Error::other("No message to retransmit")))
        }
    }

    pub(crate) async fn tsx_send_request(&self, msg: &mut OutgoingRequest) -> Result<()> {
        log::debug!("<= Request {} to /{}", msg.msg.req_line.method, msg.addr);
        let buf = match msg.buf.take() {
            Some(buf) => buf,
            None => msg.to_bytes()?,
        };
        self.0
            .endpoint
            .transport()
            .send_buffer(&self.0.transport, &buf, &self.0.addr, true)
            .await?;
        self.set_last_msg(buf).await;
        Ok(())
    }

    pub(crate) async fn tsx_send_response(&self, msg: &mut OutgoingResponse) -> Result<()> {
        let code = msg.status_code();
        log::debug!("=> Response {} {}", code.into_i32(), msg.reason());
        msg.stamp_res_delay();
        let buf = match msg.buf.take() {
            Some(buf) => buf,
            None => msg.to_bytes()?,
        };

        self.0
            .endpoint
            .transport()
            .send_buffer(&self.0.transport, &buf, &self.0.addr, false)
            .await?;
        self.set_last_status_code(code);
        self.set_last_response(msg.response.clone());
        self.set_last_msg(buf).await;
        Ok(())
    }

    /// Arms `kind` to re-enter `handler` after `duration`; a zero duration
    /// runs the handler at once, the degenerate case of reliable
    /// transports.
    pub(crate) fn arm_timer<H, Fut>(&self, kind: TimerKind, duration: Duration, handler: H)
    where
        H: Fn(TimerKind) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if duration.is_zero() {
            let handler = handler.clone();
            tokio::spawn(async move { handler(kind).await });
            return;
        }

        self.0.timers.arm(kind, duration, move || {
            let handler = handler.clone();
            async move { handler(kind).await }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        log::trace!("Dropping Transaction [{:?}] ({:p})", self.tsx_type, self)
    }
}

const TSX_CHANNEL_CAPACITY: usize = 32;

#[derive(Default)]
/// Builder for creating a new SIP `Transaction`.
pub struct Builder {
    role: Option<Role>,
    tsx_type: Option<TsxType>,
    endpoint: Option<Endpoint>,
    key: Option<TsxKey>,
    transport: Option<Arc<dyn Transport>>,
    addr: Option<SocketAddr>,
    state: Option<Mutex<State>>,
    status_code: Option<LastStatusCode>,
    last_msg: Option<LastMsg>,
    retransmit_count: Option<AtomicUsize>,
    request: Option<Request>,
    timing: Option<TimingConfig>,
}

impl Builder {
    /// Sets the role of the transaction.
    pub fn role(&mut self, role: Role) -> &mut Self {
        self.role = Some(role);
        self
    }

    /// Sets the state machine variant of the transaction.
    pub fn tsx_type(&mut self, tsx_type: TsxType) -> &mut Self {
        self.tsx_type = Some(tsx_type);
        self
    }

    /// Sets the endpoint associated with the transaction.
    pub fn endpoint(&mut self, endpoint: Endpoint) -> &mut Self {
        self.timing.get_or_insert_with(|| *endpoint.timing());
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the key used to identify the transaction.
    pub fn key(&mut self, key: TsxKey) -> &mut Self {
        self.key = Some(key);
        self
    }

    /// Sets the transport associated with the transaction.
    pub fn transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the address associated with the transaction.
    pub fn addr(&mut self, addr: SocketAddr) -> &mut Self {
        self.addr = Some(addr);
        self
    }

    /// Sets the transaction state.
    pub fn state(&mut self, state: State) -> &mut Self {
        self.state = Some(Mutex::new(state));
        self
    }

    /// Set the status code.
    pub fn status_code(&mut self, status_code: Option<StatusCode>) -> &mut Self {
        self.status_code = Some(RwLock::new(status_code));
        self
    }

    /// Set the retransmission count.
    pub fn retransmit_count(&mut self, retransmit_count: usize) -> &mut Self {
        self.retransmit_count = Some(AtomicUsize::new(retransmit_count));
        self
    }

    /// Set the request that created the transaction.
    pub fn request(&mut self, request: Request) -> &mut Self {
        self.request = Some(request);
        self
    }

    /// Override the timing constants.
    pub fn timing(&mut self, timing: TimingConfig) -> &mut Self {
        self.timing = Some(timing);
        self
    }

    /// Finalize the builder into a `Transaction`.
    pub fn build(self) -> TransactionInner {
        let (responses_tx, responses_rx) = mpsc::channel(TSX_CHANNEL_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(TSX_CHANNEL_CAPACITY);

        let inner = Inner {
            role: self.role.expect("Role is required"),
            tsx_type: self.tsx_type.expect("Transaction type is required"),
            endpoint: self.endpoint.expect("Endpoint is required"),
            key: self.key.expect("Key is required"),
            transport: self.transport.expect("Arc<dyn Transport> is required"),
            addr: self.addr.expect("Address is required"),
            state: self.state.expect("State is required"),
            status_code: self.status_code.unwrap_or_default(),
            last_msg: self.last_msg.unwrap_or_default(),
            retransmit_count: self.retransmit_count.unwrap_or_default(),
            request: RwLock::new(self.request),
            last_response: RwLock::new(None),
            timing: self.timing.unwrap_or_default(),
            timers: TimerBag::default(),
            done: watch::channel(false).0,
            responses_tx,
            responses_rx: Mutex::new(Some(responses_rx)),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        };

        TransactionInner(Arc::new(inner))
    }
}

/// The possible roles of a SIP Transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// (User Agent Client): The entity that initiates the
    /// request.
    UAC,
    /// (User Agent Server): The entity that responds to the
    /// request.
    UAS,
}

/// Which of the four RFC 3261 §17 state machines a transaction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TsxType {
    /// INVITE client transaction (§17.1.1).
    InviteClient,
    /// Non-INVITE client transaction (§17.1.2).
    NonInviteClient,
    /// INVITE server transaction (§17.2.1).
    InviteServer,
    /// Non-INVITE server transaction (§17.2.2).
    NonInviteServer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
/// Defines the possible states of a SIP Transaction.
pub enum State {
    #[default]
    /// Initial state
    Initial,
    /// Calling state
    Calling,
    /// Trying state
    Trying,
    /// Proceeding state
    Proceeding,
    /// Completed state
    Completed,
    /// Accepted state, holding a 2xx INVITE outcome open for
    /// retransmissions.
    Accepted,
    /// Confirmed state
    Confirmed,
    /// Terminated state
    Terminated,
}

#[derive(Clone)]
/// An Server Transaction, either Invite or NonInvite.
pub enum ServerTsx {
    /// An NonInvite Server Transaction.
    NonInvite(ServerTransaction),
    /// An Invite Server Transaction.
    Invite(InvServerTransaction),
}

impl ServerTsx {
    /// Retrieves the last status code sent by transaction.
    pub fn last_status_code(&self) -> Option<StatusCode> {
        match self {
            ServerTsx::NonInvite(uas) => uas.last_status_code(),
            ServerTsx::Invite(uas_inv) => uas_inv.last_status_code(),
        }
    }

    /// Responds through the transaction.
    pub async fn respond(&self, response: &mut OutgoingResponse) -> Result<()> {
        match self {
            ServerTsx::NonInvite(uas) => uas.respond(response).await,
            ServerTsx::Invite(uas_inv) => uas_inv.respond(response).await,
        }
    }

    pub(crate) fn key(&self) -> &TsxKey {
        match self {
            ServerTsx::NonInvite(uas) => uas.key(),
            ServerTsx::Invite(uas_inv) => uas_inv.key(),
        }
    }

    /// Feeds an inbound request (retransmission or ACK) into the state
    /// machine.
    ///
    /// Returns `true` when the transaction consumed the request entirely;
    /// `false` when the request must also reach the transaction user, as
    /// an ACK to a 2xx final does.
    pub(crate) async fn receive_request(&self, request: &IncomingRequest) -> Result<bool> {
        match self {
            ServerTsx::NonInvite(uas) => uas.receive_request(request).await,
            ServerTsx::Invite(uas_inv) => uas_inv.receive_request(request).await,
        }
    }
}

impl From<ServerTransaction> for ServerTsx {
    fn from(tsx: ServerTransaction) -> Self {
        ServerTsx::NonInvite(tsx)
    }
}

impl From<InvServerTransaction> for ServerTsx {
    fn from(tsx: InvServerTransaction) -> Self {
        ServerTsx::Invite(tsx)
    }
}

#[derive(Clone)]
/// An Client Transaction, either Invite or NonInvite.
pub enum ClientTsx {
    /// An NonInvite Client Transaction.
    NonInvite(ClientTransaction),
    /// An Invite Client Transaction.
    Invite(InvClientTransaction),
}

impl ClientTsx {
    /// Takes the stream of responses delivered to this transaction.
    pub fn responses(&self) -> Option<mpsc::Receiver<Response>> {
        match self {
            ClientTsx::NonInvite(uac) => uac.responses(),
            ClientTsx::Invite(uac_inv) => uac_inv.responses(),
        }
    }

    /// Takes the stream of errors delivered to this transaction.
    pub fn errors(&self) -> Option<mpsc::Receiver<Error>> {
        match self {
            ClientTsx::NonInvite(uac) => uac.errors(),
            ClientTsx::Invite(uac_inv) => uac_inv.errors(),
        }
    }

    /// Requests cancellation of the transaction (INVITE only).
    pub async fn cancel(&self) -> Result<()> {
        match self {
            ClientTsx::NonInvite(_) => Err(Error::MethodNotAllowed("CANCEL".into())),
            ClientTsx::Invite(uac_inv) => uac_inv.cancel().await,
        }
    }

    /// Tears the transaction down without waiting for timers.
    pub fn terminate(&self) {
        match self {
            ClientTsx::NonInvite(uac) => uac.on_terminated(),
            ClientTsx::Invite(uac_inv) => uac_inv.on_terminated(),
        }
    }

    pub(crate) fn key(&self) -> &TsxKey {
        match self {
            ClientTsx::NonInvite(uac) => uac.key(),
            ClientTsx::Invite(uac_inv) => uac_inv.key(),
        }
    }
}

#[derive(Default)]
/// Represents the transaction layer of the SIP protocol.
///
/// This type holds all server and client transactions created
/// by the TU (Transaction User).
pub struct TransactionLayer {
    client_transactions: Mutex<HashMap<TsxKey, ClientTsx>>,
    server_transactions: Mutex<HashMap<TsxKey, ServerTsx>>,
}

impl TransactionLayer {
    /// Remove an server transaction in the collection.
    #[inline]
    pub fn remove_server_tsx(&self, key: &TsxKey) -> Option<ServerTsx> {
        let mut map = self.server_transactions.lock().expect("Lock failed");
        map.remove(key)
    }

    /// Remove an client transaction in the collection.
    #[inline]
    pub fn remove_client_tsx(&self, key: &TsxKey) -> Option<ClientTsx> {
        let mut map = self.client_transactions.lock().expect("Lock failed");
        map.remove(key)
    }

    #[inline]
    pub(crate) fn add_server_tsx_to_map(&self, tsx: ServerTsx) {
        let key = tsx.key().clone();
        let mut map = self.server_transactions.lock().expect("Lock failed");

        map.insert(key, tsx);
    }

    #[inline]
    pub(crate) fn add_client_tsx_to_map(&self, tsx: ClientTsx) {
        let key = tsx.key().clone();
        let mut map = self.client_transactions.lock().expect("Lock failed");

        map.insert(key, tsx);
    }

    pub(crate) fn find_server_tsx(&self, key: &TsxKey) -> Option<ServerTsx> {
        self.server_transactions
            .lock()
            .expect("Lock failed")
            .get(key)
            .cloned()
    }

    pub(crate) fn find_client_tsx(&self, key: &TsxKey) -> Option<ClientTsx> {
        self.client_transactions
            .lock()
            .expect("Lock failed")
            .get(key)
            .cloned()
    }

    /// Snapshots the keys of every live transaction.
    pub fn keys(&self) -> Vec<TsxKey> {
        let mut keys: Vec<TsxKey> = self
            .client_transactions
            .lock()
            .expect("Lock failed")
            .keys()
            .cloned()
            .collect();
        keys.extend(
            self.server_transactions
                .lock()
                .expect("Lock failed")
                .keys()
                .cloned(),
        );

        keys
    }

    /// Number of live transactions, client plus server.
    pub fn len(&self) -> usize {
        self.client_transactions.lock().expect("Lock failed").len()
            + self.server_transactions.lock().expect("Lock failed").len()
    }

    /// Returns `true` when no transaction is alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminates every live transaction and waits for each to finish.
    pub(crate) async fn shutdown(&self) {
        let clients: Vec<ClientTsx> = {
            let map = self.client_transactions.lock().expect("Lock failed");
            map.values().cloned().collect()
        };
        let servers: Vec<ServerTsx> = {
            let map = self.server_transactions.lock().expect("Lock failed");
            map.values().cloned().collect()
        };

        let mut waits = Vec::new();
        for tsx in clients {
            let mut done = match &tsx {
                ClientTsx::NonInvite(uac) => uac.done(),
                ClientTsx::Invite(uac_inv) => uac_inv.done(),
            };
            tsx.terminate();
            waits.push(tokio::spawn(async move {
                let _ = done.wait_for(|done| *done).await;
            }));
        }
        for tsx in servers {
            let (inner, mut done) = match &tsx {
                ServerTsx::NonInvite(uas) => ((**uas).clone(), uas.done()),
                ServerTsx::Invite(uas_inv) => ((**uas_inv).clone(), uas_inv.done()),
            };
            inner.on_terminated();
            waits.push(tokio::spawn(async move {
                let _ = done.wait_for(|done| *done).await;
            }));
        }

        for wait in waits {
            let _ = wait.await;
        }
    }

    pub(crate) async fn handle_response(&self, response: &mut IncomingResponse) -> Result<bool> {
        let hdrs = &response.request_headers;
        let key = TsxKey::create_client(
            &hdrs.via,
            &hdrs.cseq,
            &hdrs.from,
            &hdrs.to,
            &hdrs.call_id,
            &crate::message::Uri::default(),
        );
        let key = match key {
            Ok(key) => key,
            Err(_) => return Ok(false),
        };

        let client_tsx = {
            match self.find_client_tsx(&key) {
                Some(tsx) => tsx,
                None => return Ok(false),
            }
        };
        response.transaction = Some(client_tsx.clone());

        let handled = match client_tsx {
            ClientTsx::NonInvite(tsx) => tsx.receive(response).await?,
            ClientTsx::Invite(tsx_inv) => tsx_inv.receive(response).await?,
        };

        Ok(handled)
    }

    pub(crate) async fn handle_request(&self, request: &mut IncomingRequest) -> Result<bool> {
        let hdrs = &request.request_headers;
        let key = TsxKey::create_server(
            &hdrs.via,
            &hdrs.cseq,
            &hdrs.from,
            &hdrs.to,
            &hdrs.call_id,
            &request.request.req_line.uri,
        );
        let key = match key {
            Ok(key) => key,
            Err(_) => return Ok(false),
        };

        let server_tsx = {
            match self.find_server_tsx(&key) {
                Some(tsx) => tsx,
                None => return Ok(false),
            }
        };
        request.set_tsx(server_tsx.clone());

        server_tsx.receive_request(request).await
    }
}

/// Builds a new RFC 3261 branch parameter.
pub(crate) fn generate_branch() -> String {
    use crate::headers::BRANCH_MAGIC_COOKIE;
    use rand::distr::{Alphanumeric, SampleString};

    let suffix = Alphanumeric.sample_string(&mut rand::rng(), 24);

    format!("{}{}", BRANCH_MAGIC_COOKIE, suffix)
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::headers::Header;

    use std::time::SystemTime;

    use crate::{
        headers::{CSeq, CallId, FromTo, Headers, Via},
        message::{Request, RequestLine, Response, SipMethod, StatusLine, Uri},
        transport::{udp::mock::MockUdpTransport, OutgoingAddr, Packet, Payload, RequestHeaders},
    };

    pub fn response(c: StatusCode) -> OutgoingResponse {
        let from = FromTo::parse("<sip:alice@127.0.0.1:5060>;tag=a6c85cf").unwrap();
        let to = FromTo::parse("<sip:bob@127.0.0.1:5060>").unwrap();
        let via = Via::parse("SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK3060200;received=127.0.0.1")
            .unwrap();

        let cseq = Header::CSeq(CSeq::new(1, SipMethod::Options));
        let callid = Header::CallId(CallId::new("bs9ki9iqbee8k5kal8mpqb"));
        let mut headers = Headers::new();

        headers.push(Header::Via(via));
        headers.push(Header::From(from));
        headers.push(Header::To(to));
        headers.push(callid);
        headers.push(cseq);

        let transport: Arc<dyn Transport> = Arc::new(MockUdpTransport);
        let addr = OutgoingAddr::Addr {
            addr: transport.addr(),
            transport,
        };
        let mut response = Response::new(StatusLine {
            code: c,
            reason: c.reason().into(),
        });

        response.headers = headers;

        OutgoingResponse {
            response,
            addr,
            buf: None,
            recv_time: Some(SystemTime::now()),
        }
    }

    pub fn request(m: SipMethod) -> IncomingRequest {
        let from = FromTo::parse("<sip:alice@127.0.0.1:5060>;tag=a6c85cf").unwrap();
        let to = FromTo::parse("<sip:bob@127.0.0.1:5060>").unwrap();
        let via = Via::parse("SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK3060200;received=127.0.0.1")
            .unwrap();
        let uri = Uri::new("sip:bob@127.0.0.1:5060");
        let cseq = CSeq::new(1, m.clone());
        let call_id = CallId::new("bs9ki9iqbee8k5kal8mpqb");
        let transport: Arc<dyn Transport> = Arc::new(MockUdpTransport);
        let packet = Packet {
            payload: Payload::new(bytes::Bytes::new()),
            addr: transport.addr(),
            time: SystemTime::now(),
        };

        let req_line = RequestLine { method: m, uri };
        let req = Request {
            req_line,
            headers: Headers::default(),
            body: None,
        };

        IncomingRequest {
            request: req,
            transport,
            packet,
            transaction: None,
            request_headers: RequestHeaders {
                to,
                cseq,
                via,
                call_id,
                from,
            },
        }
    }

    pub fn outgoing_request(m: SipMethod) -> OutgoingRequest {
        let from = FromTo::parse("<sip:alice@127.0.0.1:5060>;tag=a6c85cf").unwrap();
        let to = FromTo::parse("<sip:bob@127.0.0.1:5060>").unwrap();
        let via = Via::parse("SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK3060200").unwrap();
        let uri = Uri::new("sip:bob@127.0.0.1:5060");
        let cseq = CSeq::new(1, m.clone());
        let call_id = CallId::new("bs9ki9iqbee8k5kal8mpqb");
        let transport: Arc<dyn Transport> = Arc::new(MockUdpTransport);

        let mut headers = Headers::with_capacity(5);

        headers.push(Header::Via(via));
        headers.push(Header::From(from));
        headers.push(Header::To(to));
        headers.push(Header::CSeq(cseq));
        headers.push(Header::CallId(call_id));

        let req_line = RequestLine { method: m, uri };
        let req = Request {
            req_line,
            headers,
            body: None,
        };

        OutgoingRequest {
            msg: req,
            addr: transport.addr(),
            buf: None,
            transport,
        }
    }

    pub fn incoming_response(c: StatusCode) -> IncomingResponse {
        incoming_response_for(c, SipMethod::Options)
    }

    pub fn incoming_response_for(c: StatusCode, method: SipMethod) -> IncomingResponse {
        let from = FromTo::parse("<sip:alice@127.0.0.1:5060>;tag=a6c85cf").unwrap();
        let to = FromTo::parse("<sip:bob@127.0.0.1:5060>;tag=b192a").unwrap();
        let via = Via::parse("SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK3060200;received=127.0.0.1")
            .unwrap();

        let cseq = CSeq::new(1, method);
        let call_id = CallId::new("bs9ki9iqbee8k5kal8mpqb");
        let mut headers = Headers::new();

        headers.push(Header::Via(via.clone()));
        headers.push(Header::From(from.clone()));
        headers.push(Header::To(to.clone()));
        headers.push(Header::CallId(call_id.clone()));
        headers.push(Header::CSeq(cseq.clone()));

        let transport: Arc<dyn Transport> = Arc::new(MockUdpTransport);
        let addr = transport.addr();
        let mut response = Response::new(StatusLine {
            code: c,
            reason: c.reason().into(),
        });
        response.headers = headers;

        IncomingResponse {
            response,
            transport,
            packet: Packet {
                payload: Payload::new(bytes::Bytes::new()),
                addr,
                time: SystemTime::now(),
            },
            transaction: None,
            request_headers: RequestHeaders {
                to,
                via,
                cseq,
                call_id,
                from,
            },
        }
    }

    pub async fn default_endpoint() -> Endpoint {
        crate::endpoint::Builder::new()
            .with_transaction_layer(TransactionLayer::default())
            .build()
            .await
    }
}

#[cfg(test)]
mod tests {
    use crate::{endpoint, message::SipMethod};

    use super::*;

    #[tokio::test]
    async fn test_non_invite_server_tsx() {
        let mut req = mock::request(SipMethod::Register);

        let endpoint = endpoint::Builder::new()
            .with_transaction_layer(TransactionLayer::default())
            .build()
            .await;

        endpoint.new_uas_tsx(&mut req).unwrap();

        let transactions = endpoint.get_tsx_layer();
        let key = req.tsx_key().unwrap().clone();
        let tsx = transactions.find_server_tsx(&key);

        assert!(matches!(tsx.as_ref(), Some(ServerTsx::NonInvite(_))));
        let tsx = match tsx.unwrap() {
            ServerTsx::NonInvite(tsx) => tsx,
            _ => unreachable!(),
        };

        tsx.on_terminated();
        let tsx = transactions.find_server_tsx(&key);

        assert!(tsx.is_none());
    }

    #[tokio::test]
    async fn test_invite_server_tsx() {
        let mut req = mock::request(SipMethod::Invite);

        let endpoint = endpoint::Builder::new()
            .with_transaction_layer(TransactionLayer::default())
            .build()
            .await;

        endpoint.new_uas_inv_tsx(&mut req).unwrap();

        let transactions = endpoint.get_tsx_layer();
        let key = req.tsx_key().unwrap().clone();

        let tsx = transactions.find_server_tsx(&key);

        assert!(matches!(tsx.as_ref(), Some(ServerTsx::Invite(_))));

        let tsx = match tsx.unwrap() {
            ServerTsx::Invite(tsx) => tsx,
            _ => unreachable!(),
        };

        tsx.on_terminated();

        let tsx = transactions.find_server_tsx(&key);

        assert!(tsx.is_none());
    }

    #[tokio::test]
    async fn test_layer_shutdown_drains() {
        let endpoint = mock::default_endpoint().await;
        let mut req = mock::request(SipMethod::Register);

        endpoint.new_uas_tsx(&mut req).unwrap();

        let layer = endpoint.get_tsx_layer();
        assert_eq!(layer.len(), 1);

        layer.shutdown().await;
        assert!(layer.is_empty());
    }
}
