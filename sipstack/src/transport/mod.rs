#![warn(missing_docs)]
//! SIP Transport Layer.
use std::{
    collections::HashMap,
    io::Write,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
    headers::{CSeq, CallId, FromTo, Header, Headers, Rport, Timestamp, Via},
    message::{Host, HostPort, Request, Response, SipMethod, SipMsg, StatusCode, TransportKind},
    transaction::{key::TsxKey, ClientTsx, ServerTsx},
};

mod decoder;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod ws;

pub(crate) use decoder::StreamingDecoder;

/// The read buffer ceiling for one message.
pub const MAX_MSG_SIZE: usize = 65_535;

/// The assumed path MTU for unreliable transports.
pub const MTU: usize = 1_500;

/// The safe payload ceiling on unreliable transports.
pub const UDP_MAX_PAYLOAD: usize = MTU - 200;

/// This trait represents a abstraction over a SIP transport implementation.
#[async_trait::async_trait]
pub trait Transport: Sync + Send + 'static {
    /// Sends a buffer to the specified remote socket address.
    ///
    /// Returns the number of bytes sent or an I/O error.
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize>;

    /// Returns the transport kind (e.g., UDP, TCP, TLS).
    fn tp_kind(&self) -> TransportKind;

    /// Returns the local socket address bound to this transport.
    fn addr(&self) -> SocketAddr;

    /// Returns the remote socket address for connection oriented
    /// transports.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Checks if the provided address belongs to the same IP address family
    /// (IPv4 vs IPv6) as the local socket address.
    fn is_same_af(&self, addr: &SocketAddr) -> bool {
        let our_addr = self.addr();

        (addr.is_ipv4() && our_addr.is_ipv4()) || (addr.is_ipv6() && our_addr.is_ipv6())
    }

    /// Returns the local transport name.
    fn local_name(&self) -> std::borrow::Cow<'_, str>;

    /// Returns `true` if the transport is reliable (e.g., TCP or TLS).
    fn reliable(&self) -> bool {
        self.tp_kind().reliable()
    }

    /// Returns `true` if the transport is secure (e.g., TLS).
    fn secure(&self) -> bool {
        self.tp_kind().secure()
    }

    /// Returns `true` if messages arrive on a byte stream.
    fn streamed(&self) -> bool {
        self.tp_kind().streamed()
    }

    /// Returns the key that identifies this transport by its local
    /// address.
    fn key(&self) -> TransportKey {
        TransportKey::new(self.addr(), self.tp_kind())
    }

    /// Returns the key that identifies this transport by its remote
    /// address, when it has one.
    fn remote_key(&self) -> Option<TransportKey> {
        self.remote_addr()
            .map(|addr| TransportKey::new(addr, self.tp_kind()))
    }

    /// Local port to advertise in the sent-by of outbound Via hops.
    ///
    /// Connections accepted from a listener inherit the listener port so
    /// peers answer to the advertised socket instead of the ephemeral one.
    fn sent_by_port(&self) -> u16 {
        self.addr().port()
    }
}

/// This type represents a key used to identify a transport connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransportKey {
    /// The socket address of the transport.
    addr: SocketAddr,
    /// The transport kind (e.g., UDP, TCP, TLS).
    kind: TransportKind,
}

impl TransportKey {
    /// Creates a new `TransportKey`.
    pub fn new(addr: SocketAddr, kind: TransportKind) -> Self {
        TransportKey { addr, kind }
    }
}

/// This trait represents a factory for creating SIP transports.
///
/// Normally, this is used by connection oriented transports like TCP and TLS.
#[async_trait::async_trait]
pub trait Factory: Sync + Send {
    /// Creates a new transport instance connected to `addr`.
    async fn create(&self, addr: SocketAddr) -> Result<Arc<dyn Transport>>;

    /// Returns the transport protocol this factory creates.
    fn protocol(&self) -> TransportKind;
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Direction {
    Outgoing,
    Incoming,
}

/// Represents the raw binary content of a message or data block.
///
/// Commonly used for message bodies, network packets, or media content.
#[derive(Clone)]
pub struct Payload(pub(crate) Bytes);

impl Payload {
    /// Creates a new `Payload`.
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Payload(bytes)
    }

    /// Returns the raw byte buffer of this payload.
    pub fn buf(&self) -> &[u8] {
        &self.0
    }
}

/// This type represents a SIP packet.
#[derive(Clone)]
pub struct Packet {
    /// The packet payload.
    pub payload: Payload,
    /// The address of the sender.
    pub addr: SocketAddr,
    /// The time the packet was received.
    pub time: SystemTime,
}

/// Represents the address of an outbound message.
#[derive(Clone)]
pub enum OutgoingAddr {
    /// The message must be routed through the response-address rules
    /// first.
    HostPort {
        /// The host and port of the address.
        host: HostPort,
        /// The transport protocol used.
        protocol: TransportKind,
    },
    /// SocketAddr address.
    Addr {
        /// The socket address.
        addr: SocketAddr,
        /// The transport to use.
        transport: Arc<dyn Transport>,
    },
}

/// This trait is used to convert a type into a byte buffer.
pub trait ToBytes: Sized {
    /// Converts the type into a byte buffer.
    fn to_bytes(&self) -> Result<Bytes>;
}

fn render(start_line: &dyn std::fmt::Display, headers: &Headers, body: Option<&Bytes>) -> Result<Bytes> {
    let estimated_message_size = if body.is_none() { 800 } else { 1500 };
    let buf = BytesMut::with_capacity(estimated_message_size);

    let mut buf_writer = buf.writer();

    write!(buf_writer, "{}", start_line)?;

    for header in headers.iter() {
        // Content-Length is computed from the body, never echoed.
        if matches!(header, Header::ContentLength(_)) {
            continue;
        }
        write!(buf_writer, "{header}\r\n")?;
    }

    let body_len = body.map(|b| b.len()).unwrap_or(0);
    write!(buf_writer, "Content-Length: {}\r\n", body_len)?;
    write!(buf_writer, "\r\n")?;
    if let Some(body) = body {
        buf_writer.write_all(body)?;
    }

    Ok(buf_writer.into_inner().freeze())
}

/// Renders a request to its wire form.
pub(crate) fn render_request(request: &Request) -> Result<Bytes> {
    render(&request.req_line, &request.headers, request.body.as_ref())
}

/// Renders a response to its wire form.
pub(crate) fn render_response(response: &Response) -> Result<Bytes> {
    render(&response.status_line, &response.headers, response.body.as_ref())
}

/// This type represents an outgoing SIP response.
pub struct OutgoingResponse {
    /// The SIP response message.
    pub response: Response,
    /// The address to send the response to.
    pub addr: OutgoingAddr,
    /// The message raw buffer.
    pub buf: Option<Bytes>,
    /// When the request being answered was read off the wire.
    pub(crate) recv_time: Option<SystemTime>,
}

impl OutgoingResponse {
    /// Returns the message status code.
    pub fn status_code(&self) -> StatusCode {
        self.response.status_line.code
    }

    /// Append headers to the message.
    pub fn append_headers(&mut self, other: impl IntoIterator<Item = Header>) {
        self.response.headers.extend(other);
    }

    /// Returns the message rason text.
    pub fn reason(&self) -> &str {
        &self.response.status_line.reason
    }

    /// Returns `true` if this is a provisional response.
    pub fn is_provisional(&self) -> bool {
        self.response.status_line.code.is_provisional()
    }

    /// Set the message body.
    pub fn set_body(&mut self, body: Bytes) {
        self.response.body = Some(body);
    }

    /// Returns the message headers mutably.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.response.headers
    }

    /// Echoes the request timestamp with the delay this element spent
    /// before answering.
    pub(crate) fn stamp_res_delay(&mut self) {
        let Some(recv_time) = self.recv_time else {
            return;
        };
        let Some(ts) = self.response.headers.timestamp().copied() else {
            return;
        };
        let delay = SystemTime::now()
            .duration_since(recv_time)
            .unwrap_or_default()
            .as_secs_f64();
        self.response.headers.set(Header::Timestamp(Timestamp {
            value: ts.value,
            delay: Some(delay),
        }));
    }
}

impl ToBytes for OutgoingResponse {
    fn to_bytes(&self) -> Result<Bytes> {
        render(
            &self.response.status_line,
            &self.response.headers,
            self.response.body.as_ref(),
        )
    }
}

/// This type represents an outbound SIP request.
pub struct OutgoingRequest {
    /// The SIP request message.
    pub msg: Request,
    /// The addr to send the request to.
    pub addr: SocketAddr,
    /// The message raw buffer.
    pub buf: Option<Bytes>,
    /// The transport to use for sending the request.
    pub transport: Arc<dyn Transport>,
}

impl ToBytes for OutgoingRequest {
    fn to_bytes(&self) -> Result<Bytes> {
        render(&self.msg.req_line, &self.msg.headers, self.msg.body.as_ref())
    }
}

/// The mandatory headers every routable message carries.
#[derive(Clone)]
pub struct RequestHeaders {
    /// The topmost Via header as found in the message.
    pub via: Via,
    /// The From header found in the message.
    pub from: FromTo,
    /// The CSeq header as found in the message.
    pub cseq: CSeq,
    /// The Call-ID header found in the message.
    pub call_id: CallId,
    /// The To header found in the message.
    pub to: FromTo,
}

impl RequestHeaders {
    /// Collects the mandatory headers out of a header list.
    pub fn extract(headers: &Headers) -> Result<Self> {
        let Some(via) = headers.top_via() else {
            return Err(Error::MissingRequiredHeader("Via"));
        };
        let Some(from) = headers.from_hdr() else {
            return Err(Error::MissingRequiredHeader("From"));
        };
        let Some(to) = headers.to_hdr() else {
            return Err(Error::MissingRequiredHeader("To"));
        };
        let Some(call_id) = headers.call_id() else {
            return Err(Error::MissingRequiredHeader("Call-ID"));
        };
        let Some(cseq) = headers.cseq() else {
            return Err(Error::MissingRequiredHeader("CSeq"));
        };

        Ok(RequestHeaders {
            via: via.clone(),
            from: from.clone(),
            to: to.clone(),
            call_id: call_id.clone(),
            cseq: cseq.clone(),
        })
    }
}

/// This type represents an received SIP request.
pub struct IncomingRequest {
    /// The SIP request message.
    pub(crate) request: Request,
    /// The transport used to receive the request.
    pub(crate) transport: Arc<dyn Transport>,
    /// The packet that contains the request.
    pub(crate) packet: Packet,
    /// The server transaction associated with this request, if any.
    pub(crate) transaction: Option<ServerTsx>,
    /// The request headers extracted from the request.
    pub(crate) request_headers: RequestHeaders,
}

impl IncomingRequest {
    /// Returns the topmost `To` header of the request.
    pub fn to(&self) -> &FromTo {
        &self.request_headers.to
    }

    /// Returns the `From` header of the request.
    pub fn from(&self) -> &FromTo {
        &self.request_headers.from
    }

    /// Returns the `Call-ID` header of the request.
    pub fn call_id(&self) -> &CallId {
        &self.request_headers.call_id
    }

    /// Returns the topmost `Via` header of the request.
    pub fn via(&self) -> &Via {
        &self.request_headers.via
    }

    /// Returns the request message.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Returns the transaction key for this request(if any).
    pub fn tsx_key(&self) -> Option<&TsxKey> {
        self.transaction.as_ref().map(|tsx| tsx.key())
    }

    /// Returns the server transaction attached to this request, if any.
    pub fn transaction(&self) -> Option<&ServerTsx> {
        self.transaction.as_ref()
    }

    /// Returns `true` if the message method matches the given `SipMethod`.
    #[inline(always)]
    pub fn is_method(&self, method: &SipMethod) -> bool {
        self.request.method() == method
    }

    /// Returns the message method.
    pub fn method(&self) -> &SipMethod {
        self.request.method()
    }

    /// Gets the source socket address of the packet.
    pub fn addr(&self) -> &SocketAddr {
        &self.packet.addr
    }

    #[inline]
    pub(crate) fn set_tsx(&mut self, tsx: ServerTsx) {
        self.transaction = Some(tsx);
    }
}

/// Represents an received SIP response.
pub struct IncomingResponse {
    /// The SIP response message.
    pub(crate) response: Response,
    /// The transport used to receive the response.
    pub(crate) transport: Arc<dyn Transport>,
    /// The packet that contains the response.
    pub(crate) packet: Packet,
    /// The transaction associated with this response, if any.
    pub(crate) transaction: Option<ClientTsx>,
    /// The request headers extracted from the response.
    pub(crate) request_headers: RequestHeaders,
}

impl IncomingResponse {
    /// Returns the response message.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Returns the response status code.
    pub fn code(&self) -> StatusCode {
        self.response.code()
    }

    /// Returns the topmost `Via` header of the response.
    pub fn via(&self) -> &Via {
        &self.request_headers.via
    }

    /// Gets the source socket address of the packet.
    pub fn addr(&self) -> &SocketAddr {
        &self.packet.addr
    }
}

pub(crate) enum TransportEvent {
    /// A packet was received from the transport layer.
    Packet {
        transport: Arc<dyn Transport>,
        packet: Packet,
    },
    /// A new transport was created.
    Created(Arc<dyn Transport>),
    /// A transport was closed.
    Closed(Arc<dyn Transport>),
    /// A factory was created.
    Factory(Arc<dyn Factory>),
}

pub(crate) type TransportTx = mpsc::Sender<TransportEvent>;
pub(crate) type TransportRx = mpsc::Receiver<TransportEvent>;

impl From<mpsc::error::SendError<TransportEvent>> for Error {
    fn from(_: mpsc::error::SendError<TransportEvent>) -> Self {
        Self::ChannelClosed
    }
}

/// Live connections indexed by `(address, protocol)`.
///
/// One key maps to any number of connections and one connection may be
/// indexed under several keys, typically its local and its remote address.
#[derive(Default)]
pub struct ConnectionPool {
    map: RwLock<HashMap<TransportKey, Vec<Arc<dyn Transport>>>>,
}

impl ConnectionPool {
    /// Indexes `conn` under `key`.
    pub fn add(&self, key: TransportKey, conn: Arc<dyn Transport>) {
        self.map
            .write()
            .expect("Lock poisoned")
            .entry(key)
            .or_default()
            .push(conn);
    }

    /// Removes one occurrence of `conn` under `key`, collapsing the entry
    /// when it was the last one.
    ///
    /// Returns whether an occurrence was removed.
    pub fn del(&self, key: &TransportKey, conn: &Arc<dyn Transport>) -> bool {
        let mut map = self.map.write().expect("Lock poisoned");
        let Some(conns) = map.get_mut(key) else {
            return false;
        };
        let Some(pos) = conns.iter().position(|c| Arc::ptr_eq(c, conn)) else {
            return false;
        };
        conns.remove(pos);
        if conns.is_empty() {
            map.remove(key);
        }

        true
    }

    /// Returns any connection indexed under `key`.
    pub fn get_any(&self, key: &TransportKey) -> Option<Arc<dyn Transport>> {
        self.map
            .read()
            .expect("Lock poisoned")
            .get(key)
            .and_then(|conns| conns.first().cloned())
    }

    /// Snapshots the connections indexed under `key`.
    pub fn iter_key(&self, key: &TransportKey) -> Vec<Arc<dyn Transport>> {
        self.map
            .read()
            .expect("Lock poisoned")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshots every pooled connection.
    pub fn iter_all(&self) -> Vec<Arc<dyn Transport>> {
        self.map
            .read()
            .expect("Lock poisoned")
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Number of keys with at least one connection.
    pub fn len(&self) -> usize {
        self.map.read().expect("Lock poisoned").len()
    }

    /// Returns `true` if no connection is pooled.
    pub fn is_empty(&self) -> bool {
        self.map.read().expect("Lock poisoned").is_empty()
    }

    fn clear(&self) {
        self.map.write().expect("Lock poisoned").clear();
    }
}

#[derive(Default)]
struct RttEwma {
    ewma_ms: f64,
    count: u64,
}

/// Counters kept for one transport protocol.
#[derive(Default)]
pub struct TransportStats {
    listeners: AtomicUsize,
    connections: AtomicUsize,
    in_requests: AtomicU64,
    in_requests_rejected: AtomicU64,
    in_responses: AtomicU64,
    in_responses_rejected: AtomicU64,
    out_requests: AtomicU64,
    out_requests_rejected: AtomicU64,
    out_responses: AtomicU64,
    out_responses_rejected: AtomicU64,
    rtt: Mutex<RttEwma>,
}

const RTT_EWMA_WEIGHT: f64 = 0.125;

impl TransportStats {
    fn record_rtt(&self, rtt: Duration) {
        let mut state = self.rtt.lock().expect("Lock poisoned");
        let sample = rtt.as_secs_f64() * 1_000.0;
        state.ewma_ms = if state.count == 0 {
            sample
        } else {
            state.ewma_ms + RTT_EWMA_WEIGHT * (sample - state.ewma_ms)
        };
        state.count += 1;
    }

    fn snapshot(&self) -> StatsSnapshot {
        let rtt = self.rtt.lock().expect("Lock poisoned");

        StatsSnapshot {
            listeners: self.listeners.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            in_requests: self.in_requests.load(Ordering::Relaxed),
            in_requests_rejected: self.in_requests_rejected.load(Ordering::Relaxed),
            in_responses: self.in_responses.load(Ordering::Relaxed),
            in_responses_rejected: self.in_responses_rejected.load(Ordering::Relaxed),
            out_requests: self.out_requests.load(Ordering::Relaxed),
            out_requests_rejected: self.out_requests_rejected.load(Ordering::Relaxed),
            out_responses: self.out_responses.load(Ordering::Relaxed),
            out_responses_rejected: self.out_responses_rejected.load(Ordering::Relaxed),
            rtt_ewma_ms: rtt.ewma_ms,
            rtt_count: rtt.count,
        }
    }
}

/// A point-in-time copy of one protocol's counters.
#[derive(Debug, Clone, Default, PartialEq)]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub listeners: usize,
    pub connections: usize,
    pub in_requests: u64,
    pub in_requests_rejected: u64,
    pub in_responses: u64,
    pub in_responses_rejected: u64,
    pub out_requests: u64,
    pub out_requests_rejected: u64,
    pub out_responses: u64,
    pub out_responses_rejected: u64,
    /// Exponentially weighted moving average of the message round trip,
    /// measured from the Timestamp header echo.
    pub rtt_ewma_ms: f64,
    pub rtt_count: u64,
}

fn kind_index(kind: TransportKind) -> usize {
    match kind {
        TransportKind::Udp => 0,
        TransportKind::Tcp => 1,
        TransportKind::Tls => 2,
        TransportKind::Ws => 3,
        TransportKind::Wss => 4,
        TransportKind::Unknown => 5,
    }
}

/// Transport Layer for SIP messages.
pub struct TransportLayer {
    /// Live connections indexed by local and remote address.
    pool: ConnectionPool,
    /// A list of transport factories.
    factorys: Mutex<Vec<Arc<dyn Factory>>>,
    /// The transport sender used to send events to the transport layer.
    transport_tx: TransportTx,
    /// A receiver for transport events.
    transport_rx: Mutex<Option<TransportRx>>,
    /// Per protocol counters.
    stats: [TransportStats; 6],
    /// Set once shutdown begins; refuses new work.
    closed: AtomicBool,
    /// Read loop and accept loop tasks, joined on shutdown.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for TransportLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportLayer {
    pub(crate) fn new() -> Self {
        let (transport_tx, transport_rx) = mpsc::channel(1_000);
        let transport_rx = Mutex::new(Some(transport_rx));

        Self {
            transport_tx,
            transport_rx,
            pool: Default::default(),
            factorys: Default::default(),
            stats: Default::default(),
            closed: AtomicBool::new(false),
            tasks: Default::default(),
        }
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Returns the counters for one protocol.
    pub fn stats(&self, kind: TransportKind) -> StatsSnapshot {
        self.stats[kind_index(kind)].snapshot()
    }

    pub(crate) fn stats_of(&self, kind: TransportKind) -> &TransportStats {
        &self.stats[kind_index(kind)]
    }

    pub(crate) fn count_listener(&self, kind: TransportKind) {
        self.stats_of(kind).listeners.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn track_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().expect("Lock poisoned").push(task);
    }

    pub(crate) fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.pool.add(transport.key(), transport.clone());
        if let Some(remote_key) = transport.remote_key() {
            self.pool.add(remote_key, transport.clone());
        }
        self.stats_of(transport.tp_kind())
            .connections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn remove_transport(&self, transport: &Arc<dyn Transport>) {
        let mut removed = self.pool.del(&transport.key(), transport);
        if let Some(remote_key) = transport.remote_key() {
            removed |= self.pool.del(&remote_key, transport);
        }
        if removed {
            self.stats_of(transport.tp_kind())
                .connections
                .fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn add_factory(&self, factory: Arc<dyn Factory>) {
        self.factorys.lock().expect("Lock poisoned").push(factory);
    }

    pub(crate) fn sender(&self) -> &TransportTx {
        &self.transport_tx
    }

    /// Finds a suitable transport for the given destination address and transport type.
    pub fn find(&self, dst: SocketAddr, transport: TransportKind) -> Option<Arc<dyn Transport>> {
        log::debug!("Finding suitable transport={} for={}", transport, dst);

        // Find by remote addr.
        let key = TransportKey::new(dst, transport);
        if let Some(conn) = self.pool.get_any(&key) {
            return Some(conn);
        }

        // Find by transport protocol and address family.
        self.pool
            .iter_all()
            .into_iter()
            .filter(|handle| handle.tp_kind() == transport && handle.is_same_af(&dst))
            .min_by(|a, b| Arc::strong_count(a).cmp(&Arc::strong_count(b)))
    }

    /// Finds a pooled transport or dials a new one through the protocol's
    /// factory.
    pub async fn find_or_dial(
        &self,
        dst: SocketAddr,
        transport: TransportKind,
    ) -> Result<Arc<dyn Transport>> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        if let Some(conn) = self.find(dst, transport) {
            return Ok(conn);
        }

        // The dial must not run under the factory list lock.
        let factory = {
            let factorys = self.factorys.lock().expect("Lock poisoned");
            factorys.iter().find(|f| f.protocol() == transport).cloned()
        };
        let Some(factory) = factory else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No transport available for {} {}", transport, dst),
            )));
        };

        let conn = factory.create(dst).await?;

        self.add_transport(conn.clone());

        Ok(conn)
    }

    /// Sends `buf` on `transport`, enforcing the size ceiling for the
    /// protocol and counting the outcome.
    pub(crate) async fn send_buffer(
        &self,
        transport: &Arc<dyn Transport>,
        buf: &[u8],
        addr: &SocketAddr,
        is_request: bool,
    ) -> Result<usize> {
        let stats = self.stats_of(transport.tp_kind());
        let rejected = if is_request {
            &stats.out_requests_rejected
        } else {
            &stats.out_responses_rejected
        };

        if self.is_closed() {
            rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::TransportClosed);
        }

        let limit = if transport.reliable() {
            MAX_MSG_SIZE
        } else {
            UDP_MAX_PAYLOAD
        };
        if buf.len() > limit {
            rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::MessageTooLarge {
                size: buf.len(),
                limit,
            });
        }

        match transport.send(buf, addr).await {
            Ok(sent) => {
                if is_request {
                    stats.out_requests.fetch_add(1, Ordering::Relaxed);
                } else {
                    stats.out_responses.fetch_add(1, Ordering::Relaxed);
                }
                Ok(sent)
            }
            Err(err) => {
                rejected.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Refuses new work and tears every connection and loop down.
    pub(crate) fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().expect("Lock poisoned").drain(..) {
            task.abort();
        }
        self.pool.clear();
    }

    pub(crate) async fn handle_events(&self, endpoint: &Endpoint) -> Result<()> {
        let mut rx = self
            .transport_rx
            .lock()
            .expect("Lock poisoned")
            .take()
            .ok_or(Error::InvalidArgument("Transport layer already running"))?;

        // Loop to receive packets from the transports.
        while let Some(evt) = rx.recv().await {
            if self.is_closed() {
                break;
            }
            match evt {
                TransportEvent::Packet { transport, packet } => {
                    tokio::spawn(Self::on_received_packet(transport, packet, endpoint.clone()));
                }
                TransportEvent::Created(transport) => {
                    self.add_transport(transport);
                }
                TransportEvent::Closed(transport) => {
                    self.remove_transport(&transport);
                }
                TransportEvent::Factory(factory) => {
                    self.add_factory(factory);
                }
            }
        }

        Ok(())
    }

    async fn on_received_packet(
        transport: Arc<dyn Transport>,
        packet: Packet,
        endpoint: Endpoint,
    ) -> Result<()> {
        let payload = packet.payload.clone();
        let bytes = payload.buf();
        let stats = endpoint.transport().stats_of(transport.tp_kind());

        // Keep-Alive Request packet.
        if bytes == b"\r\n\r\n" {
            transport.send(b"\r\n", &packet.addr).await?;
            return Ok(());
        } else if bytes == b"\r\n" {
            // Keep-Alive Response packet.
            // do nothing
            return Ok(());
        }

        // Parse the packet into an sip message.
        let parsed = match endpoint.parser().parse_packet(bytes) {
            Ok(parsed) => parsed,
            Err(err) => {
                stats.in_requests_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Ignoring {} bytes packet from {} {} : {}\n{}-- end of packet.",
                    bytes.len(),
                    transport.tp_kind(),
                    packet.addr,
                    err,
                    String::from_utf8_lossy(bytes)
                );

                return Err(err);
            }
        };

        let is_request = parsed.msg.is_request();
        let rejected = if is_request {
            &stats.in_requests_rejected
        } else {
            &stats.in_responses_rejected
        };

        // Check for mandatory headers. Messages that lack them are not
        // routable and vanish without a trace.
        let mut request_headers = match RequestHeaders::extract(parsed.msg.headers()) {
            Ok(headers) => headers,
            Err(err) => {
                rejected.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropping unroutable packet from {}: {}", packet.addr, err);
                return Err(err);
            }
        };

        // 4. Server Behavior(https://datatracker.ietf.org/doc/html/rfc3581#section-4)
        // The server MUST insert a "received" parameter containing
        // the source IP address that the request came from even if
        // it is identical to the value of the "sent-by" component.
        if is_request {
            request_headers.via.set_received(packet.addr.ip());
            if request_headers.via.rport() == Rport::Requested {
                request_headers.via.set_rport(packet.addr.port());
            }
        }

        match parsed.msg {
            SipMsg::Request(request) => {
                let mut request = Some(IncomingRequest {
                    request,
                    transport,
                    packet,
                    transaction: None,
                    request_headers,
                });

                // A streamed transport cannot frame a request without
                // Content-Length; it is rejected and the stream already
                // drained to the next boundary.
                let missing_length = {
                    let req = request.as_ref().expect("Request just built");
                    req.transport.streamed() && req.request.headers.content_length().is_none()
                };

                if let Some(err) = parsed.error.filter(|_| !missing_length) {
                    rejected.fetch_add(1, Ordering::Relaxed);
                    let request = request.take().expect("Request just built");
                    let code = if bytes.len() > MAX_MSG_SIZE {
                        StatusCode::MESSAGE_TOO_LARGE
                    } else {
                        StatusCode::BAD_REQUEST
                    };
                    log::debug!("Rejecting request from {} with {}: {}", request.addr(), code.into_i32(), err);
                    return endpoint.respond(&request, code.into_i32(), code.reason()).await;
                }

                if missing_length {
                    rejected.fetch_add(1, Ordering::Relaxed);
                    let request = request.take().expect("Request just built");
                    log::debug!("Rejecting unframed stream request from {}", request.addr());
                    let code = StatusCode::BAD_REQUEST;
                    return endpoint.respond(&request, code.into_i32(), code.reason()).await;
                }

                stats.in_requests.fetch_add(1, Ordering::Relaxed);
                endpoint.process_request(&mut request).await?;
            }
            SipMsg::Response(response) => {
                if let Some(err) = parsed.error {
                    rejected.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Dropping mangled response from {}: {}", packet.addr, err);
                    return Ok(());
                }

                stats.in_responses.fetch_add(1, Ordering::Relaxed);

                // Round trip measured from the Timestamp echo.
                if let Some(ts) = response.headers.timestamp() {
                    if let Some(delay) = ts.delay {
                        let sent = UNIX_EPOCH + Duration::from_secs_f64(ts.value.max(0.0));
                        if let Ok(elapsed) = packet.time.duration_since(sent) {
                            let rtt = elapsed.saturating_sub(Duration::from_secs_f64(delay.max(0.0)));
                            stats.record_rtt(rtt);
                        }
                    }
                }

                let mut response = Some(IncomingResponse {
                    response,
                    transport,
                    packet,
                    transaction: None,
                    request_headers,
                });
                endpoint.process_response(&mut response).await?;
            }
        }

        Ok(())
    }
}

/// Watches a connection for idleness; every read or write postpones the
/// deadline.
pub(crate) struct IdleWatch {
    deadline: Mutex<Instant>,
    ttl: Duration,
}

impl IdleWatch {
    pub(crate) fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            deadline: Mutex::new(Instant::now() + ttl),
            ttl,
        })
    }

    pub(crate) fn touch(&self) {
        *self.deadline.lock().expect("Lock poisoned") = Instant::now() + self.ttl;
    }

    /// Resolves once the deadline passes without being postponed.
    pub(crate) async fn expired(&self) {
        loop {
            let deadline = *self.deadline.lock().expect("Lock poisoned");
            tokio::time::sleep_until(deadline).await;
            if *self.deadline.lock().expect("Lock poisoned") <= Instant::now() {
                return;
            }
        }
    }
}

#[async_trait::async_trait]
/// A trait to start a new transport.
///
/// Returns the handle of the listen loop so the layer can join it on
/// shutdown.
pub(crate) trait TransportStartup: Sync + Send {
    async fn start(&self, tx: TransportTx) -> Result<JoinHandle<()>>;
}

/// Builds the `_sip._udp.<host>` style SRV name for a lookup.
pub(crate) fn srv_name(kind: TransportKind, host: &Host) -> String {
    let service = if kind.secure() { "sips" } else { "sip" };

    format!("_{}._{}.{}", service, kind.srv_proto(), host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::udp::mock::MockUdpTransport;

    #[test]
    fn test_pool_add_del_collapses() {
        let pool = ConnectionPool::default();
        let conn: Arc<dyn Transport> = Arc::new(MockUdpTransport);
        let key = conn.key();

        pool.add(key, conn.clone());
        pool.add(key, conn.clone());
        assert_eq!(pool.iter_key(&key).len(), 2);

        // One del removes exactly one occurrence.
        assert!(pool.del(&key, &conn));
        assert_eq!(pool.iter_key(&key).len(), 1);

        assert!(pool.del(&key, &conn));
        assert!(pool.get_any(&key).is_none());
        assert!(pool.is_empty());

        assert!(!pool.del(&key, &conn));
    }

    #[test]
    fn test_pool_multiple_keys() {
        let pool = ConnectionPool::default();
        let conn: Arc<dyn Transport> = Arc::new(MockUdpTransport);
        let local = conn.key();
        let remote = TransportKey::new("10.0.0.9:5060".parse().unwrap(), TransportKind::Udp);

        pool.add(local, conn.clone());
        pool.add(remote, conn.clone());

        assert!(pool.get_any(&local).is_some());
        assert!(pool.get_any(&remote).is_some());
        assert_eq!(pool.iter_all().len(), 2);

        pool.del(&remote, &conn);
        assert!(pool.get_any(&remote).is_none());
        assert!(pool.get_any(&local).is_some());
    }

    #[test]
    fn test_layer_find() {
        let layer = TransportLayer::default();
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();

        layer.add_transport(Arc::new(MockUdpTransport));

        assert!(layer.find(addr, TransportKind::Udp).is_some());
        assert!(layer.find(addr, TransportKind::Tcp).is_none());
        assert_eq!(layer.stats(TransportKind::Udp).connections, 1);
    }

    #[test]
    fn test_layer_remove() {
        let layer = TransportLayer::default();
        let conn: Arc<dyn Transport> = Arc::new(MockUdpTransport);
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();

        layer.add_transport(conn.clone());
        assert!(layer.find(addr, TransportKind::Udp).is_some());

        layer.remove_transport(&conn);
        assert!(layer.find(addr, TransportKind::Udp).is_none());
        assert_eq!(layer.stats(TransportKind::Udp).connections, 0);
    }

    #[test]
    fn test_render_computes_content_length() {
        let parsed = crate::parser::Parser
            .parse_sip_msg(
                b"MESSAGE sip:bob@h SIP/2.0\r\n\
                Via: SIP/2.0/UDP h:5060;branch=z9hG4bKr\r\n\
                From: <sip:a@h>;tag=1\r\nTo: <sip:b@h>\r\n\
                Call-ID: 9@h\r\nCSeq: 1 MESSAGE\r\n\
                Content-Length: 999\r\n\r\nhello",
            )
            .unwrap();
        let SipMsg::Request(request) = parsed.msg else {
            unreachable!();
        };

        let rendered = render_request(&request).unwrap();
        let text = String::from_utf8(rendered.to_vec()).unwrap();

        // The stale Content-Length is replaced by the real body length.
        assert!(text.contains("Content-Length: 5\r\n"), "got: {text}");
        assert_eq!(text.matches("Content-Length").count(), 1);
        assert!(text.ends_with("\r\n\r\nhello"), "got: {text}");
    }

    #[tokio::test]
    async fn test_send_buffer_rejects_oversize_datagram() {
        let layer = TransportLayer::default();
        let conn: Arc<dyn Transport> = Arc::new(MockUdpTransport);
        let addr = conn.addr();

        let buf = vec![b'x'; UDP_MAX_PAYLOAD + 1];
        let err = layer.send_buffer(&conn, &buf, &addr, false).await.unwrap_err();

        assert!(matches!(err, Error::MessageTooLarge { .. }));
        assert_eq!(layer.stats(TransportKind::Udp).out_responses_rejected, 1);
    }

    #[test]
    fn test_rtt_ewma() {
        let stats = TransportStats::default();

        stats.record_rtt(Duration::from_millis(100));
        assert_eq!(stats.snapshot().rtt_ewma_ms, 100.0);

        stats.record_rtt(Duration::from_millis(200));
        let snap = stats.snapshot();
        assert_eq!(snap.rtt_count, 2);
        assert!(snap.rtt_ewma_ms > 100.0 && snap.rtt_ewma_ms < 200.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_watch() {
        let watch = IdleWatch::new(Duration::from_secs(5));

        let expired = {
            let watch = watch.clone();
            tokio::spawn(async move { watch.expired().await })
        };

        tokio::time::sleep(Duration::from_secs(3)).await;
        watch.touch();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!expired.is_finished());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(expired.is_finished());
    }
}
