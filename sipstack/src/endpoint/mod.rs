#![deny(missing_docs)]
//! SIP Endpoint
//!

pub mod builder;

mod resolver;

pub use builder::Builder;

use crate::endpoint::resolver::Resolver;
use crate::headers::{Header, Timestamp, Via};
use crate::message::{Host, HostPort, Request, Response, SipMethod, StatusLine, TransportKind};
use crate::parser::SipParser;
use crate::transaction::{
    ClientTransaction, ClientTsx, InvClientTransaction, InvServerTransaction, ServerTransaction,
    TimingConfig, TransactionLayer,
};
use crate::transport::{
    IncomingRequest, IncomingResponse, OutgoingAddr, OutgoingRequest, OutgoingResponse,
    RequestHeaders, StatsSnapshot, ToBytes, Transport, TransportLayer,
};
use crate::SipService;
use crate::{headers::Headers, Error, Result};

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::{io, sync::Arc};

/// Override hook building the sent-by of outbound Via hops from the
/// configured host and the sending connection's advertised port.
pub type SentByBuild = Box<dyn Fn(&str, u16) -> HostPort + Send + Sync>;

pub(crate) struct Inner {
    /// The transport layer for the endpoint.
    pub(crate) transport: TransportLayer,
    /// The transaction layer for the endpoint.
    pub(crate) transaction: Option<TransactionLayer>,
    /// The name of the endpoint.
    pub(crate) name: String,
    /// Host placed in the sent-by of outbound Via hops.
    pub(crate) sent_by_host: String,
    /// Optional override for sent-by construction.
    pub(crate) sent_by_build: Option<SentByBuild>,
    /// The resolver for DNS lookups.
    pub(crate) resolver: Resolver,
    /// The message parser.
    pub(crate) parser: Arc<dyn SipParser>,
    /// The timing constants handed to every transaction.
    pub(crate) timing: TimingConfig,
    /// The list of services registered.
    pub(crate) services: Box<[Box<dyn SipService>]>,
}

#[derive(Clone)]
/// The SIP endpoint.
///
/// An endpoint is a logical entity that can send and receive SIP messages,
/// manage transactions, and interact with various SIP services. The endpoint is
/// responsible for handling incoming requests and responses, as well as sending
/// outgoing messages.
pub struct Endpoint(pub(crate) Arc<Inner>);

impl Endpoint {
    /// Returns a builder to create an `Endpoint`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use sipstack::*;
    /// # async fn build() {
    /// let endpoint = endpoint::Builder::new()
    ///     .with_name("My Endpoint")
    ///     .build()
    ///     .await;
    /// # }
    /// ```
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Run with timeout
    pub async fn run_with_timeout(self, timeout: Duration) -> Result<()> {
        let _ = tokio::time::timeout(timeout, self.receive_message()).await;

        Ok(())
    }

    /// Runs the endpoint by processing messages from transport layer.
    ///
    /// This method spawns a new Tokio task that will run indefinitely,
    /// processing incoming SIP messages.
    pub async fn run(self) -> Result<()> {
        tokio::spawn(Box::pin(self.receive_message()))
            .await
            .map_err(|e| io::Error::other(format!("Task join error: {}", e)))??;

        Ok(())
    }

    async fn receive_message(self) -> Result<()> {
        self.0.transport.handle_events(&self).await
    }

    /// Get the endpoint name.
    pub fn get_name(&self) -> &String {
        &self.0.name
    }

    /// Refuses new work, terminates every transaction and closes every
    /// listener and connection.
    pub async fn shutdown(&self) {
        if let Some(transaction) = &self.0.transaction {
            transaction.shutdown().await;
        }
        self.0.transport.shutdown();
    }

    /// Returns the counters for one transport protocol.
    pub fn stats(&self, kind: TransportKind) -> StatsSnapshot {
        self.0.transport.stats(kind)
    }

    /// Creates a new User Agent Server (UAS) transaction.
    ///
    /// This method initializes an [`ServerTransaction`] instance, which represents
    /// the server transaction for handling incoming SIP requests that
    /// are not `INVITE` requests.
    pub fn new_uas_tsx(&self, request: &mut IncomingRequest) -> Result<ServerTransaction> {
        ServerTransaction::new(self, request)
    }

    /// Creates a new User Agent Server (UAS) Invite transaction.
    ///
    /// This method initializes an [`InvServerTransaction`] instance, which represents
    /// the server transaction for handling an incoming `INVITE` request.
    pub fn new_uas_inv_tsx(&self, request: &mut IncomingRequest) -> Result<InvServerTransaction> {
        InvServerTransaction::new(self, request)
    }

    /// Sends `request` through a client transaction towards `addr`.
    ///
    /// The topmost Via must be present; its sent-by, transport token and
    /// branch are filled in here. The returned handle delivers responses
    /// and errors and accepts `cancel()` for INVITE.
    pub async fn send_request(
        &self,
        request: Request,
        addr: SocketAddr,
        kind: TransportKind,
    ) -> Result<ClientTsx> {
        if matches!(request.method(), SipMethod::Ack) {
            // The ACK for a 2xx lives outside any transaction.
            return Err(Error::MethodNotAllowed("ACK".into()));
        }

        let mut outgoing = self.prepare_outgoing(request, addr, kind).await?;

        for service in self.0.services.iter() {
            service.on_outgoing_request(self, &mut outgoing).await?;
        }

        let tsx = if matches!(outgoing.msg.method(), SipMethod::Invite) {
            ClientTsx::Invite(InvClientTransaction::send(outgoing, self).await?)
        } else {
            ClientTsx::NonInvite(ClientTransaction::send(outgoing, self).await?)
        };

        Ok(tsx)
    }

    /// Sends `request` without creating a transaction, as an ACK for a
    /// 2xx final response must be.
    pub async fn send_request_stateless(
        &self,
        request: Request,
        addr: SocketAddr,
        kind: TransportKind,
    ) -> Result<()> {
        let mut outgoing = self.prepare_outgoing(request, addr, kind).await?;

        for service in self.0.services.iter() {
            service.on_outgoing_request(self, &mut outgoing).await?;
        }

        let buf = outgoing.to_bytes()?;
        self.0
            .transport
            .send_buffer(&outgoing.transport, &buf, &outgoing.addr, true)
            .await?;

        Ok(())
    }

    async fn prepare_outgoing(
        &self,
        mut request: Request,
        addr: SocketAddr,
        kind: TransportKind,
    ) -> Result<OutgoingRequest> {
        let transport = self.0.transport.find_or_dial(addr, kind).await?;

        let Some(via) = request.headers.top_via_mut() else {
            return Err(Error::InvalidMessage("Request carries no Via header"));
        };

        via.set_transport(kind);
        if via.sent_by().is_empty() {
            let sent_by = match &self.0.sent_by_build {
                Some(build) => build(&self.0.sent_by_host, transport.sent_by_port()),
                None => {
                    let host: Host = self
                        .0
                        .sent_by_host
                        .parse()
                        .unwrap_or(Host::DomainName(self.0.sent_by_host.clone()));
                    HostPort::new(host, Some(transport.sent_by_port()))
                }
            };
            via.set_sent_by(sent_by);
        }
        if !via.is_rfc3261_branch() {
            via.set_branch(crate::transaction::generate_branch());
        }

        // Timestamp the request so the peer's echo yields a round trip
        // sample.
        if request.headers.timestamp().is_none() {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
            request.headers.push(Header::Timestamp(Timestamp::new(now)));
        }

        Ok(OutgoingRequest {
            msg: request,
            addr,
            buf: None,
            transport,
        })
    }

    /// Respond statelessly an request.
    ///
    /// This method create an response from the incoming request and
    /// sent statelessly, meaning that no `UAS` transaction must be
    /// created for this request.
    pub async fn respond(
        &self,
        request: &IncomingRequest,
        status_code: i32,
        reason_phrase: &str,
    ) -> Result<()> {
        // No `UAS` transaction must be created for this request.
        assert!(
            request.transaction.is_none(),
            "Request already has a transaction"
        );

        let mut msg = self.new_response(request, status_code, reason_phrase);

        self.send_response(&mut msg).await
    }

    /// Respond statelessly with headers and body.
    ///
    /// Same as [`Endpoint::respond`] but allows to set additional headers and
    /// body.
    pub async fn respond_with_headers_and_body(
        &self,
        request: &IncomingRequest,
        status_code: i32,
        reason_phrase: &str,
        headers: Headers,
        body: bytes::Bytes,
    ) -> Result<()> {
        // No `UAS` transaction must be created for this request.
        assert!(
            request.transaction.is_none(),
            "Request already has a transaction"
        );

        let mut msg = self.new_response(request, status_code, reason_phrase);

        msg.append_headers(headers);

        msg.set_body(body);

        self.send_response(&mut msg).await
    }

    /// Creates a new SIP response based on an incoming request.
    ///
    /// This method generates a response message with the specified status code
    /// and reason phrase. It also sets the necessary headers from request,
    /// including `Call-ID`, `From`, `To`, `CSeq`, `Via` and `Record-Route` headers.
    pub fn new_response(
        &self,
        req: &IncomingRequest,
        code: i32,
        reason: &str,
    ) -> OutgoingResponse {
        // Copy the necessary headers from the request.
        let mut headers = Headers::with_capacity(8);
        let msg_headers = &req.request.headers;

        // `Via` header. The topmost one carries the received and rport
        // rewrites done on the inbound path.
        let topmost_via = req.request_headers.via.clone();
        let via = msg_headers
            .iter()
            .filter(|h| matches!(h, Header::Via(_)))
            .skip(1);
        headers.push(Header::Via(topmost_via));
        headers.extend(via.cloned());

        // `Record-Route` header.
        let rr = msg_headers
            .iter()
            .filter(|h| matches!(h, Header::RecordRoute(_)));
        headers.extend(rr.cloned());

        // `Call-ID` header.
        headers.push(Header::CallId(req.request_headers.call_id.clone()));

        // `From` header.
        headers.push(Header::From(req.request_headers.from.clone()));

        // `To` header.
        let mut to = req.request_headers.to.clone();
        // 8.2.6.2 Headers and Tags
        // The UAS MUST add a tag to the To header field in
        // the response (with the exception of the 100 (Trying)
        // response, in which a tag MAY be present).
        if to.tag().is_none() && code > 100 {
            if let Some(branch) = req.request_headers.via.branch() {
                to.set_tag(branch);
            }
        }
        headers.push(Header::To(to));

        // `CSeq` header.
        headers.push(Header::CSeq(req.request_headers.cseq.clone()));

        // `Timestamp` echo, completed with the response delay on send.
        if let Some(ts) = msg_headers.timestamp() {
            headers.push(Header::Timestamp(*ts));
        }

        let addr = self.get_outbound_addr(&req.request_headers.via, &req.transport, req.packet.addr);
        let status_line = StatusLine::new(code.into(), reason);

        // Done.
        OutgoingResponse {
            response: Response {
                status_line,
                headers,
                body: None,
            },
            addr,
            buf: None,
            recv_time: Some(req.packet.time),
        }
    }

    /// Creates a response from just the mandatory headers of a request,
    /// used where the full message is no longer at hand.
    pub(crate) fn new_response_from_parts(
        &self,
        hdrs: &RequestHeaders,
        transport: Arc<dyn Transport>,
        code: i32,
        reason: &str,
    ) -> OutgoingResponse {
        let mut headers = Headers::with_capacity(5);

        headers.push(Header::Via(hdrs.via.clone()));
        headers.push(Header::CallId(hdrs.call_id.clone()));
        headers.push(Header::From(hdrs.from.clone()));

        let mut to = hdrs.to.clone();
        if to.tag().is_none() && code > 100 {
            if let Some(branch) = hdrs.via.branch() {
                to.set_tag(branch);
            }
        }
        headers.push(Header::To(to));
        headers.push(Header::CSeq(hdrs.cseq.clone()));

        let remote = transport.remote_addr().unwrap_or_else(|| transport.addr());
        let addr = self.get_outbound_addr(&hdrs.via, &transport, remote);

        OutgoingResponse {
            response: Response {
                status_line: StatusLine::new(code.into(), reason),
                headers,
                body: None,
            },
            addr,
            buf: None,
            recv_time: None,
        }
    }

    /// Sends a SIP response to the specified address.
    ///
    /// This method encodes the response message and sends it to the
    /// specified address using the appropriate transport layer.
    pub async fn send_response(&self, response: &mut OutgoingResponse) -> Result<()> {
        for service in self.0.services.iter() {
            service.on_outgoing_response(self, response).await?;
        }

        log::debug!(
            "=> Response {} {}",
            response.status_code().into_i32(),
            response.reason()
        );
        response.stamp_res_delay();
        let encoded_buf = response.to_bytes()?;

        match response.addr.clone() {
            OutgoingAddr::HostPort { host, protocol } => {
                let via = response
                    .response
                    .headers
                    .top_via()
                    .cloned()
                    .unwrap_or_else(|| Via::new(protocol, host, None));

                self.send_response_candidates(&via, protocol, &encoded_buf).await
            }
            OutgoingAddr::Addr { addr, transport } => {
                match self
                    .0
                    .transport
                    .send_buffer(&transport, &encoded_buf, &addr, false)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(Error::Io(err)) => {
                        // The wire failed under us; fall back to the full
                        // response address resolution.
                        log::debug!("Response send to {} failed ({}), re-resolving", addr, err);
                        let via = response
                            .response
                            .headers
                            .top_via()
                            .cloned()
                            .ok_or(Error::Io(err))?;

                        self.send_response_candidates(&via, transport.tp_kind(), &encoded_buf)
                            .await
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    async fn send_response_candidates(
        &self,
        via: &Via,
        kind: TransportKind,
        buf: &[u8],
    ) -> Result<()> {
        let reliable = kind.reliable();
        let candidates = self.0.resolver.response_candidates(via, reliable).await?;

        let mut last_err = Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            "No address candidate for response",
        ));

        for addr in candidates {
            let transport = match self.0.transport.find_or_dial(addr, kind).await {
                Ok(transport) => transport,
                Err(err) => {
                    last_err = err;
                    continue;
                }
            };
            match self.0.transport.send_buffer(&transport, buf, &addr, false).await {
                Ok(_) => return Ok(()),
                Err(err) => last_err = err,
            }
        }

        Err(last_err)
    }

    // https://datatracker.ietf.org/doc/html/rfc3261#section-18.2.2
    // https://datatracker.ietf.org/doc/html/rfc3581
    fn get_outbound_addr(
        &self,
        via: &Via,
        transport: &Arc<dyn Transport>,
        remote: SocketAddr,
    ) -> OutgoingAddr {
        if transport.reliable() {
            // Responses go back on the connection the request used.
            return OutgoingAddr::Addr {
                addr: remote,
                transport: transport.clone(),
            };
        }

        if via.maddr().is_some() {
            // Multicast handling belongs to the resolver.
            return OutgoingAddr::HostPort {
                host: via.sent_by().clone(),
                protocol: via.transport(),
            };
        }

        if let Some(received) = via.received() {
            let port = match via.rport() {
                crate::headers::Rport::Set(rport) => rport,
                _ => via.sent_by().port.unwrap_or_else(|| via.transport().get_port()),
            };
            let addr = SocketAddr::new(received, port);

            OutgoingAddr::Addr {
                addr,
                transport: transport.clone(),
            }
        } else {
            OutgoingAddr::HostPort {
                host: via.sent_by().clone(),
                protocol: via.transport(),
            }
        }
    }

    pub(crate) async fn process_response(&self, msg: &mut Option<IncomingResponse>) -> Result<()> {
        {
            let msg = msg.as_ref().expect("Response was consumed early");
            log::debug!(
                "<= Response ({} {})",
                msg.response.status_line.code.into_i32(),
                msg.response.status_line.reason
            );
        }

        let handled_by_transaction_layer = match self.0.transaction {
            Some(ref tsx_layer) => tsx_layer.handle_response(msg.as_mut().expect("Checked above")).await?,
            None => false,
        };

        if handled_by_transaction_layer {
            return Ok(());
        }

        // The response matched no transaction; it is a stray and goes to
        // the services unchanged.
        for service in self.0.services.iter() {
            service.on_incoming_response(self, msg).await?;

            if msg.is_none() {
                break;
            }
        }

        if let Some(msg) = msg {
            log::debug!(
                "Response ({} {}) from /{} was unhandled by any sevice",
                msg.response.status_line.code.into_i32(),
                msg.response.status_line.reason,
                msg.packet.addr
            );
        }

        Ok(())
    }

    pub(crate) async fn process_request(&self, msg: &mut Option<IncomingRequest>) -> Result<()> {
        {
            let msg = msg.as_ref().expect("Request was consumed early");
            log::debug!("<= Request {} from /{}", msg.method(), msg.addr());
        }

        let handled_by_transaction_layer = match self.0.transaction {
            Some(ref tsx_layer) => tsx_layer.handle_request(msg.as_mut().expect("Checked above")).await?,
            None => false,
        };

        if handled_by_transaction_layer {
            return Ok(());
        }

        // A request that matched no transaction creates one, except the
        // ACK for a 2xx which belongs to the transaction user.
        if self.0.transaction.is_some() {
            let request = msg.as_mut().expect("Checked above");
            if request.transaction.is_none() {
                match request.method() {
                    SipMethod::Ack => (),
                    SipMethod::Invite => {
                        self.new_uas_inv_tsx(request)?;
                    }
                    _ => {
                        self.new_uas_tsx(request)?;
                    }
                }
            }
        }

        // Pass it to the services.
        for service in self.0.services.iter() {
            service.on_incoming_request(self, msg).await?;
            if msg.is_none() {
                break;
            }
        }
        if let Some(msg) = msg {
            log::debug!(
                "Request ({}) from /{} was unhandled by any sevice",
                msg.method(),
                msg.addr()
            );
        }

        Ok(())
    }

    pub(crate) fn get_tsx_layer(&self) -> &TransactionLayer {
        self.0.transaction.as_ref().expect("Transaction layer not set")
    }

    pub(crate) fn transport(&self) -> &TransportLayer {
        &self.0.transport
    }

    pub(crate) fn parser(&self) -> &Arc<dyn SipParser> {
        &self.0.parser
    }

    pub(crate) fn timing(&self) -> &TimingConfig {
        &self.0.timing
    }
}
