//! SIP WebSocket Transport (RFC 7118), plain and over TLS.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::{Direction, Factory, IdleWatch, Packet, Payload, Transport, TransportEvent, TransportStartup, TransportTx};
use crate::error::{Error, Result};
use crate::message::TransportKind;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{future, SinkExt, StreamExt, TryStreamExt};
use futures_util::future::Either;
use hyper::header::{SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION};
use hyper::{body::Incoming, server::conn::http1, service::service_fn, upgrade::Upgraded, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::pin;
use tokio::sync::Mutex;
use tokio_rustls::{rustls, TlsAcceptor};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Body = http_body_util::Full<hyper::body::Bytes>;
type WsWrite<S> = Arc<Mutex<SplitSink<WebSocketStream<S>, Message>>>;

/// WebSocket transport implementation, generic over the upgraded stream.
pub struct WebSocketTransport<S> {
    kind: TransportKind,
    addr: SocketAddr,
    remote_addr: SocketAddr,
    listener_port: Option<u16>,
    #[allow(dead_code)]
    dir: Direction,
    write: WsWrite<S>,
    idle: Option<Arc<IdleWatch>>,
}

#[async_trait::async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, buf: &[u8], _: &SocketAddr) -> Result<usize> {
        // Convert the buffer into a WebSocket message
        let message = Message::Binary(bytes::Bytes::copy_from_slice(buf));

        let mut writer = self.write.lock().await;

        // Send the message through the WebSocket
        writer
            .send(message)
            .await
            .map_err(|e| std::io::Error::other(e))?;

        if let Some(idle) = &self.idle {
            idle.touch();
        }

        Ok(buf.len())
    }

    fn tp_kind(&self) -> TransportKind {
        self.kind
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }

    fn local_name(&self) -> Cow<'_, str> {
        Cow::Owned(self.addr.to_string())
    }

    fn sent_by_port(&self) -> u16 {
        self.listener_port.unwrap_or(self.addr.port())
    }
}

/// Pumps WebSocket frames into the transport event channel until the peer
/// closes or the connection idles out.
async fn serve_ws_read<S>(
    receiver: SplitStream<WebSocketStream<S>>,
    addr: SocketAddr,
    transport: Arc<dyn Transport>,
    sender: TransportTx,
    idle: Option<Arc<IdleWatch>>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut filtered_msgs = receiver.try_filter(|msg| {
        // Filter out unwanted messages.
        future::ready(msg.is_text() || msg.is_binary() || msg.is_close())
    });

    pin! {
        let expired = match idle.clone() {
            Some(watch) => Either::Left(async move { watch.expired().await }),
            None => Either::Right(future::pending::<()>()),
        };
    }

    loop {
        tokio::select! {
            msg = filtered_msgs.next() => {
                let payload = match msg {
                    Some(Ok(Message::Text(text))) => Payload::new(text.into()),
                    Some(Ok(Message::Binary(bin))) => Payload::new(bin),
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("WebSocket connection closed");
                        sender.send(TransportEvent::Closed(transport)).await?;
                        return Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        log::warn!("Closing {} after read error: {:#}", addr, err);
                        sender.send(TransportEvent::Closed(transport)).await?;
                        return Err(Error::Io(std::io::Error::other(err)));
                    }
                };

                if let Some(watch) = &idle {
                    watch.touch();
                }

                let time = SystemTime::now();
                let packet = Packet { payload, addr, time };
                let msg = TransportEvent::Packet {
                    transport: transport.clone(),
                    packet,
                };

                // Send.
                if sender.send(msg).await.is_err() {
                    return Ok(());
                }
            }
            _ = &mut expired => {
                log::debug!("Closing idle connection {}", addr);
                sender.send(TransportEvent::Closed(transport)).await?;
                return Ok(());
            }
        }
    }
}

/// A WebSocket server for accept incoming connections.
pub struct WebSocketServer {
    sock: TcpListener,
    pub(crate) addr: SocketAddr,
    local_name: String,
    kind: TransportKind,
    tls: Option<TlsAcceptor>,
    idle_ttl: Option<Duration>,
    upgrade_timeout: Duration,
}

impl WebSocketServer {
    /// Binds a plain WebSocket server.
    pub async fn bind<A>(addr: A, idle_ttl: Option<Duration>, upgrade_timeout: Duration) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        Self::bind_inner(addr, None, idle_ttl, upgrade_timeout).await
    }

    /// Binds a WebSocket server behind TLS.
    pub async fn bind_secure<A>(
        addr: A,
        config: Arc<rustls::ServerConfig>,
        idle_ttl: Option<Duration>,
        upgrade_timeout: Duration,
    ) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        Self::bind_inner(addr, Some(TlsAcceptor::from(config)), idle_ttl, upgrade_timeout).await
    }

    async fn bind_inner<A>(
        addr: A,
        tls: Option<TlsAcceptor>,
        idle_ttl: Option<Duration>,
        upgrade_timeout: Duration,
    ) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        let sock = TcpListener::bind(addr).await?;
        let addr = sock.local_addr()?;
        let local_name = crate::get_local_name(&addr);
        let kind = if tls.is_some() {
            TransportKind::Wss
        } else {
            TransportKind::Ws
        };

        Ok(Self {
            sock,
            addr,
            local_name,
            kind,
            tls,
            idle_ttl,
            upgrade_timeout,
        })
    }

    async fn on_ws_connection(
        ws_stream: WebSocketStream<TokioIo<Upgraded>>,
        sender: TransportTx,
        ctx: WsConnCtx,
    ) {
        log::debug!("WebSocket connection established: {}", ctx.remote_addr);

        let (ws_sender, ws_receiver) = ws_stream.split();

        let write = Arc::new(Mutex::new(ws_sender));
        let idle = ctx.idle_ttl.map(IdleWatch::new);

        // Create WS transport for the new socket.
        let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport {
            kind: ctx.kind,
            dir: Direction::Incoming,
            addr: ctx.local_addr,
            remote_addr: ctx.remote_addr,
            listener_port: Some(ctx.listener_port),
            write,
            idle: idle.clone(),
        });

        if sender
            .send(TransportEvent::Created(transport.clone()))
            .await
            .is_err()
        {
            return;
        }

        let _ = serve_ws_read(ws_receiver, ctx.remote_addr, transport, sender, idle).await;
    }

    /// Handles incoming WebSocket upgrade requests.
    async fn on_received_request(
        mut req: Request<Incoming>,
        tx: TransportTx,
        ctx: WsConnCtx,
    ) -> Result<Response<Body>> {
        // Check if the request is a valid WebSocket handshake
        let headers = req.headers();

        if headers.get(SEC_WEBSOCKET_VERSION).map(|v| v.as_bytes()) != Some(b"13") {
            return Err(Error::InvalidWebSocketVersion);
        }

        if headers.get(SEC_WEBSOCKET_PROTOCOL).map(|v| v.as_bytes()) != Some(b"sip") {
            return Err(Error::InvalidSecWebSocketProtocol);
        }

        let key = match headers.get(SEC_WEBSOCKET_KEY) {
            Some(key) => key,
            None => return Err(Error::MissingSecWebSocketKey),
        };
        let accept_key = derive_accept_key(key.as_bytes());
        let version = req.version();
        let upgrade_timeout = ctx.upgrade_timeout;

        tokio::spawn(async move {
            match tokio::time::timeout(upgrade_timeout, hyper::upgrade::on(&mut req)).await {
                Ok(Ok(upgraded)) => {
                    let upgraded = TokioIo::new(upgraded);
                    let stream = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;

                    WebSocketServer::on_ws_connection(stream, tx, ctx).await;
                }
                Ok(Err(e)) => log::debug!("upgrade error: {}", e),
                Err(_) => log::debug!("upgrade from {} timed out", ctx.remote_addr),
            }
        });

        let response = Response::builder()
            .version(version)
            .status(hyper::StatusCode::SWITCHING_PROTOCOLS)
            .header(hyper::header::UPGRADE, "websocket")
            .header(hyper::header::CONNECTION, "upgrade")
            .header("Sec-WebSocket-Accept", &accept_key[..])
            .header("Sec-WebSocket-Protocol", "sip")
            .body(Body::default())
            .map_err(|e| std::io::Error::other(e))?;

        Ok(response)
    }

    pub(crate) async fn handle_incoming(self, tx: TransportTx) -> Result<()> {
        loop {
            let (stream, remote_addr) = self.sock.accept().await?;
            let tx = tx.clone();
            let local_addr = stream.local_addr()?;

            log::debug!("Got incoming WebSocket connection from {}", remote_addr);

            let ctx = WsConnCtx {
                kind: self.kind,
                local_addr,
                remote_addr,
                listener_port: self.addr.port(),
                idle_ttl: self.idle_ttl,
                upgrade_timeout: self.upgrade_timeout,
            };

            match &self.tls {
                None => {
                    // Let's spawn the handling of each connection in a separate task.
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        serve_http1(io, tx, ctx).await;
                    });
                }
                Some(acceptor) => {
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        let stream = match acceptor.accept(stream).await {
                            Ok(stream) => stream,
                            Err(err) => {
                                log::warn!("TLS handshake with {} failed: {:#}", remote_addr, err);
                                return;
                            }
                        };
                        let io = TokioIo::new(stream);
                        serve_http1(io, tx, ctx).await;
                    });
                }
            }
        }
    }
}

async fn serve_http1<S>(io: TokioIo<S>, tx: TransportTx, ctx: WsConnCtx)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service =
        service_fn(move |req| WebSocketServer::on_received_request(req, tx.clone(), ctx));

    let conn = http1::Builder::new().serve_connection(io, service).with_upgrades();

    if let Err(err) = conn.await {
        log::error!("failed to serve connection: {err:?}");
    }
}

#[derive(Clone, Copy)]
struct WsConnCtx {
    kind: TransportKind,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    listener_port: u16,
    idle_ttl: Option<Duration>,
    upgrade_timeout: Duration,
}

#[derive(Clone)]
/// Factory for dialing outbound WebSocket connections.
pub struct WsFactory {
    kind: TransportKind,
    idle_ttl: Option<Duration>,
    sender: TransportTx,
}

impl WsFactory {
    pub(crate) fn new(kind: TransportKind, idle_ttl: Option<Duration>, sender: TransportTx) -> Self {
        Self {
            kind,
            idle_ttl,
            sender,
        }
    }
}

#[async_trait::async_trait]
impl Factory for WsFactory {
    async fn create(&self, addr: SocketAddr) -> Result<Arc<dyn Transport>> {
        let scheme = if self.kind == TransportKind::Wss { "wss" } else { "ws" };
        let mut request = format!("{}://{}/", scheme, addr)
            .into_client_request()
            .map_err(|e| std::io::Error::other(e))?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            hyper::header::HeaderValue::from_static("sip"),
        );

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| std::io::Error::other(e))?;

        let local_addr = match stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.local_addr()?,
            MaybeTlsStream::Rustls(tls) => tls.get_ref().0.local_addr()?,
            _ => {
                return Err(Error::Io(std::io::Error::other(
                    "Unsupported WebSocket stream kind",
                )))
            }
        };

        let (ws_sender, ws_receiver) = stream.split();
        let write = Arc::new(Mutex::new(ws_sender));
        let idle = self.idle_ttl.map(IdleWatch::new);

        let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport {
            kind: self.kind,
            dir: Direction::Outgoing,
            addr: local_addr,
            remote_addr: addr,
            listener_port: None,
            write,
            idle: idle.clone(),
        });

        tokio::spawn(serve_ws_read(
            ws_receiver,
            addr,
            transport.clone(),
            self.sender.clone(),
            idle,
        ));

        Ok(transport)
    }

    fn protocol(&self) -> TransportKind {
        self.kind
    }
}

pub(crate) struct WsStartup {
    addr: SocketAddr,
    idle_ttl: Option<Duration>,
    upgrade_timeout: Duration,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl WsStartup {
    pub fn new(addr: SocketAddr, idle_ttl: Option<Duration>, upgrade_timeout: Duration) -> Self {
        Self {
            addr,
            idle_ttl,
            upgrade_timeout,
            tls: None,
        }
    }

    pub fn new_secure(
        addr: SocketAddr,
        config: Arc<rustls::ServerConfig>,
        idle_ttl: Option<Duration>,
        upgrade_timeout: Duration,
    ) -> Self {
        Self {
            addr,
            idle_ttl,
            upgrade_timeout,
            tls: Some(config),
        }
    }
}

#[async_trait::async_trait]
impl TransportStartup for WsStartup {
    async fn start(&self, sender: TransportTx) -> Result<tokio::task::JoinHandle<()>> {
        let server = match &self.tls {
            None => WebSocketServer::bind(self.addr, self.idle_ttl, self.upgrade_timeout).await?,
            Some(config) => {
                WebSocketServer::bind_secure(
                    self.addr,
                    config.clone(),
                    self.idle_ttl,
                    self.upgrade_timeout,
                )
                .await?
            }
        };
        let kind = server.kind;

        log::debug!(
            "SIP {} transport ready for incoming connections at {}",
            kind,
            server.local_name
        );

        let factory = Arc::new(WsFactory::new(kind, self.idle_ttl, sender.clone()));
        sender.send(TransportEvent::Factory(factory)).await?;

        let task = tokio::spawn(async move {
            if let Err(err) = server.handle_incoming(sender).await {
                log::warn!("WebSocket accept loop ended: {:#}", err);
            }
        });

        Ok(task)
    }
}
