//! SIP TLS Transport.
//!
//! Reuses the TCP framing and read loop; only the listen and dial steps
//! differ, where the rustls handshake wraps the accepted or connected
//! stream.

use super::tcp::{serve_stream_read, write_stream, StreamWrite};
use super::{
    Direction, Factory, IdleWatch, StreamingDecoder, Transport, TransportEvent, TransportStartup,
    TransportTx,
};
use crate::{error::Result, message::TransportKind};
use std::{borrow::Cow, net::SocketAddr, sync::Arc, time::Duration};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio::{
    io::{split, AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::Mutex,
};
use tokio_rustls::{rustls, TlsAcceptor, TlsConnector};
use tokio_util::codec::FramedRead;

/// TLS transport implementation, generic over the handshaken stream.
pub struct TlsTransport<S> {
    addr: SocketAddr,
    remote_addr: SocketAddr,
    listener_port: Option<u16>,
    write: StreamWrite<S>,
    #[allow(dead_code)]
    dir: Direction,
    idle: Option<Arc<IdleWatch>>,
}

#[async_trait::async_trait]
impl<S> Transport for TlsTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, buf: &[u8], _: &SocketAddr) -> Result<usize> {
        let sent = write_stream(&self.write, buf).await?;

        if let Some(idle) = &self.idle {
            idle.touch();
        }

        Ok(sent)
    }

    fn tp_kind(&self) -> TransportKind {
        TransportKind::Tls
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

/// A TLS server for accept incoming connections.
pub struct TlsServer {
    sock: TcpListener,
    acceptor: TlsAcceptor,
    pub(crate) addr: SocketAddr,
    local_name: String,
    idle_ttl: Option<Duration>,
}

impl TlsServer {
    /// Creates a new TLS server.
    pub async fn create<A>(
        addr: A,
        config: Arc<rustls::ServerConfig>,
        idle_ttl: Option<Duration>,
    ) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        let sock = TcpListener::bind(addr).await?;
        let addr = sock.local_addr()?;
        let local_name = crate::get_local_name(&addr);

        Ok(Self {
            sock,
            acceptor: TlsAcceptor::from(config),
            addr,
            local_name,
            idle_ttl,
        })
    }

    pub(crate) async fn handle_incoming(self, sender: TransportTx) -> Result<()> {
        loop {
            let (stream, addr) = match self.sock.accept().await {
                Ok(ok) => ok,
                Err(err) => {
                    log::error!("Failed to accept connection: {:#}", err);
                    continue;
                }
            };

            log::debug!("Got incoming TLS connection from {}", addr);
            let acceptor = self.acceptor.clone();
            let sender = sender.clone();
            let idle_ttl = self.idle_ttl;
            let listener_port = Some(self.addr.port());

            tokio::spawn(async move {
                let stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        log::warn!("TLS handshake with {} failed: {:#}", addr, err);
                        return;
                    }
                };
                if let Err(err) =
                    Self::on_accept(stream, addr, sender, idle_ttl, listener_port).await
                {
                    log::warn!("An error occured; error = {:#}", err);
                }
            });
        }
    }

    async fn on_accept(
        stream: tokio_rustls::server::TlsStream<TcpStream>,
        addr: SocketAddr,
        sender: TransportTx,
        idle_ttl: Option<Duration>,
        listener_port: Option<u16>,
    ) -> Result<()> {
        let local_addr = stream.get_ref().0.local_addr()?;
        let (read, write) = split(stream);

        let reader = FramedRead::new(read, StreamingDecoder);
        let write = Arc::new(Mutex::new(write));
        let idle = idle_ttl.map(IdleWatch::new);

        let transport: Arc<dyn Transport> = Arc::new(TlsTransport {
            addr: local_addr,
            remote_addr: addr,
            listener_port,
            write,
            dir: Direction::Incoming,
            idle: idle.clone(),
        });

        sender.send(TransportEvent::Created(transport.clone())).await?;

        tokio::spawn(serve_stream_read(reader, addr, transport, sender, idle));

        Ok(())
    }
}

#[derive(Clone)]
/// Factory for create tls transports.
pub struct TlsFactory {
    connector: TlsConnector,
    idle_ttl: Option<Duration>,
    sender: TransportTx,
}

impl TlsFactory {
    pub(crate) fn new(
        config: Arc<rustls::ClientConfig>,
        idle_ttl: Option<Duration>,
        sender: TransportTx,
    ) -> Self {
        Self {
            connector: TlsConnector::from(config),
            idle_ttl,
            sender,
        }
    }
}

#[async_trait::async_trait]
impl Factory for TlsFactory {
    async fn create(&self, addr: SocketAddr) -> Result<Arc<dyn Transport>> {
        let stream = TcpStream::connect(addr).await?;
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;

        let server_name = ServerName::from(addr.ip());
        let stream = self.connector.connect(server_name, stream).await?;

        let (read, write) = split(stream);
        let reader = FramedRead::new(read, StreamingDecoder);
        let write = Arc::new(Mutex::new(write));
        let idle = self.idle_ttl.map(IdleWatch::new);

        let transport: Arc<dyn Transport> = Arc::new(TlsTransport {
            addr: local_addr,
            remote_addr,
            listener_port: None,
            write,
            dir: Direction::Outgoing,
            idle: idle.clone(),
        });

        tokio::spawn(serve_stream_read(
            reader,
            remote_addr,
            transport.clone(),
            self.sender.clone(),
            idle,
        ));

        Ok(transport)
    }

    fn protocol(&self) -> TransportKind {
        TransportKind::Tls
    }
}

pub(crate) struct TlsStartup {
    addr: SocketAddr,
    idle_ttl: Option<Duration>,
    server_config: Arc<rustls::ServerConfig>,
    client_config: Option<Arc<rustls::ClientConfig>>,
}

impl TlsStartup {
    pub fn new(
        addr: SocketAddr,
        idle_ttl: Option<Duration>,
        server_config: Arc<rustls::ServerConfig>,
        client_config: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        Self {
            addr,
            idle_ttl,
            server_config,
            client_config,
        }
    }
}

#[async_trait::async_trait]
impl TransportStartup for TlsStartup {
    async fn start(&self, sender: TransportTx) -> Result<tokio::task::JoinHandle<()>> {
        let tls_server =
            TlsServer::create(self.addr, self.server_config.clone(), self.idle_ttl).await?;

        log::debug!(
            "SIP {} transport ready for incoming connections at {}",
            TransportKind::Tls,
            tls_server.local_name
        );

        if let Some(client_config) = &self.client_config {
            let factory = Arc::new(TlsFactory::new(
                client_config.clone(),
                self.idle_ttl,
                sender.clone(),
            ));
            sender.send(TransportEvent::Factory(factory)).await?;
        }

        let task = tokio::spawn(async move {
            if let Err(err) = tls_server.handle_incoming(sender).await {
                log::warn!("TLS accept loop ended: {:#}", err);
            }
        });

        Ok(task)
    }
}
