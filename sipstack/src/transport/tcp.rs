//! SIP TCP Transport.

use super::{
    Direction, Factory, IdleWatch, Packet, StreamingDecoder, Transport, TransportEvent,
    TransportStartup, TransportTx,
};
use crate::{error::Result, message::TransportKind};
use futures_util::future::{self, Either};
use std::{borrow::Cow, net::SocketAddr, sync::Arc, time::Duration, time::SystemTime};
use tokio::{
    io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    pin,
    sync::Mutex,
};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

type TcpWrite = Arc<Mutex<WriteHalf<TcpStream>>>;

#[derive(Clone)]
/// TCP transport implementation.
pub struct TcpTransport {
    /// The transport addr.
    addr: SocketAddr,
    /// The transport remote addr.
    remote_addr: SocketAddr,
    /// Port of the listener that accepted this connection, used for
    /// sent-by construction.
    listener_port: Option<u16>,
    /// The tcp writer.
    write: TcpWrite,
    /// Transport direction.
    #[allow(dead_code)]
    dir: Direction,
    /// Idle expiration watchdog.
    idle: Option<Arc<IdleWatch>>,
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, buf: &[u8], _: &SocketAddr) -> Result<usize> {
        let mut writer = self.write.lock().await;

        writer.write_all(buf).await?;
        writer.flush().await?;

        if let Some(idle) = &self.idle {
            idle.touch();
        }

        Ok(buf.len())
    }

    fn tp_kind(&self) -> TransportKind {
        TransportKind::Tcp
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

/// Pumps frames out of a stream reader into the transport event channel
/// until the peer goes away or the connection idles out.
///
/// Shared by every reliable stream transport.
pub(crate) async fn serve_stream_read<R>(
    mut reader: FramedRead<R, StreamingDecoder>,
    addr: SocketAddr,
    transport: Arc<dyn Transport>,
    sender: TransportTx,
    idle: Option<Arc<IdleWatch>>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    pin! {
        let expired = match idle.clone() {
            Some(watch) => Either::Left(async move { watch.expired().await }),
            None => Either::Right(future::pending::<()>()),
        };
    }

    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(payload)) => {
                    if let Some(watch) = &idle {
                        watch.touch();
                    }
                    let time = SystemTime::now();
                    let packet = Packet { payload, addr, time };
                    let transport = transport.clone();

                    // Send.
                    sender.send(TransportEvent::Packet { transport, packet }).await?;
                }
                Some(Err(err)) => {
                    log::warn!("Closing {} after read error: {:#}", addr, err);
                    sender.send(TransportEvent::Closed(transport)).await?;
                    return Err(crate::error::Error::Io(err));
                }
                None => {
                    sender.send(TransportEvent::Closed(transport)).await?;
                    return Ok(());
                }
            },
            _ = &mut expired => {
                log::debug!("Closing idle connection {}", addr);
                sender.send(TransportEvent::Closed(transport)).await?;
                return Ok(());
            }
        }
    }
}

/// A TCP server for accept incoming connections.
pub struct TcpServer {
    // Main socket for accept tcp connections.
    sock: TcpListener,
    // Where this server is bind to.
    pub(crate) addr: SocketAddr,
    // The server local name addres.
    local_name: String,
    // Idle TTL applied to every accepted connection.
    idle_ttl: Option<Duration>,
}

impl TcpServer {
    /// Creates a new TCP server.
    pub async fn create<A>(addr: A, idle_ttl: Option<Duration>) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        let sock = TcpListener::bind(addr).await?;
        let addr = sock.local_addr()?;
        let local_name = crate::get_local_name(&addr);

        Ok(Self {
            sock,
            local_name,
            addr,
            idle_ttl,
        })
    }

    /// Serves incoming TCP connections by accepting and handling them.
    pub(crate) async fn handle_incoming(self, sender: TransportTx) -> Result<()> {
        loop {
            let (stream, addr) = match self.sock.accept().await {
                Ok(ok) => ok,
                Err(err) => {
                    log::error!("Failed to accept connection: {:#}", err);
                    continue;
                }
            };

            log::debug!("Got incoming TCP connection from {}", addr);
            // Spawn a new task to handle the connection.
            tokio::spawn(Self::on_accept(
                (stream, addr),
                sender.clone(),
                self.idle_ttl,
                Some(self.addr.port()),
            ));
        }
    }

    // Handle incoming connection.
    async fn on_accept(
        (stream, addr): (TcpStream, SocketAddr),
        sender: TransportTx,
        idle_ttl: Option<Duration>,
        listener_port: Option<u16>,
    ) -> Result<()> {
        let local_addr = stream.local_addr()?;
        let (read, write) = split(stream);
        let decoder = StreamingDecoder;

        let reader = FramedRead::new(read, decoder);
        let write = Arc::new(Mutex::new(write));
        let idle = idle_ttl.map(IdleWatch::new);

        // Create TCP transport for the new socket.
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport {
            addr: local_addr,
            remote_addr: addr,
            listener_port,
            write,
            dir: Direction::Incoming,
            idle: idle.clone(),
        });

        // Register the new transport.
        sender.send(TransportEvent::Created(transport.clone())).await?;

        tokio::spawn(async move {
            if let Err(err) = serve_stream_read(reader, addr, transport, sender, idle).await {
                log::warn!("An error occured; error = {:#}", err);
            }
        });

        Ok(())
    }
}

#[derive(Clone)]
/// Factory for create tcp transports.
pub struct TcpFactory {
    idle_ttl: Option<Duration>,
    sender: TransportTx,
}

impl TcpFactory {
    pub(crate) fn new(idle_ttl: Option<Duration>, sender: TransportTx) -> Self {
        Self { idle_ttl, sender }
    }
}

#[async_trait::async_trait]
impl Factory for TcpFactory {
    async fn create(&self, addr: SocketAddr) -> Result<Arc<dyn Transport>> {
        let stream = TcpStream::connect(addr).await?;
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;

        let (read, write) = split(stream);

        let reader = FramedRead::new(read, StreamingDecoder);
        let write = Arc::new(Mutex::new(write));
        let idle = self.idle_ttl.map(IdleWatch::new);

        let transport: Arc<dyn Transport> = Arc::new(TcpTransport {
            addr: local_addr,
            remote_addr,
            listener_port: None,
            write,
            dir: Direction::Outgoing,
            idle: idle.clone(),
        });

        let sender = self.sender.clone();
        tokio::spawn(serve_stream_read(
            reader,
            remote_addr,
            transport.clone(),
            sender,
            idle,
        ));

        Ok(transport)
    }

    fn protocol(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

pub(crate) struct TcpStartup {
    addr: SocketAddr,
    idle_ttl: Option<Duration>,
}

impl TcpStartup {
    pub fn new(addr: SocketAddr, idle_ttl: Option<Duration>) -> Self {
        Self { addr, idle_ttl }
    }
}

#[async_trait::async_trait]
impl TransportStartup for TcpStartup {
    async fn start(&self, sender: TransportTx) -> Result<tokio::task::JoinHandle<()>> {
        let tcp_server = TcpServer::create(self.addr, self.idle_ttl).await?;

        log::debug!(
            "SIP {} transport ready for incoming connections at {}",
            TransportKind::Tcp,
            tcp_server.local_name
        );

        let factory = Arc::new(TcpFactory::new(self.idle_ttl, sender.clone()));

        sender.send(TransportEvent::Factory(factory)).await?;

        let task = tokio::spawn(async move {
            if let Err(err) = tcp_server.handle_incoming(sender).await {
                log::warn!("TCP accept loop ended: {:#}", err);
            }
        });

        Ok(task)
    }
}

// Keep the writer half generic helpers available to the TLS transport.
pub(crate) type StreamWrite<S> = Arc<Mutex<WriteHalf<S>>>;

pub(crate) async fn write_stream<S>(write: &StreamWrite<S>, buf: &[u8]) -> Result<usize>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let mut writer = write.lock().await;

    writer.write_all(buf).await?;
    writer.flush().await?;

    Ok(buf.len())
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpSocket;

    use super::*;

    const MSG_TEST: &[u8] = b"REGISTER sip:registrar.biloxi.com SIP/2.0\r\n\
    Via: SIP/2.0/UDP bobspc.biloxi.com:5060;branch=z9hG4bKnashds7\r\n\
    Max-Forwards: 70\r\n\
    To: Bob <sip:bob@biloxi.com>\r\n\
    From: Bob <sip:bob@biloxi.com>;tag=456248\r\n\
    Call-ID: 843817637684230@998sdasdh09\r\n\
    CSeq: 1826 REGISTER\r\n\
    Contact: <sip:bob@192.0.2.4>\r\n\
    Expires: 7200\r\n\
    Content-Length: 0\r\n\r\n";

    #[tokio::test]
    async fn smoke() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(2);

        let server = TcpServer::create(addr, None).await.unwrap();
        let socket = TcpSocket::new_v4().unwrap();
        let server_addr = server.addr;

        tokio::spawn(server.handle_incoming(tx));

        let mut client = socket.connect(server_addr).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Created(_)));

        client.write_all(MSG_TEST).await.unwrap();
        client.flush().await.unwrap();

        let TransportEvent::Packet { packet, .. } = rx.recv().await.unwrap() else {
            unreachable!();
        };

        assert_eq!(packet.payload.buf(), MSG_TEST);
    }

    #[tokio::test]
    async fn test_idle_connection_closes() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);

        let server = TcpServer::create(addr, Some(Duration::from_millis(50))).await.unwrap();
        let server_addr = server.addr;

        tokio::spawn(server.handle_incoming(tx));

        let socket = TcpSocket::new_v4().unwrap();
        let _client = socket.connect(server_addr).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Created(_)));
        assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Closed(_)));
    }
}
