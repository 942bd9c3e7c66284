#![deny(missing_docs)]
//! SIP Endpoint Builder
//!

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use tokio_rustls::rustls;

use crate::endpoint::resolver::Resolver;
use crate::endpoint::{Endpoint, Inner};
use crate::message::TransportKind;
use crate::parser::{Parser, SipParser};
use crate::transaction::{TimingConfig, TransactionLayer};
use crate::transport::tcp::TcpStartup;
use crate::transport::tls::TlsStartup;
use crate::transport::udp::UdpStartup;
use crate::transport::ws::WsStartup;
use crate::transport::{TransportLayer, TransportStartup};
use crate::SipService;

const DEFAULT_SENT_BY_HOST: &str = "localhost";
const DEFAULT_WS_UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

enum ListenSpec {
    Udp(SocketAddr),
    Tcp(SocketAddr),
    Tls(SocketAddr, Arc<rustls::ServerConfig>),
    Ws(SocketAddr),
    Wss(SocketAddr, Arc<rustls::ServerConfig>),
}

impl ListenSpec {
    fn kind(&self) -> TransportKind {
        match self {
            ListenSpec::Udp(_) => TransportKind::Udp,
            ListenSpec::Tcp(_) => TransportKind::Tcp,
            ListenSpec::Tls(..) => TransportKind::Tls,
            ListenSpec::Ws(_) => TransportKind::Ws,
            ListenSpec::Wss(..) => TransportKind::Wss,
        }
    }
}

/// Builder for creating a new SIP `Endpoint`.
pub struct Builder {
    name: String,
    sent_by_host: String,
    sent_by_build: Option<crate::endpoint::SentByBuild>,
    resolver: Resolver,
    transport: TransportLayer,
    transaction: Option<TransactionLayer>,
    parser: Arc<dyn SipParser>,
    timing: TimingConfig,
    services: Vec<Box<dyn SipService>>,
    listen: Vec<ListenSpec>,
    conn_idle_ttl: Option<Duration>,
    ws_upgrade_timeout: Duration,
    tls_config_client: Option<Arc<rustls::ClientConfig>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Creates a new default instance of `Builder` to construct a `Endpoint`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use sipstack::*;
    /// # async fn build() {
    /// let endpoint = endpoint::Builder::new().with_name("My Endpoint").build().await;
    /// # }
    /// ```
    pub fn new() -> Self {
        Builder {
            transport: TransportLayer::new(),
            name: String::new(),
            sent_by_host: DEFAULT_SENT_BY_HOST.to_string(),
            sent_by_build: None,
            resolver: Resolver::default(),
            parser: Arc::new(Parser),
            timing: TimingConfig::default(),
            services: vec![],
            transaction: None,
            listen: vec![],
            conn_idle_ttl: None,
            ws_upgrade_timeout: DEFAULT_WS_UPGRADE_TIMEOUT,
            tls_config_client: None,
        }
    }

    /// Sets the endpoint name.
    pub fn with_name<T: AsRef<str>>(mut self, s: T) -> Self {
        self.name = s.as_ref().to_string();

        self
    }

    /// Sets the host written into the sent-by of outbound Via hops.
    pub fn with_sent_by_host<T: AsRef<str>>(mut self, host: T) -> Self {
        self.sent_by_host = host.as_ref().to_string();

        self
    }

    /// Overrides sent-by construction entirely; the hook receives the
    /// configured host and the sending connection's advertised port.
    pub fn with_sent_by_build<F>(mut self, build: F) -> Self
    where
        F: Fn(&str, u16) -> crate::message::HostPort + Send + Sync + 'static,
    {
        self.sent_by_build = Some(Box::new(build));

        self
    }

    /// Replaces the message parser.
    pub fn with_parser(mut self, parser: impl SipParser) -> Self {
        self.parser = Arc::new(parser);

        self
    }

    /// Overrides the T1/T2/T4 timing constants and their derived timers.
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;

        self
    }

    /// Closes connections idle for longer than `ttl`. Unset by default.
    pub fn with_conn_idle_ttl(mut self, ttl: Duration) -> Self {
        self.conn_idle_ttl = if ttl.is_zero() { None } else { Some(ttl) };

        self
    }

    /// Deadline for the WS/WSS upgrade handshake.
    pub fn with_ws_upgrade_timeout(mut self, timeout: Duration) -> Self {
        self.ws_upgrade_timeout = timeout;

        self
    }

    /// TLS configuration used when dialing TLS peers.
    pub fn with_tls_client(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config_client = Some(config);

        self
    }

    /// Add a new builder for UDP transport on specified address.
    pub fn with_udp(mut self, addr: SocketAddr) -> Self {
        self.listen.push(ListenSpec::Udp(addr));
        self
    }

    /// Add a new builder for TCP transport on specified address.
    pub fn with_tcp(mut self, addr: SocketAddr) -> Self {
        self.listen.push(ListenSpec::Tcp(addr));
        self
    }

    /// Add a new builder for TLS transport on specified address.
    pub fn with_tls(mut self, addr: SocketAddr, config: Arc<rustls::ServerConfig>) -> Self {
        self.listen.push(ListenSpec::Tls(addr, config));
        self
    }

    /// Add a new builder for WebSocket transport on specified address.
    pub fn with_ws(mut self, addr: SocketAddr) -> Self {
        self.listen.push(ListenSpec::Ws(addr));
        self
    }

    /// Add a new builder for secure WebSocket transport on specified
    /// address.
    pub fn with_wss(mut self, addr: SocketAddr, config: Arc<rustls::ServerConfig>) -> Self {
        self.listen.push(ListenSpec::Wss(addr, config));
        self
    }

    /// Sets the transaction layer.
    pub fn with_transaction_layer(mut self, transaction: TransactionLayer) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// Adds a service to the endpoint.
    ///
    /// This function can be called multiple times to add additional services.
    /// If a service with the same name already exists, the new service will not
    /// be added.
    pub fn with_service(mut self, service: impl SipService) -> Self {
        if self.service_exists(service.name()) {
            return self;
        }
        self.services.push(Box::new(service));

        self
    }

    /// Add a collection of services to the endpoint.
    ///
    /// Similar to [`Builder::with_service`], but allows adding multiple
    /// services at once. Unlike `with_service`, this method expects the
    /// services to be passed as trait objects (`Box<dyn SipService>`)
    /// instead of concrete types.
    pub fn with_services<I>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn SipService>>,
    {
        let names: Vec<String> = self.services.iter().map(|s| s.name().to_string()).collect();
        let incoming = services
            .into_iter()
            .filter(|service| !names.contains(&service.name().to_string()))
            .unique_by(|service| service.name().to_string());

        self.services.extend(incoming);

        self
    }

    fn service_exists(&self, name: &str) -> bool {
        self.services.iter().any(|service| service.name() == name)
    }

    /// Finalizes the builder into an `Endpoint`, binding every configured
    /// listener.
    pub async fn build(self) -> Endpoint {
        let endpoint = Endpoint(Arc::new(Inner {
            transport: self.transport,
            transaction: self.transaction,
            name: self.name,
            sent_by_host: self.sent_by_host,
            sent_by_build: self.sent_by_build,
            resolver: self.resolver,
            parser: self.parser,
            timing: self.timing,
            services: self.services.into_boxed_slice(),
        }));

        let layer = endpoint.transport();
        for spec in self.listen {
            let kind = spec.kind();
            let startup: Box<dyn TransportStartup> = match spec {
                ListenSpec::Udp(addr) => Box::new(UdpStartup::new(addr)),
                ListenSpec::Tcp(addr) => Box::new(TcpStartup::new(addr, self.conn_idle_ttl)),
                ListenSpec::Tls(addr, config) => Box::new(TlsStartup::new(
                    addr,
                    self.conn_idle_ttl,
                    config,
                    self.tls_config_client.clone(),
                )),
                ListenSpec::Ws(addr) => Box::new(WsStartup::new(
                    addr,
                    self.conn_idle_ttl,
                    self.ws_upgrade_timeout,
                )),
                ListenSpec::Wss(addr, config) => Box::new(WsStartup::new_secure(
                    addr,
                    config,
                    self.conn_idle_ttl,
                    self.ws_upgrade_timeout,
                )),
            };

            match startup.start(layer.sender().clone()).await {
                Ok(task) => {
                    layer.track_task(task);
                    layer.count_listener(kind);
                }
                Err(err) => {
                    log::error!("Failed to start {} transport: {}", kind, err);
                }
            }
        }

        endpoint
    }
}
