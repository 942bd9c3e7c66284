use std::fmt;

const TP_UDP: &str = "UDP";
const TP_TCP: &str = "TCP";
const TP_TLS: &str = "TLS";
const TP_WS: &str = "WS";
const TP_WSS: &str = "WSS";
const TP_UNKNOWN: &str = "TP_UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
/// An SIP Transport Type.
pub enum TransportKind {
    #[default]
    /// `UDP` transport.
    Udp,
    /// `TCP` transport.
    Tcp,
    /// `TLS` transport.
    Tls,
    /// `WebSocket` transport.
    Ws,
    /// Secure `WebSocket` transport.
    Wss,
    /// UNKNOW transport.
    Unknown,
}

impl TransportKind {
    /// Returns the default port number associated with the transport protocol.
    ///
    /// - `UDP` and `TCP` use port `5060` by default.
    /// - `TLS` uses port `5061`.
    /// - `WS` uses port `80` and `WSS` port `443`.
    /// - `Unknown` returns `0` to indicate no default.
    #[inline]
    pub const fn get_port(&self) -> u16 {
        match self {
            TransportKind::Udp | TransportKind::Tcp => 5060,
            TransportKind::Tls => 5061,
            TransportKind::Ws => 80,
            TransportKind::Wss => 443,
            TransportKind::Unknown => 0,
        }
    }

    /// Returns `true` if the protocol guarantees delivery.
    #[inline]
    pub const fn reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp | TransportKind::Unknown)
    }

    /// Returns `true` if the protocol carries TLS.
    #[inline]
    pub const fn secure(&self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::Wss)
    }

    /// Returns `true` if messages arrive on a byte stream instead of
    /// datagram boundaries.
    #[inline]
    pub const fn streamed(&self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Tls)
    }

    /// The DNS SRV proto token used when resolving this transport.
    pub const fn srv_proto(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            _ => "tcp",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TransportKind {
    /// Returns the transport string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => TP_UDP,
            TransportKind::Tcp => TP_TCP,
            TransportKind::Tls => TP_TLS,
            TransportKind::Ws => TP_WS,
            TransportKind::Wss => TP_WSS,
            TransportKind::Unknown => TP_UNKNOWN,
        }
    }
}

impl From<&str> for TransportKind {
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => TransportKind::Udp,
            "TCP" => TransportKind::Tcp,
            "TLS" => TransportKind::Tls,
            "WS" => TransportKind::Ws,
            "WSS" => TransportKind::Wss,
            _ => TransportKind::Unknown,
        }
    }
}
