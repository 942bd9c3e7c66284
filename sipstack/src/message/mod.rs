//! SIP message types.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::SipParserError;
use crate::headers::Headers;

mod transport;

pub use transport::TransportKind;

pub(crate) const SIPV2: &str = "SIP/2.0";

/// A host, either a domain name or an IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// A domain name.
    DomainName(String),
    /// An IP address.
    IpAddr(IpAddr),
}

impl Host {
    /// Returns the IP address if this host is an IP literal.
    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            Host::IpAddr(ip) => Some(*ip),
            Host::DomainName(_) => None,
        }
    }
}

impl FromStr for Host {
    type Err = SipParserError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("Empty host".into());
        }
        // IPv6 literals appear in brackets on the wire.
        let trimmed = s.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Ok(Host::IpAddr(ip)),
            Err(_) => Ok(Host::DomainName(s.to_string())),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::DomainName(name) => f.write_str(name),
            Host::IpAddr(IpAddr::V4(ip)) => write!(f, "{}", ip),
            Host::IpAddr(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
        }
    }
}

impl Default for Host {
    fn default() -> Self {
        Host::DomainName(String::new())
    }
}

/// A host with an optional port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct HostPort {
    /// The host part.
    pub host: Host,
    /// The optional port part.
    pub port: Option<u16>,
}

impl HostPort {
    /// Creates a new `HostPort`.
    pub fn new(host: Host, port: Option<u16>) -> Self {
        Self { host, port }
    }

    /// Returns `true` if the host is empty and no port is set.
    pub fn is_empty(&self) -> bool {
        matches!(&self.host, Host::DomainName(name) if name.is_empty()) && self.port.is_none()
    }
}

impl FromStr for HostPort {
    type Err = SipParserError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // Split on the last colon outside of an IPv6 bracket pair.
        if let Some(end) = s.rfind(']') {
            let host = s[..=end].parse()?;
            let port = match s[end + 1..].strip_prefix(':') {
                Some(p) => Some(p.parse().map_err(|_| SipParserError::new("Invalid port"))?),
                None => None,
            };
            return Ok(Self { host, port });
        }
        match s.rsplit_once(':') {
            Some((host, port)) => Ok(Self {
                host: host.parse()?,
                port: Some(port.parse().map_err(|_| SipParserError::new("Invalid port"))?),
            }),
            None => Ok(Self {
                host: s.parse()?,
                port: None,
            }),
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// An SIP request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    /// `INVITE` method.
    Invite,
    /// `ACK` method.
    Ack,
    /// `CANCEL` method.
    Cancel,
    /// `BYE` method.
    Bye,
    /// `OPTIONS` method.
    Options,
    /// `REGISTER` method.
    Register,
    /// `INFO` method.
    Info,
    /// `SUBSCRIBE` method.
    Subscribe,
    /// `NOTIFY` method.
    Notify,
    /// `REFER` method.
    Refer,
    /// `MESSAGE` method.
    Message,
    /// `UPDATE` method.
    Update,
    /// `PRACK` method.
    Prack,
    /// Any other method token.
    Other(String),
}

impl SipMethod {
    /// Returns the method token.
    pub fn as_str(&self) -> &str {
        match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Register => "REGISTER",
            SipMethod::Info => "INFO",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Other(token) => token,
        }
    }

    /// Server transaction matching folds `ACK` into the `INVITE` it
    /// acknowledges.
    pub fn folded(&self) -> SipMethod {
        match self {
            SipMethod::Ack => SipMethod::Invite,
            other => other.clone(),
        }
    }

    /// Case-insensitive method comparison.
    pub fn eq_ignore_case(&self, other: &SipMethod) -> bool {
        self.as_str().eq_ignore_ascii_case(other.as_str())
    }
}

impl From<&str> for SipMethod {
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "CANCEL" => SipMethod::Cancel,
            "BYE" => SipMethod::Bye,
            "OPTIONS" => SipMethod::Options,
            "REGISTER" => SipMethod::Register,
            "INFO" => SipMethod::Info,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            "UPDATE" => SipMethod::Update,
            "PRACK" => SipMethod::Prack,
            _ => SipMethod::Other(s.to_string()),
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An SIP response status code in the `100..=699` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusCode(pub u16);

#[allow(missing_docs)]
impl StatusCode {
    pub const TRYING: StatusCode = StatusCode(100);
    pub const RINGING: StatusCode = StatusCode(180);
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const MESSAGE_TOO_LARGE: StatusCode = StatusCode(513);
    pub const BUSY_HERE: StatusCode = StatusCode(486);
    pub const REQUEST_TERMINATED: StatusCode = StatusCode(487);
    pub const SERVER_ERROR: StatusCode = StatusCode(500);

    /// Returns the numeric code.
    pub fn into_i32(self) -> i32 {
        self.0 as i32
    }

    /// Returns `true` for `1xx` codes.
    pub fn is_provisional(self) -> bool {
        matches!(self.0, 100..=199)
    }

    /// Returns `true` for `2xx..6xx` codes.
    pub fn is_final(self) -> bool {
        matches!(self.0, 200..=699)
    }

    /// Returns `true` for `2xx` codes.
    pub fn is_success(self) -> bool {
        matches!(self.0, 200..=299)
    }

    /// The default reason phrase for this code.
    pub fn reason(self) -> &'static str {
        match self.0 {
            100 => "Trying",
            180 => "Ringing",
            181 => "Call Is Being Forwarded",
            183 => "Session Progress",
            200 => "OK",
            202 => "Accepted",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            420 => "Bad Extension",
            421 => "Extension Required",
            480 => "Temporarily Unavailable",
            481 => "Call/Transaction Does Not Exist",
            486 => "Busy Here",
            487 => "Request Terminated",
            500 => "Server Internal Error",
            501 => "Not Implemented",
            503 => "Service Unavailable",
            513 => "Message Too Large",
            600 => "Busy Everywhere",
            603 => "Decline",
            _ => "Unknown",
        }
    }
}

impl From<i32> for StatusCode {
    fn from(code: i32) -> Self {
        StatusCode(code as u16)
    }
}

/// A request target URI, kept opaque by the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Uri(pub String);

impl Uri {
    /// Creates an `Uri` from raw text.
    pub fn new<T: AsRef<str>>(s: T) -> Self {
        Uri(s.as_ref().to_string())
    }

    /// Returns the raw URI text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The start line of a SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    /// The request method.
    pub method: SipMethod,
    /// The request URI.
    pub uri: Uri,
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.uri, SIPV2)
    }
}

/// The start line of a SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    /// The status code.
    pub code: StatusCode,
    /// The reason phrase.
    pub reason: String,
}

impl StatusLine {
    /// Creates a new `StatusLine`.
    pub fn new(code: StatusCode, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", SIPV2, self.code.0, self.reason)
    }
}

/// An SIP request message.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// The request line.
    pub req_line: RequestLine,
    /// The message headers.
    pub headers: Headers,
    /// The message body.
    pub body: Option<Bytes>,
}

impl Request {
    /// Creates a new request with empty headers and no body.
    pub fn new(method: SipMethod, uri: Uri) -> Self {
        Self {
            req_line: RequestLine { method, uri },
            headers: Headers::new(),
            body: None,
        }
    }

    /// Returns the request method.
    pub fn method(&self) -> &SipMethod {
        &self.req_line.method
    }
}

/// An SIP response message.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The status line.
    pub status_line: StatusLine,
    /// The message headers.
    pub headers: Headers,
    /// The message body.
    pub body: Option<Bytes>,
}

impl Response {
    /// Creates a new response with empty headers and no body.
    pub fn new(status_line: StatusLine) -> Self {
        Self {
            status_line,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Returns the status code.
    pub fn code(&self) -> StatusCode {
        self.status_line.code
    }

    /// Returns the reason phrase.
    pub fn reason(&self) -> &str {
        &self.status_line.reason
    }
}

/// A parsed SIP message, either request or response.
#[derive(Debug, Clone)]
pub enum SipMsg {
    /// A request.
    Request(Request),
    /// A response.
    Response(Response),
}

impl SipMsg {
    /// Returns the message headers.
    pub fn headers(&self) -> &Headers {
        match self {
            SipMsg::Request(req) => &req.headers,
            SipMsg::Response(res) => &res.headers,
        }
    }

    /// Returns the message headers mutably.
    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMsg::Request(req) => &mut req.headers,
            SipMsg::Response(res) => &mut res.headers,
        }
    }

    /// Returns `true` if this is a request.
    pub fn is_request(&self) -> bool {
        matches!(self, SipMsg::Request(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port_parse() {
        let hp: HostPort = "127.0.0.1:5060".parse().unwrap();
        assert_eq!(hp.host, Host::IpAddr("127.0.0.1".parse().unwrap()));
        assert_eq!(hp.port, Some(5060));

        let hp: HostPort = "biloxi.com".parse().unwrap();
        assert_eq!(hp.host, Host::DomainName("biloxi.com".into()));
        assert_eq!(hp.port, None);

        let hp: HostPort = "[::1]:5061".parse().unwrap();
        assert_eq!(hp.host, Host::IpAddr("::1".parse().unwrap()));
        assert_eq!(hp.port, Some(5061));
    }

    #[test]
    fn test_method_fold() {
        assert_eq!(SipMethod::Ack.folded(), SipMethod::Invite);
        assert_eq!(SipMethod::Bye.folded(), SipMethod::Bye);
    }

    #[test]
    fn test_status_code() {
        assert!(StatusCode(180).is_provisional());
        assert!(StatusCode(200).is_final());
        assert!(!StatusCode(200).is_provisional());
        assert_eq!(StatusCode::BUSY_HERE.reason(), "Busy Here");
    }
}
