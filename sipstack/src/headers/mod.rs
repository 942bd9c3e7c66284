//! The compact header set manipulated by the transport and transaction
//! layers.
//!
//! Everything the core does not need to understand is carried verbatim in
//! [`Header::Other`] and re-rendered untouched.

use core::fmt;

use enum_as_inner::EnumAsInner;

use crate::error::{Result, SipParserError};
use crate::message::SipMethod;

mod via;

pub use via::{Rport, Via, BRANCH_MAGIC_COOKIE};

/// The `From` or `To` SIP header.
///
/// The name-addr part is kept opaque; only the `tag` parameter is
/// interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FromTo {
    /// The display-name and URI part, verbatim.
    pub addr: String,
    /// The `tag` parameter.
    pub tag: Option<String>,
    /// Remaining parameters, verbatim.
    pub params: Vec<String>,
}

impl FromTo {
    /// Creates a `FromTo` from an addr spec and an optional tag.
    pub fn new<T: AsRef<str>>(addr: T, tag: Option<&str>) -> Self {
        Self {
            addr: addr.as_ref().to_string(),
            tag: tag.map(str::to_string),
            params: vec![],
        }
    }

    /// Parses the header value.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        // Parameters start after the closing '>' when a name-addr is used,
        // otherwise at the first ';'.
        let param_start = match value.find('>') {
            Some(end) => value[end..].find(';').map(|i| end + i),
            None => value.find(';'),
        };

        let (addr, params_str) = match param_start {
            Some(i) => (&value[..i], &value[i + 1..]),
            None => (value, ""),
        };

        let mut hdr = FromTo {
            addr: addr.trim().to_string(),
            ..Default::default()
        };

        for param in params_str.split(';').filter(|p| !p.is_empty()) {
            match param.trim().strip_prefix("tag=") {
                Some(tag) => hdr.tag = Some(tag.to_string()),
                None => hdr.params.push(param.trim().to_string()),
            }
        }

        Ok(hdr)
    }

    /// Returns the `tag` parameter.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Set the `tag` parameter.
    pub fn set_tag<T: AsRef<str>>(&mut self, tag: T) {
        self.tag = Some(tag.as_ref().to_string());
    }
}

impl fmt::Display for FromTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={}", tag)?;
        }
        for param in &self.params {
            write!(f, ";{}", param)?;
        }
        Ok(())
    }
}

/// The `Call-ID` SIP header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CallId(pub String);

impl CallId {
    /// Creates a new `CallId`.
    pub fn new<T: AsRef<str>>(id: T) -> Self {
        CallId(id.as_ref().to_string())
    }

    /// Returns the Call-ID value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `CSeq` SIP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    /// The sequence number.
    pub cseq: u32,
    /// The request method.
    pub method: SipMethod,
}

impl CSeq {
    /// Creates a new `CSeq`.
    pub fn new(cseq: u32, method: SipMethod) -> Self {
        Self { cseq, method }
    }

    /// Returns the method.
    pub fn method(&self) -> &SipMethod {
        &self.method
    }

    /// Parses the header value.
    pub fn parse(value: &str) -> Result<Self> {
        let (num, method) = value
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| SipParserError::new("CSeq has no method"))?;
        let cseq = num
            .parse()
            .map_err(|_| SipParserError::new("Invalid CSeq number"))?;

        Ok(Self {
            cseq,
            method: method.trim().into(),
        })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.cseq, self.method)
    }
}

/// The `Timestamp` SIP header (RFC 3261 §20.38).
///
/// Requests carry the client send time; responses echo it plus the delay
/// the server spent before answering.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Timestamp {
    /// Seconds since the UNIX epoch at client send time.
    pub value: f64,
    /// Server delay, in seconds.
    pub delay: Option<f64>,
}

impl Timestamp {
    /// Creates a `Timestamp` without delay.
    pub fn new(value: f64) -> Self {
        Self { value, delay: None }
    }

    /// Parses the header value.
    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.split_whitespace();
        let value = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| SipParserError::new("Invalid Timestamp"))?;
        let delay = parts.next().and_then(|v| v.parse().ok());

        Ok(Self { value, delay })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.value)?;
        if let Some(delay) = self.delay {
            write!(f, " {:.3}", delay)?;
        }
        Ok(())
    }
}

/// A `Route` or `Record-Route` entry, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteEntry(pub String);

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One SIP header.
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Header {
    /// The `Via` header.
    Via(Via),
    /// The `From` header.
    From(FromTo),
    /// The `To` header.
    To(FromTo),
    /// The `Call-ID` header.
    CallId(CallId),
    /// The `CSeq` header.
    CSeq(CSeq),
    /// The `Max-Forwards` header.
    MaxForwards(u32),
    /// The `Content-Length` header.
    ContentLength(u64),
    /// The `Timestamp` header.
    Timestamp(Timestamp),
    /// A `Route` header.
    Route(RouteEntry),
    /// A `Record-Route` header.
    RecordRoute(RouteEntry),
    /// Any header the core carries verbatim.
    Other {
        /// The header name.
        name: String,
        /// The raw header value.
        value: String,
    },
}

impl Header {
    /// Parses one `name: value` pair into a typed header where the core
    /// understands the name, and into [`Header::Other`] everywhere else.
    pub fn parse(name: &str, value: &str) -> Result<Header> {
        let header = match name.to_ascii_lowercase().as_str() {
            "via" | "v" => Header::Via(Via::parse(value)?),
            "from" | "f" => Header::From(FromTo::parse(value)?),
            "to" | "t" => Header::To(FromTo::parse(value)?),
            "call-id" | "i" => Header::CallId(CallId::new(value.trim())),
            "cseq" => Header::CSeq(CSeq::parse(value)?),
            "max-forwards" => Header::MaxForwards(
                value
                    .trim()
                    .parse()
                    .map_err(|_| SipParserError::new("Invalid Max-Forwards"))?,
            ),
            "content-length" | "l" => Header::ContentLength(
                value
                    .trim()
                    .parse()
                    .map_err(|_| SipParserError::new("Invalid Content-Length"))?,
            ),
            "timestamp" => Header::Timestamp(Timestamp::parse(value)?),
            "route" => Header::Route(RouteEntry(value.trim().to_string())),
            "record-route" => Header::RecordRoute(RouteEntry(value.trim().to_string())),
            _ => Header::Other {
                name: name.to_string(),
                value: value.trim().to_string(),
            },
        };

        Ok(header)
    }

    /// Returns the canonical header name.
    pub fn name(&self) -> &str {
        match self {
            Header::Via(_) => "Via",
            Header::From(_) => "From",
            Header::To(_) => "To",
            Header::CallId(_) => "Call-ID",
            Header::CSeq(_) => "CSeq",
            Header::MaxForwards(_) => "Max-Forwards",
            Header::ContentLength(_) => "Content-Length",
            Header::Timestamp(_) => "Timestamp",
            Header::Route(_) => "Route",
            Header::RecordRoute(_) => "Record-Route",
            Header::Other { name, .. } => name,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.name())?;
        match self {
            Header::Via(via) => write!(f, "{}", via),
            Header::From(from) => write!(f, "{}", from),
            Header::To(to) => write!(f, "{}", to),
            Header::CallId(call_id) => write!(f, "{}", call_id),
            Header::CSeq(cseq) => write!(f, "{}", cseq),
            Header::MaxForwards(hops) => write!(f, "{}", hops),
            Header::ContentLength(len) => write!(f, "{}", len),
            Header::Timestamp(ts) => write!(f, "{}", ts),
            Header::Route(route) => write!(f, "{}", route),
            Header::RecordRoute(route) => write!(f, "{}", route),
            Header::Other { value, .. } => f.write_str(value),
        }
    }
}

/// An ordered header multimap.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// Creates an empty header list.
    pub fn new() -> Self {
        Self(vec![])
    }

    /// Creates an empty header list with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// Appends a header.
    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    /// Inserts a header at the given position.
    pub fn insert(&mut self, index: usize, header: Header) {
        self.0.insert(index, header);
    }

    /// Removes and returns the header at the given position.
    pub fn remove(&mut self, index: usize) -> Header {
        self.0.remove(index)
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the headers.
    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    /// Iterates mutably over the headers.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Header> {
        self.0.iter_mut()
    }

    /// Retains only headers matching the predicate.
    pub fn retain<F: FnMut(&Header) -> bool>(&mut self, f: F) {
        self.0.retain(f);
    }

    /// Returns the topmost `Via` header.
    pub fn top_via(&self) -> Option<&Via> {
        self.iter().find_map(Header::as_via)
    }

    /// Returns the topmost `Via` header mutably.
    pub fn top_via_mut(&mut self) -> Option<&mut Via> {
        self.iter_mut().find_map(Header::as_via_mut)
    }

    /// Returns the `From` header.
    pub fn from_hdr(&self) -> Option<&FromTo> {
        self.iter().find_map(Header::as_from)
    }

    /// Returns the `To` header.
    pub fn to_hdr(&self) -> Option<&FromTo> {
        self.iter().find_map(Header::as_to)
    }

    /// Returns the `To` header mutably.
    pub fn to_hdr_mut(&mut self) -> Option<&mut FromTo> {
        self.iter_mut().find_map(Header::as_to_mut)
    }

    /// Returns the `Call-ID` header.
    pub fn call_id(&self) -> Option<&CallId> {
        self.iter().find_map(Header::as_call_id)
    }

    /// Returns the `CSeq` header.
    pub fn cseq(&self) -> Option<&CSeq> {
        self.iter().find_map(Header::as_c_seq)
    }

    /// Returns the `Content-Length` header value.
    pub fn content_length(&self) -> Option<u64> {
        self.iter().find_map(|h| h.as_content_length().copied())
    }

    /// Returns the `Timestamp` header.
    pub fn timestamp(&self) -> Option<&Timestamp> {
        self.iter().find_map(Header::as_timestamp)
    }

    /// Returns the `Max-Forwards` header value.
    pub fn max_forwards(&self) -> Option<u32> {
        self.iter().find_map(|h| h.as_max_forwards().copied())
    }

    /// Replaces any existing header of the same variant kind, or appends.
    pub fn set(&mut self, header: Header) {
        let name = header.name().to_string();
        match self
            .0
            .iter_mut()
            .find(|h| h.name().eq_ignore_ascii_case(&name))
        {
            Some(slot) => *slot = header,
            None => self.0.push(header),
        }
    }
}

impl Extend<Header> for Headers {
    fn extend<T: IntoIterator<Item = Header>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
