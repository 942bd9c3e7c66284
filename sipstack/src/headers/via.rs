use core::fmt;
use std::net::IpAddr;

use crate::error::{Result, SipParserError};
use crate::message::{Host, HostPort, TransportKind, SIPV2};

const MADDR_PARAM: &str = "maddr";
const BRANCH_PARAM: &str = "branch";
const TTL_PARAM: &str = "ttl";
const RPORT_PARAM: &str = "rport";
const RECEIVED_PARAM: &str = "received";

/// The RFC 3261 magic cookie every conformant branch starts with.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// The `rport` Via parameter per RFC 3581.
///
/// A client asks for the response port by sending the parameter without a
/// value; the server fills in the observed source port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rport {
    /// Parameter absent.
    #[default]
    Unset,
    /// Parameter present without a value.
    Requested,
    /// Parameter carrying the observed source port.
    Set(u16),
}

/// The `Via` SIP header.
///
/// Indicates the path taken by the request so far and the
/// path that should be followed in routing responses.
///
/// # Examples
/// ```
/// # use sipstack::headers::Via;
///
/// let via = Via::parse("SIP/2.0/UDP server10.biloxi.com;branch=z9hG4bKnashds8").unwrap();
///
/// assert_eq!(via.branch(), Some("z9hG4bKnashds8"));
/// ```
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct Via {
    transport: TransportKind,
    sent_by: HostPort,
    ttl: Option<u8>,
    maddr: Option<Host>,
    received: Option<IpAddr>,
    branch: Option<String>,
    rport: Rport,
    params: Vec<(String, Option<String>)>,
}

impl Via {
    /// Creates a new `Via` hop for the given transport, sent-by and branch.
    pub fn new(transport: TransportKind, sent_by: HostPort, branch: Option<&str>) -> Self {
        Self {
            transport,
            sent_by,
            branch: branch.map(str::to_string),
            ..Default::default()
        }
    }

    /// Parses the header value, i.e. everything after `Via:`.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let rest = value
            .strip_prefix(SIPV2)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| SipParserError::new("Via does not start with SIP/2.0/"))?;

        let (transport, rest) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| SipParserError::new("Via has no sent-by"))?;
        let transport = TransportKind::from(transport);

        let mut parts = rest.trim().split(';');
        let sent_by: HostPort = parts
            .next()
            .ok_or_else(|| SipParserError::new("Via has no sent-by"))?
            .trim()
            .parse()?;

        let mut via = Via {
            transport,
            sent_by,
            ..Default::default()
        };

        for param in parts {
            let (name, val) = match param.split_once('=') {
                Some((name, val)) => (name.trim(), Some(val.trim())),
                None => (param.trim(), None),
            };
            match (name, val) {
                (BRANCH_PARAM, Some(val)) => via.branch = Some(val.to_string()),
                (RECEIVED_PARAM, Some(val)) => {
                    via.received = val.parse().ok();
                }
                (RPORT_PARAM, Some(val)) => {
                    via.rport = val.parse().map(Rport::Set).unwrap_or(Rport::Requested);
                }
                (RPORT_PARAM, None) => via.rport = Rport::Requested,
                (MADDR_PARAM, Some(val)) => via.maddr = val.parse().ok(),
                (TTL_PARAM, Some(val)) => via.ttl = val.parse().ok(),
                (name, val) => via
                    .params
                    .push((name.to_string(), val.map(str::to_string))),
            }
        }

        Ok(via)
    }

    /// Set the `received` parameter.
    pub fn set_received(&mut self, received: IpAddr) {
        self.received = Some(received);
    }

    /// Returns the `received` parameter.
    pub fn received(&self) -> Option<IpAddr> {
        self.received
    }

    /// Returns the `transport`.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Set the `transport`.
    pub fn set_transport(&mut self, transport: TransportKind) {
        self.transport = transport;
    }

    /// Returns the `rport` parameter.
    pub fn rport(&self) -> Rport {
        self.rport
    }

    /// Fill in the `rport` parameter with the observed source port.
    pub fn set_rport(&mut self, port: u16) {
        self.rport = Rport::Set(port);
    }

    /// Returns the branch parameter.
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    /// Set the branch parameter.
    pub fn set_branch<T: AsRef<str>>(&mut self, branch: T) {
        self.branch = Some(branch.as_ref().to_string());
    }

    /// Returns `true` if the branch carries the RFC 3261 magic cookie with a
    /// non-empty suffix.
    pub fn is_rfc3261_branch(&self) -> bool {
        matches!(
            self.branch.as_deref(),
            Some(branch) if branch.len() > BRANCH_MAGIC_COOKIE.len()
                && branch.starts_with(BRANCH_MAGIC_COOKIE)
        )
    }

    /// Set the sent_by field.
    pub fn set_sent_by(&mut self, sent_by: HostPort) {
        self.sent_by = sent_by;
    }

    /// Returns the sent_by field.
    pub fn sent_by(&self) -> &HostPort {
        &self.sent_by
    }

    /// Returns the `maddr` parameter.
    pub fn maddr(&self) -> Option<&Host> {
        self.maddr.as_ref()
    }

    /// Returns the `ttl` parameter.
    pub fn ttl(&self) -> Option<u8> {
        self.ttl
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", SIPV2, self.transport, self.sent_by)?;

        match self.rport {
            Rport::Unset => (),
            Rport::Requested => write!(f, ";rport")?,
            Rport::Set(port) => write!(f, ";rport={}", port)?,
        }
        if let Some(ttl) = self.ttl {
            write!(f, ";ttl={}", ttl)?;
        }
        if let Some(maddr) = &self.maddr {
            write!(f, ";maddr={}", maddr)?;
        }
        if let Some(received) = self.received {
            write!(f, ";received={}", received)?;
        }
        if let Some(branch) = &self.branch {
            write!(f, ";branch={}", branch)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let via =
            Via::parse("SIP/2.0/UDP 127.0.0.1:5060;rport;branch=z9hG4bK3060200;received=10.0.0.1")
                .unwrap();

        assert_eq!(via.transport(), TransportKind::Udp);
        assert_eq!(via.sent_by().port, Some(5060));
        assert_eq!(via.rport(), Rport::Requested);
        assert_eq!(via.branch(), Some("z9hG4bK3060200"));
        assert_eq!(via.received(), Some("10.0.0.1".parse().unwrap()));
        assert!(via.is_rfc3261_branch());
    }

    #[test]
    fn test_parse_maddr() {
        let via = Via::parse("SIP/2.0/UDP biloxi.com;maddr=224.0.1.75;ttl=1;branch=z9hG4bKx").unwrap();

        assert_eq!(via.maddr().unwrap().as_ip(), Some("224.0.1.75".parse().unwrap()));
        assert_eq!(via.ttl(), Some(1));
    }

    #[test]
    fn test_rfc2543_branch() {
        let via = Via::parse("SIP/2.0/UDP biloxi.com:5060;branch=oldstyle").unwrap();
        assert!(!via.is_rfc3261_branch());

        let via = Via::parse("SIP/2.0/UDP biloxi.com:5060").unwrap();
        assert!(!via.is_rfc3261_branch());
    }

    #[test]
    fn test_roundtrip() {
        let text = "SIP/2.0/TCP 127.0.0.1:5060;rport=5080;received=127.0.0.1;branch=z9hG4bKa";
        let via = Via::parse(text).unwrap();

        assert_eq!(via.to_string(), text);
    }
}
