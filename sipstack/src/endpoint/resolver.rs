//! Response address resolution.
//!
//! Implements the precedence of RFC 3261 §18.2.2, RFC 3263 §5 and
//! RFC 3581: maddr, then received (with rport), then an IP literal
//! sent-by, then A/AAAA on an explicit port, then SRV. The first rule
//! that fully resolves decides; DNS is only consulted when the earlier
//! rules yield nothing.

use std::net::SocketAddr;

use util::DnsResolver;

use crate::error::Result;
use crate::headers::{Rport, Via};
use crate::message::{Host, TransportKind};
use crate::transport::srv_name;

/// Resolver
#[derive(Default)]
pub struct Resolver {
    dns_resolver: DnsResolver,
}

impl Resolver {
    /// Produces the ordered response address candidates for the topmost
    /// Via of a request.
    ///
    /// The caller stops pulling on the first successful send.
    pub async fn response_candidates(
        &self,
        via: &Via,
        reliable: bool,
    ) -> Result<Vec<SocketAddr>> {
        let kind = via.transport();
        let default_port = kind.get_port();
        let via_port = via.sent_by().port;

        // 18.2.2: for unreliable transports a multicast maddr wins and
        // allows no fallback.
        if !reliable {
            if let Some(maddr) = via.maddr().and_then(Host::as_ip) {
                let port = via_port.unwrap_or(default_port);
                return Ok(vec![SocketAddr::new(maddr, port)]);
            }
        }

        // RFC 3581: received plus rport names the NAT binding the request
        // came through.
        if let Some(received) = via.received() {
            let port = match via.rport() {
                Rport::Set(rport) if !reliable => rport,
                _ => via_port.unwrap_or(default_port),
            };
            return Ok(vec![SocketAddr::new(received, port)]);
        }

        match (&via.sent_by().host, via_port) {
            (Host::IpAddr(ip), port) => Ok(vec![SocketAddr::new(*ip, port.unwrap_or(default_port))]),
            (Host::DomainName(domain), Some(port)) => {
                let ips = self.dns_resolver.resolve_all(domain).await?;

                Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
            }
            (host @ Host::DomainName(_), None) => self.srv_candidates(kind, host).await,
        }
    }

    async fn srv_candidates(&self, kind: TransportKind, host: &Host) -> Result<Vec<SocketAddr>> {
        let name = srv_name(kind, host);

        let targets = match self.dns_resolver.resolve_srv(&name).await {
            Ok(targets) if !targets.is_empty() => targets,
            // RFC 3263: no SRV records means plain A/AAAA on the default
            // port.
            _ => {
                let Host::DomainName(domain) = host else {
                    return Ok(vec![]);
                };
                let ips = self.dns_resolver.resolve_all(domain).await?;
                return Ok(ips
                    .into_iter()
                    .map(|ip| SocketAddr::new(ip, kind.get_port()))
                    .collect());
            }
        };

        let mut candidates = Vec::new();
        for target in targets {
            match self.dns_resolver.resolve_all(&target.target).await {
                Ok(ips) => {
                    candidates.extend(ips.into_iter().map(|ip| SocketAddr::new(ip, target.port)));
                }
                Err(err) => {
                    log::debug!("Skipping SRV target {}: {}", target.target, err);
                }
            }
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Via;

    #[tokio::test]
    async fn test_maddr_wins_on_unreliable() {
        let resolver = Resolver::default();
        let via =
            Via::parse("SIP/2.0/UDP h.example.com:5070;maddr=224.0.1.75;received=10.0.0.1;branch=z9hG4bKa")
                .unwrap();

        let candidates = resolver.response_candidates(&via, false).await.unwrap();

        assert_eq!(candidates, vec!["224.0.1.75:5070".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_received_with_rport() {
        let resolver = Resolver::default();
        let via = Via::parse(
            "SIP/2.0/UDP h.example.com:5070;rport=5081;received=10.0.0.1;branch=z9hG4bKa",
        )
        .unwrap();

        let candidates = resolver.response_candidates(&via, false).await.unwrap();

        assert_eq!(candidates, vec!["10.0.0.1:5081".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_received_without_rport_uses_via_port() {
        let resolver = Resolver::default();
        let via =
            Via::parse("SIP/2.0/UDP h.example.com:5070;received=10.0.0.1;branch=z9hG4bKa").unwrap();

        let candidates = resolver.response_candidates(&via, false).await.unwrap();

        assert_eq!(candidates, vec!["10.0.0.1:5070".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_rport_ignored_on_reliable() {
        let resolver = Resolver::default();
        let via = Via::parse(
            "SIP/2.0/TCP h.example.com;rport=5081;received=10.0.0.1;branch=z9hG4bKa",
        )
        .unwrap();

        let candidates = resolver.response_candidates(&via, true).await.unwrap();

        assert_eq!(candidates, vec!["10.0.0.1:5060".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_ip_literal_sent_by() {
        let resolver = Resolver::default();
        let via = Via::parse("SIP/2.0/TLS 192.0.2.10;branch=z9hG4bKa").unwrap();

        let candidates = resolver.response_candidates(&via, true).await.unwrap();

        // TLS defaults to 5061.
        assert_eq!(candidates, vec!["192.0.2.10:5061".parse().unwrap()]);
    }
}
