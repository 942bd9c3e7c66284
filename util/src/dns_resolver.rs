//! DNS resolve with the `DnsResolver` type.

use std::io;
use std::net::IpAddr;

use hickory_resolver::TokioResolver;

/// A DNS resolver backed by [hickory-dns](https://github.com/hickory-dns/hickory-dns).
pub struct DnsResolver {
    dns_resolver: TokioResolver,
}

/// One target of an SRV record set, already expanded with its port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    /// The record priority.
    pub priority: u16,
    /// The record weight.
    pub weight: u16,
    /// The port clients must connect to.
    pub port: u16,
    /// The target host name.
    pub target: String,
}

impl DnsResolver {
    /// Resolve a single.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, io::Error> {
        self.resolve_all(host)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| io::Error::other(format!("No address found for {}", host)))
    }

    /// Resolve a all.
    pub async fn resolve_all(&self, host: &str) -> Result<Vec<IpAddr>, io::Error> {
        let result = self
            .dns_resolver
            .lookup_ip(host)
            .await
            .map_err(|err| io::Error::other(format!("Failed to lookup dns: {}", err)))?;

        let addresses = result.iter().collect();

        Ok(addresses)
    }

    /// Resolve an SRV record set.
    ///
    /// Targets come back ordered by priority ascending, then weight
    /// descending, then target name ascending.
    pub async fn resolve_srv(&self, name: &str) -> Result<Vec<SrvTarget>, io::Error> {
        let result = self
            .dns_resolver
            .srv_lookup(name)
            .await
            .map_err(|err| io::Error::other(format!("Failed to lookup srv: {}", err)))?;

        let mut targets: Vec<SrvTarget> = result
            .iter()
            .map(|srv| SrvTarget {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: srv.target().to_utf8(),
            })
            .collect();

        targets.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.weight.cmp(&a.weight))
                .then(a.target.cmp(&b.target))
        });

        Ok(targets)
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self {
            dns_resolver: TokioResolver::builder_tokio()
                .expect("Failed to get DNS resolver")
                .build(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_srv_ordering() {
        let mut targets = vec![
            SrvTarget {
                priority: 20,
                weight: 0,
                port: 5060,
                target: "backup.example.com.".into(),
            },
            SrvTarget {
                priority: 10,
                weight: 40,
                port: 5060,
                target: "b.example.com.".into(),
            },
            SrvTarget {
                priority: 10,
                weight: 60,
                port: 5060,
                target: "a.example.com.".into(),
            },
        ];

        targets.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.weight.cmp(&a.weight))
                .then(a.target.cmp(&b.target))
        });

        assert_eq!(targets[0].target, "a.example.com.");
        assert_eq!(targets[1].target, "b.example.com.");
        assert_eq!(targets[2].target, "backup.example.com.");
    }
}
