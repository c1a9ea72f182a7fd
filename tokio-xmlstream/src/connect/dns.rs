use hickory_resolver::{
    config::LookupIpStrategy, name_server::TokioConnectionProvider, IntoName, TokioAsyncResolver,
};
use log::debug;
use std::net::{IpAddr, SocketAddr};

use crate::Error;

/// How to obtain address candidates for a connection attempt.
///
/// Resolution is lazy: the connection loop asks for a fresh candidate list
/// only when its previous list is exhausted, and consumes one candidate per
/// attempt.
#[derive(Clone, Debug)]
pub enum DnsConfig {
    /// Use SRV records to find server host
    UseSrv {
        /// Hostname to resolve
        host: String,
        /// SRV service label, eg. _xmpp-client._tcp
        srv: String,
        /// When SRV resolution fails what port to use
        fallback_port: u16,
    },

    /// Manually define server host and port
    NoSrv {
        /// Server host name
        host: String,
        /// Server port
        port: u16,
    },

    /// Manually define IP: port
    Addr {
        /// IP:port
        addr: String,
    },
}

impl std::fmt::Display for DnsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UseSrv { host, .. } => write!(f, "{}", host),
            Self::NoSrv { host, port } => write!(f, "{}:{}", host, port),
            Self::Addr { addr } => write!(f, "{}", addr),
        }
    }
}

impl DnsConfig {
    /// Constructor for DnsConfig::UseSrv variant
    pub fn srv(host: &str, srv: &str, fallback_port: u16) -> Self {
        Self::UseSrv {
            host: host.to_string(),
            srv: srv.to_string(),
            fallback_port,
        }
    }

    /// Constructor for DnsConfig::NoSrv variant
    pub fn no_srv(host: &str, port: u16) -> Self {
        Self::NoSrv {
            host: host.to_string(),
            port,
        }
    }

    /// Constructor for DnsConfig::Addr variant
    pub fn addr(addr: &str) -> Self {
        Self::Addr {
            addr: addr.to_string(),
        }
    }

    /// Resolves this configuration to an ordered candidate list.
    pub async fn candidates(&self, prefer_ipv6: bool) -> Result<Vec<SocketAddr>, Error> {
        match self {
            Self::UseSrv {
                host,
                srv,
                fallback_port,
            } => Self::resolve_srv(host, srv, *fallback_port, prefer_ipv6).await,
            Self::NoSrv { host, port } => Self::resolve_host(host, *port, prefer_ipv6).await,
            Self::Addr { addr } => {
                let addr: SocketAddr = addr.parse()?;
                Ok(vec![addr])
            }
        }
    }

    async fn resolve_srv(
        host: &str,
        srv: &str,
        fallback_port: u16,
        prefer_ipv6: bool,
    ) -> Result<Vec<SocketAddr>, Error> {
        let ascii_domain = idna::domain_to_ascii(host)?;

        if let Ok(ip) = ascii_domain.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, fallback_port)]);
        }

        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;

        let srv_domain = format!("{}.{}.", srv, ascii_domain).into_name()?;
        let srv_records = resolver.srv_lookup(srv_domain.clone()).await.ok();

        match srv_records {
            Some(lookup) => {
                let mut records: Vec<_> = lookup.iter().collect();
                // Lowest priority first; heavier weights first within a
                // priority.
                records.sort_by_key(|r| (r.priority(), core::cmp::Reverse(r.weight())));
                let mut out = Vec::new();
                for record in records {
                    debug!("SRV candidate for {srv_domain}: {record}");
                    match Self::resolve_host(&record.target().to_ascii(), record.port(), prefer_ipv6)
                        .await
                    {
                        Ok(addrs) => out.extend(addrs),
                        Err(e) => debug!("skipping SRV target {}: {}", record.target(), e),
                    }
                }
                if out.is_empty() {
                    return Err(Error::Disconnected);
                }
                Ok(out)
            }
            None => {
                // SRV lookup error, retry with the bare hostname
                debug!("no SRV records for {host}, using {host}:{fallback_port}");
                Self::resolve_host(host, fallback_port, prefer_ipv6).await
            }
        }
    }

    async fn resolve_host(
        host: &str,
        port: u16,
        prefer_ipv6: bool,
    ) -> Result<Vec<SocketAddr>, Error> {
        let ascii_domain = idna::domain_to_ascii(host)?;

        if let Ok(ip) = ascii_domain.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let (config, mut options) = hickory_resolver::system_conf::read_system_conf()?;
        options.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        let resolver = TokioAsyncResolver::new(config, options, TokioConnectionProvider::default());

        let ips = resolver.lookup_ip(ascii_domain).await?;
        let mut addrs: Vec<SocketAddr> = ips
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect();
        // Stable sort keeps resolver order within each family.
        addrs.sort_by_key(|addr| addr.is_ipv6() != prefer_ipv6);
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_addr_needs_no_resolver() {
        let config = DnsConfig::addr("127.0.0.1:5222");
        let addrs = config.candidates(false).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:5222".parse().unwrap()]);
    }

    #[tokio::test]
    async fn ip_literal_host_short_circuits() {
        let config = DnsConfig::no_srv("::1", 5223);
        let addrs = config.candidates(true).await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_ipv6());
        assert_eq!(addrs[0].port(), 5223);
    }

    #[tokio::test]
    async fn bad_literal_is_reported() {
        let config = DnsConfig::addr("not-an-address");
        assert!(matches!(
            config.candidates(false).await,
            Err(Error::Addr(_))
        ));
    }

    #[test]
    fn proto_errors_map_into_dns_variant() {
        // SRV name assembly bubbles resolver protocol errors up as-is.
        let proto = hickory_resolver::proto::error::ProtoError::from("bad srv name");
        assert!(matches!(Error::from(proto), Error::Dns(_)));
    }
}
