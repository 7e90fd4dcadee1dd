use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// How the host part of a [ConnDescriptor] is turned into addresses.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ResolveMode {
    /// Look the host up if it is not a literal address.
    Resolve,
    /// Treat the host as a literal address; never issue a lookup.
    NoResolve,
    /// Look the host up and report the results, but never connect.
    ResolveOnly,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum AddrFamily {
    Any,
    Ipv4,
    Ipv6,
}

impl AddrFamily {
    pub(crate) fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            AddrFamily::Any => true,
            AddrFamily::Ipv4 => addr.is_ipv4(),
            AddrFamily::Ipv6 => addr.is_ipv6(),
        }
    }
}

/// Direction of a peer, and also the key for the two process-level rate groups.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Token bucket configuration, in bytes per second. [RateLimit::UNLIMITED_RATE]
///  as a rate disables limiting for that direction.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct RateLimit {
    pub max_read_rate: u64,
    pub max_burst_read: u64,
    pub max_write_rate: u64,
    pub max_burst_write: u64,
}

impl RateLimit {
    pub const UNLIMITED_RATE: u64 = u64::MAX;

    pub const UNLIMITED: RateLimit = RateLimit {
        max_read_rate: Self::UNLIMITED_RATE,
        max_burst_read: Self::UNLIMITED_RATE,
        max_write_rate: Self::UNLIMITED_RATE,
        max_burst_write: Self::UNLIMITED_RATE,
    };
}

/// Per-connection policy knobs, supplied by the application as part of the
///  descriptor and preserved byte-for-byte across retries.
#[derive(Clone, Debug)]
pub struct ConnOptions {
    pub resolve_mode: ResolveMode,
    pub family: AddrFamily,
    pub initial_timeout: Duration,
    pub retry_interval: Duration,
    /// negative: no retries; zero: retry forever; positive: that many retries
    pub retry_count: i32,
    /// reconnect after a remote disconnect
    pub persistent: bool,
    pub rate_limit: RateLimit,
    pub write_high_water: usize,
    pub write_low_water: usize,
}

impl Default for ConnOptions {
    fn default() -> ConnOptions {
        ConnOptions {
            resolve_mode: ResolveMode::Resolve,
            family: AddrFamily::Any,
            initial_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(1),
            retry_count: -1,
            persistent: false,
            rate_limit: RateLimit::UNLIMITED,
            write_high_water: 1024 * 1024,
            write_low_water: 256 * 1024,
        }
    }
}

/// SOCKS5 username/password credentials (RFC 1929), meaningful on a
///  descriptor that is used as a proxy.
#[derive(Clone, Eq, PartialEq)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

impl Debug for ProxyAuth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProxyAuth{{username:{}}}", self.username)
    }
}

/// An application-supplied specification of a peer endpoint: where to connect
///  (or bind, or resolve) and the policy for doing so.
#[derive(Clone)]
pub struct ConnDescriptor {
    pub host: String,
    pub port: u16,
    pub proxy: Option<Box<ConnDescriptor>>,
    pub auth: Option<ProxyAuth>,
    pub options: ConnOptions,
}

impl ConnDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> ConnDescriptor {
        ConnDescriptor {
            host: host.into(),
            port,
            proxy: None,
            auth: None,
            options: ConnOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ConnOptions) -> ConnDescriptor {
        self.options = options;
        self
    }

    pub fn with_proxy(mut self, proxy: ConnDescriptor) -> ConnDescriptor {
        self.proxy = Some(Box::new(proxy));
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> ConnDescriptor {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// An unset descriptor is skipped by the admission loop.
    pub fn is_set(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    /// The literal socket address, if the host is one.
    pub fn literal_addr(&self) -> Option<SocketAddr> {
        self.host.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// A descriptor is a DNS descriptor when its host needs resolution.
    pub fn is_dns(&self) -> bool {
        self.literal_addr().is_none()
    }

    /// The descriptor for one concrete resolved address, carrying over the
    ///  policy options. Reported up alongside the requested descriptor.
    pub fn resolved_from(&self, addr: SocketAddr) -> ConnDescriptor {
        ConnDescriptor {
            host: addr.ip().to_string(),
            port: addr.port(),
            proxy: None,
            auth: None,
            options: self.options.clone(),
        }
    }
}

impl Debug for ConnDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.proxy {
            Some(proxy) => write!(f, "[{}:{} via {}:{}]", self.host, self.port, proxy.host, proxy.port),
            None => write!(f, "[{}:{}]", self.host, self.port),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_is_set() {
        assert!(ConnDescriptor::new("10.0.0.1", 8333).is_set());
        assert!(!ConnDescriptor::new("", 8333).is_set());
        assert!(!ConnDescriptor::new("10.0.0.1", 0).is_set());
    }

    #[test]
    fn test_literal_vs_dns() {
        assert!(!ConnDescriptor::new("10.0.0.1", 8333).is_dns());
        assert!(!ConnDescriptor::new("::1", 8333).is_dns());
        assert!(ConnDescriptor::new("peer.example", 8333).is_dns());

        let addr = ConnDescriptor::new("127.0.0.1", 8333).literal_addr();
        assert_eq!(addr, Some("127.0.0.1:8333".parse().unwrap()));
    }

    #[test]
    fn test_resolved_from_carries_options() {
        let mut options = ConnOptions::default();
        options.retry_count = 7;
        let desc = ConnDescriptor::new("peer.example", 8333).with_options(options);

        let resolved = desc.resolved_from("192.0.2.1:8333".parse().unwrap());
        assert_eq!(resolved.host, "192.0.2.1");
        assert_eq!(resolved.port, 8333);
        assert_eq!(resolved.options.retry_count, 7);
        assert!(resolved.proxy.is_none());
    }

    #[test]
    fn test_family_matches() {
        let v4: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let v6: SocketAddr = "[::1]:1".parse().unwrap();

        assert!(AddrFamily::Any.matches(&v4) && AddrFamily::Any.matches(&v6));
        assert!(AddrFamily::Ipv4.matches(&v4) && !AddrFamily::Ipv4.matches(&v6));
        assert!(AddrFamily::Ipv6.matches(&v6) && !AddrFamily::Ipv6.matches(&v4));
    }
}
