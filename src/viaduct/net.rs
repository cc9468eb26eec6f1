use std::borrow::Cow;

/// Transport network of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// A host:port endpoint, either an upstream proxy or a tunnel target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub network: Network,
}

impl Destination {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            network: Network::Tcp,
        }
    }

    /// Parse `"host:port"` into a TCP destination.
    pub fn parse_host_port(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        let (host, port) = split_host_port(s)
            .ok_or_else(|| anyhow::anyhow!("invalid host:port address {s:?}"))?;
        if host.is_empty() {
            anyhow::bail!("invalid host:port address {s:?}");
        }
        Ok(Self::tcp(host, port))
    }

    /// `host:port` form used for dialing, cache keys and CONNECT authorities.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn split_host_port(s: &str) -> Option<(&str, u16)> {
    // Bracketed IPv6 first, then the plain `host:port` shorthand.
    if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let port = rest.strip_prefix(':')?.parse().ok()?;
        return Some((host, port));
    }
    let (host, port) = s.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some((host, port.parse().ok()?))
}

/// Normalize a bind/listen address.
///
/// Viaduct's config commonly uses the shorthand `":PORT"` to mean "bind on
/// all interfaces". Rust's `SocketAddr` parsing and Tokio bind APIs do not
/// accept `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_forms() {
        let d = Destination::parse_host_port("example.com:8443").unwrap();
        assert_eq!(d.host, "example.com");
        assert_eq!(d.port, 8443);
        assert_eq!(d.network, Network::Tcp);
        assert_eq!(d.authority(), "example.com:8443");

        let d = Destination::parse_host_port("[2001:db8::1]:443").unwrap();
        assert_eq!(d.host, "2001:db8::1");
        assert_eq!(d.port, 443);

        assert!(Destination::parse_host_port("no-port").is_err());
        assert!(Destination::parse_host_port(":443").is_err());
        assert!(Destination::parse_host_port("host:notaport").is_err());
    }

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }
}
