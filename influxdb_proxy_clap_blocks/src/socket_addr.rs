//! Config for socket addresses.
use std::{net::ToSocketAddrs, ops::Deref};

/// Socket address parsed from a CLI argument, resolving host names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketAddr(std::net::SocketAddr);

impl Deref for SocketAddr {
    type Target = std::net::SocketAddr;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for SocketAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SocketAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addrs = s
            .to_socket_addrs()
            .map_err(|e| format!("Cannot parse socket address '{s}': {e}"))?;
        addrs
            .next()
            .map(Self)
            .ok_or_else(|| format!("Found no addresses for '{s}'"))
    }
}

impl From<SocketAddr> for std::net::SocketAddr {
    fn from(addr: SocketAddr) -> Self {
        addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::FromStr;

    #[test]
    fn parses_ip_and_port() {
        let addr: std::net::SocketAddr = SocketAddr::from_str("0.0.0.0:7076").unwrap().into();
        assert_eq!(addr, std::net::SocketAddr::from(([0, 0, 0, 0], 7076)));
        assert_eq!(SocketAddr::from_str("0.0.0.0:7076").unwrap().to_string(), "0.0.0.0:7076");
    }

    #[test]
    fn resolves_localhost() {
        let addr = SocketAddr::from_str("localhost:8086").unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 8086);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            SocketAddr::from_str("not an address").unwrap_err(),
            "Cannot parse socket address 'not an address': invalid socket address",
        );
    }
}
