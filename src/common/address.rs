//! Address type for network connections

use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Create from socket address
    pub fn socket(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }

    /// Parse a `host:port` string, as found in a CONNECT request target.
    ///
    /// The port is mandatory; a CONNECT target without one is malformed.
    pub fn parse_host_port(s: &str) -> Result<Address> {
        if let Ok(addr) = s.parse() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("missing port in {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("invalid port in {}", s)))?;

        // Remove brackets from IPv6
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::InvalidAddress(format!("missing host in {}", s)));
        }

        Ok(Address::Domain(host.to_string(), port))
    }

    /// Parse a listen address string (`ip:port` or `host:port`)
    pub fn parse_listen(s: &str) -> Result<Address> {
        if let Ok(addr) = s.parse() {
            return Ok(Address::Socket(addr));
        }

        if let Some((host, port)) = s.rsplit_once(':') {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid port in listen address: {}", s)))?;
            if let Ok(ip) = host.parse() {
                return Ok(Address::Socket(SocketAddr::new(ip, port)));
            }
            return Ok(Address::Domain(host.to_string(), port));
        }

        Err(Error::Config(format!("invalid listen address: {}", s)))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_domain() {
        let addr = Address::parse_host_port("echo.test:9").unwrap();
        assert_eq!(addr, Address::Domain("echo.test".to_string(), 9));
        assert_eq!(addr.to_string(), "echo.test:9");
    }

    #[test]
    fn parse_host_port_socket() {
        let addr = Address::parse_host_port("127.0.0.1:8080").unwrap();
        assert_eq!(addr.port(), 8080);
        assert_eq!(addr.host(), "127.0.0.1");
    }

    #[test]
    fn parse_host_port_requires_port() {
        assert!(Address::parse_host_port("example.com").is_err());
        assert!(Address::parse_host_port("example.com:http").is_err());
        assert!(Address::parse_host_port(":443").is_err());
    }

    #[test]
    fn parse_host_port_ipv6() {
        let addr = Address::parse_host_port("[::1]:443").unwrap();
        assert_eq!(addr.port(), 443);
    }

    #[test]
    fn parse_listen_accepts_unresolved_host() {
        let addr = Address::parse_listen("localhost:3128").unwrap();
        assert_eq!(addr, Address::Domain("localhost".to_string(), 3128));
        assert!(Address::parse_listen("3128").is_err());
    }
}
