use serde::{Deserialize, Serialize};
use std::{
    fmt::Display,
    io,
    net::{SocketAddr, ToSocketAddrs},
    num::ParseIntError,
    str::FromStr,
    vec,
};
use thiserror::Error;

/// Identity of a node: the host and port of its unicast listener.
///
/// Ordering is lexicographic on the host, then numeric on the port. The ring and the
/// election both rely on this ordering, so every node must agree on it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl ToSocketAddrs for NodeAddress {
    type Iter = vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> io::Result<Self::Iter> {
        (self.host.as_str(), self.port).to_socket_addrs()
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum AddressParseError {
    #[error("Address {0:?} is missing a ':' separated port")]
    MissingPort(String),
    #[error("Address {0:?} has an empty host")]
    EmptyHost(String),
    #[error("Failed to parse port of address {address:?}")]
    Port {
        address: String,
        source: ParseIntError,
    },
}

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError::MissingPort(value.to_owned()))?;
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost(value.to_owned()));
        }
        let port = port.parse().map_err(|e| AddressParseError::Port {
            address: value.to_owned(),
            source: e,
        })?;
        Ok(Self::new(host, port))
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Unwrap is ok in test code")]
mod tests {
    use super::*;

    #[test]
    fn orders_by_host_then_numeric_port() {
        let mut addresses: Vec<NodeAddress> = ["10.0.0.2:80", "10.0.0.1:9000", "10.0.0.1:10000"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        addresses.sort();
        assert_eq!(
            addresses,
            vec![
                NodeAddress::new("10.0.0.1", 9000),
                NodeAddress::new("10.0.0.1", 10000),
                NodeAddress::new("10.0.0.2", 80),
            ]
        );
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            "localhost".parse::<NodeAddress>(),
            Err(AddressParseError::MissingPort(_))
        ));
        assert!(matches!(
            ":80".parse::<NodeAddress>(),
            Err(AddressParseError::EmptyHost(_))
        ));
        assert!(matches!(
            "localhost:http".parse::<NodeAddress>(),
            Err(AddressParseError::Port { .. })
        ));
    }

    #[test]
    fn display_matches_parse_input() {
        let address: NodeAddress = "192.168.1.7:10001".parse().unwrap();
        assert_eq!(address.to_string(), "192.168.1.7:10001");
    }
}
