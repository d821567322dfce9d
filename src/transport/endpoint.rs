//! Transport endpoint type and URL grammar.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::utils::TsoError;

/// Transport protocols a channel may ride on. `Rrdma` connections are carried
/// over the same reliable stream transport in this implementation; the proto
/// tag is preserved end-to-end in endpoints and URLs.
#[derive(
    Debug, PartialEq, Eq, Copy, Clone, Hash, Serialize, Deserialize,
)]
pub enum TransportProto {
    Rrdma,
    TcpK2rpc,
}

impl TransportProto {
    /// The proto tag as it appears in URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProto::Rrdma => "rrdma",
            TransportProto::TcpK2rpc => "tcp+k2rpc",
        }
    }

    /// Parses a proto tag from its URL form.
    pub fn parse_name(name: &str) -> Option<TransportProto> {
        match name {
            "rrdma" => Some(TransportProto::Rrdma),
            "tcp+k2rpc" => Some(TransportProto::TcpK2rpc),
            _ => None,
        }
    }
}

impl fmt::Display for TransportProto {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A remote (or local listening) transport endpoint, keyed by protocol, host
/// and port. URL grammar is `<proto>+<host>:<port>`; since `tcp+k2rpc` itself
/// contains a `+`, parsing splits the proto tag off at the LAST `+`.
#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub struct TxEndpoint {
    pub proto: TransportProto,
    pub host: String,
    pub port: u16,
}

// Safety: `Hash`/`Eq` are derived from `TransportProto` (a plain enum), `String`,
// and `u16`, all of which have deterministic `Hash`/`Eq`.
unsafe impl flashmap::TrustedHashEq for TxEndpoint {}

impl TxEndpoint {
    pub fn new(
        proto: TransportProto,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        TxEndpoint {
            proto,
            host: host.into(),
            port,
        }
    }

    /// Parses an endpoint from its URL form.
    pub fn parse_url(url: &str) -> Result<TxEndpoint, TsoError> {
        let (proto_str, host_port) = url
            .rsplit_once('+')
            .ok_or_else(|| TsoError::msg(format!("invalid URL '{}'", url)))?;
        let proto = TransportProto::parse_name(proto_str).ok_or_else(|| {
            TsoError::msg(format!("unrecognized proto in URL '{}'", url))
        })?;
        let (host, port_str) = host_port.rsplit_once(':').ok_or_else(|| {
            TsoError::msg(format!("missing port in URL '{}'", url))
        })?;
        if host.is_empty() {
            return Err(TsoError::msg(format!("empty host in URL '{}'", url)));
        }
        let port: u16 = port_str.parse()?;
        Ok(TxEndpoint::new(proto, host, port))
    }

    /// The endpoint's canonical URL text.
    pub fn url(&self) -> String {
        format!("{}+{}:{}", self.proto, self.host, self.port)
    }

    /// Resolves the host:port pair to a socket address. Hosts are expected to
    /// be IP literals.
    pub fn socket_addr(&self) -> Result<SocketAddr, TsoError> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    /// Builds the endpoint a freshly accepted connection is keyed under,
    /// carrying the listener's proto and the peer's address.
    pub(crate) fn from_peer_addr(
        proto: TransportProto,
        addr: SocketAddr,
    ) -> TxEndpoint {
        TxEndpoint::new(proto, addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for TxEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

#[cfg(test)]
mod endpoint_tests {
    use super::*;

    #[test]
    fn parse_rrdma_url() -> Result<(), TsoError> {
        let ep = TxEndpoint::parse_url("rrdma+10.0.0.7:5300")?;
        assert_eq!(ep.proto, TransportProto::Rrdma);
        assert_eq!(ep.host, "10.0.0.7");
        assert_eq!(ep.port, 5300);
        assert_eq!(ep.url(), "rrdma+10.0.0.7:5300");
        Ok(())
    }

    #[test]
    fn parse_tcp_url_with_embedded_plus() -> Result<(), TsoError> {
        let ep = TxEndpoint::parse_url("tcp+k2rpc+127.0.0.1:5301")?;
        assert_eq!(ep.proto, TransportProto::TcpK2rpc);
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 5301);
        assert_eq!(ep.url(), "tcp+k2rpc+127.0.0.1:5301");
        Ok(())
    }

    #[test]
    fn parse_invalid_urls() {
        assert!(TxEndpoint::parse_url("127.0.0.1:5300").is_err());
        assert!(TxEndpoint::parse_url("quic+127.0.0.1:5300").is_err());
        assert!(TxEndpoint::parse_url("rrdma+127.0.0.1").is_err());
        assert!(TxEndpoint::parse_url("rrdma+:5300").is_err());
        assert!(TxEndpoint::parse_url("rrdma+127.0.0.1:banana").is_err());
    }

    #[test]
    fn roundtrip_url() -> Result<(), TsoError> {
        let ep = TxEndpoint::new(TransportProto::TcpK2rpc, "192.168.1.9", 443);
        assert_eq!(TxEndpoint::parse_url(&ep.url())?, ep);
        Ok(())
    }
}
