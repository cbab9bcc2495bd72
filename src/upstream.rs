/* Upstream addresses and the connector that opens outbound streams to them. */

use log::debug;
use std::fmt;
use std::str::FromStr;
use tokio::net::TcpStream;

use crate::error::{ConnectionError, UpstreamParseError};

/// A backend service the tunnel relays to, such as an SSH or OpenVPN daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Opens a fresh connection. No retry; the caller closes the client on failure.
    pub async fn connect(&self) -> Result<TcpStream, ConnectionError> {
        debug!("Attempting to connect to upstream {}", self);
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|source| ConnectionError::UpstreamConnect {
                upstream: self.clone(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set nodelay towards {}: {}", self, e);
        }
        Ok(stream)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Upstream {
    type Err = UpstreamParseError;

    // Accepts host:port, 1.2.3.4:port and [::1]:port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| UpstreamParseError::MissingPort(s.to_string()))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(UpstreamParseError::MissingHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| UpstreamParseError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        assert_eq!(
            "127.0.0.1:22".parse::<Upstream>(),
            Ok(Upstream::new("127.0.0.1", 22))
        );
        assert_eq!(
            "vpn.internal:1194".parse::<Upstream>(),
            Ok(Upstream::new("vpn.internal", 1194))
        );
        assert_eq!("[::1]:22".parse::<Upstream>(), Ok(Upstream::new("::1", 22)));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(matches!(
            "localhost".parse::<Upstream>(),
            Err(UpstreamParseError::MissingPort(_))
        ));
        assert!(matches!(
            ":22".parse::<Upstream>(),
            Err(UpstreamParseError::MissingHost(_))
        ));
        assert!(matches!(
            "localhost:ssh".parse::<Upstream>(),
            Err(UpstreamParseError::InvalidPort(_))
        ));
        assert!(matches!(
            "localhost:0".parse::<Upstream>(),
            Err(UpstreamParseError::InvalidPort(_))
        ));
    }

    #[test]
    fn displays_ipv6_in_brackets() {
        assert_eq!(Upstream::new("::1", 22).to_string(), "[::1]:22");
        assert_eq!(Upstream::new("127.0.0.1", 1194).to_string(), "127.0.0.1:1194");
    }

    #[tokio::test]
    async fn connect_failure_names_the_upstream() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let upstream = Upstream::new("127.0.0.1", port);
        match upstream.connect().await {
            Err(ConnectionError::UpstreamConnect { upstream: failed, .. }) => {
                assert_eq!(failed, upstream)
            }
            other => panic!("expected connect failure, got {other:?}"),
        }
    }
}
