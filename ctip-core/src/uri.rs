//! Server addresses.
//!
//! A transcoding server is addressed by a `ctip://host:port/` URI
//! (`ctips://` for TLS). The optional `timeout=<ms>` query sets the
//! per-operation I/O deadline; `version=1` selects the superseded V1
//! sub-protocol, which this implementation does not speak.

use std::time::Duration;

use crate::error::CtipError;

/// Default server port when the URI omits one.
pub const DEFAULT_PORT: u16 = 8099;

/// A parsed `ctip://` / `ctips://` server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUri {
    pub host: String,
    pub port: u16,
    /// `true` for `ctips://` (TLS).
    pub tls: bool,
    /// I/O deadline; `Duration::ZERO` means wait forever.
    pub timeout: Duration,
}

impl ServerUri {
    /// Parse a server URI string.
    pub fn parse(uri: &str) -> Result<Self, CtipError> {
        let bad = || CtipError::InvalidUri(uri.to_string());

        let (scheme, rest) = uri.split_once("://").ok_or_else(bad)?;
        let tls = match scheme {
            "ctip" => false,
            "ctips" => true,
            _ => return Err(bad()),
        };

        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };
        let authority = authority.split('/').next().unwrap_or(authority);
        if authority.is_empty() {
            return Err(bad());
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h, p.parse::<u16>().map_err(|_| bad())?),
            None => (authority, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(bad());
        }

        let mut timeout = Duration::ZERO;
        if let Some(query) = query {
            for param in query.split('&') {
                match param.split_once('=') {
                    Some(("timeout", ms)) => {
                        let ms: u64 = ms.parse().map_err(|_| bad())?;
                        timeout = Duration::from_millis(ms);
                    }
                    Some(("version", v)) if v != "2" => {
                        return Err(CtipError::UnsupportedVersion(v.to_string()));
                    }
                    _ => {} // unknown parameters are ignored
                }
            }
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
            timeout,
        })
    }
}

impl std::str::FromStr for ServerUri {
    type Err = CtipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ServerUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "ctips" } else { "ctip" };
        write!(f, "{scheme}://{}:{}/", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_with_port() {
        let u = ServerUri::parse("ctip://render.example:9000/").unwrap();
        assert_eq!(u.host, "render.example");
        assert_eq!(u.port, 9000);
        assert!(!u.tls);
        assert_eq!(u.timeout, Duration::ZERO);
    }

    #[test]
    fn default_port() {
        let u = ServerUri::parse("ctip://localhost").unwrap();
        assert_eq!(u.port, DEFAULT_PORT);
    }

    #[test]
    fn tls_scheme() {
        let u = ServerUri::parse("ctips://secure.example:8443/").unwrap();
        assert!(u.tls);
    }

    #[test]
    fn timeout_query() {
        let u = ServerUri::parse("ctip://h:1234/?timeout=1500").unwrap();
        assert_eq!(u.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn legacy_version_rejected() {
        let e = ServerUri::parse("ctip://h:1234/?version=1").unwrap_err();
        assert!(matches!(e, CtipError::UnsupportedVersion(_)));
    }

    #[test]
    fn bad_uris() {
        assert!(ServerUri::parse("http://h/").is_err());
        assert!(ServerUri::parse("ctip://").is_err());
        assert!(ServerUri::parse("ctip://h:notaport/").is_err());
        assert!(ServerUri::parse("no-scheme").is_err());
    }

    #[test]
    fn display_roundtrip() {
        let u = ServerUri::parse("ctips://h:70/").unwrap();
        assert_eq!(u.to_string(), "ctips://h:70/");
    }
}
