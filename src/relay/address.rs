//! Backend address parsing.
//!
//! Addresses must carry an explicit port: `ws://host:80/path`,
//! `wss://10.0.0.5:443/socket`. Anything else is rejected at route
//! construction time.

use std::fmt;

use url::Url;

use crate::{Error, Result};

/// Backend transport scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP
    Ws,
    /// TLS over TCP
    Wss,
}

impl Scheme {
    /// Scheme as written in the address
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `ws://` or `wss://` backend address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAddress {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

impl BackendAddress {
    /// Parse and validate a backend address.
    ///
    /// # Errors
    ///
    /// [`Error::AddressFormat`] when the scheme is not `ws`/`wss`, the host or
    /// port is missing, or the port is not a number.
    pub fn parse(addr: &str) -> Result<Self> {
        let format_err = || Error::AddressFormat(addr.to_string());

        let url = Url::parse(addr).map_err(|_| format_err())?;
        let scheme = match url.scheme() {
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            _ => return Err(format_err()),
        };

        // `Url` hides ports equal to the scheme default, so the explicit
        // host:port pair is taken from the raw authority.
        let authority = addr
            .split_once("://")
            .map(|(_, rest)| rest)
            .and_then(|rest| rest.split(['/', '?', '#']).next())
            .ok_or_else(format_err)?;
        if authority.contains('@') {
            return Err(format_err());
        }

        let (host, port) = authority.rsplit_once(':').ok_or_else(format_err)?;
        if host.is_empty() || (host.contains(':') && !host.starts_with('[')) {
            return Err(format_err());
        }
        let port: u16 = port.parse().map_err(|_| format_err())?;

        let path = if url.path().is_empty() {
            "/".to_string()
        } else {
            url.path().to_string()
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path,
        })
    }

    /// Transport scheme
    #[must_use]
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host as written (IPv6 literals keep their brackets)
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host without IPv6 brackets, suitable for TLS server names
    #[must_use]
    pub fn server_name(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host)
    }

    /// Backend port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Backend request path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port`, used for dialing and as the forwarded `Host` header
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }
}
