//! Origin model used to classify responses and gate worker registration.

use std::fmt;
use url::Url;

/// A web origin (scheme + host + port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A tuple origin (scheme, host, port).
    Tuple {
        scheme: String,
        host: String,
        port: Option<u16>,
    },
    /// An opaque origin (unique, cannot match anything).
    Opaque(String),
}

impl Origin {
    /// Create an origin from a URL.
    pub fn from_url(url: &Url) -> Self {
        // data: and file: URLs have opaque origins
        if matches!(url.scheme(), "data" | "file" | "javascript" | "about") {
            return Origin::Opaque(url.to_string());
        }

        Origin::Tuple {
            scheme: url.scheme().to_string(),
            host: url.host_str().unwrap_or("").to_ascii_lowercase(),
            port: url.port_or_known_default(),
        }
    }

    /// Check if two origins are the same.
    pub fn same_origin(&self, other: &Origin) -> bool {
        match (self, other) {
            (
                Origin::Tuple { scheme: s1, host: h1, port: p1 },
                Origin::Tuple { scheme: s2, host: h2, port: p2 },
            ) => s1 == s2 && h1 == h2 && p1 == p2,
            // Opaque origins are never same-origin (even with themselves)
            _ => false,
        }
    }

    /// Check if this is an opaque origin.
    pub fn is_opaque(&self) -> bool {
        matches!(self, Origin::Opaque(_))
    }

    /// Check if this is a secure origin (HTTPS or loopback).
    ///
    /// Workers may only be registered for secure origins.
    pub fn is_secure(&self) -> bool {
        match self {
            Origin::Tuple { scheme, host, .. } => {
                scheme == "https"
                    || host == "localhost"
                    || host == "127.0.0.1"
                    || host == "[::1]"
                    || host.ends_with(".localhost")
            }
            Origin::Opaque(_) => false,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Tuple { scheme, host, port } => {
                let default_port = match scheme.as_str() {
                    "http" => Some(80),
                    "https" => Some(443),
                    _ => None,
                };
                match port {
                    Some(p) if Some(*p) != default_port => write!(f, "{}://{}:{}", scheme, host, p),
                    _ => write!(f, "{}://{}", scheme, host),
                }
            }
            Origin::Opaque(_) => write!(f, "null"),
        }
    }
}
