use std::fmt;

use url::Url;

use crate::types::ErrorKind;

/// A connection target: scheme, host and port.
///
/// Sessions are pooled per origin, so two URLs with the same scheme, host
/// and port share one transport connection. Hosts are normalized to
/// lowercase for consistent lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: String,
    host: String,
    port: u16,
}

impl Origin {
    /// The URL scheme, `http` or `https`.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The lowercased hostname.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port, defaulted from the scheme when the URL carries none.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Whether connections to this origin require TLS.
    #[must_use]
    pub fn is_https(&self) -> bool {
        self.scheme == "https"
    }

    /// The value for the `:authority` pseudo header.
    ///
    /// Default ports are omitted, matching what browsers and most servers
    /// expect.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.has_default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn has_default_port(&self) -> bool {
        matches!(
            (self.scheme.as_str(), self.port),
            ("https", 443) | ("http", 80)
        )
    }
}

impl TryFrom<&Url> for Origin {
    type Error = ErrorKind;

    fn try_from(url: &Url) -> Result<Self, ErrorKind> {
        let host = url
            .host_str()
            .ok_or(ErrorKind::InvalidUrlHost)?
            .to_lowercase();
        let port = url.port_or_known_default().ok_or(ErrorKind::InvalidUrlHost)?;

        Ok(Self {
            scheme: url.scheme().to_owned(),
            host,
            port,
        })
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn origin(url: &str) -> Origin {
        Origin::try_from(&Url::parse(url).unwrap()).unwrap()
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(origin("https://example.com/a/b").port(), 443);
        assert_eq!(origin("http://example.com").port(), 80);
        assert_eq!(origin("http://example.com:8000/x").port(), 8000);
    }

    #[test]
    fn test_host_is_lowercased() {
        assert_eq!(origin("https://API.Example.COM/x").host(), "api.example.com");
    }

    #[test]
    fn test_same_origin_for_different_paths() {
        assert_eq!(origin("https://example.com/a"), origin("https://example.com/b?c=d"));
    }

    #[test]
    fn test_authority_omits_default_port() {
        assert_eq!(origin("https://example.com").authority(), "example.com");
        assert_eq!(origin("http://example.com:8000").authority(), "example.com:8000");
    }

    #[test]
    fn test_display() {
        assert_eq!(
            origin("http://example.com:8000/x").to_string(),
            "http://example.com:8000"
        );
    }

    #[test]
    fn test_missing_host() {
        let url = Url::parse("data:text/plain,hi").unwrap();
        assert!(Origin::try_from(&url).is_err());
    }
}
