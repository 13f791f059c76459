//! Route and target parsing
//!
//! A target is written `scheme://address` with an optional scheme
//! (defaulting to `tcp`). The address is either a static `host:port` or a
//! backend reference `app/kind/name:port` resolved through the workload
//! locator every time a connection is dialed.

use crate::error::FrontendError;
use std::fmt;
use std::str::FromStr;

/// Listener protocol of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Raw byte relay
    Tcp,
    /// Reverse proxy, plaintext
    Http,
    /// Reverse proxy behind TLS termination; backend re-dialed over TLS
    Https,
    /// TLS termination and byte relay over a TLS backend connection
    Tls,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Tls => "tls",
        }
    }

    /// Whether client connections are TLS-terminated
    pub fn terminates_tls(&self) -> bool {
        matches!(self, Scheme::Https | Scheme::Tls)
    }

    /// Whether requests are proxied at the HTTP layer
    pub fn is_http(&self) -> bool {
        matches!(self, Scheme::Http | Scheme::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = FrontendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Scheme::Tcp),
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "tls" => Ok(Scheme::Tls),
            _ => Err(FrontendError::InvalidScheme(s.to_string())),
        }
    }
}

/// Where a proxy sends its traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Fixed `host:port`
    Static { host: String, port: u16 },
    /// `app/kind/name:port`, resolved through the locator at dial time
    Backend {
        app: String,
        kind: String,
        name: String,
        port: u16,
    },
}

impl Target {
    /// Service label used in diagnostics
    pub fn label(&self) -> String {
        match self {
            Target::Static { host, port } => format!("{}:{}", host, port),
            Target::Backend { app, kind, name, .. } => format!("{}/{}/{}", app, kind, name),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Target::Static { port, .. } | Target::Backend { port, .. } => *port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Static { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Target::Static { host, port } => write!(f, "{}:{}", host, port),
            Target::Backend {
                app,
                kind,
                name,
                port,
            } => write!(f, "{}/{}/{}:{}", app, kind, name, port),
        }
    }
}

fn split_port(address: &str, original: &str) -> Result<(String, u16), FrontendError> {
    let invalid = || FrontendError::InvalidTarget(original.to_string());

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

impl FromStr for Target {
    type Err = FrontendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (path, port) = split_port(s, s)?;

        if !path.contains('/') {
            return Ok(Target::Static { host: path, port });
        }

        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            [app, kind, name] if !app.is_empty() && !kind.is_empty() && !name.is_empty() => {
                Ok(Target::Backend {
                    app: app.to_string(),
                    kind: kind.to_string(),
                    name: name.to_string(),
                    port,
                })
            }
            _ => Err(FrontendError::InvalidTarget(s.to_string())),
        }
    }
}

/// The listener scheme plus the current target; what a proxy reads for
/// every new connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub scheme: Scheme,
    pub target: Target,
}

impl Route {
    /// Parse `[scheme://]address`; an explicit `scheme` wins over the prefix
    pub fn parse(target: &str, scheme: Option<Scheme>) -> Result<Self, FrontendError> {
        let route = Self::parse_with_default(target, Scheme::Tcp)?;
        Ok(match scheme {
            Some(scheme) => Self { scheme, ..route },
            None => route,
        })
    }

    /// Parse `[scheme://]address`, taking `default` when there is no prefix
    pub fn parse_with_default(target: &str, default: Scheme) -> Result<Self, FrontendError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(FrontendError::MissingParameter("target"));
        }

        let (prefix, address) = match target.split_once("://") {
            Some((prefix, address)) => (Some(prefix.parse::<Scheme>()?), address),
            None => (None, target),
        };

        Ok(Self {
            scheme: prefix.unwrap_or(default),
            target: address.parse()?,
        })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_target_with_scheme() {
        let route = Route::parse("http://10.0.0.5:8080", None).unwrap();
        assert_eq!(route.scheme, Scheme::Http);
        assert_eq!(
            route.target,
            Target::Static {
                host: "10.0.0.5".to_string(),
                port: 8080
            }
        );
        assert_eq!(route.to_string(), "http://10.0.0.5:8080");
    }

    #[test]
    fn test_scheme_defaults_to_tcp() {
        let route = Route::parse("db.internal:5432", None).unwrap();
        assert_eq!(route.scheme, Scheme::Tcp);
        assert_eq!(route.target.port(), 5432);
    }

    #[test]
    fn test_backend_reference() {
        let route = Route::parse("https://shop/service/web:3000", None).unwrap();
        assert_eq!(route.scheme, Scheme::Https);
        assert_eq!(
            route.target,
            Target::Backend {
                app: "shop".to_string(),
                kind: "service".to_string(),
                name: "web".to_string(),
                port: 3000
            }
        );
        assert_eq!(route.target.label(), "shop/service/web");
    }

    #[test]
    fn test_explicit_scheme_overrides_prefix() {
        let route = Route::parse("http://127.0.0.1:80", Some(Scheme::Tls)).unwrap();
        assert_eq!(route.scheme, Scheme::Tls);
    }

    #[test]
    fn test_default_scheme_applies_only_without_prefix() {
        let bare = Route::parse_with_default("127.0.0.1:8443", Scheme::Tls).unwrap();
        assert_eq!(bare.scheme, Scheme::Tls);

        let prefixed = Route::parse_with_default("http://127.0.0.1:8080", Scheme::Tls).unwrap();
        assert_eq!(prefixed.scheme, Scheme::Http);
    }

    #[test]
    fn test_ipv6_static_target() {
        let target: Target = "[::1]:8080".parse().unwrap();
        assert_eq!(
            target,
            Target::Static {
                host: "::1".to_string(),
                port: 8080
            }
        );
        assert_eq!(target.to_string(), "[::1]:8080");
    }

    #[test]
    fn test_invalid_targets() {
        for input in ["", "nohost", "host:", ":80", "host:0", "host:99999", "a/b:80", "a//c:80"] {
            assert!(Route::parse(input, None).is_err(), "{:?} should be rejected", input);
        }
        assert!(matches!(
            Route::parse("ftp://host:21", None),
            Err(FrontendError::InvalidScheme(_))
        ));
        assert!(matches!(
            Route::parse("  ", None),
            Err(FrontendError::MissingParameter("target"))
        ));
    }

    #[test]
    fn test_scheme_properties() {
        assert!(Scheme::Https.terminates_tls());
        assert!(Scheme::Tls.terminates_tls());
        assert!(!Scheme::Http.terminates_tls());
        assert!(Scheme::Http.is_http());
        assert!(!Scheme::Tcp.is_http());
        assert_eq!("HTTPS".parse::<Scheme>().unwrap(), Scheme::Https);
    }
}
