//! Handler rows and their compiled form.
//!
//! # Responsibilities
//! - Represent a handler row as stored in the handler table
//! - Parse listen addresses, method sets and path patterns
//!
//! # Design Decisions
//! - Rows keep raw text columns; compilation happens when a snapshot
//!   is built so a malformed row rejects the snapshot, not the write
//! - Path patterns are exact or trailing-wildcard prefixes (no regex)

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use axum::http::Method;
use serde::{Deserialize, Serialize};

use crate::config::validation::ConfigurationError;

/// Stable identity of a handler row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(pub i64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A row of the handler table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerRow {
    pub id: HandlerId,
    /// `host:port`, `:port`, or `unix:/path/to.sock`.
    pub listen: String,
    /// Accepted methods. Empty accepts any method.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Exact path, `/prefix/*`, or `*`.
    pub path: String,
    /// SQL text executed for matching requests.
    pub query: String,
    /// Higher priority is matched first.
    #[serde(default)]
    pub priority: i32,
}

impl HandlerRow {
    pub fn new(
        id: i64,
        listen: impl Into<String>,
        methods: &[&str],
        path: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            id: HandlerId(id),
            listen: listen.into(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            path: path.into(),
            query: query.into(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Where a handler listens.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ListenAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for ListenAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err("empty unix socket path".to_string());
            }
            return Ok(ListenAddress::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(ListenAddress::Unix(PathBuf::from(s)));
        }
        if let Some(port) = s.strip_prefix(':') {
            let port: u16 = port.parse().map_err(|e| format!("invalid port: {e}"))?;
            return Ok(ListenAddress::Tcp(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                port,
            ))));
        }
        s.parse::<SocketAddr>()
            .map(ListenAddress::Tcp)
            .map_err(|e| e.to_string())
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Tcp(addr) => write!(f, "{addr}"),
            ListenAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Set of accepted methods; empty accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodSet(Vec<Method>);

impl MethodSet {
    pub fn any() -> Self {
        Self(Vec::new())
    }

    pub fn parse<S: AsRef<str>>(methods: &[S]) -> Result<Self, String> {
        let mut parsed = Vec::with_capacity(methods.len());
        for raw in methods {
            let raw = raw.as_ref().trim();
            let method = Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
                .map_err(|_| raw.to_string())?;
            if !parsed.contains(&method) {
                parsed.push(method);
            }
        }
        parsed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(Self(parsed))
    }

    pub fn matches(&self, method: &Method) -> bool {
        self.0.is_empty() || self.0.contains(method)
    }
}

/// Request path matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    /// `*` or `/*`.
    Any,
    /// `/api/*` matches `/api` and everything below `/api/`.
    Prefix(String),
    Exact(String),
}

impl PathPattern {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Any => true,
            PathPattern::Exact(expected) => path == expected,
            PathPattern::Prefix(prefix) => {
                path.starts_with(prefix.as_str()) || path == prefix.trim_end_matches('/')
            }
        }
    }
}

impl FromStr for PathPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "*" | "/*" => Ok(PathPattern::Any),
            _ if !s.starts_with('/') => Err("path must start with '/'".to_string()),
            _ => match s.strip_suffix('*') {
                Some(prefix) if prefix.ends_with('/') => Ok(PathPattern::Prefix(prefix.to_string())),
                Some(_) => Err("wildcard must follow '/'".to_string()),
                None if s.contains('*') => Err("wildcard must be the last character".to_string()),
                None => Ok(PathPattern::Exact(s.to_string())),
            },
        }
    }
}

/// A handler compiled for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handler {
    pub id: HandlerId,
    pub listen: ListenAddress,
    pub methods: MethodSet,
    pub path: PathPattern,
    pub query: Arc<str>,
    pub priority: i32,
}

impl Handler {
    /// Compile a row, reporting every malformed column.
    pub fn compile(row: &HandlerRow) -> Result<Self, Vec<ConfigurationError>> {
        let mut errors = Vec::new();

        let listen = row
            .listen
            .parse::<ListenAddress>()
            .map_err(|reason| ConfigurationError::MalformedAddress {
                handler: row.id.0,
                address: row.listen.clone(),
                reason,
            });
        let methods = MethodSet::parse(&row.methods).map_err(|method| {
            ConfigurationError::InvalidMethod {
                handler: row.id.0,
                method,
            }
        });
        let path = row
            .path
            .parse::<PathPattern>()
            .map_err(|reason| ConfigurationError::InvalidPath {
                handler: row.id.0,
                pattern: row.path.clone(),
                reason,
            });

        match (listen, methods, path) {
            (Ok(listen), Ok(methods), Ok(path)) => Ok(Self {
                id: row.id,
                listen,
                methods,
                path,
                query: Arc::from(row.query.as_str()),
                priority: row.priority,
            }),
            (listen, methods, path) => {
                errors.extend(listen.err());
                errors.extend(methods.err());
                errors.extend(path.err());
                Err(errors)
            }
        }
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.methods.matches(method) && self.path.matches(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_addresses() {
        assert_eq!(
            "127.0.0.1:8080".parse::<ListenAddress>().unwrap(),
            ListenAddress::Tcp("127.0.0.1:8080".parse().unwrap())
        );
        assert_eq!(
            ":9090".parse::<ListenAddress>().unwrap(),
            ListenAddress::Tcp("0.0.0.0:9090".parse().unwrap())
        );
        assert_eq!(
            "unix:/tmp/h.sock".parse::<ListenAddress>().unwrap(),
            ListenAddress::Unix(PathBuf::from("/tmp/h.sock"))
        );
        assert!("localhost".parse::<ListenAddress>().is_err());
        assert!(":99999".parse::<ListenAddress>().is_err());
    }

    #[test]
    fn listen_address_display_round_trips() {
        for raw in ["10.0.0.1:80", "unix:/run/x.sock", "[::1]:8443"] {
            let parsed: ListenAddress = raw.parse().unwrap();
            assert_eq!(parsed.to_string().parse::<ListenAddress>().unwrap(), parsed);
        }
    }

    #[test]
    fn method_sets() {
        let any = MethodSet::any();
        assert!(any.matches(&Method::DELETE));

        let get_post = MethodSet::parse(&["get", "POST", "GET"]).unwrap();
        assert!(get_post.matches(&Method::GET));
        assert!(get_post.matches(&Method::POST));
        assert!(!get_post.matches(&Method::PUT));

        assert!(MethodSet::parse(&["BAD METHOD"]).is_err());
    }

    #[test]
    fn path_patterns() {
        let exact: PathPattern = "/hi".parse().unwrap();
        assert!(exact.matches("/hi"));
        assert!(!exact.matches("/hi/there"));

        let prefix: PathPattern = "/api/*".parse().unwrap();
        assert!(prefix.matches("/api"));
        assert!(prefix.matches("/api/v1/users"));
        assert!(!prefix.matches("/apix"));

        let any: PathPattern = "*".parse().unwrap();
        assert!(any.matches("/anything"));

        assert!("hi".parse::<PathPattern>().is_err());
        assert!("/a*b".parse::<PathPattern>().is_err());
        assert!("/a*".parse::<PathPattern>().is_err());
    }

    #[test]
    fn compile_reports_all_errors() {
        let row = HandlerRow::new(7, "nope", &["NOT A METHOD"], "relative", "SELECT 1");
        let errors = Handler::compile(&row).unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
