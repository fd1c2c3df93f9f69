use core::fmt;

use crate::http::Uri;

/// Intermediary a route connects through.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Proxy {
    Direct,
    /// http proxy. https targets are reached through a CONNECT tunnel.
    Http { host: String, port: u16 },
}

impl Proxy {
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::Http {
            host: host.into(),
            port,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("DIRECT"),
            Self::Http { host, port } => write!(f, "HTTP @ {host}:{port}"),
        }
    }
}

/// Trait for choosing candidate proxies of a request uri.
///
/// Candidates are tried in order. An empty list is treated as [Proxy::Direct].
pub trait ProxySelector: Send + Sync {
    fn select(&self, uri: &Uri) -> Vec<Proxy>;
}

/// Selector that always connects directly.
pub struct NoProxy;

impl ProxySelector for NoProxy {
    fn select(&self, _: &Uri) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}

impl<F> ProxySelector for F
where
    F: Fn(&Uri) -> Vec<Proxy> + Send + Sync,
{
    fn select(&self, uri: &Uri) -> Vec<Proxy> {
        self(uri)
    }
}
