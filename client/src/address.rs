use core::fmt;

use crate::{
    error::{Error, InvalidUri},
    http::Uri,
    proxy::Proxy,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Application protocol a connection may speak.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http11,
    Http2,
    /// http/2 over clear text without negotiation.
    H2PriorKnowledge,
}

impl Protocol {
    /// ALPN protocol id. Prior knowledge is never negotiated.
    pub const fn alpn(&self) -> Option<&'static [u8]> {
        match self {
            Self::Http11 => Some(b"http/1.1"),
            Self::Http2 => Some(b"h2"),
            Self::H2PriorKnowledge => None,
        }
    }

    pub fn from_alpn(id: &[u8]) -> Option<Self> {
        match id {
            b"http/1.1" => Some(Self::Http11),
            b"h2" => Some(Self::Http2),
            _ => None,
        }
    }

    pub const fn is_multiplexed(&self) -> bool {
        matches!(self, Self::Http2 | Self::H2PriorKnowledge)
    }
}

/// Everything a connection must agree on to carry a request. Used as the pool key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    scheme: Scheme,
    host: String,
    port: u16,
    protocols: Vec<Protocol>,
    proxy: Option<Proxy>,
}

impl Address {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16, protocols: Vec<Protocol>, proxy: Option<Proxy>) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            protocols,
            proxy,
        }
    }

    pub(crate) fn from_uri(uri: &Uri, protocols: &[Protocol], proxy: Option<&Proxy>) -> Result<Self, Error> {
        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            Some(_) => return Err(InvalidUri::UnknownScheme.into()),
            None => return Err(InvalidUri::MissingScheme.into()),
        };

        let host = uri.host().ok_or(InvalidUri::MissingHost)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(InvalidUri::MissingHost.into());
        }

        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());

        // prior knowledge only applies to clear text. tls always negotiates.
        let protocols = match scheme {
            Scheme::Https => protocols
                .iter()
                .copied()
                .filter(|p| *p != Protocol::H2PriorKnowledge)
                .collect(),
            Scheme::Http => protocols.to_vec(),
        };

        Ok(Self::new(scheme, host.to_ascii_lowercase(), port, protocols, proxy.cloned()))
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// hostname without port and brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    /// explicit proxy. `None` means the proxy selector decides.
    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// true when clear text http/2 should be spoken without negotiation.
    pub(crate) fn is_prior_knowledge(&self) -> bool {
        self.scheme == Scheme::Http && self.protocols == [Protocol::H2PriorKnowledge]
    }

    /// compare everything except the host.
    pub(crate) fn equals_non_host(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.port == other.port
            && self.protocols == other.protocols
            && self.proxy == other.proxy
    }

    /// value for Host header and CONNECT target.
    pub(crate) fn authority(&self, with_default_port: bool) -> String {
        let mut buf = String::with_capacity(self.host.len() + 8);
        if self.host.contains(':') {
            buf.push('[');
            buf.push_str(&self.host);
            buf.push(']');
        } else {
            buf.push_str(&self.host);
        }
        if with_default_port || self.port != self.scheme.default_port() {
            buf.push(':');
            buf.push_str(itoa::Buffer::new().format(self.port));
        }
        buf
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority(true))
    }
}
