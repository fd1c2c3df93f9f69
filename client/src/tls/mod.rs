//! tls collaborator.
//!
//! The backend is chosen from an ordered list of [Probe]s at client construction. The first probe
//! producing a connector wins.

pub(crate) mod stream;

#[cfg(feature = "rustls")]
pub(crate) mod rustls;

use std::sync::Arc;

use futures_core::future::BoxFuture;
use tracing::debug;

use crate::{
    address::Protocol,
    error::{Error, FeatureError},
};

pub use self::stream::{BoxedIo, Io};

#[cfg(feature = "rustls")]
pub use self::rustls::RustlsConnector;

/// Outcome of a tls handshake.
#[derive(Clone, Default)]
pub struct Handshake {
    /// protocol negotiated through ALPN.
    pub protocol: Option<Protocol>,
    /// DER encoded peer certificate chain, end entity first.
    pub peer_certificates: Vec<Vec<u8>>,
    /// verifier able to check the chain against another hostname. Connections without it
    /// never coalesce.
    pub verifier: Option<Arc<dyn HostVerifier>>,
}

impl Handshake {
    /// true when the peer certificate chain is valid for given host.
    pub fn is_valid_for(&self, host: &str) -> bool {
        match self.verifier {
            Some(ref verifier) => !self.peer_certificates.is_empty() && verifier.verify(host, &self.peer_certificates),
            None => false,
        }
    }
}

/// Trait for checking a certificate chain against a hostname.
pub trait HostVerifier: Send + Sync {
    fn verify(&self, host: &str, peer_certificates: &[Vec<u8>]) -> bool;
}

/// Trait for custom tls handshake logic.
///
/// `alpn` is the preference ordered protocol list of the address. Implementations report the
/// negotiated protocol in [Handshake::protocol]. `None` is treated as http/1.1.
pub trait TlsConnect: Send + Sync {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        alpn: &'a [Protocol],
        io: BoxedIo,
    ) -> BoxFuture<'a, Result<(BoxedIo, Handshake), Error>>;
}

/// Named capability check producing a tls connector when the backend is usable.
pub struct Probe {
    name: &'static str,
    probe: Box<dyn FnOnce() -> Option<Arc<dyn TlsConnect>> + Send>,
}

impl Probe {
    pub fn new<F>(name: &'static str, probe: F) -> Self
    where
        F: FnOnce() -> Option<Arc<dyn TlsConnect>> + Send + 'static,
    {
        Self {
            name,
            probe: Box::new(probe),
        }
    }

    /// A probe that always yields given connector.
    pub fn connector(name: &'static str, connector: impl TlsConnect + 'static) -> Self {
        let connector = Arc::new(connector) as Arc<dyn TlsConnect>;
        Self::new(name, move || Some(connector))
    }

    /// Built in probes in priority order.
    pub(crate) fn builtin() -> Vec<Self> {
        #[allow(unused_mut)]
        let mut probes = Vec::new();

        #[cfg(feature = "rustls")]
        probes.push(Self::new("rustls", || {
            self::rustls::RustlsConnector::with_webpki_roots().map(|c| Arc::new(c) as Arc<dyn TlsConnect>)
        }));

        probes
    }
}

/// Connector selected from probes.
#[derive(Clone)]
pub(crate) struct Connector {
    name: &'static str,
    inner: Option<Arc<dyn TlsConnect>>,
}

impl Connector {
    pub(crate) fn select(probes: impl IntoIterator<Item = Probe>) -> Self {
        for probe in probes {
            let name = probe.name;
            if let Some(inner) = (probe.probe)() {
                debug!("tls backend selected: {name}");
                return Self {
                    name,
                    inner: Some(inner),
                };
            }
            debug!("tls backend unavailable: {name}");
        }

        Self {
            name: "unavailable",
            inner: None,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) async fn connect(
        &self,
        host: &str,
        alpn: &[Protocol],
        io: BoxedIo,
    ) -> Result<(BoxedIo, Handshake), Error> {
        match self.inner {
            Some(ref inner) => inner.connect(host, alpn, io).await,
            None => Err(FeatureError::TlsNotEnabled.into()),
        }
    }
}
