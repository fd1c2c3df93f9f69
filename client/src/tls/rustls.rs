use std::{io, sync::Arc};

use ::rustls::{
    ClientConfig, RootCertStore,
    client::{WebPkiServerVerifier, danger::ServerCertVerifier},
    crypto::ring,
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use futures_core::future::BoxFuture;
use tokio_rustls::TlsConnector;

use crate::{address::Protocol, error::Error};

use super::{Handshake, HostVerifier, TlsConnect, stream::BoxedIo};

/// tls connector backed by rustls with the ring crypto provider.
pub struct RustlsConnector {
    config: Arc<ClientConfig>,
    verifier: Arc<WebPkiVerifier>,
}

impl RustlsConnector {
    /// connector trusting the bundled webpki root certificates.
    pub fn with_webpki_roots() -> Option<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_root_store(roots).ok()
    }

    /// connector trusting given root certificates.
    pub fn with_root_store(roots: RootCertStore) -> Result<Self, Error> {
        let provider = Arc::new(ring::default_provider());
        let roots = Arc::new(roots);

        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Std(Box::new(e)))?
            .with_root_certificates(roots.clone())
            .with_no_client_auth();

        let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|e| Error::Std(Box::new(e)))?;

        Ok(Self {
            config: Arc::new(config),
            verifier: Arc::new(WebPkiVerifier { inner }),
        })
    }
}

impl TlsConnect for RustlsConnector {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        alpn: &'a [Protocol],
        io: BoxedIo,
    ) -> BoxFuture<'a, Result<(BoxedIo, Handshake), Error>> {
        Box::pin(async move {
            let name = ServerName::try_from(host.to_owned()).map_err(|e| Error::Std(Box::new(e)))?;

            let mut config = ClientConfig::clone(&self.config);
            config.alpn_protocols = alpn.iter().filter_map(Protocol::alpn).map(<[u8]>::to_vec).collect();

            let stream = TlsConnector::from(Arc::new(config))
                .connect(name, io)
                .await
                .map_err(map_handshake_err)?;

            let (_, session) = stream.get_ref();

            let handshake = Handshake {
                protocol: session.alpn_protocol().and_then(Protocol::from_alpn),
                peer_certificates: session
                    .peer_certificates()
                    .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
                    .unwrap_or_default(),
                verifier: Some(self.verifier.clone() as Arc<dyn HostVerifier>),
            };

            Ok((Box::new(stream) as BoxedIo, handshake))
        })
    }
}

fn map_handshake_err(e: io::Error) -> Error {
    let is_cert = e
        .get_ref()
        .and_then(|e| e.downcast_ref::<::rustls::Error>())
        .is_some_and(|e| matches!(e, ::rustls::Error::InvalidCertificate(_)));

    if is_cert {
        Error::Certificate(Box::new(e))
    } else {
        Error::Io(e)
    }
}

struct WebPkiVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl HostVerifier for WebPkiVerifier {
    fn verify(&self, host: &str, peer_certificates: &[Vec<u8>]) -> bool {
        let Ok(name) = ServerName::try_from(host) else {
            return false;
        };

        let Some((end, intermediates)) = peer_certificates.split_first() else {
            return false;
        };

        let end = CertificateDer::from(end.as_slice());
        let intermediates = intermediates
            .iter()
            .map(|c| CertificateDer::from(c.as_slice()))
            .collect::<Vec<_>>();

        self.inner
            .verify_server_cert(&end, &intermediates, &name, &[], UnixTime::now())
            .is_ok()
    }
}
