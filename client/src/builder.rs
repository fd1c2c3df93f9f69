use core::time::Duration;

use std::{net::SocketAddr, sync::Arc};

use tracing::debug;

use crate::{
    address::Protocol,
    auth::Authenticator,
    client::{Client, ClientInner},
    dispatcher::Dispatcher,
    event::{EventListener, NoopEventListener},
    pool::Pool,
    proxy::{NoProxy, Proxy, ProxySelector},
    resolver::{Resolve, Resolver},
    task::TaskRunner,
    timeout::TimeoutConfig,
    tls::{Connector, Probe, TlsConnect},
};

pub struct ClientBuilder {
    probes: Vec<Probe>,
    resolver: Resolver,
    proxy_selector: Box<dyn ProxySelector>,
    proxy: Option<Proxy>,
    protocols: Vec<Protocol>,
    timeout_config: TimeoutConfig,
    local_addr: Option<SocketAddr>,
    listener: Arc<dyn EventListener>,
    authenticator: Option<Box<dyn Authenticator>>,
    proxy_authenticator: Option<Box<dyn Authenticator>>,
    follow_redirects: bool,
    follow_ssl_redirects: bool,
    retry_on_connection_failure: bool,
    max_follow_ups: usize,
    max_idle_connections: usize,
    keep_alive: Duration,
    max_requests: usize,
    max_requests_per_host: usize,
    task_workers: usize,
    h2_initial_window_size: u32,
    h2_ping_interval: Option<Duration>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder {
            probes: Probe::builtin(),
            resolver: Resolver::default(),
            proxy_selector: Box::new(NoProxy),
            proxy: None,
            protocols: vec![Protocol::Http2, Protocol::Http11],
            timeout_config: TimeoutConfig::new(),
            local_addr: None,
            listener: Arc::new(NoopEventListener),
            authenticator: None,
            proxy_authenticator: None,
            follow_redirects: true,
            follow_ssl_redirects: true,
            retry_on_connection_failure: true,
            max_follow_ups: 20,
            max_idle_connections: 5,
            keep_alive: Duration::from_secs(5 * 60),
            max_requests: 64,
            max_requests_per_host: 5,
            task_workers: 4,
            h2_initial_window_size: 65_535,
            h2_ping_interval: None,
        }
    }

    /// Prefer rustls for tls handshaking, trusting the bundled webpki root certificates.
    #[cfg(feature = "rustls")]
    pub fn rustls(mut self) -> Self {
        self.probes.insert(
            0,
            Probe::new("rustls", || {
                crate::tls::rustls::RustlsConnector::with_webpki_roots()
                    .map(|c| Arc::new(c) as Arc<dyn TlsConnect>)
            }),
        );
        self
    }

    /// Use custom dns resolver for resolving host names.
    ///
    /// See [Resolve] for example.
    pub fn resolver(mut self, resolver: impl Resolve + 'static) -> Self {
        self.resolver = Resolver::custom(resolver);
        self
    }

    /// Use custom tls connector for tls handshaking. It takes priority over every built in tls
    /// backend.
    pub fn tls_connector(mut self, connector: impl TlsConnect + 'static) -> Self {
        self.probes.insert(0, Probe::connector("custom", connector));
        self
    }

    /// Add a tls capability probe in front of the existing ones.
    pub fn tls_probe(mut self, probe: Probe) -> Self {
        self.probes.insert(0, probe);
        self
    }

    /// Route every request through given proxy. Takes priority over [ClientBuilder::proxy_selector].
    pub fn set_proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Choose candidate proxies per request uri.
    ///
    /// Default to always connecting directly.
    pub fn proxy_selector(mut self, selector: impl ProxySelector + 'static) -> Self {
        self.proxy_selector = Box::new(selector);
        self
    }

    pub fn event_listener(mut self, listener: impl EventListener + 'static) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    /// Answer `401 Unauthorized` challenges of origin servers.
    pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Some(Box::new(authenticator));
        self
    }

    /// Answer `407 Proxy Authentication Required` challenges, both of CONNECT tunnels and of
    /// requests sent through a proxy.
    pub fn proxy_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.proxy_authenticator = Some(Box::new(authenticator));
        self
    }

    /// Set timeout for DNS resolve.
    ///
    /// Default to 5 seconds.
    pub fn set_resolve_timeout(mut self, dur: Duration) -> Self {
        self.timeout_config.resolve_timeout = dur;
        self
    }

    /// Set timeout for establishing one tcp connection.
    ///
    /// Default to 10 seconds.
    pub fn set_connect_timeout(mut self, dur: Duration) -> Self {
        self.timeout_config.connect_timeout = dur;
        self
    }

    /// Set timeout for tls handshake.
    ///
    /// Default to 10 seconds.
    pub fn set_tls_connect_timeout(mut self, dur: Duration) -> Self {
        self.timeout_config.tls_connect_timeout = dur;
        self
    }

    /// Set timeout for a single socket read.
    ///
    /// Default to 10 seconds.
    pub fn set_read_timeout(mut self, dur: Duration) -> Self {
        self.timeout_config.read_timeout = dur;
        self
    }

    /// Set timeout for a single socket write.
    ///
    /// Default to 10 seconds.
    pub fn set_write_timeout(mut self, dur: Duration) -> Self {
        self.timeout_config.write_timeout = dur;
        self
    }

    /// Set timeout for the entire call, including follow ups and reading response body.
    ///
    /// Default to no timeout.
    pub fn set_call_timeout(mut self, dur: Duration) -> Self {
        self.timeout_config.call_timeout = Some(dur);
        self
    }

    /// Set [TimeoutConfig] for client.
    pub fn set_timeout(mut self, timeout_config: TimeoutConfig) -> Self {
        self.timeout_config = timeout_config;
        self
    }

    /// Set local Socket address, either IPv4 or IPv6 used for http client.
    ///
    /// By default client uses any free address the OS returns.
    pub fn set_local_addr(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.local_addr = Some(addr.into());
        self
    }

    /// Set max number of idle connections kept in pool.
    ///
    /// Default to 5. 0 disables connection reuse.
    pub fn set_max_idle_connections(mut self, max: usize) -> Self {
        self.max_idle_connections = max;
        self
    }

    /// Set how long an idle connection is kept in pool.
    ///
    /// Default to 5 minutes.
    pub fn set_keep_alive(mut self, dur: Duration) -> Self {
        self.keep_alive = dur;
        self
    }

    /// Set protocols in order of preference.
    ///
    /// Default to `[Http2, Http11]`.
    ///
    /// # Panics:
    /// When the list lacks [Protocol::Http11] and is not exactly `[H2PriorKnowledge]`.
    pub fn set_protocols(mut self, protocols: impl Into<Vec<Protocol>>) -> Self {
        let mut protocols = protocols.into();
        protocols.dedup();

        let prior_knowledge = protocols == [Protocol::H2PriorKnowledge];
        assert!(
            prior_knowledge || protocols.contains(&Protocol::Http11),
            "protocols must contain http/1.1 or be h2 prior knowledge alone: {protocols:?}"
        );

        self.protocols = protocols;
        self
    }

    /// Default to true.
    pub fn set_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Follow redirects switching between http and https.
    ///
    /// Default to true.
    pub fn set_follow_ssl_redirects(mut self, follow: bool) -> Self {
        self.follow_ssl_redirects = follow;
        self
    }

    /// Retry requests failed by connection problems when it is safe to do so.
    ///
    /// Default to true.
    pub fn set_retry_on_connection_failure(mut self, retry: bool) -> Self {
        self.retry_on_connection_failure = retry;
        self
    }

    /// Set max number of follow ups and retries of one call.
    ///
    /// Default to 20.
    pub fn set_max_follow_ups(mut self, max: usize) -> Self {
        self.max_follow_ups = max;
        self
    }

    /// Set max number of concurrently running enqueued calls.
    ///
    /// Default to 64.
    ///
    /// # Panics:
    /// When pass 0.
    pub fn set_max_requests(mut self, max: usize) -> Self {
        assert_ne!(max, 0);
        self.max_requests = max;
        self
    }

    /// Set max number of concurrently running enqueued calls to one host.
    ///
    /// Default to 5.
    ///
    /// # Panics:
    /// When pass 0.
    pub fn set_max_requests_per_host(mut self, max: usize) -> Self {
        assert_ne!(max, 0);
        self.max_requests_per_host = max;
        self
    }

    /// Set worker count of the background task runner.
    ///
    /// Default to 4.
    ///
    /// # Panics:
    /// When pass 0.
    pub fn set_task_workers(mut self, workers: usize) -> Self {
        assert_ne!(workers, 0);
        self.task_workers = workers;
        self
    }

    /// Set initial http/2 stream window size advertised to servers.
    ///
    /// Default to 65535.
    pub fn set_h2_initial_window_size(mut self, size: u32) -> Self {
        self.h2_initial_window_size = size;
        self
    }

    /// Send http/2 PING every `dur`. A connection whose PING is not acknowledged by the next one
    /// fails.
    ///
    /// Default to no ping.
    pub fn set_h2_ping_interval(mut self, dur: Duration) -> Self {
        self.h2_ping_interval = Some(dur);
        self
    }

    /// Finish the builder and construct [Client] instance.
    pub fn finish(self) -> Client {
        let connector = Connector::select(self.probes);
        debug!("client built with tls backend {}", connector.name());

        let runner = TaskRunner::new(self.task_workers);
        let pool = Pool::new(self.max_idle_connections, self.keep_alive, runner.queue("connection pool"));
        let call_timeouts = runner.queue("call timeouts");

        Client {
            inner: Arc::new(ClientInner {
                pool,
                connector,
                resolver: self.resolver,
                proxy_selector: self.proxy_selector,
                proxy: self.proxy,
                protocols: self.protocols,
                timeout_config: self.timeout_config,
                local_addr: self.local_addr,
                listener: self.listener,
                authenticator: self.authenticator,
                proxy_authenticator: self.proxy_authenticator,
                follow_redirects: self.follow_redirects,
                follow_ssl_redirects: self.follow_ssl_redirects,
                retry_on_connection_failure: self.retry_on_connection_failure,
                max_follow_ups: self.max_follow_ups,
                dispatcher: Dispatcher::new(self.max_requests, self.max_requests_per_host),
                runner,
                call_timeouts,
                h2_initial_window_size: self.h2_initial_window_size,
                h2_ping_interval: self.h2_ping_interval,
            }),
        }
    }
}
