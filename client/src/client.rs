use core::time::Duration;

use std::{net::SocketAddr, sync::Arc};

use crate::{
    address::Protocol,
    auth::Authenticator,
    builder::ClientBuilder,
    bytes::Bytes,
    dispatcher::Dispatcher,
    error::Error,
    event::EventListener,
    http::{self, uri, Method},
    pool::Pool,
    proxy::{Proxy, ProxySelector},
    request::RequestBuilder,
    resolver::Resolver,
    task::{TaskQueue, TaskRunner},
    timeout::TimeoutConfig,
    tls::Connector,
};

/// http client type used for sending [Request] and receive [Response].
///
/// Cloning is cheap. Clones share connection pool, dispatcher and task runner.
///
/// [Request]: crate::request::RequestBuilder
/// [Response]: crate::response::Response
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) pool: Pool,
    pub(crate) connector: Connector,
    pub(crate) resolver: Resolver,
    pub(crate) proxy_selector: Box<dyn ProxySelector>,
    pub(crate) proxy: Option<Proxy>,
    pub(crate) protocols: Vec<Protocol>,
    pub(crate) timeout_config: TimeoutConfig,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) listener: Arc<dyn EventListener>,
    pub(crate) authenticator: Option<Box<dyn Authenticator>>,
    pub(crate) proxy_authenticator: Option<Box<dyn Authenticator>>,
    pub(crate) follow_redirects: bool,
    pub(crate) follow_ssl_redirects: bool,
    pub(crate) retry_on_connection_failure: bool,
    pub(crate) max_follow_ups: usize,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) runner: TaskRunner,
    pub(crate) call_timeouts: TaskQueue,
    pub(crate) h2_initial_window_size: u32,
    pub(crate) h2_ping_interval: Option<Duration>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! method {
    ($method: tt, $method2: tt) => {
        #[doc = concat!("Start a new [Method::",stringify!($method2),"] request with empty request body.")]
        pub fn $method<U>(&self, url: U) -> Result<RequestBuilder, Error>
        where
            uri::Uri: TryFrom<U>,
            Error: From<<uri::Uri as TryFrom<U>>::Error>,
        {
            Ok(self.get(url)?.method(Method::$method2))
        }
    };
}

impl Client {
    /// Construct a new Client with default setting.
    pub fn new() -> Self {
        Self::builder().finish()
    }

    /// Start a new ClientBuilder and with customizable configuration.
    ///
    /// See [ClientBuilder] for detail.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Start a new HTTP request with given [http::Request].
    #[inline]
    pub fn request(&self, req: http::Request<Bytes>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), req)
    }

    /// Start a new [Method::GET] request with empty request body.
    pub fn get<U>(&self, url: U) -> Result<RequestBuilder, Error>
    where
        uri::Uri: TryFrom<U>,
        Error: From<<uri::Uri as TryFrom<U>>::Error>,
    {
        let uri = uri::Uri::try_from(url)?;

        let mut req = http::Request::new(Bytes::new());
        *req.uri_mut() = uri;

        Ok(self.request(req))
    }

    method!(post, POST);
    method!(put, PUT);
    method!(patch, PATCH);
    method!(delete, DELETE);
    method!(options, OPTIONS);
    method!(head, HEAD);

    /// Close every pooled connection. Idle ones close right away, busy ones once their exchanges
    /// are done.
    pub fn evict_all(&self) {
        self.inner.pool.evict_all();
    }

    /// Number of pooled connections, idle or not.
    pub fn connection_count(&self) -> usize {
        self.inner.pool.connection_count()
    }

    pub fn idle_connection_count(&self) -> usize {
        self.inner.pool.idle_connection_count()
    }

    /// Calls currently running, both executed and enqueued.
    pub fn running_calls_count(&self) -> usize {
        self.inner.dispatcher.running_calls_count()
    }

    /// Enqueued calls waiting for the dispatcher.
    pub fn queued_calls_count(&self) -> usize {
        self.inner.dispatcher.queued_calls_count()
    }

    /// Runner of the client's background work: pool cleanup, call timeouts and http/2 pings.
    pub fn task_runner(&self) -> &TaskRunner {
        &self.inner.runner
    }
}
