//! route planning: expand an [Address] into ordered (proxy, socket address) candidates.

use core::{fmt, net::SocketAddr};

use std::collections::HashSet;

use tracing::debug;

use crate::{
    address::Address,
    error::{Error, ResolveError, TimeoutError},
    event::Events,
    http::Uri,
    proxy::{Proxy, ProxySelector},
    resolver::Resolver,
    timeout::timed,
};

/// One concrete way of reaching an [Address].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    address: Address,
    proxy: Proxy,
    socket_addr: SocketAddr,
}

impl Route {
    pub fn new(address: Address, proxy: Proxy, socket_addr: SocketAddr) -> Self {
        Self {
            address,
            proxy,
            socket_addr,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// socket address of the target or, when proxied, of the proxy.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// https through an http proxy needs a CONNECT tunnel.
    pub fn requires_tunnel(&self) -> bool {
        self.address.is_tls() && !self.proxy.is_direct()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {} at {}", self.address, self.proxy, self.socket_addr)
    }
}

/// Routes that failed during one call.
#[derive(Default)]
pub(crate) struct RouteDatabase {
    failed: HashSet<Route>,
}

impl RouteDatabase {
    pub(crate) fn failed(&mut self, route: &Route) {
        self.failed.insert(route.clone());
    }

    pub(crate) fn connected(&mut self, route: &Route) {
        self.failed.remove(route);
    }

    pub(crate) fn should_postpone(&self, route: &Route) -> bool {
        self.failed.contains(route)
    }
}

pub(crate) struct RouteSelector<'a> {
    pub(crate) resolver: &'a Resolver,
    pub(crate) proxy_selector: &'a dyn ProxySelector,
    pub(crate) resolve_timeout: core::time::Duration,
}

impl RouteSelector<'_> {
    /// Produce every route of the address. Routes failed earlier in the same call are moved to the
    /// tail in their original relative order.
    pub(crate) async fn plan(
        &self,
        address: &Address,
        uri: &Uri,
        db: &RouteDatabase,
        events: &Events,
    ) -> Result<Vec<Route>, Error> {
        let proxies = match address.proxy() {
            Some(proxy) => vec![proxy.clone()],
            None => {
                let proxies = self.proxy_selector.select(uri);
                if proxies.is_empty() { vec![Proxy::Direct] } else { proxies }
            }
        };

        let mut routes = Vec::new();
        let mut last_err = None;

        for proxy in proxies {
            let (host, port) = match proxy {
                Proxy::Direct => (address.host(), address.port()),
                Proxy::Http { ref host, port } => (host.as_str(), port),
            };

            match self.resolve(host, port, events).await {
                Ok(addrs) => routes.extend(addrs.into_iter().map(|a| Route::new(address.clone(), proxy.clone(), a))),
                Err(e) => {
                    debug!("failed to resolve {host}:{port} for {address}: {e}");
                    last_err = Some(e);
                }
            }
        }

        if routes.is_empty() {
            return Err(last_err.unwrap_or_else(|| ResolveError::new(address.host()).into()));
        }

        let (fresh, postponed): (Vec<_>, Vec<_>) = routes.into_iter().partition(|r| !db.should_postpone(r));

        Ok(fresh.into_iter().chain(postponed).collect())
    }

    async fn resolve(&self, host: &str, port: u16, events: &Events) -> Result<Vec<SocketAddr>, Error> {
        // literal addresses skip the resolver.
        if let Ok(ip) = host.parse() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        events.dns_start(host);

        let addrs = timed(self.resolver.resolve(host, port), self.resolve_timeout, TimeoutError::Resolve)
            .await
            .map_err(|e| match e {
                e @ (Error::NameResolution(_) | Error::Timeout(_)) => e,
                e => ResolveError::with_source(host, e).into(),
            })?;

        events.dns_end(host, &addrs);

        if addrs.is_empty() {
            return Err(ResolveError::new(host).into());
        }

        Ok(addrs)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::{address::Protocol, event::NoopEventListener, resolver::Resolve};

    use super::*;

    struct Fixed(Vec<SocketAddr>);

    impl Resolve for Fixed {
        async fn resolve(&self, _: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
            Ok(self.0.iter().map(|a| SocketAddr::new(a.ip(), port)).collect())
        }
    }

    fn address(proxy: Option<Proxy>) -> Address {
        Address::from_uri(
            &Uri::from_static("http://example.com/"),
            &[Protocol::Http11],
            proxy.as_ref(),
        )
        .unwrap()
    }

    fn ips() -> Vec<SocketAddr> {
        vec!["10.0.0.1:0".parse().unwrap(), "10.0.0.2:0".parse().unwrap()]
    }

    #[tokio::test]
    async fn postpone_failed() {
        let resolver = Resolver::custom(Fixed(ips()));
        let selector = RouteSelector {
            resolver: &resolver,
            proxy_selector: &crate::proxy::NoProxy,
            resolve_timeout: core::time::Duration::from_secs(1),
        };
        let events = Events::new(Arc::new(NoopEventListener), 0);
        let address = address(None);
        let uri = Uri::from_static("http://example.com/");
        let mut db = RouteDatabase::default();

        let routes = selector.plan(&address, &uri, &db, &events).await.unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].socket_addr(), "10.0.0.1:80".parse().unwrap());

        db.failed(&routes[0]);
        let replanned = selector.plan(&address, &uri, &db, &events).await.unwrap();
        assert_eq!(replanned, [routes[1].clone(), routes[0].clone()]);

        db.connected(&routes[0]);
        let replanned = selector.plan(&address, &uri, &db, &events).await.unwrap();
        assert_eq!(replanned, routes);
    }

    #[tokio::test]
    async fn proxies_times_addresses() {
        let resolver = Resolver::custom(Fixed(ips()));
        let selector_fn = |_: &Uri| vec![Proxy::http("proxy.local", 3128), Proxy::Direct];
        let selector = RouteSelector {
            resolver: &resolver,
            proxy_selector: &selector_fn,
            resolve_timeout: core::time::Duration::from_secs(1),
        };
        let events = Events::new(Arc::new(NoopEventListener), 0);

        let routes = selector
            .plan(
                &address(None),
                &Uri::from_static("http://example.com/"),
                &RouteDatabase::default(),
                &events,
            )
            .await
            .unwrap();

        let got = routes.iter().map(|r| (r.proxy().is_direct(), r.socket_addr().port())).collect::<Vec<_>>();
        assert_eq!(got, [(false, 3128), (false, 3128), (true, 80), (true, 80)]);
    }

    #[tokio::test]
    async fn empty_resolution() {
        let resolver = Resolver::custom(Fixed(Vec::new()));
        let selector = RouteSelector {
            resolver: &resolver,
            proxy_selector: &crate::proxy::NoProxy,
            resolve_timeout: core::time::Duration::from_secs(1),
        };
        let events = Events::new(Arc::new(NoopEventListener), 0);

        let err = selector
            .plan(
                &address(None),
                &Uri::from_static("http://example.com/"),
                &RouteDatabase::default(),
                &events,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NameResolution(_)));
    }
}
