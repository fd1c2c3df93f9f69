//! one request/response cycle bound to one connection.

use core::time::Duration;

use tracing::debug;

use crate::{
    address::Address,
    bytes::Bytes,
    client::ClientInner,
    error::{Error, ErrorMultiple, TimeoutError},
    event::Events,
    h1::{
        body::H1Body,
        codec::ResponseHead,
        proto::{write_request, H1Stream, RequestTarget},
    },
    h2::connection::StreamRef,
    http::{response, Method, Request, Uri},
    pool::Lease,
    retry::ExchangeFailure,
    route::{Route, RouteDatabase, RouteSelector},
    timeout::timed,
};

// time spent draining an unwanted body so its connection can serve the next request.
const DISCARD_TIMEOUT: Duration = Duration::from_millis(100);

impl ClientInner {
    /// Find a pooled connection for `address` or dial a new one. Every route of the plan is
    /// tried once before giving up.
    pub(crate) async fn acquire(
        &self,
        address: &Address,
        uri: &Uri,
        db: &mut RouteDatabase,
        events: &Events,
    ) -> Result<Lease, ExchangeFailure> {
        if let Some(lease) = self.pool.acquire(address, None, false) {
            return Ok(lease);
        }

        let selector = RouteSelector {
            resolver: &self.resolver,
            proxy_selector: &*self.proxy_selector,
            resolve_timeout: self.timeout_config.resolve_timeout,
        };

        let routes = selector.plan(address, uri, db, events).await?;

        // an http/2 connection of another host may cover this one.
        if let Some(lease) = self.pool.acquire(address, Some(&routes), true) {
            return Ok(lease);
        }

        let mut errors = ErrorMultiple::default();

        for route in routes.iter() {
            match self.connect(route, events).await {
                Ok(conn) => {
                    db.connected(route);
                    return Ok(self.pool.register_or_coalesce(conn, address, &routes));
                }
                Err(e @ (Error::Certificate(_) | Error::Feature(_) | Error::Tunnel(_))) => {
                    return Err(ExchangeFailure {
                        route: Some(route.clone()),
                        ..ExchangeFailure::new(e)
                    });
                }
                Err(e) => {
                    db.failed(route);
                    errors.push(route.clone(), e);
                }
            }
        }

        Err(ExchangeFailure::new(errors.into()))
    }

    /// Write the request on the leased connection.
    pub(crate) async fn send(
        &self,
        lease: Lease,
        address: &Address,
        req: &Request<Bytes>,
        events: &Events,
    ) -> Result<Sent, ExchangeFailure> {
        let conn = lease.connection().clone();

        if let Some(h2) = conn.h2() {
            let path = req.uri().path_and_query().map_or("/", |p| p.as_str());
            let authority = address.authority(false);
            let body = req.body();

            let stream = h2
                .open_stream(
                    req.method(),
                    address.scheme().as_str(),
                    &authority,
                    path,
                    req.headers(),
                    body.is_empty(),
                )
                .await
                .map_err(|e| failure(&lease, e, false, false))?;

            events.request_headers_end(req.method(), req.uri());

            if !body.is_empty() {
                timed(
                    stream.send_data(body.clone(), true),
                    self.timeout_config.write_timeout,
                    TimeoutError::Write,
                )
                .await
                .map_err(|e| failure(&lease, e, true, false))?;
            }

            events.request_body_end(body.len() as u64);

            return Ok(Sent {
                lease,
                inner: SentInner::H2(stream),
            });
        }

        let Some(mut stream) = conn.take_h1() else {
            // lost to a concurrent close. nothing was written.
            return Err(failure(&lease, Error::ConnectionShutdown { refused: true }, false, false));
        };

        // plain http through a proxy uses absolute-form.
        let absolute = !conn.route().proxy().is_direct() && !address.is_tls();
        let uri = absolute.then(|| req.uri().to_string());
        let target = match uri {
            Some(ref uri) => uri.as_str(),
            None => req.uri().path_and_query().map_or("/", |p| p.as_str()),
        };
        let host = address.authority(false);

        let target = RequestTarget {
            method: req.method(),
            uri: req.uri(),
            target,
            host: &host,
            headers: req.headers(),
        };

        match write_request(&mut stream, target, req.body(), &self.timeout_config, events).await {
            Ok(early) => Ok(Sent {
                lease,
                inner: SentInner::H1 {
                    stream,
                    early,
                    is_head: req.method() == Method::HEAD,
                },
            }),
            Err(e) => Err(failure(&lease, e, stream.request_written(), stream.response_started())),
        }
    }
}

fn failure(lease: &Lease, error: Error, request_written: bool, response_started: bool) -> ExchangeFailure {
    let conn = lease.connection();
    ExchangeFailure {
        error,
        route: Some(conn.route().clone()),
        connection_id: Some(conn.id()),
        reused: lease.is_reused(),
        request_written,
        response_started,
    }
}

/// A request that was written and awaits its response.
pub(crate) struct Sent {
    inner: SentInner,
    lease: Lease,
}

enum SentInner {
    H1 {
        stream: H1Stream,
        /// head the peer sent before the body was fully written.
        early: Option<ResponseHead>,
        is_head: bool,
    },
    H2(StreamRef),
}

impl Sent {
    /// Wait for the final response head.
    pub(crate) async fn receive(self, read_timeout: Duration, events: &Events) -> Result<(response::Parts, Exchange), ExchangeFailure> {
        let Self { lease, inner } = self;

        let (parts, body) = match inner {
            SentInner::H1 {
                mut stream,
                early,
                is_head,
            } => {
                let head = match early {
                    Some(head) => head,
                    None => match stream.read_head(is_head, read_timeout).await {
                        Ok(head) => head,
                        Err(e) => {
                            let started = stream.response_started();
                            return Err(failure(&lease, e, true, started));
                        }
                    },
                };

                let body = H1Body::new(stream, head.coding, head.keep_alive, read_timeout);
                (head.parts, ExchangeBody::H1(body))
            }
            SentInner::H2(stream) => {
                let parts = timed(stream.response(), read_timeout, TimeoutError::Read)
                    .await
                    .map_err(|e| failure(&lease, e, true, false))?;
                (parts, ExchangeBody::H2(stream))
            }
        };

        events.response_headers_end(parts.status);

        Ok((
            parts,
            Exchange {
                lease,
                body,
                read_timeout,
            },
        ))
    }
}

enum ExchangeBody {
    H1(H1Body),
    H2(StreamRef),
}

/// Response body source of a completed exchange. Holds the connection until released.
pub(crate) struct Exchange {
    // dropped before the lease so the transport is gone when the connection is released.
    body: ExchangeBody,
    lease: Lease,
    read_timeout: Duration,
}

impl Exchange {
    pub(crate) fn route(&self) -> &Route {
        self.lease.connection().route()
    }

    pub(crate) async fn chunk(&mut self) -> Option<Result<Bytes, Error>> {
        match self.body {
            ExchangeBody::H1(ref mut body) => body.chunk().await,
            ExchangeBody::H2(ref stream) => {
                match timed(async { Ok::<_, Error>(stream.data().await) }, self.read_timeout, TimeoutError::Read).await {
                    Ok(res) => res,
                    Err(e) => Some(Err(e)),
                }
            }
        }
    }

    /// Drain what is left of an unwanted body for a short moment.
    pub(crate) async fn discard(&mut self) {
        let drain = async {
            while let Some(chunk) = self.chunk().await {
                chunk?;
            }
            Ok::<_, Error>(())
        };

        if let Err(e) = timed(drain, DISCARD_TIMEOUT, TimeoutError::Read).await {
            debug!("response body discarded: {e}");
        }
    }

    /// Give the connection back. An http/1 transport is reused only when its body was read to
    /// the end.
    pub(crate) fn release(self, events: &Events) {
        let Self { lease, body, .. } = self;

        match body {
            ExchangeBody::H1(mut body) => {
                if let Some(stream) = body.take_reusable() {
                    lease.connection().put_h1(stream);
                }
            }
            ExchangeBody::H2(stream) => drop(stream),
        }

        events.connection_released(lease.connection());
    }
}
