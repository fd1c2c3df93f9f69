//! follow up requests derived from a response: redirects, authentication challenges and
//! server requested retries.

use tracing::debug;

use crate::{
    auth::Authenticator,
    bytes::Bytes,
    http::{header, uri, Method, Request, Response, StatusCode, Uri},
    request::clone_request,
    route::Route,
};

pub(crate) struct FollowUpPolicy<'a> {
    pub(crate) follow_redirects: bool,
    pub(crate) follow_ssl_redirects: bool,
    pub(crate) retry_on_connection_failure: bool,
    pub(crate) authenticator: Option<&'a dyn Authenticator>,
    pub(crate) proxy_authenticator: Option<&'a dyn Authenticator>,
}

impl FollowUpPolicy<'_> {
    /// The request to send after `res`, or `None` when `res` is the final response.
    ///
    /// `prior` is the status of the response that led to `req`, if any.
    pub(crate) fn follow_up(
        &self,
        res: &Response<()>,
        req: &Request<Bytes>,
        route: Option<&Route>,
        prior: Option<StatusCode>,
    ) -> Option<Request<Bytes>> {
        let status = res.status();
        match status {
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                if route.is_none_or(|r| r.proxy().is_direct()) {
                    debug!("407 from a direct connection is not followed");
                    return None;
                }
                self.proxy_authenticator?.authenticate(route, res, req)
            }
            StatusCode::UNAUTHORIZED => self.authenticator?.authenticate(route, res, req),
            StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT => self.redirect(res, req),
            StatusCode::REQUEST_TIMEOUT => {
                if !self.retry_on_connection_failure || prior == Some(StatusCode::REQUEST_TIMEOUT) {
                    return None;
                }
                (retry_after(res, 0) == 0).then(|| clone_request(req))
            }
            StatusCode::SERVICE_UNAVAILABLE => {
                if prior == Some(StatusCode::SERVICE_UNAVAILABLE) {
                    return None;
                }
                // only an explicit zero asks for an immediate retry.
                (retry_after(res, u64::MAX) == 0).then(|| clone_request(req))
            }
            _ => None,
        }
    }

    fn redirect(&self, res: &Response<()>, req: &Request<Bytes>) -> Option<Request<Bytes>> {
        if !self.follow_redirects {
            return None;
        }

        let location = res.headers().get(header::LOCATION)?.to_str().ok()?;
        let uri = resolve(req.uri(), location)?;

        if uri.scheme() != req.uri().scheme() && !self.follow_ssl_redirects {
            debug!("redirect across schemes to {uri} is not followed");
            return None;
        }

        let mut next = clone_request(req);

        let status = res.status();
        let keep_body = status == StatusCode::TEMPORARY_REDIRECT || status == StatusCode::PERMANENT_REDIRECT;
        if !keep_body {
            if req.method() != Method::GET && req.method() != Method::HEAD {
                *next.method_mut() = Method::GET;
                *next.body_mut() = Bytes::new();
            }
            let headers = next.headers_mut();
            headers.remove(header::TRANSFER_ENCODING);
            headers.remove(header::CONTENT_LENGTH);
            headers.remove(header::CONTENT_TYPE);
        }

        if !same_origin(req.uri(), &uri) {
            let headers = next.headers_mut();
            headers.remove(header::AUTHORIZATION);
            headers.remove(header::PROXY_AUTHORIZATION);
            headers.remove(header::COOKIE);
            headers.remove(header::HOST);
        }

        debug!("redirect {} -> {uri}", req.uri());
        *next.uri_mut() = uri;

        Some(next)
    }
}

/// seconds of a `Retry-After` header. A date or garbage counts as a long wait.
fn retry_after(res: &Response<()>, default: u64) -> u64 {
    match res.headers().get(header::RETRY_AFTER) {
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(u64::MAX),
        None => default,
    }
}

fn same_origin(a: &Uri, b: &Uri) -> bool {
    a.scheme() == b.scheme() && a.host() == b.host() && a.port_u16() == b.port_u16()
}

/// Resolve a `Location` value against the uri of the request it answers.
fn resolve(base: &Uri, location: &str) -> Option<Uri> {
    let scheme = base.scheme_str()?;

    let resolved = if location.starts_with("//") {
        format!("{scheme}:{location}")
    } else if location.starts_with('/') {
        format!("{scheme}://{}{location}", base.authority()?)
    } else {
        match location.parse::<Uri>() {
            Ok(uri) if uri.scheme().is_some() => {
                if !matches!(uri.scheme_str(), Some("http" | "https")) {
                    return None;
                }
                location.to_owned()
            }
            _ => {
                let path = base.path();
                let dir = &path[..path.rfind('/').map_or(0, |i| i + 1)];
                format!("{scheme}://{}{dir}{location}", base.authority()?)
            }
        }
    };

    let mut parts = resolved.parse::<Uri>().ok()?.into_parts();
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(uri::PathAndQuery::from_static("/"));
    }
    Uri::from_parts(parts).ok()
}
