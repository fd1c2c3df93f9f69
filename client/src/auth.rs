use crate::{
    bytes::Bytes,
    http::{Request, Response},
    route::Route,
};

/// Trait for answering `401 Unauthorized` and `407 Proxy Authentication Required` challenges.
///
/// Return the request to send next, usually the given one with an `Authorization` or
/// `Proxy-Authorization` header added. `None` gives up and hands the challenge response to the
/// caller.
///
/// # Examples
/// ```rust
/// use conduit_client::{
///     bytes::Bytes,
///     http::{header, HeaderValue, Request, Response},
///     route::Route,
///     Authenticator, Client,
/// };
///
/// struct Bearer;
///
/// impl Authenticator for Bearer {
///     fn authenticate(&self, _: Option<&Route>, _: &Response<()>, req: &Request<Bytes>) -> Option<Request<Bytes>> {
///         // credentials were already rejected.
///         if req.headers().contains_key(header::AUTHORIZATION) {
///             return None;
///         }
///         let mut req = conduit_client::request::clone_request(req);
///         req.headers_mut()
///             .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer token"));
///         Some(req)
///     }
/// }
///
/// let client = Client::builder().authenticator(Bearer).finish();
/// ```
pub trait Authenticator: Send + Sync {
    /// `route` is the route of the challenged connection when one was established.
    fn authenticate(&self, route: Option<&Route>, response: &Response<()>, request: &Request<Bytes>) -> Option<Request<Bytes>>;
}

impl<F> Authenticator for F
where
    F: Fn(Option<&Route>, &Response<()>, &Request<Bytes>) -> Option<Request<Bytes>> + Send + Sync,
{
    fn authenticate(&self, route: Option<&Route>, response: &Response<()>, request: &Request<Bytes>) -> Option<Request<Bytes>> {
        self(route, response, request)
    }
}
