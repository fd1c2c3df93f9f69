//! request building.

use crate::{
    bytes::Bytes,
    call::Call,
    client::Client,
    error::Error,
    http::{
        header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE},
        Method, Request,
    },
    response::Response,
};

const TEXT_UTF8: HeaderValue = HeaderValue::from_static("text/plain; charset=utf-8");

/// builder type for [Call] with deferred error handling. The first error met while building is
/// returned when the call runs.
pub struct RequestBuilder {
    client: Client,
    req: Request<Bytes>,
    err: Option<Error>,
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, req: Request<Bytes>) -> Self {
        Self { client, req, err: None }
    }

    /// Set HTTP method of this request.
    #[inline]
    pub fn method(mut self, method: Method) -> Self {
        *self.req.method_mut() = method;
        self
    }

    /// Append a header. An invalid name or value fails the call.
    pub fn header<K, V>(mut self, key: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<crate::http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<crate::http::Error>,
    {
        let res = HeaderName::try_from(key)
            .map_err(Into::<crate::http::Error>::into)
            .and_then(|key| Ok((key, HeaderValue::try_from(value).map_err(Into::into)?)));

        match res {
            Ok((key, value)) => {
                self.req.headers_mut().append(key, value);
            }
            Err(e) => self.push_error(e.into()),
        }
        self
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        self.req.headers()
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.req.headers_mut()
    }

    /// Use text(utf-8 encoded) as request body.
    ///
    /// [CONTENT_TYPE] header would be set with value: `text/plain; charset=utf-8`.
    pub fn text<B>(mut self, text: B) -> Self
    where
        Bytes: From<B>,
    {
        self.headers_mut().insert(CONTENT_TYPE, TEXT_UTF8);
        self.body(text)
    }

    /// Use pre allocated bytes as request body.
    ///
    /// Input type must implement [From] trait with [Bytes].
    pub fn body<B>(mut self, body: B) -> Self
    where
        Bytes: From<B>,
    {
        let bytes = Bytes::from(body);
        let val = HeaderValue::from(bytes.len());
        self.headers_mut().insert(CONTENT_LENGTH, val);
        *self.req.body_mut() = bytes;
        self
    }

    /// Finish building and produce a [Call] that is not started yet.
    pub fn call(self) -> Call {
        Call::new(self.client.inner, self.req, self.err)
    }

    /// Finish request builder and send it to server.
    pub async fn send(self) -> Result<Response, Error> {
        self.call().execute().await
    }

    fn push_error(&mut self, e: Error) {
        self.err.get_or_insert(e);
    }
}

/// Copy of a request with a shared body. Useful for [Authenticator](crate::Authenticator)
/// implementations producing a follow up request.
///
/// Extensions are not carried over.
pub fn clone_request(req: &Request<Bytes>) -> Request<Bytes> {
    let mut next = Request::new(req.body().clone());
    *next.method_mut() = req.method().clone();
    *next.uri_mut() = req.uri().clone();
    *next.version_mut() = req.version();
    *next.headers_mut() = req.headers().clone();
    next
}
