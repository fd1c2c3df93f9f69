use core::{
    fmt,
    ops::{Deref, DerefMut},
};

use tracing::debug;

use crate::{
    body::ResponseBody,
    bytes::BytesMut,
    error::Error,
    http::{self, StatusCode},
    route::Route,
};

const DEFAULT_PAYLOAD_LIMIT: usize = 1024 * 1024 * 8;

pub struct Response<const PAYLOAD_LIMIT: usize = DEFAULT_PAYLOAD_LIMIT> {
    res: http::Response<ResponseBody>,
    prior: Vec<StatusCode>,
    route: Route,
}

impl<const PAYLOAD_LIMIT: usize> Deref for Response<PAYLOAD_LIMIT> {
    type Target = http::Response<ResponseBody>;

    fn deref(&self) -> &Self::Target {
        &self.res
    }
}

impl<const PAYLOAD_LIMIT: usize> DerefMut for Response<PAYLOAD_LIMIT> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.res
    }
}

impl<const PAYLOAD_LIMIT: usize> fmt::Debug for Response<PAYLOAD_LIMIT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.res)
    }
}

impl<const PAYLOAD_LIMIT: usize> Response<PAYLOAD_LIMIT> {
    pub(crate) fn new(res: http::Response<ResponseBody>, prior: Vec<StatusCode>, route: Route) -> Self {
        Self { res, prior, route }
    }

    /// Get a reference of the inner response type.
    pub fn inner(&self) -> &http::Response<ResponseBody> {
        &self.res
    }

    /// Get a mutable reference of the inner response type.
    pub fn inner_mut(&mut self) -> &mut http::Response<ResponseBody> {
        &mut self.res
    }

    pub fn into_inner(self) -> http::Response<ResponseBody> {
        self.res
    }

    /// Status codes of the responses that were followed up before this one, oldest first.
    /// Empty when the first response was the final one.
    pub fn prior(&self) -> &[StatusCode] {
        &self.prior
    }

    /// The route of the connection this response arrived on.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Set payload size limit in bytes. Payload size beyond limit would be discarded.
    ///
    /// Default to 8 Mb.
    #[inline]
    pub fn limit<const PAYLOAD_LIMIT_2: usize>(self) -> Response<PAYLOAD_LIMIT_2> {
        Response {
            res: self.res,
            prior: self.prior,
            route: self.route,
        }
    }

    /// Collect response body as String. Response is consumed.
    pub async fn string(self) -> Result<String, Error> {
        let bytes = self.collect().await?;
        Ok(core::str::from_utf8(&bytes)?.to_owned())
    }

    /// Collect response body as Vec<u8>. Response is consumed.
    #[inline]
    pub async fn body(self) -> Result<Vec<u8>, Error> {
        self.collect().await.map(|buf| buf.to_vec())
    }

    async fn collect(self) -> Result<BytesMut, Error> {
        let (res, mut body) = self.res.into_parts();

        let limit = res
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok().and_then(|str| str.parse::<usize>().ok()))
            .unwrap_or(PAYLOAD_LIMIT);

        let limit = core::cmp::min(limit, PAYLOAD_LIMIT);

        let mut buf = BytesMut::with_capacity(core::cmp::min(limit, 1024 * 64));

        while let Some(chunk) = body.chunk().await {
            buf.extend_from_slice(&chunk?);

            if buf.len() > limit {
                // the rest of body is dropped together with its connection.
                debug!("PAYLOAD_LIMIT reached and only part of the response body is collected.");
                buf.truncate(limit);
                break;
            }
        }

        Ok(buf)
    }
}
