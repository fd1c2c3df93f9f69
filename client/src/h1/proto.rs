use core::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::{
    error::{Error, TimeoutError},
    event::Events,
    http::{HeaderMap, Method, StatusCode, Uri},
    timeout::{timed, TimeoutConfig},
    tls::stream::BoxedIo,
};

use super::codec::{decode_head, encode_head, ResponseHead};

// bodies up to this size are written in the same buffer as the head.
const INLINE_BODY_LIMIT: usize = 16 * 1024;

/// Transport of an http/1 connection while it is held by one exchange.
pub(crate) struct H1Stream {
    io: BoxedIo,
    pub(crate) buf: BytesMut,
    written: bool,
    read_any: bool,
}

impl H1Stream {
    pub(crate) fn new(io: BoxedIo) -> Self {
        Self {
            io,
            buf: BytesMut::new(),
            written: false,
            read_any: false,
        }
    }

    /// prepare for the next exchange on a reused connection.
    pub(crate) fn reset(&mut self) {
        self.written = false;
        self.read_any = false;
    }

    pub(crate) fn into_io(self) -> BoxedIo {
        self.io
    }

    /// true once writing the request was attempted. bytes may have reached the peer.
    pub(crate) fn request_written(&self) -> bool {
        self.written
    }

    pub(crate) fn response_started(&self) -> bool {
        self.read_any
    }

    pub(crate) async fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), Error> {
        self.written = true;
        let io = &mut self.io;
        timed(
            async {
                io.write_all(bytes).await?;
                io.flush().await
            },
            timeout,
            TimeoutError::Write,
        )
        .await
    }

    /// read more bytes into the buffer. zero means the peer closed.
    pub(crate) async fn read(&mut self, timeout: Duration) -> Result<usize, Error> {
        let n = timed(self.io.read_buf(&mut self.buf), timeout, TimeoutError::Read).await?;
        if n > 0 {
            self.read_any = true;
        }
        Ok(n)
    }

    /// Read the final response head. Informational responses other than 101 are skipped.
    pub(crate) async fn read_head(&mut self, is_head_method: bool, timeout: Duration) -> Result<ResponseHead, Error> {
        loop {
            while let Some(head) = decode_head(&mut self.buf, is_head_method)? {
                let status = head.parts.status;
                if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
                    trace!("skipping informational response {status}");
                    continue;
                }
                return Ok(head);
            }

            if self.read(timeout).await? == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }
}

/// What the request line and Host header carry.
pub(crate) struct RequestTarget<'a> {
    pub(crate) method: &'a Method,
    pub(crate) uri: &'a Uri,
    /// origin-form path and query, or absolute-form through a proxy.
    pub(crate) target: &'a str,
    pub(crate) host: &'a str,
    pub(crate) headers: &'a HeaderMap,
}

/// Write one request. Returns the response head early when the peer answered before taking
/// the whole body.
pub(crate) async fn write_request(
    stream: &mut H1Stream,
    req: RequestTarget<'_>,
    body: &Bytes,
    timeouts: &TimeoutConfig,
    events: &Events,
) -> Result<Option<ResponseHead>, Error> {
    let mut buf = BytesMut::new();
    encode_head(&mut buf, req.method, req.target, req.host, req.headers, body.len());

    let inline = body.len() <= INLINE_BODY_LIMIT;
    if inline {
        buf.extend_from_slice(body);
    }

    stream.write(&buf, timeouts.write_timeout).await?;
    events.request_headers_end(req.method, req.uri);

    if !inline {
        if let Err(e) = stream.write(body, timeouts.write_timeout).await {
            // peer may have answered without reading the body. prefer its response when there is
            // one but never reuse the connection.
            return match stream.read_head(*req.method == Method::HEAD, timeouts.read_timeout).await {
                Ok(mut head) => {
                    head.keep_alive = false;
                    Ok(Some(head))
                }
                Err(_) => Err(e),
            };
        }
    }
    events.request_body_end(body.len() as u64);

    Ok(None)
}
