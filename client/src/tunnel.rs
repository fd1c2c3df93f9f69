//! CONNECT tunnel through an http proxy.

use std::io;

use bytes::BytesMut;
use tracing::debug;

use crate::{
    address::Address,
    bytes::Bytes,
    error::Error,
    h1::{body::H1Body, codec::encode_head, proto::H1Stream},
    http::{header, HeaderValue, Method, Request, Response, StatusCode},
    timeout::TimeoutConfig,
    tls::stream::BoxedIo,
};

pub(crate) enum Tunnel {
    /// io is now a byte stream to the target.
    Ready(BoxedIo),
    /// proxy asked for credentials. `io` is returned when the proxy kept the connection open.
    Challenge {
        response: Response<()>,
        io: Option<BoxedIo>,
    },
}

/// The CONNECT request handed to the proxy authenticator.
pub(crate) fn request(address: &Address) -> Result<Request<Bytes>, Error> {
    let authority = address.authority(true);
    let req = Request::builder()
        .method(Method::CONNECT)
        .uri(authority.as_str())
        .header(header::HOST, authority.as_str())
        .header("proxy-connection", HeaderValue::from_static("Keep-Alive"))
        .body(Bytes::new())?;
    Ok(req)
}

/// Send `req` over a fresh proxy connection and read the proxy's answer.
pub(crate) async fn open(io: BoxedIo, req: &Request<Bytes>, timeouts: &TimeoutConfig) -> Result<Tunnel, Error> {
    let mut stream = H1Stream::new(io);

    let target = req
        .uri()
        .authority()
        .map(|a| a.as_str())
        .unwrap_or_default()
        .to_owned();

    let mut buf = BytesMut::new();
    encode_head(&mut buf, &Method::CONNECT, &target, &target, req.headers(), 0);
    stream.write(&buf, timeouts.write_timeout).await?;

    let head = stream.read_head(false, timeouts.read_timeout).await?;
    let status = head.parts.status;

    if status.is_success() {
        // the target speaks first only after our tls hello.
        if !stream.buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "proxy sent data after CONNECT response").into());
        }
        debug!("tunnel to {target} established");
        return Ok(Tunnel::Ready(stream.into_io()));
    }

    if status != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        return Err(Error::Tunnel(status));
    }

    let mut body = H1Body::new(stream, head.coding, head.keep_alive, timeouts.read_timeout);
    while let Some(chunk) = body.chunk().await {
        chunk?;
    }

    let io = body.take_reusable().map(H1Stream::into_io);

    Ok(Tunnel::Challenge {
        response: Response::from_parts(head.parts, ()),
        io,
    })
}
