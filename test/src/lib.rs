use std::{
    error,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use bytes::{Buf, Bytes, BytesMut};
use conduit_client::h2::{
    frame::{Frame, PREFACE},
    settings::Setting,
};
use http::{header, Request, Response};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

pub type Error = Box<dyn error::Error + Send + Sync>;

/// Position of a request on the server side. Inserted into every request's extensions.
#[derive(Clone, Copy, Debug)]
pub struct Seen {
    /// index of the accepted connection, starting at 0.
    pub connection: usize,
    /// index of the request on its connection, starting at 0.
    pub nth: usize,
}

/// What a scripted server does with one request.
pub enum Reply {
    Send(Response<Bytes>),
    /// write given bytes as they are.
    Raw(&'static [u8]),
    /// close the connection without answering.
    Hangup,
    /// keep the connection open and never answer.
    Stall,
}

impl Reply {
    pub fn text(body: &'static str) -> Self {
        Self::Send(Response::new(Bytes::from_static(body.as_bytes())))
    }

    pub fn status(status: u16) -> Self {
        let mut res = Response::new(Bytes::new());
        *res.status_mut() = http::StatusCode::from_u16(status).expect("valid status");
        Self::Send(res)
    }
}

/// A scripted http/1.1 server. `handler` runs for every request in arrival order.
pub async fn test_h1_server<F>(handler: F) -> Result<TestServerHandle, Error>
where
    F: Fn(Request<Bytes>) -> Reply + Send + Sync + 'static,
{
    let lst = TcpListener::bind("127.0.0.1:0").await?;
    let addr = lst.local_addr()?;

    let handler = Arc::new(handler);
    let accepted = Arc::new(AtomicUsize::new(0));

    let handle = tokio::spawn({
        let accepted = accepted.clone();
        async move {
            while let Ok((stream, _)) = lst.accept().await {
                let connection = accepted.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                tokio::spawn(async move {
                    let _ = serve_h1(stream, connection, &*handler).await;
                });
            }
        }
    });

    Ok(TestServerHandle { addr, accepted, handle })
}

async fn serve_h1<F>(mut stream: TcpStream, connection: usize, handler: &F) -> Result<(), Error>
where
    F: Fn(Request<Bytes>) -> Reply,
{
    let mut buf = BytesMut::new();
    let mut nth = 0;

    while let Some(mut req) = read_request(&mut stream, &mut buf).await? {
        req.extensions_mut().insert(Seen { connection, nth });
        nth += 1;

        let is_head = req.method() == http::Method::HEAD;

        match handler(req) {
            Reply::Send(res) => write_response(&mut stream, res, is_head).await?,
            Reply::Raw(bytes) => stream.write_all(bytes).await?,
            Reply::Hangup => return Ok(()),
            Reply::Stall => {
                // wait for the client to go away.
                while stream.read_buf(&mut buf).await? != 0 {}
                return Ok(());
            }
        }
    }

    Ok(())
}

async fn read_request(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<Option<Request<Bytes>>, Error> {
    loop {
        let head = {
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut parsed = httparse::Request::new(&mut headers);

            match parsed.parse(buf)? {
                httparse::Status::Complete(len) => {
                    let mut builder = Request::builder()
                        .method(parsed.method.unwrap_or("GET"))
                        .uri(parsed.path.unwrap_or("/"));

                    let mut content_length = 0;
                    for h in parsed.headers.iter() {
                        if h.name.eq_ignore_ascii_case("content-length") {
                            content_length = std::str::from_utf8(h.value)?.trim().parse()?;
                        }
                        builder = builder.header(h.name, h.value);
                    }

                    Some((builder, len, content_length))
                }
                httparse::Status::Partial => None,
            }
        };

        if let Some((builder, len, content_length)) = head {
            buf.advance(len);

            while buf.len() < content_length {
                if stream.read_buf(buf).await? == 0 {
                    return Err("connection closed inside request body".into());
                }
            }

            let body = buf.split_to(content_length).freeze();
            return Ok(Some(builder.body(body)?));
        }

        if stream.read_buf(buf).await? == 0 {
            return match buf.is_empty() {
                true => Ok(None),
                false => Err("connection closed inside request head".into()),
            };
        }
    }
}

async fn write_response(stream: &mut TcpStream, res: Response<Bytes>, is_head: bool) -> Result<(), Error> {
    let (parts, body) = res.into_parts();

    let mut head = format!("HTTP/1.1 {}\r\n", parts.status);
    for (name, value) in parts.headers.iter() {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(value.to_str()?);
        head.push_str("\r\n");
    }
    if !parts.headers.contains_key(header::CONTENT_LENGTH) {
        head.push_str(&format!("content-length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await?;
    if !is_head {
        stream.write_all(&body).await?;
    }

    Ok(())
}

pub struct TestServerHandle {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip_port_string(&self) -> String {
        format!("{}:{}", self.addr.ip(), self.addr.port())
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Future for TestServerHandle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().handle).poll(cx).map(|_| ())
    }
}

/// Server side of one http/2 connection, scripted frame by frame.
pub struct H2Peer {
    io: TcpStream,
    buf: BytesMut,
    encoder: fluke_hpack::Encoder<'static>,
    decoder: fluke_hpack::Decoder<'static>,
}

impl H2Peer {
    /// Accept one connection, check the client preface and announce `settings`.
    pub async fn accept(lst: &TcpListener, settings: Vec<Setting>) -> Result<Self, Error> {
        let (io, _) = lst.accept().await?;

        let mut peer = Self {
            io,
            buf: BytesMut::new(),
            encoder: fluke_hpack::Encoder::new(),
            decoder: fluke_hpack::Decoder::new(),
        };

        peer.send(Frame::Settings { ack: false, settings }).await?;

        while peer.buf.len() < PREFACE.len() {
            if peer.io.read_buf(&mut peer.buf).await? == 0 {
                return Err("client closed before preface".into());
            }
        }
        if &peer.buf[..PREFACE.len()] != PREFACE {
            return Err("invalid preface".into());
        }
        peer.buf.advance(PREFACE.len());

        match peer.frame().await? {
            Frame::Settings { ack: false, .. } => peer.send(Frame::Settings { ack: true, settings: Vec::new() }).await?,
            frame => return Err(format!("expected SETTINGS, got {}", frame.name()).into()),
        }

        Ok(peer)
    }

    pub async fn frame(&mut self) -> Result<Frame, Error> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf, 1 << 20)? {
                return Ok(frame);
            }
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err("client closed".into());
            }
        }
    }

    /// Next frame that is not a SETTINGS ack, WINDOW_UPDATE or PING.
    pub async fn significant(&mut self) -> Result<Frame, Error> {
        loop {
            match self.frame().await? {
                Frame::Settings { ack: true, .. } | Frame::WindowUpdate { .. } => continue,
                Frame::Ping { ack: false, payload } => self.send(Frame::Ping { ack: true, payload }).await?,
                frame => return Ok(frame),
            }
        }
    }

    /// Wait for a request HEADERS frame and return its stream id and decoded fields. DATA and
    /// RST_STREAM frames of earlier streams are skipped.
    pub async fn request(&mut self) -> Result<(u32, Vec<(Vec<u8>, Vec<u8>)>), Error> {
        loop {
            match self.significant().await? {
                Frame::Headers { stream_id, block, .. } => {
                    let fields = self.decoder.decode(&block).map_err(|e| format!("hpack: {e:?}"))?;
                    return Ok((stream_id, fields));
                }
                Frame::Data { .. } | Frame::RstStream { .. } => continue,
                frame => return Err(format!("expected HEADERS, got {}", frame.name()).into()),
            }
        }
    }

    /// Collect the request body of `stream_id` up to its end of stream.
    pub async fn body(&mut self, stream_id: u32) -> Result<Bytes, Error> {
        let mut body = BytesMut::new();
        loop {
            match self.significant().await? {
                Frame::Data {
                    stream_id: id,
                    payload,
                    end_stream,
                    ..
                } if id == stream_id => {
                    body.extend_from_slice(&payload);
                    if end_stream {
                        return Ok(body.freeze());
                    }
                }
                frame => return Err(format!("expected DATA of stream {stream_id}, got {}", frame.name()).into()),
            }
        }
    }

    pub async fn send(&mut self, frame: Frame) -> Result<(), Error> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        self.io.write_all(&buf).await?;
        Ok(())
    }

    /// Answer a stream with given status and body in one HEADERS and one DATA frame.
    pub async fn respond(&mut self, stream_id: u32, status: u16, body: &'static [u8]) -> Result<(), Error> {
        let status = status.to_string();
        let block = self.encoder.encode([(&b":status"[..], status.as_bytes())]);
        self.send(Frame::Headers {
            stream_id,
            block: block.into(),
            end_stream: body.is_empty(),
            end_headers: true,
        })
        .await?;

        if !body.is_empty() {
            self.send(Frame::data(stream_id, body, true)).await?;
        }

        Ok(())
    }
}
