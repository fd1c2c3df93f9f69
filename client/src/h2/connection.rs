//! multiplexed connection engine.
//!
//! Shared state lives behind one lock that is never held across an await point. A reader task
//! owns the read half of the transport and the HPACK decoder. A writer task owns the write half
//! and drains an unbounded channel of encoded frames. Frames are encoded and enqueued while the
//! state lock is held so HPACK table updates and stream ids reach the wire in order.

use core::{cmp, pin::pin, time::Duration};

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, Notify},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    error::{Error, TimeoutError},
    http::{header, response, HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode, Version},
    task::TaskQueue,
    timeout::timed,
    tls::stream::BoxedIo,
};

use super::{
    error::{ErrorCode, H2Error},
    flow::{RecvWindow, Window, DEFAULT_WINDOW},
    frame::{Frame, PREFACE},
    settings::{Settings, DEFAULT_MAX_FRAME_SIZE},
    stream::{Cause, StreamState},
};

const MAX_STREAM_ID: u32 = 0x7fff_ffff;

// largest dynamic table the hpack encoder keeps, whatever the peer allows.
const ENCODER_TABLE_LIMIT: u32 = 4096;

pub(crate) struct H2Config {
    /// stream receive window announced to the peer. also the target of the connection window
    /// when larger than the protocol default.
    pub(crate) initial_window_size: u32,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
}

/// Reason a connection stopped. Replicated to every stream it fails.
#[derive(Debug, Clone)]
enum Failure {
    Io(io::ErrorKind, String),
    /// peer violated the protocol. GOAWAY is sent with the error's code.
    Local(H2Error),
    Timeout(TimeoutError),
    /// closed by the pool.
    Closed,
}

impl Failure {
    fn to_error(&self) -> Error {
        match self {
            Self::Io(kind, msg) => Error::Io(io::Error::new(*kind, msg.clone())),
            Self::Local(e) => e.clone().into(),
            Self::Timeout(e) => Error::Timeout(*e),
            Self::Closed => Error::ConnectionShutdown { refused: false },
        }
    }
}

impl From<io::Error> for Failure {
    fn from(e: io::Error) -> Self {
        Self::Io(e.kind(), e.to_string())
    }
}

impl From<H2Error> for Failure {
    fn from(e: H2Error) -> Self {
        Self::Local(e)
    }
}

#[derive(Debug, Clone)]
enum StreamFailure {
    Reset(ErrorCode),
    /// stream id above the last one GOAWAY accepted.
    Refused,
    /// we reset the stream after the peer misbehaved on it.
    Protocol(H2Error),
    Connection(Failure),
}

impl StreamFailure {
    fn to_error(&self, stream_id: u32) -> Error {
        match self {
            Self::Reset(code) => Error::StreamReset { stream_id, code: *code },
            Self::Refused => Error::ConnectionShutdown { refused: true },
            Self::Protocol(e) => e.clone().into(),
            Self::Connection(f) => f.to_error(),
        }
    }
}

struct Stream {
    state: StreamState,
    send: Window,
    recv: RecvWindow,
    /// response head waiting to be taken.
    head: Option<response::Parts>,
    head_received: bool,
    data: VecDeque<Bytes>,
    /// flow controlled bytes queued in `data` and not yet handed out.
    buffered: u32,
    error: Option<StreamFailure>,
    /// true while the stream counts against the peer's concurrency limit.
    counted: bool,
    notify: Arc<Notify>,
}

impl Stream {
    fn fail(&mut self, cause: Cause, failure: StreamFailure) {
        self.state.close(cause);
        self.error.get_or_insert(failure);
        self.notify.notify_one();
    }
}

struct State {
    streams: HashMap<u32, Stream>,
    next_stream_id: u32,
    peer: Settings,
    local_window: u32,
    local_acked: bool,
    send_window: Window,
    recv_window: RecvWindow,
    /// streams counted against the peer's concurrency limit.
    active: usize,
    goaway: Option<u32>,
    error: Option<Failure>,
    encoder: fluke_hpack::Encoder<'static>,
    encoder_table_size: u32,
    /// smallest table size since the last header block, signalled ahead of the next one.
    table_size_update: Option<u32>,
    ping: Option<[u8; 8]>,
    ping_seq: u64,
}

impl State {
    fn is_idle_stream(&self, stream_id: u32) -> bool {
        stream_id % 2 == 0 || stream_id >= self.next_stream_id
    }

    /// follow the peer's SETTINGS_HEADER_TABLE_SIZE.
    fn resize_encoder(&mut self, size: u32) {
        let size = cmp::min(size, ENCODER_TABLE_LIMIT);
        if size == self.encoder_table_size {
            return;
        }
        self.encoder_table_size = size;
        self.encoder.set_max_table_size(size as usize);
        self.table_size_update = Some(self.table_size_update.map_or(size, |min| cmp::min(min, size)));
    }

    fn encode_head(
        &mut self,
        method: &Method,
        scheme: &str,
        authority: &str,
        path: &str,
        headers: &HeaderMap,
    ) -> Vec<u8> {
        let mut block = Vec::new();
        if let Some(min) = self.table_size_update.take() {
            encode_table_size_update(&mut block, min);
            if min != self.encoder_table_size {
                encode_table_size_update(&mut block, self.encoder_table_size);
            }
        }
        block.extend(encode_head(&mut self.encoder, method, scheme, authority, path, headers));
        block
    }

    fn recv_initial(&self) -> u32 {
        // peer assumes the protocol default until it acknowledges our settings.
        if self.local_acked { self.local_window } else { DEFAULT_WINDOW }
    }

    /// drop a closed stream from the concurrency count. returns true when a slot was freed.
    fn settle(&mut self, stream_id: u32) -> bool {
        match self.streams.get_mut(&stream_id) {
            Some(stream) if stream.counted && stream.state.is_closed() => {
                stream.counted = false;
                self.active -= 1;
                true
            }
            _ => false,
        }
    }

    fn is_accepting(&self) -> bool {
        self.error.is_none() && self.goaway.is_none() && self.next_stream_id <= MAX_STREAM_ID
    }
}

struct Shared {
    state: Mutex<State>,
    /// woken when a stream slot frees up or the connection stops taking streams.
    capacity: Notify,
    tx: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
    on_shutdown: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn send(&self, frame: Frame) {
        trace!(target: "h2", "send {} stream={}", frame.name(), frame.stream_id());
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        // writer gone means the connection already failed.
        let _ = self.tx.send(buf.freeze());
    }

    /// return consumed credit of a stream and the connection to the peer.
    fn release(&self, state: &mut State, stream_id: u32, n: u32) {
        if n == 0 {
            return;
        }
        if let Some(increment) = state.recv_window.release(n) {
            self.send(Frame::WindowUpdate { stream_id: 0, increment });
        }
        if let Some(stream) = state.streams.get_mut(&stream_id) {
            if let Some(increment) = stream.recv.release(n) {
                if !stream.state.is_recv_closed() {
                    self.send(Frame::WindowUpdate { stream_id, increment });
                }
            }
        }
    }

    fn release_connection(&self, state: &mut State, n: u32) {
        if let Some(increment) = state.recv_window.release(n) {
            self.send(Frame::WindowUpdate { stream_id: 0, increment });
        }
    }

    fn reset(&self, state: &mut State, stream_id: u32, code: ErrorCode, error: H2Error) {
        warn!(target: "h2", "resetting stream {stream_id}: {error}");
        self.send(Frame::RstStream { stream_id, code });
        if let Some(stream) = state.streams.get_mut(&stream_id) {
            stream.fail(Cause::LocalReset(code), StreamFailure::Protocol(error));
            let buffered = core::mem::take(&mut stream.buffered);
            stream.data.clear();
            self.release_connection(state, buffered);
        }
        state.settle(stream_id);
    }

    fn fail(&self, failure: Failure) {
        {
            let mut guard = self.lock();
            let state = &mut *guard;

            if state.error.is_some() {
                return;
            }

            debug!(target: "h2", "connection failed: {failure:?}");

            if let Failure::Local(ref e) = failure {
                self.send(Frame::GoAway {
                    last_stream_id: 0,
                    code: e.code(),
                    debug: Bytes::from(e.to_string()),
                });
            }

            for stream in state.streams.values_mut() {
                if !stream.state.is_closed() {
                    stream.fail(Cause::Connection, StreamFailure::Connection(failure.clone()));
                }
                stream.counted = false;
                stream.notify.notify_one();
            }

            state.active = 0;
            state.error = Some(failure);
        }

        self.closed.cancel();
        self.capacity.notify_waiters();
        self.maybe_shutdown();
    }

    /// run the shutdown callback once the connection takes no new streams and none is open.
    fn maybe_shutdown(&self) {
        let done = {
            let state = self.lock();
            !state.is_accepting() && state.active == 0
        };

        if done {
            let callback = self.on_shutdown.lock().unwrap().take();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    fn recv_frame(&self, frame: Frame, pending: &mut Option<PendingHeaders>, decoder: &mut Decoder) -> Result<(), Failure> {
        trace!(target: "h2", "recv {} stream={} len={}", frame.name(), frame.stream_id(), frame.flow_len());

        if let Some(ref p) = *pending {
            match frame {
                Frame::Continuation { stream_id, .. } if stream_id == p.stream_id => {}
                _ => return Err(H2Error::protocol("header block interrupted").into()),
            }
        }

        match frame {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                padding,
            } => {
                let flow_len = payload.len() as u32 + padding.map(|p| u32::from(p) + 1).unwrap_or(0);
                self.recv_data(stream_id, payload, end_stream, flow_len)
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
            } => {
                if end_headers {
                    self.recv_headers(stream_id, &block, end_stream, decoder)
                } else {
                    *pending = Some(PendingHeaders {
                        stream_id,
                        block: BytesMut::from(&block[..]),
                        end_stream,
                    });
                    Ok(())
                }
            }
            Frame::Continuation {
                block, end_headers, ..
            } => {
                let Some(p) = pending.as_mut() else {
                    return Err(H2Error::protocol("CONTINUATION without HEADERS").into());
                };
                p.block.extend_from_slice(&block);
                if end_headers {
                    if let Some(p) = pending.take() {
                        self.recv_headers(p.stream_id, &p.block, p.end_stream, decoder)?;
                    }
                }
                Ok(())
            }
            Frame::RstStream { stream_id, code } => self.recv_reset(stream_id, code),
            Frame::Settings { ack, settings } => self.recv_settings(ack, settings),
            Frame::PushPromise { .. } => Err(H2Error::protocol("PUSH_PROMISE with push disabled").into()),
            Frame::Ping { ack, payload } => {
                if ack {
                    let mut state = self.lock();
                    if state.ping == Some(payload) {
                        state.ping = None;
                    }
                } else {
                    self.send(Frame::Ping { ack: true, payload });
                }
                Ok(())
            }
            Frame::GoAway {
                last_stream_id,
                code,
                debug,
            } => {
                self.recv_goaway(last_stream_id, code, &debug);
                Ok(())
            }
            Frame::WindowUpdate { stream_id, increment } => self.recv_window_update(stream_id, increment),
            Frame::Priority { .. } | Frame::Unknown { .. } => Ok(()),
        }
    }

    fn recv_data(&self, stream_id: u32, payload: Bytes, end_stream: bool, flow_len: u32) -> Result<(), Failure> {
        let freed = {
            let mut guard = self.lock();
            let state = &mut *guard;

            state.recv_window.receive(flow_len)?;

            if state.is_idle_stream(stream_id) {
                return Err(H2Error::protocol(format!("DATA on idle stream {stream_id}")).into());
            }

            let Some(stream) = state.streams.get_mut(&stream_id) else {
                // stream is gone. credit the connection right away.
                self.release_connection(state, flow_len);
                return Ok(());
            };

            if stream.state.is_recv_closed() || !stream.head_received {
                let closed = stream.state.is_closed();
                self.release_connection(state, flow_len);
                if !closed {
                    self.reset(state, stream_id, ErrorCode::StreamClosed, H2Error::protocol("unexpected DATA"));
                }
                return Ok(());
            }

            if stream.recv.receive(flow_len).is_err() {
                self.release_connection(state, flow_len);
                self.reset(state, stream_id, ErrorCode::FlowControlError, H2Error::FlowControl);
                return Ok(());
            }

            let len = payload.len() as u32;
            if len > 0 {
                stream.buffered += len;
                stream.data.push_back(payload);
            }
            stream.state.recv(end_stream)?;
            stream.notify.notify_one();

            // padding is never handed to the application.
            self.release(state, stream_id, flow_len - len);

            state.settle(stream_id)
        };

        if freed {
            self.capacity.notify_waiters();
            self.maybe_shutdown();
        }

        Ok(())
    }

    fn recv_headers(&self, stream_id: u32, block: &[u8], end_stream: bool, decoder: &mut Decoder) -> Result<(), Failure> {
        // always decode to keep the dynamic table in sync, even for streams that are gone.
        let fields = decoder.decode(block).map_err(|_| H2Error::Compression)?;

        let freed = {
            let mut guard = self.lock();
            let state = &mut *guard;

            if state.is_idle_stream(stream_id) {
                return Err(H2Error::protocol(format!("HEADERS on idle stream {stream_id}")).into());
            }

            let Some(stream) = state.streams.get_mut(&stream_id) else {
                return Ok(());
            };

            if stream.state.is_recv_closed() {
                if !stream.state.is_closed() {
                    self.reset(state, stream_id, ErrorCode::StreamClosed, H2Error::protocol("HEADERS after END_STREAM"));
                }
                return Ok(());
            }

            if stream.head_received {
                // trailers. kept out of the response.
                if !end_stream {
                    self.reset(state, stream_id, ErrorCode::ProtocolError, H2Error::protocol("trailers without END_STREAM"));
                    return Ok(());
                }
            } else {
                match parse_head(fields) {
                    Ok(Some(parts)) => {
                        stream.head = Some(parts);
                        stream.head_received = true;
                    }
                    // informational response.
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        self.reset(state, stream_id, ErrorCode::ProtocolError, e);
                        return Ok(());
                    }
                }
            }

            stream.state.recv(end_stream)?;
            stream.notify.notify_one();

            state.settle(stream_id)
        };

        if freed {
            self.capacity.notify_waiters();
            self.maybe_shutdown();
        }

        Ok(())
    }

    fn recv_reset(&self, stream_id: u32, code: ErrorCode) -> Result<(), Failure> {
        {
            let mut guard = self.lock();
            let state = &mut *guard;

            if state.is_idle_stream(stream_id) {
                return Err(H2Error::protocol(format!("RST_STREAM on idle stream {stream_id}")).into());
            }

            let Some(stream) = state.streams.get_mut(&stream_id) else {
                return Ok(());
            };

            debug!(target: "h2", "stream {stream_id} reset by peer: {code:?}");

            if code == ErrorCode::NoError && stream.state.is_recv_closed() {
                // peer has the full response out and does not want the rest of the request.
                stream.state.close(Cause::Reset(code));
                stream.notify.notify_one();
            } else {
                stream.fail(Cause::Reset(code), StreamFailure::Reset(code));
                let buffered = core::mem::take(&mut stream.buffered);
                stream.data.clear();
                self.release_connection(state, buffered);
            }

            state.settle(stream_id);
        }

        self.capacity.notify_waiters();
        self.maybe_shutdown();
        Ok(())
    }

    fn recv_settings(&self, ack: bool, settings: Vec<super::settings::Setting>) -> Result<(), Failure> {
        use super::settings::Setting;

        {
            let mut guard = self.lock();
            let state = &mut *guard;

            if ack {
                if !state.local_acked {
                    state.local_acked = true;
                    let target = state.local_window;
                    for stream in state.streams.values_mut() {
                        stream.recv.retarget(target)?;
                    }
                }
                return Ok(());
            }

            for setting in settings {
                match setting {
                    Setting::InitialWindowSize(size) => {
                        let delta = i64::from(size) - i64::from(state.peer.initial_window_size);
                        for stream in state.streams.values_mut() {
                            stream.send.adjust(delta)?;
                            stream.notify.notify_one();
                        }
                    }
                    Setting::HeaderTableSize(size) => state.resize_encoder(size),
                    _ => {}
                }
                state.peer.apply(setting);
            }

            self.send(Frame::Settings {
                ack: true,
                settings: Vec::new(),
            });
        }

        // concurrency limit may have grown.
        self.capacity.notify_waiters();
        Ok(())
    }

    fn recv_goaway(&self, last_stream_id: u32, code: ErrorCode, debug_data: &[u8]) {
        {
            let mut guard = self.lock();
            let state = &mut *guard;

            debug!(
                target: "h2",
                "GOAWAY received. last_stream_id: {last_stream_id}, code: {code:?}, debug: {}",
                String::from_utf8_lossy(debug_data)
            );

            let last = state.goaway.map_or(last_stream_id, |l| cmp::min(l, last_stream_id));
            state.goaway = Some(last);

            let refused = state
                .streams
                .iter()
                .filter(|(id, s)| **id > last && !s.state.is_closed())
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();

            for id in refused {
                if let Some(stream) = state.streams.get_mut(&id) {
                    stream.fail(Cause::Connection, StreamFailure::Refused);
                    let buffered = core::mem::take(&mut stream.buffered);
                    stream.data.clear();
                    self.release_connection(state, buffered);
                }
                state.settle(id);
            }
        }

        self.capacity.notify_waiters();
        self.maybe_shutdown();
    }

    fn recv_window_update(&self, stream_id: u32, increment: u32) -> Result<(), Failure> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if stream_id == 0 {
            state.send_window.increase(increment)?;
            state.streams.values().for_each(|s| s.notify.notify_one());
            return Ok(());
        }

        if state.is_idle_stream(stream_id) {
            return Err(H2Error::protocol(format!("WINDOW_UPDATE on idle stream {stream_id}")).into());
        }

        if let Some(stream) = state.streams.get_mut(&stream_id) {
            if stream.send.increase(increment).is_err() {
                self.reset(state, stream_id, ErrorCode::FlowControlError, H2Error::FlowControl);
                drop(guard);
                self.capacity.notify_waiters();
                self.maybe_shutdown();
                return Ok(());
            }
            stream.notify.notify_one();
        }

        Ok(())
    }
}

type Decoder = fluke_hpack::Decoder<'static>;

struct PendingHeaders {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
}

/// Client side of an http/2 connection.
pub(crate) struct H2Connection {
    shared: Arc<Shared>,
}

impl H2Connection {
    /// Send the connection preface, wait for the peer's SETTINGS and start the reader and writer
    /// tasks. `on_shutdown` runs once when the connection takes no new streams and the last open
    /// stream closed.
    pub(crate) async fn handshake(
        mut io: BoxedIo,
        config: &H2Config,
        on_shutdown: Box<dyn FnOnce() + Send>,
    ) -> Result<Self, Error> {
        let mut buf = BytesMut::with_capacity(64);
        buf.extend_from_slice(PREFACE);
        Frame::Settings {
            ack: false,
            settings: Settings::client(config.initial_window_size),
        }
        .encode(&mut buf);

        let conn_window = cmp::max(config.initial_window_size, DEFAULT_WINDOW);
        if conn_window > DEFAULT_WINDOW {
            Frame::WindowUpdate {
                stream_id: 0,
                increment: conn_window - DEFAULT_WINDOW,
            }
            .encode(&mut buf);
        }

        timed(
            async {
                io.write_all_buf(&mut buf).await?;
                io.flush().await.map_err(Error::from)
            },
            config.write_timeout,
            TimeoutError::Write,
        )
        .await?;

        // server preface is a SETTINGS frame.
        let mut read_buf = BytesMut::with_capacity(4096);
        let settings = loop {
            match Frame::decode(&mut read_buf, DEFAULT_MAX_FRAME_SIZE)? {
                Some(Frame::Settings { ack: false, settings }) => break settings,
                Some(frame) => {
                    return Err(H2Error::protocol(format!("expected SETTINGS as server preface, got {}", frame.name())).into());
                }
                None => {
                    let n = timed(
                        async { io.read_buf(&mut read_buf).await.map_err(Error::from) },
                        config.read_timeout,
                        TimeoutError::Read,
                    )
                    .await?;
                    if n == 0 {
                        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                    }
                }
            }
        };

        let mut peer = Settings::default();
        settings.into_iter().for_each(|s| peer.apply(s));

        trace!(target: "h2", "handshake done. peer settings: {peer:?}");

        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = State {
            streams: HashMap::new(),
            next_stream_id: 1,
            peer,
            local_window: config.initial_window_size,
            local_acked: false,
            send_window: Window::new(DEFAULT_WINDOW),
            recv_window: RecvWindow::new(conn_window),
            active: 0,
            goaway: None,
            error: None,
            encoder: fluke_hpack::Encoder::new(),
            encoder_table_size: ENCODER_TABLE_LIMIT,
            table_size_update: None,
            ping: None,
            ping_seq: 0,
        };
        state.resize_encoder(state.peer.header_table_size);

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            capacity: Notify::new(),
            tx,
            closed: CancellationToken::new(),
            on_shutdown: Mutex::new(Some(on_shutdown)),
        });

        shared.send(Frame::Settings {
            ack: true,
            settings: Vec::new(),
        });

        let (read, write) = tokio::io::split(io);

        tokio::spawn(write_loop(Arc::downgrade(&shared), write, rx, config.write_timeout));
        tokio::spawn(read_loop(shared.clone(), read, read_buf));

        Ok(Self { shared })
    }

    /// true while new streams may be opened.
    pub(crate) fn is_accepting(&self) -> bool {
        self.shared.lock().is_accepting()
    }

    /// fail every stream and close the transport.
    pub(crate) fn close(&self) {
        self.shared.fail(Failure::Closed);
    }

    /// Send PING every `interval`. A PING still unanswered when the next one is due fails the
    /// connection with a read timeout.
    pub(crate) fn keepalive(&self, queue: &TaskQueue, interval: Duration) {
        let shared = Arc::downgrade(&self.shared);
        queue.schedule("h2 ping", interval, move || {
            let shared = shared.upgrade()?;

            let mut state = shared.lock();
            if state.error.is_some() {
                return None;
            }

            if state.ping.is_some() {
                drop(state);
                warn!(target: "h2", "PING not acknowledged within {interval:?}");
                shared.fail(Failure::Timeout(TimeoutError::Read));
                return None;
            }

            state.ping_seq += 1;
            let payload = state.ping_seq.to_be_bytes();
            state.ping = Some(payload);
            shared.send(Frame::Ping { ack: false, payload });

            Some(interval)
        });
    }

    /// Open a stream carrying the request head. Waits while the peer's concurrency limit is
    /// reached.
    pub(crate) async fn open_stream(
        &self,
        method: &Method,
        scheme: &str,
        authority: &str,
        path: &str,
        headers: &HeaderMap,
        end_stream: bool,
    ) -> Result<StreamRef, Error> {
        let shared = &self.shared;

        loop {
            let mut notified = pin!(shared.capacity.notified());
            notified.as_mut().enable();

            {
                let mut guard = shared.lock();
                let state = &mut *guard;

                if let Some(ref failure) = state.error {
                    return Err(failure.to_error());
                }

                if !state.is_accepting() {
                    return Err(Error::ConnectionShutdown { refused: true });
                }

                let limit = state.peer.max_concurrent_streams.map_or(usize::MAX, |n| n as usize);

                if state.active < limit {
                    let stream_id = state.next_stream_id;
                    state.next_stream_id += 2;

                    let block = state.encode_head(method, scheme, authority, path, headers);

                    let max = state.peer.max_frame_size as usize;
                    let mut block = Bytes::from(block);
                    let first = block.split_to(cmp::min(max, block.len()));
                    shared.send(Frame::Headers {
                        stream_id,
                        block: first,
                        end_stream,
                        end_headers: block.is_empty(),
                    });
                    while !block.is_empty() {
                        let chunk = block.split_to(cmp::min(max, block.len()));
                        shared.send(Frame::Continuation {
                            stream_id,
                            block: chunk,
                            end_headers: block.is_empty(),
                        });
                    }

                    let mut stream_state = StreamState::Idle;
                    stream_state.send_headers(end_stream)?;

                    let notify = Arc::new(Notify::new());
                    let stream = Stream {
                        state: stream_state,
                        send: Window::new(state.peer.initial_window_size),
                        recv: RecvWindow::new(state.recv_initial()),
                        head: None,
                        head_received: false,
                        data: VecDeque::new(),
                        buffered: 0,
                        error: None,
                        counted: true,
                        notify: notify.clone(),
                    };

                    state.streams.insert(stream_id, stream);
                    state.active += 1;

                    return Ok(StreamRef {
                        shared: shared.clone(),
                        stream_id,
                        notify,
                    });
                }

                trace!(target: "h2", "stream admission blocked. active: {}, limit: {limit}", state.active);
            }

            notified.await;
        }
    }
}

impl Drop for H2Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn encode_head(
    encoder: &mut fluke_hpack::Encoder<'static>,
    method: &Method,
    scheme: &str,
    authority: &str,
    path: &str,
    headers: &HeaderMap,
) -> Vec<u8> {
    let pseudo: [(&[u8], &[u8]); 4] = [
        (b":method", method.as_str().as_bytes()),
        (b":scheme", scheme.as_bytes()),
        (b":authority", authority.as_bytes()),
        (b":path", path.as_bytes()),
    ];

    let fields = headers
        .iter()
        .filter(|(name, value)| {
            if **name == header::TE {
                return value.as_bytes() == b"trailers";
            }
            !matches!(
                name.as_str(),
                "connection" | "transfer-encoding" | "upgrade" | "host" | "keep-alive" | "proxy-connection"
            )
        })
        .map(|(name, value)| (name.as_str().as_bytes(), value.as_bytes()));

    encoder.encode(pseudo.into_iter().chain(fields))
}

// dynamic table size update, 5 bit prefix after the 001 pattern.
fn encode_table_size_update(block: &mut Vec<u8>, size: u32) {
    let mut update = fluke_hpack::encoder::encode_integer(size as usize, 5);
    update[0] |= 0x20;
    block.extend_from_slice(&update);
}

/// build response head from decoded fields. `None` for informational responses.
fn parse_head(fields: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Option<response::Parts>, H2Error> {
    let mut status = None;
    let mut headers = HeaderMap::with_capacity(fields.len());

    for (name, value) in fields {
        if name.first() == Some(&b':') {
            if name != b":status" || status.is_some() {
                return Err(H2Error::protocol("invalid response pseudo header"));
            }
            status = Some(StatusCode::from_bytes(&value).map_err(|_| H2Error::protocol("invalid :status"))?);
            continue;
        }

        let name = HeaderName::from_bytes(&name).map_err(|_| H2Error::protocol("invalid header name"))?;
        let value = HeaderValue::from_bytes(&value).map_err(|_| H2Error::protocol("invalid header value"))?;
        headers.append(name, value);
    }

    let status = status.ok_or_else(|| H2Error::protocol("missing :status"))?;

    if status.is_informational() {
        return Ok(None);
    }

    let (mut parts, _) = Response::new(()).into_parts();
    parts.status = status;
    parts.version = Version::HTTP_2;
    parts.headers = headers;

    Ok(Some(parts))
}

async fn read_loop(shared: Arc<Shared>, mut io: ReadHalf<BoxedIo>, mut buf: BytesMut) {
    let mut decoder = Decoder::new();
    let mut pending = None;

    let failure = 'read: loop {
        loop {
            match Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE) {
                Ok(Some(frame)) => {
                    if let Err(e) = shared.recv_frame(frame, &mut pending, &mut decoder) {
                        break 'read e;
                    }
                }
                Ok(None) => break,
                Err(e) => break 'read Failure::Local(e),
            }
        }

        tokio::select! {
            res = io.read_buf(&mut buf) => match res {
                Ok(0) => break 'read Failure::Io(io::ErrorKind::UnexpectedEof, "connection closed by peer".into()),
                Ok(_) => {}
                Err(e) => break 'read e.into(),
            },
            _ = shared.closed.cancelled() => return,
        }
    };

    if let Failure::Local(ref e) = failure {
        warn!(target: "h2", "peer protocol violation: {e}");
    }

    shared.fail(failure);
}

async fn write_loop(
    shared: Weak<Shared>,
    mut io: WriteHalf<BoxedIo>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    write_timeout: Duration,
) {
    let closed = match shared.upgrade() {
        Some(shared) => shared.closed.clone(),
        None => return,
    };

    let mut buf = BytesMut::new();

    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(bytes) => buf.extend_from_slice(&bytes),
                None => break,
            },
            _ = closed.cancelled() => break,
        }

        while let Ok(bytes) = rx.try_recv() {
            buf.extend_from_slice(&bytes);
        }

        let res = timed(
            async {
                io.write_all_buf(&mut buf).await?;
                io.flush().await.map_err(Error::from)
            },
            write_timeout,
            TimeoutError::Write,
        )
        .await;

        if let Err(e) = res {
            if let Some(shared) = shared.upgrade() {
                shared.fail(match e {
                    Error::Timeout(t) => Failure::Timeout(t),
                    Error::Io(e) => e.into(),
                    e => Failure::Io(io::ErrorKind::Other, e.to_string()),
                });
            }
            return;
        }
    }

    // flush what was queued before close. GOAWAY among it.
    while let Ok(bytes) = rx.try_recv() {
        buf.extend_from_slice(&bytes);
    }

    let _ = timed(
        async {
            io.write_all_buf(&mut buf).await?;
            io.shutdown().await.map_err(Error::from)
        },
        write_timeout,
        TimeoutError::Write,
    )
    .await;
}

/// Handle of one open stream. Dropping it before the stream closed resets the stream.
pub(crate) struct StreamRef {
    shared: Arc<Shared>,
    stream_id: u32,
    notify: Arc<Notify>,
}

impl StreamRef {
    #[cfg(test)]
    pub(crate) fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Send request body. Blocks while the stream or connection window is exhausted.
    pub(crate) async fn send_data(&self, mut data: Bytes, end_stream: bool) -> Result<(), Error> {
        loop {
            let notified = self.notify.notified();

            {
                let mut guard = self.shared.lock();
                let state = &mut *guard;

                if let Some(ref failure) = state.error {
                    return Err(failure.to_error());
                }

                let max_frame = state.peer.max_frame_size;
                let conn_avail = state.send_window.available();

                let Some(stream) = state.streams.get_mut(&self.stream_id) else {
                    return Err(Error::ConnectionShutdown { refused: false });
                };

                if let Some(ref e) = stream.error {
                    return Err(e.to_error(self.stream_id));
                }

                // peer answered and closed the stream. the rest of the body is not wanted.
                if stream.state.is_send_closed() {
                    return Ok(());
                }

                let avail = cmp::min(cmp::min(stream.send.available(), conn_avail), max_frame) as usize;
                let n = cmp::min(avail, data.len());

                if n > 0 || data.is_empty() {
                    let chunk = data.split_to(n);
                    let last = end_stream && data.is_empty();

                    stream.send.consume(n as u32)?;
                    if last {
                        stream.state.send_end()?;
                    }
                    state.send_window.consume(n as u32)?;

                    self.shared.send(Frame::data(self.stream_id, chunk, last));

                    let freed = state.settle(self.stream_id);
                    drop(guard);

                    if freed {
                        self.shared.capacity.notify_waiters();
                        self.shared.maybe_shutdown();
                    }

                    if data.is_empty() {
                        return Ok(());
                    }

                    continue;
                }

                trace!(target: "h2", "stream {} waiting for send window", self.stream_id);
            }

            notified.await;
        }
    }

    /// Wait for the final response head.
    pub(crate) async fn response(&self) -> Result<response::Parts, Error> {
        loop {
            let notified = self.notify.notified();

            {
                let mut state = self.shared.lock();
                let conn_error = state.error.clone();

                let Some(stream) = state.streams.get_mut(&self.stream_id) else {
                    return Err(Error::ConnectionShutdown { refused: false });
                };

                if let Some(head) = stream.head.take() {
                    return Ok(head);
                }

                if let Some(ref e) = stream.error {
                    return Err(e.to_error(self.stream_id));
                }

                if let Some(failure) = conn_error {
                    return Err(failure.to_error());
                }

                if stream.state.is_recv_closed() {
                    return Err(H2Error::protocol("stream closed without response").into());
                }
            }

            notified.await;
        }
    }

    /// Next chunk of the response body. `None` once the peer ended the stream.
    pub(crate) async fn data(&self) -> Option<Result<Bytes, Error>> {
        loop {
            let notified = self.notify.notified();

            {
                let mut guard = self.shared.lock();
                let state = &mut *guard;

                let Some(stream) = state.streams.get_mut(&self.stream_id) else {
                    return Some(Err(Error::ConnectionShutdown { refused: false }));
                };

                if let Some(bytes) = stream.data.pop_front() {
                    let len = bytes.len() as u32;
                    stream.buffered -= len;
                    self.shared.release(state, self.stream_id, len);
                    return Some(Ok(bytes));
                }

                if let Some(ref e) = stream.error {
                    return Some(Err(e.to_error(self.stream_id)));
                }

                if stream.state.is_recv_closed() {
                    return None;
                }

                if let Some(ref failure) = state.error {
                    return Some(Err(failure.to_error()));
                }
            }

            notified.await;
        }
    }

    /// true when the stream ended normally.
    #[cfg(test)]
    pub(crate) fn is_end_stream(&self) -> bool {
        let state = self.shared.lock();
        state
            .streams
            .get(&self.stream_id)
            .is_some_and(|s| s.error.is_none() && s.state.is_recv_closed() && s.data.is_empty())
    }
}

impl Drop for StreamRef {
    fn drop(&mut self) {
        {
            let mut guard = self.shared.lock();
            let state = &mut *guard;

            let Some(mut stream) = state.streams.remove(&self.stream_id) else {
                return;
            };

            if !stream.state.is_closed() && state.error.is_none() {
                trace!(target: "h2", "stream {} dropped while open", self.stream_id);
                self.shared.send(Frame::RstStream {
                    stream_id: self.stream_id,
                    code: ErrorCode::Cancel,
                });
            }

            stream.state.close(Cause::LocalReset(ErrorCode::Cancel));
            if stream.counted {
                state.active -= 1;
            }

            // unread data is credited back to the connection.
            self.shared.release_connection(state, stream.buffered);
        }

        self.shared.capacity.notify_waiters();
        self.shared.maybe_shutdown();
    }
}

#[cfg(test)]
impl H2Connection {
    /// connection over an in memory pipe. the returned peer half only sent its SETTINGS and keeps
    /// the transport open while held.
    pub(crate) async fn in_memory() -> (Self, tokio::io::DuplexStream) {
        let (client, mut server) = tokio::io::duplex(1 << 16);

        let mut buf = BytesMut::new();
        Frame::Settings {
            ack: false,
            settings: Vec::new(),
        }
        .encode(&mut buf);
        server.write_all(&buf).await.unwrap();

        let config = H2Config {
            initial_window_size: DEFAULT_WINDOW,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        };
        let conn = Self::handshake(Box::new(client), &config, Box::new(|| {})).await.unwrap();
        (conn, server)
    }
}
