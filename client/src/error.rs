//! strongly typed library error.

use std::{error, fmt, io, str};

use crate::{
    h1::ParseError,
    h2::{ErrorCode, H2Error},
    http::{uri, StatusCode},
    route::Route,
};

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    Io(io::Error),
    Std(Box<dyn error::Error + Send + Sync>),
    InvalidUri(InvalidUri),
    /// every route of the address failed to connect.
    ConnectFailure(ErrorMultiple),
    NameResolution(ResolveError),
    Protocol(ProtocolError),
    /// peer reset the stream with given error code.
    StreamReset {
        stream_id: u32,
        code: ErrorCode,
    },
    /// connection stopped accepting exchanges while this one was in flight.
    ///
    /// `refused` is true when the peer guaranteed the exchange was never processed.
    ConnectionShutdown {
        refused: bool,
    },
    Timeout(TimeoutError),
    Certificate(Box<dyn error::Error + Send + Sync>),
    /// proxy refused to open a tunnel.
    Tunnel(StatusCode),
    Canceled,
    TooManyFollowUps(usize),
    AlreadyExecuted,
    Feature(FeatureError),
    Parse(str::Utf8Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => fmt::Display::fmt(e, f),
            Self::Std(e) => fmt::Display::fmt(e, f),
            Self::InvalidUri(e) => write!(f, "invalid uri: {e:?}"),
            Self::ConnectFailure(e) => write!(f, "failed to connect: {e}"),
            Self::NameResolution(e) => fmt::Display::fmt(e, f),
            Self::Protocol(e) => fmt::Display::fmt(e, f),
            Self::StreamReset { stream_id, code } => write!(f, "stream {stream_id} reset by peer: {code:?}"),
            Self::ConnectionShutdown { refused: true } => f.write_str("connection shutdown before stream was processed"),
            Self::ConnectionShutdown { refused: false } => f.write_str("connection shutdown"),
            Self::Timeout(e) => fmt::Display::fmt(e, f),
            Self::Certificate(e) => write!(f, "certificate validation failed: {e}"),
            Self::Tunnel(status) => write!(f, "proxy tunnel refused with status {status}"),
            Self::Canceled => f.write_str("call canceled"),
            Self::TooManyFollowUps(n) => write!(f, "too many follow-up requests: {n}"),
            Self::AlreadyExecuted => f.write_str("call already executed"),
            Self::Feature(e) => fmt::Display::fmt(e, f),
            Self::Parse(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<Box<dyn error::Error + Send + Sync>> for Error {
    fn from(e: Box<dyn error::Error + Send + Sync>) -> Self {
        Self::Std(e)
    }
}

impl From<str::Utf8Error> for Error {
    fn from(e: str::Utf8Error) -> Self {
        Self::Parse(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Self::Std(Box::new(e))
    }
}

/// a failure paired with the route it happened on.
#[derive(Debug)]
pub struct RouteFailure {
    pub route: Route,
    pub error: Error,
}

/// a collection of multiple errors chained together.
#[derive(Debug, Default)]
pub struct ErrorMultiple(pub(crate) Vec<RouteFailure>);

impl ErrorMultiple {
    pub fn failures(&self) -> &[RouteFailure] {
        &self.0
    }

    pub(crate) fn push(&mut self, route: Route, error: Error) {
        self.0.push(RouteFailure { route, error });
    }
}

impl fmt::Display for ErrorMultiple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.route, e.error)?;
        }

        Ok(())
    }
}

impl error::Error for ErrorMultiple {}

impl From<ErrorMultiple> for Error {
    fn from(e: ErrorMultiple) -> Self {
        Self::ConnectFailure(e)
    }
}

#[derive(Debug)]
pub enum InvalidUri {
    MissingHost,
    MissingScheme,
    UnknownScheme,
    Other(uri::InvalidUri),
}

impl From<uri::InvalidUri> for InvalidUri {
    fn from(uri: uri::InvalidUri) -> Self {
        Self::Other(uri)
    }
}

impl From<uri::InvalidUri> for Error {
    fn from(e: uri::InvalidUri) -> Self {
        Self::InvalidUri(e.into())
    }
}

impl From<InvalidUri> for Error {
    fn from(e: InvalidUri) -> Self {
        Self::InvalidUri(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    Resolve,
    Connect,
    TlsHandshake,
    Read,
    Write,
    Call,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve => f.write_str("dns look up timeout"),
            Self::Connect => f.write_str("socket connect timeout"),
            Self::TlsHandshake => f.write_str("tls handshake timeout"),
            Self::Read => f.write_str("socket read timeout"),
            Self::Write => f.write_str("socket write timeout"),
            Self::Call => f.write_str("call timeout"),
        }
    }
}

impl error::Error for TimeoutError {}

impl From<TimeoutError> for Error {
    fn from(e: TimeoutError) -> Self {
        Self::Timeout(e)
    }
}

#[derive(Debug)]
pub struct ResolveError {
    domain: String,
    source: Option<Box<Error>>,
}

impl ResolveError {
    pub(crate) fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            source: None,
        }
    }

    pub(crate) fn with_source(domain: impl Into<String>, source: Error) -> Self {
        Self {
            domain: domain.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain: {} can't be resolved to socket address", self.domain)?;
        if let Some(ref e) = self.source {
            write!(f, " ({e})")?;
        }
        Ok(())
    }
}

impl error::Error for ResolveError {}

impl From<ResolveError> for Error {
    fn from(e: ResolveError) -> Self {
        Self::NameResolution(e)
    }
}

/// peer violated the wire protocol.
#[derive(Debug)]
pub enum ProtocolError {
    H1(ParseError),
    H2(H2Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H1(e) => write!(f, "http/1 protocol error: {e}"),
            Self::H2(e) => write!(f, "http/2 protocol error: {e}"),
        }
    }
}

impl error::Error for ProtocolError {}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self::Protocol(ProtocolError::H1(e))
    }
}

impl From<H2Error> for Error {
    fn from(e: H2Error) -> Self {
        Self::Protocol(ProtocolError::H2(e))
    }
}

#[derive(Debug)]
pub enum FeatureError {
    TlsNotEnabled,
}

impl fmt::Display for FeatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TlsNotEnabled => f.write_str("rustls crate feature is not enabled and no tls connector is set"),
        }
    }
}

impl error::Error for FeatureError {}

impl From<FeatureError> for Error {
    fn from(e: FeatureError) -> Self {
        Self::Feature(e)
    }
}

impl Error {
    /// true when error is caused by the peer closing the socket under us.
    pub(crate) fn is_peer_closed(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            Self::ConnectionShutdown { .. } => true,
            _ => false,
        }
    }
}
