use core::fmt;

use std::error;

/// Malformed http/1 response.
#[derive(Debug)]
pub enum ParseError {
    HeaderName,
    HeaderValue,
    /// response head exceeds the header count or size limit.
    HeaderTooLarge,
    StatusCode,
    Version,
    /// unparsable or conflicting Content-Length.
    ContentLength,
    /// chunked transfer coding violation.
    Chunked(&'static str),
    HttpParse(httparse::Error),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderName => f.write_str("invalid header name"),
            Self::HeaderValue => f.write_str("invalid header value"),
            Self::HeaderTooLarge => f.write_str("response head too large"),
            Self::StatusCode => f.write_str("invalid status code"),
            Self::Version => f.write_str("unsupported http version"),
            Self::ContentLength => f.write_str("invalid Content-Length"),
            Self::Chunked(msg) => write!(f, "invalid chunked body: {msg}"),
            Self::HttpParse(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl error::Error for ParseError {}

impl From<httparse::Error> for ParseError {
    fn from(e: httparse::Error) -> Self {
        match e {
            // too many headers is handled the same as a head too large.
            httparse::Error::TooManyHeaders => Self::HeaderTooLarge,
            httparse::Error::HeaderName => Self::HeaderName,
            httparse::Error::HeaderValue => Self::HeaderValue,
            httparse::Error::Status => Self::StatusCode,
            httparse::Error::Version => Self::Version,
            e => Self::HttpParse(e),
        }
    }
}
