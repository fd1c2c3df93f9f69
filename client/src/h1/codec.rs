//! request head encoding, response head parsing and body transfer coding.

use core::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use httparse::{Status, EMPTY_HEADER};
use tracing::trace;

use crate::http::{
    header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING},
    response, HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode, Version,
};

use super::error::ParseError;

/// most headers a response head may carry.
pub(crate) const MAX_HEADERS: usize = 64;

/// largest response head accepted before giving up on finding its end.
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Decoder of a response body.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransferCoding {
    /// Content-Length delimited. the value is what remains.
    Length(u64),
    /// Transfer-Encoding chunked.
    DecodeChunked(ChunkedState, u64),
    /// neither length nor chunked. the body ends when the peer closes the connection.
    Eof,
}

/// outcome of one [TransferCoding::decode] call.
#[derive(Debug)]
pub(crate) enum ChunkResult {
    Ok(Bytes),
    InsufficientData,
    /// body ended. decoding again yields the same.
    Eof,
    Err(ParseError),
}

impl TransferCoding {
    #[inline]
    pub(crate) const fn length(len: u64) -> Self {
        Self::Length(len)
    }

    #[inline]
    pub(crate) const fn decode_chunked() -> Self {
        Self::DecodeChunked(ChunkedState::Size, 0)
    }

    #[inline]
    pub(crate) fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }

    /// true when the body is known to be fully consumed.
    pub(crate) fn is_complete(&self) -> bool {
        matches!(self, Self::Length(0) | Self::DecodeChunked(ChunkedState::End, _))
    }

    pub(crate) fn decode(&mut self, src: &mut BytesMut) -> ChunkResult {
        match *self {
            Self::Length(0) => ChunkResult::Eof,
            Self::Length(ref mut remaining) => {
                if src.is_empty() {
                    return ChunkResult::InsufficientData;
                }
                let len = src.len() as u64;
                let buf = if *remaining > len {
                    *remaining -= len;
                    src.split().freeze()
                } else {
                    let split = mem::take(remaining);
                    src.split_to(split as usize).freeze()
                };
                ChunkResult::Ok(buf)
            }
            Self::DecodeChunked(ref mut state, ref mut size) => loop {
                if matches!(state, ChunkedState::End) {
                    return ChunkResult::Eof;
                }

                let mut buf = None;
                // advances the chunked state
                *state = match state.step(src, size, &mut buf) {
                    Ok(Some(state)) => state,
                    Ok(None) => return ChunkResult::InsufficientData,
                    Err(e) => return ChunkResult::Err(e),
                };

                if let Some(buf) = buf {
                    return ChunkResult::Ok(buf);
                }
            },
            Self::Eof => {
                if src.is_empty() {
                    ChunkResult::InsufficientData
                } else {
                    ChunkResult::Ok(src.split().freeze())
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub(crate) enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

// take one byte or report more input is needed.
macro_rules! byte (
    ($rdr:ident) => ({
        if !$rdr.is_empty() {
            let b = $rdr[0];
            $rdr.advance(1);
            b
        } else {
            return Ok(None);
        }
    })
);

type Step = Result<Option<ChunkedState>, ParseError>;

impl ChunkedState {
    /// Advance by consuming input. `Ok(None)` means `body` ran dry before the step completed.
    pub(crate) fn step(&self, body: &mut BytesMut, size: &mut u64, buf: &mut Option<Bytes>) -> Step {
        use self::ChunkedState::*;
        match *self {
            Size => ChunkedState::read_size(body, size),
            SizeLws => ChunkedState::read_size_lws(body),
            Extension => ChunkedState::read_extension(body),
            SizeLf => ChunkedState::read_size_lf(body, size),
            Body => ChunkedState::read_body(body, size, buf),
            BodyCr => ChunkedState::read_body_cr(body),
            BodyLf => ChunkedState::read_body_lf(body),
            Trailer => ChunkedState::read_trailer(body),
            TrailerLf => ChunkedState::read_trailer_lf(body),
            EndCr => ChunkedState::read_end_cr(body),
            EndLf => ChunkedState::read_end_lf(body),
            End => Ok(Some(ChunkedState::End)),
        }
    }

    fn read_size(rdr: &mut BytesMut, size: &mut u64) -> Step {
        let digit = match byte!(rdr) {
            b @ b'0'..=b'9' => b - b'0',
            b @ b'a'..=b'f' => b + 10 - b'a',
            b @ b'A'..=b'F' => b + 10 - b'A',
            b'\t' | b' ' => return Ok(Some(ChunkedState::SizeLws)),
            b';' => return Ok(Some(ChunkedState::Extension)),
            b'\r' => return Ok(Some(ChunkedState::SizeLf)),
            _ => return Err(ParseError::Chunked("invalid chunk size")),
        };

        *size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(u64::from(digit)))
            .ok_or(ParseError::Chunked("chunk size overflow"))?;

        Ok(Some(ChunkedState::Size))
    }

    fn read_size_lws(rdr: &mut BytesMut) -> Step {
        match byte!(rdr) {
            // whitespace may follow the size but no more digits.
            b'\t' | b' ' => Ok(Some(ChunkedState::SizeLws)),
            b';' => Ok(Some(ChunkedState::Extension)),
            b'\r' => Ok(Some(ChunkedState::SizeLf)),
            _ => Err(ParseError::Chunked("invalid chunk size whitespace")),
        }
    }

    fn read_extension(rdr: &mut BytesMut) -> Step {
        match byte!(rdr) {
            b'\r' => Ok(Some(ChunkedState::SizeLf)),
            b'\n' => Err(ParseError::Chunked("chunk extension contains newline")),
            // extensions are skipped.
            _ => Ok(Some(ChunkedState::Extension)),
        }
    }

    fn read_size_lf(rdr: &mut BytesMut, size: &mut u64) -> Step {
        match byte!(rdr) {
            b'\n' if *size > 0 => Ok(Some(ChunkedState::Body)),
            b'\n' => Ok(Some(ChunkedState::EndCr)),
            _ => Err(ParseError::Chunked("invalid chunk size LF")),
        }
    }

    fn read_body(rdr: &mut BytesMut, rem: &mut u64, buf: &mut Option<Bytes>) -> Step {
        let len = rdr.len() as u64;
        if len == 0 {
            return Ok(None);
        }

        let slice = if *rem > len {
            *rem -= len;
            rdr.split().freeze()
        } else {
            let n = mem::take(rem);
            rdr.split_to(n as usize).freeze()
        };
        *buf = Some(slice);

        if *rem > 0 {
            Ok(Some(ChunkedState::Body))
        } else {
            Ok(Some(ChunkedState::BodyCr))
        }
    }

    fn read_body_cr(rdr: &mut BytesMut) -> Step {
        match byte!(rdr) {
            b'\r' => Ok(Some(ChunkedState::BodyLf)),
            _ => Err(ParseError::Chunked("invalid chunk body CR")),
        }
    }

    fn read_body_lf(rdr: &mut BytesMut) -> Step {
        match byte!(rdr) {
            b'\n' => Ok(Some(ChunkedState::Size)),
            _ => Err(ParseError::Chunked("invalid chunk body LF")),
        }
    }

    fn read_trailer(rdr: &mut BytesMut) -> Step {
        trace!(target: "h1_decode", "read_trailer");
        match byte!(rdr) {
            b'\r' => Ok(Some(ChunkedState::TrailerLf)),
            _ => Ok(Some(ChunkedState::Trailer)),
        }
    }

    fn read_trailer_lf(rdr: &mut BytesMut) -> Step {
        match byte!(rdr) {
            b'\n' => Ok(Some(ChunkedState::EndCr)),
            _ => Err(ParseError::Chunked("invalid trailer end LF")),
        }
    }

    fn read_end_cr(rdr: &mut BytesMut) -> Step {
        match byte!(rdr) {
            b'\r' => Ok(Some(ChunkedState::EndLf)),
            _ => Ok(Some(ChunkedState::Trailer)),
        }
    }

    fn read_end_lf(rdr: &mut BytesMut) -> Step {
        match byte!(rdr) {
            b'\n' => Ok(Some(ChunkedState::End)),
            _ => Err(ParseError::Chunked("invalid chunk end LF")),
        }
    }
}

/// methods that send Content-Length even for an empty body.
fn permits_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Write request line and headers. `target` is origin-form or, for plain http through a proxy,
/// absolute-form. Framing headers given by the caller are replaced by Content-Length of `body_len`.
pub(crate) fn encode_head(
    buf: &mut BytesMut,
    method: &Method,
    target: &str,
    host: &str,
    headers: &HeaderMap,
    body_len: usize,
) {
    buf.reserve(method.as_str().len() + target.len() + 256);

    buf.put_slice(method.as_str().as_bytes());
    buf.put_slice(b" ");
    buf.put_slice(target.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    if !headers.contains_key(HOST) {
        buf.put_slice(b"host: ");
        buf.put_slice(host.as_bytes());
        buf.put_slice(b"\r\n");
    }

    for (name, value) in headers {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if body_len > 0 || permits_body(method) {
        buf.put_slice(b"content-length: ");
        buf.put_slice(itoa::Buffer::new().format(body_len).as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
}

/// A parsed response head with the decoder of its body.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) parts: response::Parts,
    pub(crate) coding: TransferCoding,
    /// connection may carry another exchange once the body is read.
    pub(crate) keep_alive: bool,
}

/// Parse a response head from the front of `buf`. `Ok(None)` means more bytes are needed.
pub(crate) fn decode_head(buf: &mut BytesMut, is_head_method: bool) -> Result<Option<ResponseHead>, ParseError> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);

    let len = match parsed.parse(buf.as_ref())? {
        Status::Complete(len) => len,
        Status::Partial if buf.len() >= MAX_HEAD_SIZE => return Err(ParseError::HeaderTooLarge),
        Status::Partial => return Ok(None),
    };

    let version = match parsed.version {
        Some(1) => Version::HTTP_11,
        Some(0) => Version::HTTP_10,
        _ => return Err(ParseError::Version),
    };

    let status = parsed
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(ParseError::StatusCode)?;

    let mut map = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| ParseError::HeaderName)?;
        let value = HeaderValue::from_bytes(header.value).map_err(|_| ParseError::HeaderValue)?;
        map.append(name, value);
    }

    buf.advance(len);

    let (coding, keep_alive) = body_coding(status, version, &map, is_head_method)?;

    let (mut parts, _) = Response::new(()).into_parts();
    parts.status = status;
    parts.version = version;
    parts.headers = map;

    Ok(Some(ResponseHead {
        parts,
        coding,
        keep_alive,
    }))
}

fn body_coding(
    status: StatusCode,
    version: Version,
    headers: &HeaderMap,
    is_head_method: bool,
) -> Result<(TransferCoding, bool), ParseError> {
    let mut close = false;
    let mut keep_alive = false;

    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .for_each(|token| {
            let token = token.trim();
            if token.eq_ignore_ascii_case("close") {
                close = true;
            } else if token.eq_ignore_ascii_case("keep-alive") {
                keep_alive = true;
            }
        });

    let keep_alive = !close && (version == Version::HTTP_11 || keep_alive);

    if is_head_method
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok((TransferCoding::length(0), keep_alive));
    }

    if let Some(te) = headers.get_all(TRANSFER_ENCODING).iter().last() {
        let chunked = te
            .to_str()
            .ok()
            .and_then(|v| v.rsplit(',').next())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("chunked"));

        // chunked must be the final coding. anything else reads until close.
        return Ok(if chunked {
            (TransferCoding::decode_chunked(), keep_alive)
        } else {
            (TransferCoding::Eof, false)
        });
    }

    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let len = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(ParseError::ContentLength)?;

        if length.is_some_and(|l| l != len) {
            return Err(ParseError::ContentLength);
        }

        length = Some(len);
    }

    Ok(match length {
        Some(len) => (TransferCoding::length(len), keep_alive),
        None => (TransferCoding::Eof, false),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn read_size(s: &str) -> Result<Option<u64>, ParseError> {
        let mut state = ChunkedState::Size;
        let rdr = &mut BytesMut::from(s);
        let mut size = 0;
        loop {
            state = match state.step(rdr, &mut size, &mut None)? {
                Some(state) => state,
                None => return Ok(None),
            };
            if state == ChunkedState::Body || state == ChunkedState::EndCr {
                return Ok(Some(size));
            }
        }
    }

    #[test]
    fn chunk_size() {
        assert_eq!(read_size("1\r\n").unwrap(), Some(1));
        assert_eq!(read_size("00\r\n").unwrap(), Some(0));
        assert_eq!(read_size("Ff   \r\n").unwrap(), Some(255));
        assert_eq!(read_size("a;ext name=value\r\n").unwrap(), Some(10));
        assert_eq!(read_size("3   ;   \r\n").unwrap(), Some(3));

        // incomplete input waits for more.
        assert_eq!(read_size("F").unwrap(), None);
        assert_eq!(read_size("1;no CRLF").unwrap(), None);

        assert!(read_size("X\r\n").is_err());
        assert!(read_size("-1\r\n").is_err());
        assert!(read_size("F\rF").is_err());
        assert!(read_size("1 A\r\n").is_err());
        assert!(read_size("1;reject\nnewlines\r\n").is_err());
        assert!(read_size("f0000000000000003\r\n").is_err());
    }

    #[test]
    fn chunked_across_reads() {
        let mut decoder = TransferCoding::decode_chunked();
        let mut buf = BytesMut::from("9\r\nfoo ");

        let ChunkResult::Ok(bytes) = decoder.decode(&mut buf) else {
            panic!("expected data");
        };
        assert_eq!(bytes, "foo ");
        assert!(matches!(decoder.decode(&mut buf), ChunkResult::InsufficientData));

        buf.extend_from_slice(b"bar b\r\n0\r\nx-trailer: 1\r\n\r\n");
        let ChunkResult::Ok(bytes) = decoder.decode(&mut buf) else {
            panic!("expected data");
        };
        assert_eq!(bytes, "bar b");
        assert!(matches!(decoder.decode(&mut buf), ChunkResult::Eof));
        assert!(decoder.is_complete());
        assert!(buf.is_empty());

        // decoding after the end keeps reporting it.
        assert!(matches!(decoder.decode(&mut buf), ChunkResult::Eof));
    }

    #[test]
    fn chunked_bad_trailer() {
        let mut buf = BytesMut::from("3\r\nabc\r\n0\r\nbad\r\r\n");
        let mut decoder = TransferCoding::decode_chunked();
        assert!(matches!(decoder.decode(&mut buf), ChunkResult::Ok(_)));
        assert!(matches!(decoder.decode(&mut buf), ChunkResult::Err(_)));
    }

    #[test]
    fn length_leaves_pipelined_bytes() {
        let mut decoder = TransferCoding::length(5);
        let mut buf = BytesMut::from("hello HTTP/1.1");
        let ChunkResult::Ok(bytes) = decoder.decode(&mut buf) else {
            panic!("expected data");
        };
        assert_eq!(bytes, "hello");
        assert!(matches!(decoder.decode(&mut buf), ChunkResult::Eof));
        assert_eq!(buf, " HTTP/1.1");
    }

    #[test]
    fn encode() {
        let mut buf = BytesMut::new();
        let mut headers = HeaderMap::new();
        headers.insert("x-id", HeaderValue::from_static("7"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        encode_head(&mut buf, &Method::POST, "/a?b=c", "example.com:8080", &headers, 0);
        assert_eq!(
            buf,
            "POST /a?b=c HTTP/1.1\r\nhost: example.com:8080\r\nx-id: 7\r\ncontent-length: 0\r\n\r\n"
        );

        buf.clear();
        headers.clear();
        headers.insert(HOST, HeaderValue::from_static("override"));
        encode_head(&mut buf, &Method::GET, "http://example.com/", "example.com", &headers, 0);
        assert_eq!(buf, "GET http://example.com/ HTTP/1.1\r\nhost: override\r\n\r\n");
    }

    #[test]
    fn decode_response_head() {
        let mut buf = BytesMut::from("HTTP/1.1 200 OK\r\ncontent-length: 3\r\n");
        assert!(decode_head(&mut buf, false).unwrap().is_none());

        buf.extend_from_slice(b"\r\nabc");
        let head = decode_head(&mut buf, false).unwrap().unwrap();
        assert_eq!(head.parts.status, StatusCode::OK);
        assert_eq!(head.coding, TransferCoding::length(3));
        assert!(head.keep_alive);
        assert_eq!(buf, "abc");

        let mut buf = BytesMut::from("HTTP/1.0 200 OK\r\n\r\n");
        let head = decode_head(&mut buf, false).unwrap().unwrap();
        assert!(head.coding.is_eof());
        assert!(!head.keep_alive);

        let mut buf = BytesMut::from("HTTP/1.1 200 OK\r\ntransfer-encoding: gzip, chunked\r\nconnection: close\r\n\r\n");
        let head = decode_head(&mut buf, false).unwrap().unwrap();
        assert_eq!(head.coding, TransferCoding::decode_chunked());
        assert!(!head.keep_alive);

        let mut buf = BytesMut::from("HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\n");
        let head = decode_head(&mut buf, true).unwrap().unwrap();
        assert!(head.coding.is_complete());

        let mut buf = BytesMut::from("HTTP/1.1 200 OK\r\ncontent-length: 1\r\ncontent-length: 2\r\n\r\n");
        assert!(matches!(decode_head(&mut buf, false), Err(ParseError::ContentLength)));

        let mut buf = BytesMut::from("HTTP/1.1 abc OK\r\n\r\n");
        assert!(decode_head(&mut buf, false).is_err());
    }
}
