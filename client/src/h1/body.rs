use core::time::Duration;

use std::io;

use bytes::Bytes;

use crate::error::Error;

use super::{
    codec::{ChunkResult, TransferCoding},
    proto::H1Stream,
};

/// Response body read straight from the connection's transport.
pub(crate) struct H1Body {
    stream: Option<H1Stream>,
    coding: TransferCoding,
    keep_alive: bool,
    read_timeout: Duration,
    done: bool,
}

impl H1Body {
    pub(crate) fn new(stream: H1Stream, coding: TransferCoding, keep_alive: bool, read_timeout: Duration) -> Self {
        let done = coding.is_complete();
        Self {
            stream: Some(stream),
            coding,
            keep_alive,
            read_timeout,
            done,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) async fn chunk(&mut self) -> Option<Result<Bytes, Error>> {
        if self.done {
            return None;
        }

        let stream = self.stream.as_mut()?;

        loop {
            match self.coding.decode(&mut stream.buf) {
                ChunkResult::Ok(bytes) => return Some(Ok(bytes)),
                ChunkResult::Eof => {
                    self.done = true;
                    return None;
                }
                ChunkResult::Err(e) => {
                    self.stream = None;
                    return Some(Err(e.into()));
                }
                ChunkResult::InsufficientData => match stream.read(self.read_timeout).await {
                    // body delimited by close ends here. the connection is spent.
                    Ok(0) if self.coding.is_eof() => {
                        self.done = true;
                        self.keep_alive = false;
                        return None;
                    }
                    Ok(0) => {
                        self.stream = None;
                        return Some(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.stream = None;
                        return Some(Err(e));
                    }
                },
            }
        }
    }

    /// Transport ready for the next exchange. `None` unless the body was read to its end on a
    /// keep-alive connection with nothing left over.
    pub(crate) fn take_reusable(&mut self) -> Option<H1Stream> {
        if !(self.done && self.keep_alive) {
            return None;
        }
        let mut stream = self.stream.take()?;
        if !stream.buf.is_empty() {
            return None;
        }
        stream.reset();
        Some(stream)
    }
}
