use core::fmt;

use crate::{bytes::Bytes, call::CallGuard, error::Error, exchange::Exchange};

/// Streaming body of a [Response](crate::Response).
///
/// The connection it is read from goes back to the pool once the body is read to the end. A body
/// dropped early closes its http/1 connection or resets its http/2 stream.
pub struct ResponseBody {
    exchange: Option<Exchange>,
    guard: CallGuard,
    read: u64,
}

impl ResponseBody {
    pub(crate) fn new(exchange: Exchange, guard: CallGuard) -> Self {
        Self {
            exchange: Some(exchange),
            guard,
            read: 0,
        }
    }

    /// Read the next chunk. `None` marks the end of body.
    ///
    /// Canceling the call while a chunk is pending fails the read.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, Error>> {
        let exchange = self.exchange.as_mut()?;

        let res = tokio::select! {
            biased;
            _ = self.guard.token().cancelled() => Some(Err(self.guard.cancel_error())),
            res = exchange.chunk() => res,
        };

        match res {
            Some(Ok(bytes)) => {
                self.read += bytes.len() as u64;
                Some(Ok(bytes))
            }
            Some(Err(e)) => {
                self.complete(Some(&e));
                Some(Err(e))
            }
            None => {
                self.complete(None);
                None
            }
        }
    }

    /// true once the body was read to the end or failed.
    pub fn is_eof(&self) -> bool {
        self.exchange.is_none()
    }

    fn complete(&mut self, error: Option<&Error>) {
        if let Some(exchange) = self.exchange.take() {
            let events = self.guard.events();
            if error.is_none() {
                events.response_body_end(self.read);
            }
            exchange.release(events);
        }

        match error {
            Some(e) => self.guard.fail(e),
            None => self.guard.finish(),
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        // dropped before its end. the body never ended.
        if let Some(exchange) = self.exchange.take() {
            exchange.release(self.guard.events());
        }
        self.guard.finish();
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("read", &self.read)
            .field("eof", &self.is_eof())
            .finish()
    }
}
