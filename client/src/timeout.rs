use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use pin_project_lite::pin_project;
use tokio::time::{sleep, Sleep};

use crate::error::{Error, TimeoutError};

/// Timeout configuration for client. Each deadline is independent of the others.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutConfig {
    /// Timeout for resolving domain to socket addresses.
    ///
    /// Default to 5 seconds.
    pub resolve_timeout: Duration,
    /// Timeout for establishing one tcp connection.
    ///
    /// Default to 10 seconds.
    pub connect_timeout: Duration,
    /// Timeout for tls handshake.
    ///
    /// Default to 10 seconds.
    pub tls_connect_timeout: Duration,
    /// Timeout for a single socket read, including waiting for response head.
    ///
    /// Default to 10 seconds.
    pub read_timeout: Duration,
    /// Timeout for a single socket write, including waiting for http/2 flow control credit.
    ///
    /// Default to 10 seconds.
    pub write_timeout: Duration,
    /// Timeout of the entire call including retries, follow ups and reading the response body.
    ///
    /// Default to no timeout.
    pub call_timeout: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutConfig {
    pub const fn new() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            tls_connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            call_timeout: None,
        }
    }
}

pub(crate) trait Timeout: Sized {
    fn timeout(self, dur: Duration) -> TimeoutFuture<Self>;
}

impl<F> Timeout for F
where
    F: Future,
{
    fn timeout(self, dur: Duration) -> TimeoutFuture<Self> {
        TimeoutFuture {
            fut: self,
            timer: sleep(dur),
        }
    }
}

pin_project! {
    pub(crate) struct TimeoutFuture<F> {
        #[pin]
        fut: F,
        #[pin]
        timer: Sleep,
    }
}

impl<F: Future> Future for TimeoutFuture<F> {
    type Output = Result<F::Output, ()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.fut.poll(cx) {
            Poll::Ready(res) => Poll::Ready(Ok(res)),
            Poll::Pending => this.timer.poll(cx).map(Err),
        }
    }
}

/// Flatten a timed fallible future into crate error with given timeout kind.
pub(crate) async fn timed<F, T, E>(fut: F, dur: Duration, kind: TimeoutError) -> Result<T, Error>
where
    F: Future<Output = Result<T, E>>,
    Error: From<E>,
{
    match fut.timeout(dur).await {
        Ok(res) => res.map_err(Into::into),
        Err(_) => Err(kind.into()),
    }
}
