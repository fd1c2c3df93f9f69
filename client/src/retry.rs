//! decide whether a failed exchange may be attempted again.

use crate::{
    error::{Error, TimeoutError},
    h2::ErrorCode,
    http::Method,
    route::Route,
};

/// A failure of one attempt together with how far the attempt got.
#[derive(Debug)]
pub(crate) struct ExchangeFailure {
    pub(crate) error: Error,
    pub(crate) route: Option<Route>,
    pub(crate) connection_id: Option<u64>,
    /// connection came from the pool instead of being dialed for this attempt.
    pub(crate) reused: bool,
    /// request bytes may have reached the peer.
    pub(crate) request_written: bool,
    pub(crate) response_started: bool,
}

impl ExchangeFailure {
    /// failure before any connection was involved.
    pub(crate) fn new(error: Error) -> Self {
        Self {
            error,
            route: None,
            connection_id: None,
            reused: false,
            request_written: false,
            response_started: false,
        }
    }
}

impl From<Error> for ExchangeFailure {
    fn from(error: Error) -> Self {
        Self::new(error)
    }
}

/// true when the request can be sent again without risking a duplicated side effect.
pub(crate) fn is_recoverable(failure: &ExchangeFailure, method: &Method, retry_on_connection_failure: bool) -> bool {
    if !retry_on_connection_failure {
        return false;
    }

    match failure.error {
        // the peer guarantees these were never processed.
        Error::StreamReset {
            code: ErrorCode::RefusedStream,
            ..
        }
        | Error::ConnectionShutdown { refused: true } => return true,
        // a fresh connection that went away mid stream will not do better on the next try.
        Error::ConnectionShutdown { refused: false } if !failure.reused => return false,
        Error::Canceled
        | Error::Timeout(TimeoutError::Call | TimeoutError::Resolve)
        | Error::Certificate(_)
        | Error::Protocol(_)
        | Error::InvalidUri(_)
        | Error::TooManyFollowUps(_)
        | Error::AlreadyExecuted
        | Error::ConnectFailure(_)
        | Error::NameResolution(_)
        | Error::Tunnel(_)
        | Error::Feature(_)
        | Error::Std(_)
        | Error::Parse(_) => return false,
        _ => {}
    }

    if !failure.request_written {
        return true;
    }

    // the peer may still be processing a request it received before the deadline.
    if matches!(failure.error, Error::Timeout(_)) {
        return false;
    }

    // a pooled connection the peer closed while it sat idle.
    if failure.reused && !failure.response_started && failure.error.is_peer_closed() {
        return true;
    }

    method.is_idempotent()
}

#[cfg(test)]
mod test {
    use std::io;

    use super::*;

    fn failure(error: Error, reused: bool, request_written: bool, response_started: bool) -> ExchangeFailure {
        ExchangeFailure {
            error,
            route: None,
            connection_id: Some(1),
            reused,
            request_written,
            response_started,
        }
    }

    fn reset() -> Error {
        io::Error::from(io::ErrorKind::ConnectionReset).into()
    }

    #[test]
    fn nothing_written() {
        let f = failure(reset(), false, false, false);
        assert!(is_recoverable(&f, &Method::POST, true));
        assert!(!is_recoverable(&f, &Method::POST, false));

        let f = failure(TimeoutError::Connect.into(), false, false, false);
        assert!(is_recoverable(&f, &Method::POST, true));
    }

    #[test]
    fn written_non_idempotent() {
        let f = failure(reset(), false, true, false);
        assert!(!is_recoverable(&f, &Method::POST, true));
        assert!(is_recoverable(&f, &Method::GET, true));
        assert!(is_recoverable(&f, &Method::PUT, true));
    }

    #[test]
    fn stale_pooled_connection() {
        let f = failure(reset(), true, true, false);
        assert!(is_recoverable(&f, &Method::POST, true));

        // the peer started answering. the request was processed.
        let f = failure(reset(), true, true, true);
        assert!(!is_recoverable(&f, &Method::POST, true));
    }

    #[test]
    fn refused_stream() {
        let f = failure(
            Error::StreamReset {
                stream_id: 3,
                code: ErrorCode::RefusedStream,
            },
            true,
            true,
            true,
        );
        assert!(is_recoverable(&f, &Method::POST, true));

        let f = failure(Error::ConnectionShutdown { refused: true }, true, true, false);
        assert!(is_recoverable(&f, &Method::POST, true));

        let f = failure(
            Error::StreamReset {
                stream_id: 3,
                code: ErrorCode::InternalError,
            },
            false,
            true,
            true,
        );
        assert!(!is_recoverable(&f, &Method::POST, true));
    }

    #[test]
    fn terminal() {
        for error in [
            Error::Canceled,
            Error::Timeout(TimeoutError::Call),
            Error::Timeout(TimeoutError::Resolve),
            Error::ConnectionShutdown { refused: false },
            Error::Certificate("bad".into()),
            Error::TooManyFollowUps(21),
        ] {
            let f = failure(error, false, false, false);
            assert!(!is_recoverable(&f, &Method::GET, true));
        }

        let f = failure(TimeoutError::Read.into(), false, true, false);
        assert!(!is_recoverable(&f, &Method::GET, true));

        // a pooled connection shut down before answering may be stale.
        let f = failure(Error::ConnectionShutdown { refused: false }, true, false, false);
        assert!(is_recoverable(&f, &Method::GET, true));
    }
}
