//! a logical request and everything done on its behalf: route planning, retries, follow ups and
//! the final response.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    address::Address,
    body::ResponseBody,
    bytes::Bytes,
    client::ClientInner,
    error::{Error, TimeoutError},
    event::{CallId, Events},
    exchange::Exchange,
    follow_up::FollowUpPolicy,
    http::{self, response, Request, StatusCode},
    request::clone_request,
    response::Response,
    retry::{is_recoverable, ExchangeFailure},
    route::RouteDatabase,
    task::TaskHandle,
};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Progress of a [Call].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    NotStarted,
    Connecting,
    SendingRequest,
    AwaitingResponse,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CancelReason {
    Canceled,
    CallTimeout,
}

/// A prepared request that can be executed once.
///
/// Clones share the same underlying call. Canceling any of them cancels it.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

pub(crate) struct CallInner {
    id: CallId,
    client: Arc<ClientInner>,
    request: Request<Bytes>,
    // error deferred from building the request.
    error: Mutex<Option<Error>>,
    token: CancellationToken,
    reason: Mutex<Option<CancelReason>>,
    executed: AtomicBool,
    state: Mutex<CallState>,
}

impl Call {
    pub(crate) fn new(client: Arc<ClientInner>, request: Request<Bytes>, error: Option<Error>) -> Self {
        Self {
            inner: Arc::new(CallInner {
                id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
                client,
                request,
                error: Mutex::new(error),
                token: CancellationToken::new(),
                reason: Mutex::new(None),
                executed: AtomicBool::new(false),
                state: Mutex::new(CallState::NotStarted),
            }),
        }
    }

    /// Identifier handed to every [EventListener](crate::EventListener) method for this call.
    pub fn id(&self) -> CallId {
        self.inner.id
    }

    /// The original request. Follow ups never modify it.
    pub fn request(&self) -> &Request<Bytes> {
        &self.inner.request
    }

    pub fn state(&self) -> CallState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Cancel the call. In flight io is dropped and the call fails with [Error::Canceled].
    /// A response body still being read fails the same way.
    ///
    /// Canceling more than once or after completion has no effect.
    pub fn cancel(&self) {
        self.inner.cancel_with(CancelReason::Canceled);
    }

    /// Run the call and wait for the response head.
    ///
    /// Returns [Error::AlreadyExecuted] when the call was executed or enqueued before.
    pub async fn execute(&self) -> Result<Response, Error> {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyExecuted);
        }
        let _running = self.inner.client.dispatcher.track();
        self.inner.run().await
    }

    /// Run the call in background once the dispatcher admits it. `callback` is invoked exactly
    /// once with the outcome.
    ///
    /// # Panics
    /// When called outside of a tokio runtime.
    pub fn enqueue<F>(&self, callback: F)
    where
        F: FnOnce(Result<Response, Error>) + Send + 'static,
    {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            return callback(Err(Error::AlreadyExecuted));
        }

        let call = self.inner.clone();

        tokio::spawn(async move {
            let dispatcher = call.client.dispatcher.clone();
            let host = call.request.uri().host().unwrap_or_default().to_owned();

            let permit = tokio::select! {
                biased;
                _ = call.token.cancelled() => None,
                permit = dispatcher.acquire(&host) => Some(permit),
            };

            let res = match permit {
                Some(_permit) => call.run().await,
                None => {
                    debug!("call {} canceled while queued", call.id);
                    Err(call.cancel_error())
                }
            };

            callback(res);
        });
    }
}

// outcome of the follow up loop: the head and body source of the final response.
struct Final {
    parts: response::Parts,
    exchange: Exchange,
    prior: Vec<StatusCode>,
}

impl CallInner {
    fn cancel_with(&self, reason: CancelReason) {
        self.reason.lock().unwrap().get_or_insert(reason);
        self.token.cancel();
    }

    fn cancel_error(&self) -> Error {
        match *self.reason.lock().unwrap() {
            Some(CancelReason::CallTimeout) => Error::Timeout(TimeoutError::Call),
            _ => Error::Canceled,
        }
    }

    fn set_state(&self, state: CallState) {
        *self.state.lock().unwrap() = state;
    }

    async fn run(self: &Arc<Self>) -> Result<Response, Error> {
        let client = &self.client;
        let events = Events::new(client.listener.clone(), self.id);

        events.call_start(self.request.method(), self.request.uri());

        let timeout = client.timeout_config.call_timeout.map(|dur| {
            let call = Arc::downgrade(self);
            client.call_timeouts.schedule(format!("call {} timeout", self.id), dur, move || {
                if let Some(call) = call.upgrade() {
                    debug!("call {} timed out", call.id);
                    call.cancel_with(CancelReason::CallTimeout);
                }
                None
            })
        });

        let mut guard = CallGuard {
            call: self.clone(),
            events: events.clone(),
            timeout,
            done: false,
        };

        let deferred = self.error.lock().unwrap().take();

        let res = match deferred {
            Some(e) => Err(e),
            None => tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(self.cancel_error()),
                res = self.follow_ups(&events) => res,
            },
        };

        match res {
            Ok(Final { parts, exchange, prior }) => {
                let route = exchange.route().clone();
                let body = ResponseBody::new(exchange, guard);
                Ok(Response::new(http::Response::from_parts(parts, body), prior, route))
            }
            Err(e) => {
                guard.fail(&e);
                Err(e)
            }
        }
    }

    async fn follow_ups(&self, events: &Events) -> Result<Final, Error> {
        let client = &*self.client;

        let policy = FollowUpPolicy {
            follow_redirects: client.follow_redirects,
            follow_ssl_redirects: client.follow_ssl_redirects,
            retry_on_connection_failure: client.retry_on_connection_failure,
            authenticator: client.authenticator.as_deref(),
            proxy_authenticator: client.proxy_authenticator.as_deref(),
        };

        let mut req = clone_request(&self.request);
        let mut db = RouteDatabase::default();
        let mut prior = Vec::new();
        let mut count = 0;

        loop {
            let failure = match self.attempt(&req, &mut db, events).await {
                Ok((parts, mut exchange)) => {
                    let head = head(&parts);
                    let Some(next) = policy.follow_up(&head, &req, Some(exchange.route()), prior.last().copied())
                    else {
                        return Ok(Final { parts, exchange, prior });
                    };

                    exchange.discard().await;
                    exchange.release(events);

                    count += 1;
                    if count > client.max_follow_ups {
                        return Err(Error::TooManyFollowUps(count));
                    }

                    debug!(
                        "call {} follows up {} with {} {}",
                        self.id,
                        parts.status,
                        next.method(),
                        next.uri()
                    );
                    events.retry(count, None);

                    prior.push(parts.status);
                    req = next;
                    continue;
                }
                Err(failure) => failure,
            };

            if !is_recoverable(&failure, req.method(), client.retry_on_connection_failure) {
                return Err(failure.error);
            }

            count += 1;
            if count > client.max_follow_ups {
                return Err(Error::TooManyFollowUps(count));
            }

            debug!(
                "call {} retries after {} on route {:?} connection {:?}",
                self.id,
                failure.error,
                failure.route.as_ref().map(ToString::to_string),
                failure.connection_id
            );
            events.retry(count, Some(&failure.error));

            // a fresh connection that failed before sending anything says the route is bad.
            if let Some(ref route) = failure.route {
                if !failure.reused && !failure.request_written {
                    db.failed(route);
                }
            }
        }
    }

    async fn attempt(
        &self,
        req: &Request<Bytes>,
        db: &mut RouteDatabase,
        events: &Events,
    ) -> Result<(response::Parts, Exchange), ExchangeFailure> {
        let client = &*self.client;
        let address = Address::from_uri(req.uri(), &client.protocols, client.proxy.as_ref())?;

        self.set_state(CallState::Connecting);
        let lease = client.acquire(&address, req.uri(), db, events).await?;
        let conn = lease.connection().clone();
        events.connection_acquired(&conn);

        self.set_state(CallState::SendingRequest);
        let res = match client.send(lease, &address, req, events).await {
            Ok(sent) => {
                self.set_state(CallState::AwaitingResponse);
                sent.receive(client.timeout_config.read_timeout, events).await
            }
            Err(e) => Err(e),
        };

        if res.is_err() {
            events.connection_released(&conn);
        }

        res
    }
}

fn head(parts: &response::Parts) -> http::Response<()> {
    let mut res = http::Response::new(());
    *res.status_mut() = parts.status;
    *res.version_mut() = parts.version;
    *res.headers_mut() = parts.headers.clone();
    res
}

/// Completion of a call. Outlives the call future inside the response body so the call ends
/// when its body does.
pub(crate) struct CallGuard {
    call: Arc<CallInner>,
    events: Events,
    timeout: Option<TaskHandle>,
    done: bool,
}

impl CallGuard {
    pub(crate) fn events(&self) -> &Events {
        &self.events
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.call.token
    }

    pub(crate) fn cancel_error(&self) -> Error {
        self.call.cancel_error()
    }

    fn complete(&mut self) -> bool {
        if self.done {
            return false;
        }
        self.done = true;
        if let Some(timeout) = self.timeout.take() {
            timeout.cancel();
        }
        self.call.set_state(CallState::Complete);
        true
    }

    pub(crate) fn finish(&mut self) {
        if self.complete() {
            self.events.call_end();
        }
    }

    pub(crate) fn fail(&mut self, e: &Error) {
        if self.complete() {
            if matches!(e, Error::Canceled | Error::Timeout(TimeoutError::Call)) {
                self.events.canceled();
            }
            self.events.call_failed(e);
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.finish();
    }
}
