//! observation of call lifecycle.
//!
//! Listeners are called synchronously on the call's own task. Return values are never consulted,
//! so a listener can not alter control flow. Keep the work done inside them short.

use std::{net::SocketAddr, sync::Arc};

use crate::{
    address::Protocol,
    connection::Connection,
    error::Error,
    http::{Method, StatusCode},
    route::Route,
};

/// Identifier of one call, unique within a process.
pub type CallId = u64;

/// Trait for receiving call lifecycle events. Every method defaults to no-op.
#[allow(unused_variables)]
pub trait EventListener: Send + Sync {
    fn call_start(&self, call: CallId, method: &Method, uri: &http::Uri) {}

    fn dns_start(&self, call: CallId, host: &str) {}

    fn dns_end(&self, call: CallId, host: &str, addrs: &[SocketAddr]) {}

    fn connect_start(&self, call: CallId, route: &Route) {}

    fn secure_connect_start(&self, call: CallId) {}

    fn secure_connect_end(&self, call: CallId, protocol: Option<Protocol>) {}

    fn connect_end(&self, call: CallId, route: &Route, protocol: Protocol) {}

    fn connect_failed(&self, call: CallId, route: &Route, error: &Error) {}

    fn connection_acquired(&self, call: CallId, connection: &Connection) {}

    fn connection_released(&self, call: CallId, connection: &Connection) {}

    fn request_headers_end(&self, call: CallId, method: &Method, uri: &http::Uri) {}

    fn request_body_end(&self, call: CallId, bytes: u64) {}

    fn response_headers_end(&self, call: CallId, status: StatusCode) {}

    fn response_body_end(&self, call: CallId, bytes: u64) {}

    /// a new attempt is about to start. `error` is set when the previous attempt failed,
    /// otherwise the previous response asked for a follow up.
    fn retry(&self, call: CallId, attempt: usize, error: Option<&Error>) {}

    fn canceled(&self, call: CallId) {}

    fn call_end(&self, call: CallId) {}

    fn call_failed(&self, call: CallId, error: &Error) {}
}

pub struct NoopEventListener;

impl EventListener for NoopEventListener {}

/// Listener bound to one call id.
#[derive(Clone)]
pub(crate) struct Events {
    listener: Arc<dyn EventListener>,
    call: CallId,
}

macro_rules! forward {
    ($($name: ident($($arg: ident: $ty: ty),*);)*) => {
        $(
            #[inline]
            pub(crate) fn $name(&self, $($arg: $ty),*) {
                self.listener.$name(self.call, $($arg),*)
            }
        )*
    };
}

impl Events {
    pub(crate) fn new(listener: Arc<dyn EventListener>, call: CallId) -> Self {
        Self { listener, call }
    }

    forward! {
        call_start(method: &Method, uri: &http::Uri);
        dns_start(host: &str);
        dns_end(host: &str, addrs: &[SocketAddr]);
        connect_start(route: &Route);
        secure_connect_start();
        secure_connect_end(protocol: Option<Protocol>);
        connect_end(route: &Route, protocol: Protocol);
        connect_failed(route: &Route, error: &Error);
        connection_acquired(connection: &Connection);
        connection_released(connection: &Connection);
        request_headers_end(method: &Method, uri: &http::Uri);
        request_body_end(bytes: u64);
        response_headers_end(status: StatusCode);
        response_body_end(bytes: u64);
        retry(attempt: usize, error: Option<&Error>);
        canceled();
        call_end();
        call_failed(error: &Error);
    }
}
