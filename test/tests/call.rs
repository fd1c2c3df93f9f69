use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use conduit_client::{
    bytes::Bytes,
    error::{Error as ClientError, TimeoutError},
    event::CallId,
    http::{Request, Response},
    route::Route,
    CallState, Client, EventListener, Resolve,
};
use conduit_test::{test_h1_server, Error, Reply};
use tokio::sync::oneshot;

fn echo_header(req: Request<Bytes>) -> Reply {
    let value = req
        .headers()
        .get("x-id")
        .map(|v| Bytes::copy_from_slice(v.as_bytes()))
        .unwrap_or_default();
    Reply::Send(Response::new(value))
}

struct Fixed(Vec<SocketAddr>);

impl Resolve for Fixed {
    async fn resolve(&self, _: &str, _: u16) -> Result<Vec<SocketAddr>, ClientError> {
        Ok(self.0.clone())
    }
}

#[derive(Clone, Default)]
struct Hanging(Arc<AtomicUsize>);

impl Resolve for Hanging {
    async fn resolve(&self, _: &str, _: u16) -> Result<Vec<SocketAddr>, ClientError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<&'static str>>>);

impl Recorder {
    fn push(&self, event: &'static str) {
        self.0.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }
}

impl EventListener for Recorder {
    fn call_start(&self, _: CallId, _: &conduit_client::http::Method, _: &conduit_client::http::Uri) {
        self.push("call_start");
    }

    fn connect_start(&self, _: CallId, _: &Route) {
        self.push("connect_start");
    }

    fn connect_end(&self, _: CallId, _: &Route, _: conduit_client::address::Protocol) {
        self.push("connect_end");
    }

    fn connect_failed(&self, _: CallId, _: &Route, _: &ClientError) {
        self.push("connect_failed");
    }

    fn connection_acquired(&self, _: CallId, _: &conduit_client::Connection) {
        self.push("connection_acquired");
    }

    fn connection_released(&self, _: CallId, _: &conduit_client::Connection) {
        self.push("connection_released");
    }

    fn request_headers_end(&self, _: CallId, _: &conduit_client::http::Method, _: &conduit_client::http::Uri) {
        self.push("request_headers_end");
    }

    fn request_body_end(&self, _: CallId, _: u64) {
        self.push("request_body_end");
    }

    fn response_headers_end(&self, _: CallId, _: conduit_client::http::StatusCode) {
        self.push("response_headers_end");
    }

    fn response_body_end(&self, _: CallId, _: u64) {
        self.push("response_body_end");
    }

    fn canceled(&self, _: CallId) {
        self.push("canceled");
    }

    fn call_end(&self, _: CallId) {
        self.push("call_end");
    }

    fn call_failed(&self, _: CallId, _: &ClientError) {
        self.push("call_failed");
    }
}

// the first resolved address refuses connections. the call moves on to the next route and the
// same request reaches the server.
#[tokio::test]
async fn unreachable_route_skipped() -> Result<(), Error> {
    let handle = test_h1_server(echo_header).await?;

    let closed = {
        let lst = std::net::TcpListener::bind("127.0.0.1:0")?;
        lst.local_addr()?
    };

    let recorder = Recorder::default();
    let client = Client::builder()
        .resolver(Fixed(vec![closed, handle.addr()]))
        .event_listener(recorder.clone())
        .finish();

    let url = format!("http://conduit.test:{}/", handle.addr().port());
    let res = client.get(&url)?.header("x-id", "42").send().await?;
    assert_eq!(res.route().socket_addr(), handle.addr());
    assert_eq!(res.string().await?, "42");

    let events = recorder.events();
    assert_eq!(
        events,
        [
            "call_start",
            "connect_start",
            "connect_failed",
            "connect_start",
            "connect_end",
            "connection_acquired",
            "request_headers_end",
            "request_body_end",
            "response_headers_end",
            "response_body_end",
            "connection_released",
            "call_end",
        ]
    );

    Ok(())
}

#[tokio::test]
async fn unread_body_events() -> Result<(), Error> {
    let handle = test_h1_server(echo_header).await?;

    let recorder = Recorder::default();
    let client = Client::builder().event_listener(recorder.clone()).finish();

    let res = client
        .get(format!("http://{}/", handle.ip_port_string()))?
        .header("x-id", "unread")
        .send()
        .await?;
    drop(res);

    let events = recorder.events();
    assert!(!events.contains(&"response_body_end"));
    assert_eq!(&events[events.len() - 2..], ["connection_released", "call_end"]);

    Ok(())
}

#[tokio::test]
async fn every_route_unreachable() -> Result<(), Error> {
    let closed = {
        let lst = std::net::TcpListener::bind("127.0.0.1:0")?;
        lst.local_addr()?
    };

    let client = Client::builder().resolver(Fixed(vec![closed])).finish();

    let err = client.get("http://conduit.test/")?.send().await.unwrap_err();
    match err {
        ClientError::ConnectFailure(ref e) => assert_eq!(e.failures().len(), 1),
        e => panic!("unexpected error: {e}"),
    }

    Ok(())
}

#[tokio::test]
async fn resolve_timeout_not_retried() -> Result<(), Error> {
    let resolver = Hanging::default();

    let client = Client::builder()
        .resolver(resolver.clone())
        .set_resolve_timeout(Duration::from_millis(20))
        .finish();

    let err = client.get("http://conduit.test/")?.send().await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(TimeoutError::Resolve)));
    assert_eq!(resolver.0.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn execute_once() -> Result<(), Error> {
    let handle = test_h1_server(echo_header).await?;

    let client = Client::new();
    let call = client.get(format!("http://{}/", handle.ip_port_string()))?.call();
    assert_eq!(call.state(), CallState::NotStarted);

    let res = call.execute().await?;
    assert_eq!(call.state(), CallState::AwaitingResponse);
    res.body().await?;
    assert_eq!(call.state(), CallState::Complete);

    assert!(matches!(call.execute().await, Err(ClientError::AlreadyExecuted)));

    Ok(())
}

#[tokio::test]
async fn enqueue() -> Result<(), Error> {
    let handle = test_h1_server(echo_header).await?;

    let client = Client::new();
    let call = client
        .get(format!("http://{}/", handle.ip_port_string()))?
        .header("x-id", "queued")
        .call();

    let (tx, rx) = oneshot::channel();
    call.enqueue(move |res| {
        let _ = tx.send(res);
    });

    let body = rx.await?.map_err(Error::from)?.string().await?;
    assert_eq!(body, "queued");

    // the callback ran after the call left the dispatcher.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.running_calls_count(), 0);
    assert_eq!(client.queued_calls_count(), 0);

    Ok(())
}

#[tokio::test]
async fn cancel() -> Result<(), Error> {
    let handle = test_h1_server(|_| Reply::Stall).await?;

    let recorder = Recorder::default();
    let client = Client::builder().event_listener(recorder.clone()).finish();
    let call = client.get(format!("http://{}/", handle.ip_port_string()))?.call();

    let task = tokio::spawn({
        let call = call.clone();
        async move { call.execute().await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    call.cancel();
    call.cancel();
    assert!(call.is_canceled());

    assert!(matches!(task.await?, Err(ClientError::Canceled)));

    let events = recorder.events();
    assert_eq!(&events[events.len() - 2..], ["canceled", "call_failed"]);

    Ok(())
}

#[tokio::test]
async fn call_timeout() -> Result<(), Error> {
    let handle = test_h1_server(|_| Reply::Stall).await?;

    let client = Client::builder().set_call_timeout(Duration::from_millis(100)).finish();

    let err = client.get(format!("http://{}/", handle.ip_port_string()))?.send().await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(TimeoutError::Call)));

    Ok(())
}

#[tokio::test]
async fn invalid_header_deferred() -> Result<(), Error> {
    let client = Client::new();

    let err = client
        .get("http://127.0.0.1:1/")?
        .header("bad header", "v")
        .send()
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Std(_)));

    Ok(())
}
